//! Input formats and the read-master combo they select.

/// Read-master group a format is fetched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combo {
    Yuv = 0,
    Bayer = 1,
}

/// Number of [`Combo`] variants.
pub const COMBO_MAX: usize = 2;

/// Client capability bit for Bayer/packed fetch.
pub const COMBO_BAYER_MASK: u32 = 1 << 0;
/// Client capability bit for YUV fetch.
pub const COMBO_YUV_MASK: u32 = 1 << 1;

impl Combo {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn mask(self) -> u32 {
        match self {
            Combo::Bayer => COMBO_BAYER_MASK,
            Combo::Yuv => COMBO_YUV_MASK,
        }
    }
}

/// Pixel formats the bus reader can fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv422,
    Nv21,
    Nv12,
    MipiRaw6,
    MipiRaw8,
    MipiRaw10,
    MipiRaw12,
    MipiRaw14,
    MipiRaw16,
    MipiRaw20,
    QtiRaw8,
    QtiRaw10,
    QtiRaw12,
    QtiRaw14,
    Plain8,
    Plain16_8,
    Plain16_10,
    Plain16_12,
    Plain16_14,
    Plain16_16,
    Plain32_20,
    Plain64,
    Plain128,
}

impl PixelFormat {
    pub fn combo(self) -> Combo {
        match self {
            PixelFormat::Yuv422 | PixelFormat::Nv21 | PixelFormat::Nv12 => Combo::Yuv,
            _ => Combo::Bayer,
        }
    }

    /// Memory planes of one frame.
    pub fn planes(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            _ => 1,
        }
    }
}

/// Bayer/YUV sample order, as carried in the CCIF metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PixelPattern {
    Rggb = 0,
    Grbg = 1,
    Bggr = 2,
    Gbrg = 3,
    YCbYCr = 4,
    YCrYCb = 5,
    CbYCrY = 6,
    CrYCbY = 7,
}

impl PixelPattern {
    /// `None` for anything past [`PixelPattern::CrYCbY`].
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => PixelPattern::Rggb,
            1 => PixelPattern::Grbg,
            2 => PixelPattern::Bggr,
            3 => PixelPattern::Gbrg,
            4 => PixelPattern::YCbYCr,
            5 => PixelPattern::YCrYCb,
            6 => PixelPattern::CbYCrY,
            7 => PixelPattern::CrYCbY,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semi_planar_yuv_has_two_planes() {
        assert_eq!(PixelFormat::Nv12.combo(), Combo::Yuv);
        assert_eq!(PixelFormat::Nv12.planes(), 2);
        assert_eq!(PixelFormat::Yuv422.planes(), 1);
        assert_eq!(PixelFormat::MipiRaw10.combo(), Combo::Bayer);
    }

    #[test]
    fn patterns_past_crycby_are_rejected() {
        assert_eq!(PixelPattern::from_raw(7), Some(PixelPattern::CrYCbY));
        assert_eq!(PixelPattern::from_raw(8), None);
    }
}
