//! Logical port descriptions accepted by acquisition.
//!
//! An acquisition carries one or more input ports (a sensor PHY or the pattern
//! generator), each listing the outputs the client wants from it.

use crate::error::{AppResult, HwMgrError};
use crate::hw::{OutResId, UsageType};
use serde::{Deserialize, Serialize};

/// Number of sensor PHYs an input port can name.
pub const PHY_MAX: u32 = 4;

/// Where an input port's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InPortId {
    /// Sensor on PHY `n`.
    Phy(u32),
    /// Test pattern generator.
    Tpg,
}

impl InPortId {
    /// Wire value of the pattern generator input.
    pub const TPG_RAW: u32 = 0x10;

    pub fn raw(self) -> u32 {
        match self {
            InPortId::Phy(n) => n,
            InPortId::Tpg => Self::TPG_RAW,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            Self::TPG_RAW => Some(InPortId::Tpg),
            n if n < PHY_MAX => Some(InPortId::Phy(n)),
            _ => None,
        }
    }
}

/// One requested output of an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPortInfo {
    pub res_id: OutResId,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub secure: bool,
}

impl OutPortInfo {
    pub fn new(res_id: OutResId) -> Self {
        Self {
            res_id,
            format: 0,
            width: 0,
            height: 0,
            secure: false,
        }
    }
}

/// One input port and its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InPortInfo {
    pub res_id: InPortId,
    pub lane_type: u32,
    pub lane_num: u32,
    pub vc: u32,
    pub dt: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub usage_type: UsageType,
    pub out_ports: Vec<OutPortInfo>,
}

impl InPortInfo {
    /// A sensor input on `phy` with default stream parameters.
    pub fn sensor(phy: u32, usage_type: UsageType, outs: &[OutResId]) -> Self {
        Self::with_source(InPortId::Phy(phy), usage_type, outs)
    }

    /// A pattern generator input.
    pub fn tpg(outs: &[OutResId]) -> Self {
        Self::with_source(InPortId::Tpg, UsageType::Single, outs)
    }

    fn with_source(res_id: InPortId, usage_type: UsageType, outs: &[OutResId]) -> Self {
        Self {
            res_id,
            lane_type: 0,
            lane_num: 4,
            vc: 0,
            dt: 0x2b,
            format: 0,
            width: 1920,
            height: 1080,
            usage_type,
            out_ports: outs.iter().copied().map(OutPortInfo::new).collect(),
        }
    }

    pub fn is_dual(&self) -> bool {
        self.usage_type == UsageType::Dual
    }

    pub fn is_tpg(&self) -> bool {
        self.res_id == InPortId::Tpg
    }

    /// True when any requested output runs in secure mode.
    pub fn is_secure(&self) -> bool {
        self.out_ports.iter().any(|o| o.secure)
    }

    /// Outputs served by the pixel path.
    pub fn pix_outputs(&self) -> impl Iterator<Item = &OutPortInfo> {
        self.out_ports.iter().filter(|o| !o.res_id.is_rdi())
    }

    /// Outputs served by per-channel paths.
    pub fn rdi_outputs(&self) -> impl Iterator<Item = &OutPortInfo> {
        self.out_ports.iter().filter(|o| o.res_id.is_rdi())
    }

    /// Classify the outputs and reject impossible combinations.
    pub fn preprocess(&self) -> AppResult<PortCounts> {
        let mut counts = PortCounts::default();
        let mut has_pdaf = false;
        let mut has_rdi2 = false;

        for out in &self.out_ports {
            match out.res_id {
                OutResId::Rdi2 => {
                    has_rdi2 = true;
                    counts.rdi += 1;
                }
                id if id.is_rdi() => counts.rdi += 1,
                OutResId::Pdaf => {
                    has_pdaf = true;
                    counts.pix += 1;
                }
                _ => counts.pix += 1,
            }
        }

        if has_rdi2 && has_pdaf {
            return Err(HwMgrError::InvalidArgument(
                "RDI2 and PDAF outputs are mutually exclusive".to_string(),
            ));
        }
        if counts.pix == 0 && counts.rdi == 0 {
            return Err(HwMgrError::InvalidArgument(format!(
                "input port {:?} requests no outputs",
                self.res_id
            )));
        }
        Ok(counts)
    }
}

/// Output classification of one input port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounts {
    pub pix: usize,
    pub rdi: usize,
}
