//! Register layout of the bus reader and the CDM reg-random encoder.

use crate::format::{COMBO_BAYER_MASK, COMBO_YUV_MASK};
use bytes::BufMut;

/// CDM opcode of a reg-random command.
pub const CDM_CMD_REG_RANDOM: u32 = 0x3;
/// Header words preceding the offset/value pairs of a reg-random command.
pub const REG_RANDOM_HDR_WORDS: usize = 1;

/// Per read-master register offsets, relative to [`BusRdRegs::offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRegs {
    pub core_cfg: u32,
    pub ccif_meta_data: u32,
    pub img_addr: u32,
    pub img_cfg: u32,
    pub stride: u32,
    pub unpack_cfg: u32,
    pub latency_buf_allocation: u32,
}

impl ClientRegs {
    /// Standard layout of read master `rm` with a 0x100 stride from 0x400.
    pub fn at(rm: u32) -> Self {
        let base = 0x400 + rm * 0x100;
        Self {
            core_cfg: base,
            ccif_meta_data: base + 0x04,
            img_addr: base + 0x08,
            img_cfg: base + 0x0c,
            stride: base + 0x10,
            unpack_cfg: base + 0x14,
            latency_buf_allocation: base + 0x18,
        }
    }
}

/// Block-level register offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRdRegs {
    /// Offset of the bus reader inside the engine's register window.
    pub offset: u32,
    pub security_cfg: u32,
    pub input_if_cmd: u32,
    pub irq_status: u32,
    pub clients: Vec<ClientRegs>,
}

/// Field layout and routing of one read master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRegVal {
    /// 1-based input port served by this read master.
    pub input_port_id: u32,
    pub rm_port_id: u32,
    /// `COMBO_*_MASK` bits of the formats it can fetch.
    pub format_type: u32,
    pub stripe_location_mask: u32,
    pub pix_pattern_mask: u32,
    pub pix_pattern_shift: u32,
    pub img_width_mask: u32,
    pub img_width_shift: u32,
    pub mode_mask: u32,
    pub mode_shift: u32,
    pub alignment_mask: u32,
    pub alignment_shift: u32,
}

impl ClientRegVal {
    pub fn new(input_port_id: u32, rm_port_id: u32, format_type: u32) -> Self {
        Self {
            input_port_id,
            rm_port_id,
            format_type,
            stripe_location_mask: 0x3,
            pix_pattern_mask: 0x3f,
            pix_pattern_shift: 2,
            img_width_mask: 0xffff,
            img_width_shift: 16,
            mode_mask: 0x1f,
            mode_shift: 1,
            alignment_mask: 0x1,
            alignment_shift: 5,
        }
    }
}

/// Block-level values and the client table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRdRegVals {
    pub go_cmd: u32,
    pub latency_buf_size: u32,
    pub rst_done: u32,
    pub violation: u32,
    pub clients: Vec<ClientRegVal>,
}

/// Everything the builder needs to know about one hardware revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwInfo {
    pub regs: BusRdRegs,
    pub vals: BusRdRegVals,
}

impl Default for HwInfo {
    /// Three read masters: port 1 fetches Bayer through RM0 or YUV through
    /// RM0 (luma) and RM1 (chroma); port 2 fetches Bayer through RM2.
    fn default() -> Self {
        let clients = vec![
            ClientRegVal::new(1, 0, COMBO_BAYER_MASK | COMBO_YUV_MASK),
            ClientRegVal::new(1, 1, COMBO_YUV_MASK),
            ClientRegVal::new(2, 2, COMBO_BAYER_MASK),
        ];
        Self {
            regs: BusRdRegs {
                offset: 0x200,
                security_cfg: 0x0c,
                input_if_cmd: 0x10,
                irq_status: 0x1c,
                clients: (0..clients.len() as u32).map(ClientRegs::at).collect(),
            },
            vals: BusRdRegVals {
                go_cmd: 0x1,
                latency_buf_size: 4096,
                rst_done: 0x1,
                violation: 0x2,
                clients,
            },
        }
    }
}

/// Append a reg-random command for `pairs` of `(offset, value)`. Returns the
/// bytes written.
pub fn write_reg_random(out: &mut impl BufMut, pairs: &[(u32, u32)]) -> usize {
    out.put_u32_le((CDM_CMD_REG_RANDOM << 24) | pairs.len() as u32);
    for (offset, value) in pairs {
        out.put_u32_le(*offset);
        out.put_u32_le(*value);
    }
    reg_random_len(pairs.len())
}

/// Encoded size of a reg-random command with `pairs` writes.
pub fn reg_random_len(pairs: usize) -> usize {
    (REG_RANDOM_HDR_WORDS + pairs * 2) * std::mem::size_of::<u32>()
}
