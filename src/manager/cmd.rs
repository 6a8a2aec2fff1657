//! Generic command dispatcher.

use super::{CtxHandle, Shared};
use crate::context::ContextState;
use crate::error::{AppResult, HwMgrError};
use crate::hw::{BwControl, HwCommand, OutResId, TfeInId};
use tracing::{debug, error, info, warn};

/// Why a register dump was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpReason {
    Flush,
    Error,
}

/// Buffer mapped for one output of the faulting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBufInfo {
    pub port: OutResId,
    pub mem_handle: u32,
    pub iova: u64,
    pub len: u64,
}

impl IoBufInfo {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.iova && addr - self.iova < self.len
    }
}

/// Pipeline class reported by [`HwMgrCmd::CtxType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxType {
    Rdi,
    Pix,
}

/// Sub-commands of [`super::TfeHwManager::cmd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwMgrCmd {
    Pause,
    Resume,
    SofDebug(bool),
    CtxType,
    PageFaultDump {
        fault_addr: u64,
        buffers: Vec<IoBufInfo>,
    },
    RegDump {
        reason: DumpReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdReply {
    Done,
    CtxType(CtxType),
    /// `dumped` is false when the applied request was already dumped for this reason.
    RegDump { dumped: bool, req_id: u64 },
    PageFault { culprit: Option<IoBufInfo> },
}

/// Ask every CSID path and TFE input of a context to dump its registers.
pub(crate) fn dump_registers(ctx: usize, st: &ContextState, reason: &str) {
    warn!(ctx, req_id = st.applied_req_id, reason, "Dumping registers");
    for entry in st.csid_entries().chain(st.tfe_in_entries()) {
        for (_, node) in entry.nodes() {
            if let Err(e) = node.command(HwCommand::DumpRegisters) {
                error!(ctx, hw_idx = node.hw_idx(), kind = ?entry.kind, error = %e, "Register dump failed");
            }
        }
    }
}

fn set_bw(ctx: usize, st: &ContextState, control: BwControl) -> AppResult<()> {
    for input in st.tfe_in_entries() {
        for (_, node) in input.nodes() {
            node.command(HwCommand::BwControl(control))
                .map_err(HwMgrError::hw("bandwidth control"))?;
        }
    }
    debug!(ctx, ?control, "Bandwidth vote updated");
    Ok(())
}

impl Shared {
    pub(crate) fn cmd(&self, handle: CtxHandle, cmd: HwMgrCmd) -> AppResult<CmdReply> {
        let ctx = self.ctx_in_use(handle)?;
        let idx = ctx.index();

        match cmd {
            HwMgrCmd::Pause => {
                set_bw(idx, &ctx.state.lock(), BwControl::Exclude)?;
                Ok(CmdReply::Done)
            }
            HwMgrCmd::Resume => {
                set_bw(idx, &ctx.state.lock(), BwControl::Include)?;
                Ok(CmdReply::Done)
            }
            HwMgrCmd::SofDebug(enable) => {
                let st = ctx.state.lock();
                let camif = st
                    .tfe_in_entries()
                    .filter(|e| e.res_id == TfeInId::Camif.raw());
                for entry in st.csid_entries().chain(camif) {
                    for (_, node) in entry.nodes() {
                        node.command(HwCommand::SofIrqDebug(enable))
                            .map_err(HwMgrError::hw("SOF debug"))?;
                    }
                }
                info!(ctx = idx, enable, "SOF IRQ debug toggled");
                Ok(CmdReply::Done)
            }
            HwMgrCmd::CtxType => Ok(CmdReply::CtxType(if ctx.rdi_only() {
                CtxType::Rdi
            } else {
                CtxType::Pix
            })),
            HwMgrCmd::PageFaultDump {
                fault_addr,
                buffers,
            } => {
                for buf in &buffers {
                    debug!(
                        ctx = idx,
                        port = ?buf.port,
                        mem_handle = buf.mem_handle,
                        iova = buf.iova,
                        len = buf.len,
                        "Io buffer"
                    );
                }
                let culprit = buffers.iter().copied().find(|b| b.contains(fault_addr));
                match &culprit {
                    Some(buf) => error!(
                        ctx = idx,
                        fault_addr,
                        port = ?buf.port,
                        mem_handle = buf.mem_handle,
                        "Page fault inside io buffer"
                    ),
                    None => warn!(
                        ctx = idx,
                        fault_addr,
                        "Page fault outside every io buffer"
                    ),
                }
                Ok(CmdReply::PageFault { culprit })
            }
            HwMgrCmd::RegDump { reason } => {
                let mut st = ctx.state.lock();
                let applied = st.applied_req_id;
                let last = match reason {
                    DumpReason::Flush => &mut st.last_dump_flush_req_id,
                    DumpReason::Error => &mut st.last_dump_err_req_id,
                };
                if *last == applied {
                    return Ok(CmdReply::RegDump {
                        dumped: false,
                        req_id: applied,
                    });
                }
                *last = applied;
                let label = match reason {
                    DumpReason::Flush => "flush",
                    DumpReason::Error => "error",
                };
                dump_registers(idx, &st, label);
                Ok(CmdReply::RegDump {
                    dumped: true,
                    req_id: applied,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_address_matches_half_open_range() {
        let buf = IoBufInfo {
            port: OutResId::Full,
            mem_handle: 4,
            iova: 0x1000,
            len: 0x100,
        };
        assert!(buf.contains(0x1000));
        assert!(buf.contains(0x10ff));
        assert!(!buf.contains(0x1100));
        assert!(!buf.contains(0x0fff));
    }
}
