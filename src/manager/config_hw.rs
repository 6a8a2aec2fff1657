//! Command-list submission.
//!
//! A prepared update arrives already split per hardware base. It becomes one
//! CDM batch; only the init request waits for the completion callback.

use super::Shared;
use crate::cdm::{CdmBatch, CdmBlEntry};
use crate::context::HwMgrContext;
use crate::error::{AppResult, HwMgrError};
use crate::hw::HwCommand;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Class of a prepared command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    #[default]
    General,
    /// Image-quality settings, skipped when a request is reapplied.
    Iq,
    /// Anything else; not understood by this layer.
    Other(u32),
}

/// One prepared command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwUpdateEntry {
    pub handle: u32,
    pub offset: u32,
    pub len: u32,
    pub kind: UpdateKind,
}

impl HwUpdateEntry {
    pub fn general(handle: u32, offset: u32, len: u32) -> Self {
        Self {
            handle,
            offset,
            len,
            kind: UpdateKind::General,
        }
    }
}

/// Bandwidth vote for one TFE core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BwUpdate {
    pub hw_idx: u32,
    pub camnoc_bw: u64,
    pub axi_bw: u64,
}

/// Arguments for [`super::TfeHwManager::config_hw`].
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub request_id: u64,
    /// First submission of a stream; blocks until the batch is applied.
    pub init_packet: bool,
    pub reapply: bool,
    pub entries: Vec<HwUpdateEntry>,
    pub bw: Vec<BwUpdate>,
}

impl ConfigArgs {
    /// Init request carrying `entries`.
    pub fn init(request_id: u64, entries: Vec<HwUpdateEntry>) -> Self {
        Self {
            request_id,
            init_packet: true,
            entries,
            ..Self::default()
        }
    }

    pub fn update(request_id: u64, entries: Vec<HwUpdateEntry>) -> Self {
        Self {
            request_id,
            entries,
            ..Self::default()
        }
    }
}

fn build_batch(ctx: usize, args: &ConfigArgs) -> CdmBatch {
    let mut batch = CdmBatch {
        cookie: args.request_id,
        entries: Vec::with_capacity(args.entries.len()),
    };
    for entry in &args.entries {
        match entry.kind {
            UpdateKind::Iq if args.reapply => {
                debug!(ctx, req_id = args.request_id, "Skipping IQ buffer on reapply");
            }
            UpdateKind::Other(kind) => {
                warn!(ctx, req_id = args.request_id, kind, "Unknown update kind, skipped");
            }
            _ => batch.entries.push(CdmBlEntry {
                mem_handle: entry.handle,
                offset: entry.offset,
                len: entry.len,
                arbitrate: false,
            }),
        }
    }
    batch
}

impl Shared {
    fn apply_bw(&self, ctx: &HwMgrContext, updates: &[BwUpdate]) -> AppResult<()> {
        let bases = ctx.bases.read().clone();
        for bw in updates.iter().filter(|bw| bases.contains(bw.hw_idx)) {
            let Some(tfe) = self.devices.tfe_by_idx(bw.hw_idx) else {
                continue;
            };
            tfe.process_command(
                None,
                HwCommand::BwUpdate {
                    camnoc_bw: bw.camnoc_bw,
                    axi_bw: bw.axi_bw,
                },
            )
            .map_err(HwMgrError::hw("bandwidth update"))?;
        }
        Ok(())
    }

    pub(crate) async fn config_hw(&self, ctx: &Arc<HwMgrContext>, args: ConfigArgs) -> AppResult<()> {
        let idx = ctx.index();
        if !ctx.in_use() {
            return Err(HwMgrError::ContextNotInUse(idx));
        }
        if ctx.overflow_pending() {
            return Err(HwMgrError::OverflowPending(idx));
        }
        if args.entries.len() > self.config.entries_max {
            return Err(HwMgrError::InvalidArgument(format!(
                "{} update entries, at most {}",
                args.entries.len(),
                self.config.entries_max
            )));
        }

        self.apply_bw(ctx, &args.bw)?;

        if args.entries.is_empty() {
            debug!(ctx = idx, req_id = args.request_id, "No commands to config");
            return Ok(());
        }

        let batch = build_batch(idx, &args);
        let handle = {
            let mut st = ctx.state.lock();
            st.applied_req_id = args.request_id;
            st.cdm_handle
        }
        .ok_or_else(|| HwMgrError::Submit {
            req_id: args.request_id,
            reason: "context has no CDM channel".to_string(),
        })?;

        ctx.config_done.reinit();
        ctx.cdm_done.store(false, Ordering::Release);
        if let Err(e) = self.cdm.submit_batch(handle, batch) {
            ctx.config_done.complete_all();
            ctx.cdm_done.store(true, Ordering::Release);
            error!(ctx = idx, req_id = args.request_id, error = %e, "Submit failed");
            return Err(HwMgrError::Submit {
                req_id: args.request_id,
                reason: e.to_string(),
            });
        }

        if args.init_packet {
            let timeout = self.config.config_timeout();
            if !ctx.config_done.wait_timeout(timeout).await {
                error!(ctx = idx, req_id = args.request_id, ?timeout, "Init config timed out");
                return Err(HwMgrError::ConfigTimeout {
                    req_id: args.request_id,
                    timeout_ms: self.config.config_timeout_ms,
                });
            }
        }

        debug!(
            ctx = idx,
            req_id = args.request_id,
            init = args.init_packet,
            "Config submitted"
        );
        Ok(())
    }
}
