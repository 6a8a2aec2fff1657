//! Event path: correlation, filtering and delivery to client callbacks.
//!
//! Runs on whatever thread the adapter raises events from. Nothing here waits:
//! the context state mutex is never taken, and callbacks are cloned out of the
//! table before they are invoked.

use super::recovery::RecoveryRecord;
use super::Shared;
use crate::context::{Correlation, HwMgrContext, PeriodicEvent};
use crate::event::{IspErrorType, IspEvent};
use crate::hw::{CommandReply, HwCommand, HwEvent, HwEventKind, HwFault, ResourceKind, TfeInId};
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

fn deliver(ctx: &HwMgrContext, event: IspEvent) {
    let cb = ctx.callbacks.read().get(event.kind());
    match cb {
        Some(cb) => cb(&event),
        None => trace!(ctx = ctx.index(), kind = ?event.kind(), "No callback registered"),
    }
}

fn classify(fault: HwFault, res_kind: ResourceKind) -> IspErrorType {
    match (fault, res_kind) {
        (HwFault::Violation, _) => IspErrorType::Violation,
        (HwFault::Overflow, ResourceKind::TfeOut) => IspErrorType::BusOverflow,
        (HwFault::Overflow, _) => IspErrorType::Overflow,
    }
}

impl Shared {
    pub(crate) fn handle_event(&self, ctx_idx: usize, evt: HwEvent) {
        let Some(ctx) = self.contexts.get(ctx_idx) else {
            warn!(ctx = ctx_idx, "Event for unknown context");
            return;
        };
        if !ctx.in_use() {
            trace!(ctx = ctx_idx, kind = ?evt.kind, "Event for idle context dropped");
            return;
        }

        match &evt.kind {
            HwEventKind::RegUpdate => self.handle_reg_update(ctx, &evt),
            HwEventKind::Sof => self.handle_periodic(ctx, &evt, PeriodicEvent::Sof),
            HwEventKind::Epoch => self.handle_periodic(ctx, &evt, PeriodicEvent::Epoch),
            HwEventKind::Eof => self.handle_periodic(ctx, &evt, PeriodicEvent::Eof),
            HwEventKind::Done { handles } => {
                if ctx.overflow_pending() {
                    return;
                }
                deliver(
                    ctx,
                    IspEvent::Done {
                        handles: handles.clone(),
                    },
                );
            }
            HwEventKind::Error(fault) => self.handle_hw_err(ctx_idx, &evt, *fault),
        }
    }

    fn handle_reg_update(&self, ctx: &HwMgrContext, evt: &HwEvent) {
        if ctx.overflow_pending() {
            return;
        }
        let is_camif = evt.res_kind == ResourceKind::TfeIn && evt.res_id == TfeInId::Camif.raw();
        let deliver_it = if is_camif {
            !ctx.is_dual() || evt.hw_idx == ctx.master_hw_idx()
        } else {
            ctx.rdi_only()
        };
        if deliver_it {
            deliver(
                ctx,
                IspEvent::RegUpdate {
                    hw_idx: evt.hw_idx,
                    res_id: evt.res_id,
                },
            );
        }
    }

    fn handle_periodic(&self, ctx: &HwMgrContext, evt: &HwEvent, kind: PeriodicEvent) {
        if ctx.overflow_pending() {
            return;
        }
        let is_camif = evt.res_kind == ResourceKind::TfeIn && evt.res_id == TfeInId::Camif.raw();

        if !is_camif {
            // Per-channel inputs only report SOF, and only for contexts without a pixel path.
            if kind == PeriodicEvent::Sof && ctx.rdi_only() {
                self.deliver_periodic(ctx, evt.hw_idx, kind);
            }
            return;
        }

        if ctx.is_dual() {
            let Some(pair) = ctx.bases.read().pair() else {
                return;
            };
            let verdict = ctx.counters.lock().correlate(
                kind,
                evt.hw_idx,
                pair,
                self.config.mismatch_budget,
            );
            match verdict {
                Correlation::Deliver => {}
                Correlation::Pending => return,
                Correlation::Mismatch { first } => {
                    warn!(ctx = ctx.index(), hw_idx = evt.hw_idx, event = ?kind, "Dual-pipe event mismatch");
                    if first {
                        self.dump_irq(ctx);
                    }
                    return;
                }
                Correlation::HardFailure => {
                    error!(ctx = ctx.index(), event = ?kind, "Dual-pipe event correlation failed");
                    return;
                }
            }
        }
        self.deliver_periodic(ctx, evt.hw_idx, kind);
    }

    fn deliver_periodic(&self, ctx: &HwMgrContext, hw_idx: u32, kind: PeriodicEvent) {
        let event = match kind {
            PeriodicEvent::Sof => {
                let source = ctx.time_source.read().clone();
                let (timestamp, boot_time) = match source.map(|n| n.command(HwCommand::GetTime)) {
                    Some(Ok(CommandReply::Time { sof_ts, boot_ts })) => (sof_ts, boot_ts),
                    Some(Err(e)) => {
                        warn!(ctx = ctx.index(), error = %e, "SOF timestamp unavailable");
                        (0, 0)
                    }
                    _ => (0, 0),
                };
                IspEvent::Sof {
                    hw_idx,
                    timestamp,
                    boot_time,
                }
            }
            PeriodicEvent::Epoch => IspEvent::Epoch { hw_idx },
            PeriodicEvent::Eof => IspEvent::Eof { hw_idx },
        };
        deliver(ctx, event);
    }

    fn dump_irq(&self, ctx: &HwMgrContext) {
        let bases: Vec<u32> = ctx.bases.read().entries().iter().map(|b| b.idx).collect();
        for hw_idx in bases {
            if let Some(tfe) = self.devices.tfe_by_idx(hw_idx) {
                if let Err(e) = tfe.process_command(None, HwCommand::DumpIrqRegisters) {
                    warn!(ctx = ctx.index(), hw_idx, error = %e, "IRQ dump failed");
                }
            }
        }
    }

    /// Classify a fault, notify every affected context once and queue recovery.
    fn handle_hw_err(&self, ctx_idx: usize, evt: &HwEvent, fault: HwFault) {
        let error_type = classify(fault, evt.res_kind);
        let recovery_enabled =
            self.debug.recovery_enabled() && error_type != IspErrorType::BusOverflow;

        warn!(
            ctx = ctx_idx,
            hw_idx = evt.hw_idx,
            res_kind = ?evt.res_kind,
            res_id = evt.res_id,
            ?error_type,
            recovery_enabled,
            "Hardware error"
        );

        let mut record = RecoveryRecord::new(error_type, recovery_enabled, evt.hw_idx);
        self.find_affected_ctx(&mut record);

        if record.affected_ctx.is_empty() {
            debug!(hw_idx = evt.hw_idx, "No new context affected");
            return;
        }
        if error_type == IspErrorType::BusOverflow {
            return;
        }
        self.enqueue_recovery(record);
    }

    /// Grow `record` to every used context sharing a core with an affected one.
    fn find_affected_ctx(&self, record: &mut RecoveryRecord) {
        let used = self.used_ctx_indices();
        let mut visited = vec![false; used.len()];

        loop {
            let mut grew = false;
            for (slot, &idx) in used.iter().enumerate() {
                if visited[slot] {
                    continue;
                }
                let ctx = &self.contexts[idx];
                if !record.absorb(&ctx.bases.read()) {
                    continue;
                }
                visited[slot] = true;
                grew = true;

                if ctx.overflow_pending.swap(true, Ordering::AcqRel) {
                    debug!(ctx = idx, "Overflow already pending");
                    continue;
                }
                if record.affected_ctx.len() >= self.contexts.len() {
                    continue;
                }
                record.affected_ctx.push(idx);
                if ctx.is_streaming() {
                    record.streaming_ctx.push(idx);
                }
                deliver(
                    ctx,
                    IspEvent::Error {
                        error_type: record.error_type,
                        recovery_enabled: record.recovery_enabled,
                    },
                );
            }
            if !grew {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_overflow_is_a_bus_overflow() {
        assert_eq!(
            classify(HwFault::Overflow, ResourceKind::TfeOut),
            IspErrorType::BusOverflow
        );
        assert_eq!(
            classify(HwFault::Overflow, ResourceKind::TfeIn),
            IspErrorType::Overflow
        );
        assert_eq!(
            classify(HwFault::Overflow, ResourceKind::CsidPath),
            IspErrorType::Overflow
        );
        assert_eq!(
            classify(HwFault::Violation, ResourceKind::TfeOut),
            IspErrorType::Violation
        );
    }
}
