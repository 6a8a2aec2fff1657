//! Recovery worker.
//!
//! The event path builds a [`RecoveryRecord`] and sends an owned copy over an
//! unbounded channel. The worker runs each cycle on the blocking pool, since
//! stop, reset and restart call into hardware that may sleep.

use super::{CtxHandle, Shared};
use crate::context::BaseTable;
use crate::error::AppResult;
use crate::event::IspErrorType;
use crate::limits::TFE_HW_NUM_MAX;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Contexts and cores hit by one fault episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub error_type: IspErrorType,
    pub recovery_enabled: bool,
    pub affected_ctx: Vec<usize>,
    /// Subset of `affected_ctx` that was streaming when the fault was seen.
    pub streaming_ctx: Vec<usize>,
    pub affected_core: [bool; TFE_HW_NUM_MAX],
}

impl RecoveryRecord {
    pub fn new(error_type: IspErrorType, recovery_enabled: bool, hw_idx: u32) -> Self {
        let mut affected_core = [false; TFE_HW_NUM_MAX];
        if let Some(core) = affected_core.get_mut(hw_idx as usize) {
            *core = true;
        }
        Self {
            error_type,
            recovery_enabled,
            affected_ctx: Vec::new(),
            streaming_ctx: Vec::new(),
            affected_core,
        }
    }

    /// If any of `bases` is already affected, mark all of them and return true.
    pub fn absorb(&mut self, bases: &BaseTable) -> bool {
        let hit = bases
            .entries()
            .iter()
            .any(|b| self.is_core_affected(b.idx));
        if hit {
            for base in bases.entries() {
                if let Some(core) = self.affected_core.get_mut(base.idx as usize) {
                    *core = true;
                }
            }
        }
        hit
    }

    pub fn is_core_affected(&self, hw_idx: u32) -> bool {
        self.affected_core
            .get(hw_idx as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn affected_cores(&self) -> Vec<u32> {
        (0..TFE_HW_NUM_MAX as u32)
            .filter(|idx| self.is_core_affected(*idx))
            .collect()
    }

    pub fn was_streaming(&self, ctx: usize) -> bool {
        self.streaming_ctx.contains(&ctx)
    }

    fn handles(&self) -> Vec<CtxHandle> {
        self.affected_ctx.iter().map(|i| CtxHandle(*i)).collect()
    }
}

/// Result of one recovery cycle, published to [`super::TfeHwManager::subscribe_recovery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Contexts stopped, reset and restarted.
    Recovered {
        contexts: Vec<CtxHandle>,
        cores: Vec<u32>,
    },
    /// Recovery disabled: registers dumped, contexts left with the overflow pending.
    DumpOnly { contexts: Vec<CtxHandle> },
    Failed {
        contexts: Vec<CtxHandle>,
        error: String,
    },
}

pub(crate) async fn run_worker(
    shared: Weak<Shared>,
    mut rx: mpsc::UnboundedReceiver<RecoveryRecord>,
) {
    debug!("Recovery worker started");
    while let Some(record) = rx.recv().await {
        let Some(strong) = shared.upgrade() else {
            break;
        };
        let contexts = record.handles();
        let outcome = match tokio::task::spawn_blocking(move || strong.run_recovery(record)).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Recovery task panicked");
                RecoveryOutcome::Failed {
                    contexts,
                    error: e.to_string(),
                }
            }
        };
        if let Some(strong) = shared.upgrade() {
            // No subscribers is fine.
            let _ = strong.recovery_events.send(outcome);
        }
    }
    debug!("Recovery worker stopped");
}

impl Shared {
    pub(crate) fn run_recovery(&self, record: RecoveryRecord) -> RecoveryOutcome {
        let contexts = record.handles();
        match self.recover(&record) {
            Ok(true) => {
                let cores = record.affected_cores();
                info!(?contexts, ?cores, error_type = ?record.error_type, "Recovery complete");
                RecoveryOutcome::Recovered { contexts, cores }
            }
            Ok(false) => {
                warn!(?contexts, "Recovery disabled, contexts left halted");
                RecoveryOutcome::DumpOnly { contexts }
            }
            Err(e) => {
                error!(?contexts, error = %e, "Recovery failed");
                RecoveryOutcome::Failed {
                    contexts,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Reset every affected context; halt and restart those that were streaming.
    /// `Ok(false)` when only dumps ran.
    fn recover(&self, record: &RecoveryRecord) -> AppResult<bool> {
        let live: Vec<usize> = record
            .affected_ctx
            .iter()
            .copied()
            .filter(|idx| self.contexts.get(*idx).is_some_and(|c| c.in_use()))
            .collect();
        // A context stopped after the fault was seen stays stopped.
        let running: Vec<usize> = live
            .iter()
            .copied()
            .filter(|idx| record.was_streaming(*idx) && self.contexts[*idx].is_streaming())
            .collect();

        for &idx in &live {
            let ctx = &self.contexts[idx];
            if self.debug.reg_dump_enabled() {
                super::cmd::dump_registers(idx, &ctx.state.lock(), "error");
            }
            if record.recovery_enabled && running.contains(&idx) {
                self.stop_hw_in_overflow(ctx)?;
            }
        }
        if !record.recovery_enabled {
            return Ok(false);
        }

        for &idx in &live {
            self.reset_csid_paths(&self.contexts[idx])?;
        }
        for core in record.affected_cores() {
            if self.devices.tfe_by_idx(core).is_none() {
                continue;
            }
            self.reset_core(core)?;
        }

        for &idx in &live {
            let ctx = &self.contexts[idx];
            ctx.overflow_pending.store(false, Ordering::Release);
            *ctx.counters.lock() = Default::default();
            if running.contains(&idx) {
                self.restart(ctx)?;
            } else {
                debug!(ctx = idx, "Context was not streaming, left stopped");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SplitId;

    #[test]
    fn absorb_marks_every_base_of_a_hit_context() {
        let mut record = RecoveryRecord::new(IspErrorType::Overflow, true, 1);
        let mut bases = BaseTable::default();
        bases.add(1, Some(SplitId::Left)).unwrap();
        bases.add(2, Some(SplitId::Right)).unwrap();

        assert!(record.absorb(&bases));
        assert_eq!(record.affected_cores(), vec![1, 2]);
    }

    #[test]
    fn absorb_ignores_unrelated_context() {
        let mut record = RecoveryRecord::new(IspErrorType::Violation, false, 0);
        let mut bases = BaseTable::default();
        bases.add(2, None).unwrap();

        assert!(!record.absorb(&bases));
        assert_eq!(record.affected_cores(), vec![0]);
    }
}
