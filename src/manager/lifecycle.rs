//! Init, start, stop, release and reset of a context's hardware.
//!
//! Start order is sinks before sources: TFE outputs, TFE inputs, CSID paths,
//! pattern generator. Within a dual entry the slave split is armed first. Stop
//! runs the other way round, beginning with the master unit's CSID paths.

use super::config_hw::ConfigArgs;
use super::{CtxHandle, Shared};
use crate::context::{ContextState, HwMgrContext, ResEntry};
use crate::error::{AppResult, HwMgrError};
use crate::hw::{
    BoundNode, BwControl, CsidPathId, HaltMode, HwCommand, NodeState, OutResId, ResetType,
    TfeInId,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Arguments for [`super::TfeHwManager::start`].
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    /// Initial command list, applied after init and before streaming.
    pub config: ConfigArgs,
    /// Restart already-initialized hardware without init or stream-on.
    pub start_only: bool,
}

/// Arguments for [`super::TfeHwManager::stop`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StopArgs {
    pub halt: HaltMode,
    /// Halt streaming but keep the hardware initialized for a later `start_only`.
    pub stop_only: bool,
}

/// Keep the first error, log the rest.
fn note_err(first: &mut Option<HwMgrError>, ctx: usize, err: HwMgrError) {
    warn!(ctx, error = %err, "Stop step failed, continuing");
    if first.is_none() {
        *first = Some(err);
    }
}

fn start_entry(entry: &ResEntry, op: &'static str) -> AppResult<()> {
    for (_, node) in entry.nodes_slave_first() {
        node.start().map_err(HwMgrError::hw(op))?;
    }
    Ok(())
}

/// Start every bound resource of `st`, outputs first.
pub(crate) fn start_resources(ctx: &HwMgrContext, st: &ContextState) -> AppResult<()> {
    let idx = ctx.index();
    let rdi_only = ctx.rdi_only();
    let mut primary_in: Option<TfeInId> = None;

    for out in st.tfe_out_entries() {
        if rdi_only && primary_in.is_none() {
            let rdi = OutResId::from_raw(out.res_id)
                .and_then(OutResId::rdi_index)
                .and_then(CsidPathId::rdi)
                .map(CsidPathId::tfe_in);
            if let Some(in_id) = rdi {
                for (_, node) in out.nodes() {
                    node.node().set_primary_rdi(true);
                }
                primary_in = Some(in_id);
            }
        }
        start_entry(out, "start TFE output")?;
    }

    for input in st.tfe_in_entries() {
        if primary_in.is_some_and(|id| id.raw() == input.res_id) {
            for (_, node) in input.nodes() {
                node.node().set_primary_rdi(true);
            }
        }
        start_entry(input, "start TFE input")?;
    }

    for csid in st.csid_entries() {
        start_entry(csid, "start CSID path")?;
    }

    if let Some(tpg) = st.tpg_entry() {
        start_entry(tpg, "start pattern generator")?;
    }

    debug!(ctx = idx, ?primary_in, "Resources started");
    Ok(())
}

/// CSID nodes grouped master unit first, then every other unit.
fn csid_nodes_master_first(st: &ContextState, master: u32) -> Vec<BoundNode> {
    let all: Vec<BoundNode> = st
        .csid_entries()
        .flat_map(|e| e.nodes().map(|(_, n)| n.clone()).collect::<Vec<_>>())
        .collect();
    let (mut first, rest): (Vec<_>, Vec<_>) =
        all.into_iter().partition(|n| n.hw_idx() == master);
    first.extend(rest);
    first
}

fn stop_entries<'a>(
    entries: impl Iterator<Item = &'a ResEntry>,
    halt: HaltMode,
    op: &'static str,
    ctx: usize,
    first: &mut Option<HwMgrError>,
) {
    for entry in entries {
        for (_, node) in entry.nodes() {
            if let Err(e) = node.stop(halt) {
                note_err(first, ctx, HwMgrError::hw(op)(e));
            }
        }
    }
}

impl Shared {
    fn init_hw(&self, ctx: &HwMgrContext, st: &ContextState) -> AppResult<()> {
        let csid_debug = self.debug.csid_debug();
        let camif_debug = self.debug.camif_debug();

        let result: AppResult<()> = (|| {
            if let Some(tpg) = st.tpg_entry() {
                for (_, node) in tpg.nodes() {
                    node.init().map_err(HwMgrError::hw("init pattern generator"))?;
                }
            }
            for csid in st.csid_entries() {
                for (_, node) in csid.nodes() {
                    if csid_debug != 0 {
                        node.command(HwCommand::SetCsidDebug(csid_debug))
                            .map_err(HwMgrError::hw("set CSID debug"))?;
                    }
                    node.init().map_err(HwMgrError::hw("init CSID path"))?;
                }
            }
            for input in st.tfe_in_entries() {
                for (_, node) in input.nodes() {
                    if camif_debug != 0 && input.res_id == TfeInId::Camif.raw() {
                        node.command(HwCommand::SetCamifDebug(camif_debug))
                            .map_err(HwMgrError::hw("set CAMIF debug"))?;
                    }
                    node.init().map_err(HwMgrError::hw("init TFE input"))?;
                }
            }
            Ok(())
        })();

        if let Err(e) = &result {
            error!(ctx = ctx.index(), error = %e, "Init failed, deinitializing");
            Self::deinit_resources(ctx.index(), st);
        }
        result
    }

    fn deinit_resources(ctx: usize, st: &ContextState) {
        let entries = st
            .csid_entries()
            .chain(st.tfe_in_entries())
            .chain(st.tfe_out_entries())
            .chain(st.tpg_entry());
        for entry in entries {
            for (_, node) in entry.nodes() {
                if let Err(e) = node.deinit() {
                    warn!(ctx, kind = ?entry.kind, res_id = entry.res_id, error = %e, "Deinit failed");
                }
            }
        }
    }

    fn deinit_hw(&self, ctx: &HwMgrContext, st: &mut ContextState) {
        Self::deinit_resources(ctx.index(), st);
        st.init_done = false;
        self.dec_active();
    }

    /// Init, stream on the CDM channel, count the context active.
    fn bring_up(&self, ctx: &HwMgrContext) -> AppResult<()> {
        let mut st = ctx.state.lock();
        self.init_hw(ctx, &st)?;
        st.init_done = true;
        self.active_ctx_cnt.fetch_add(1, Ordering::AcqRel);

        if let Some(handle) = st.cdm_handle {
            if let Err(e) = self.cdm.stream_on(handle) {
                self.deinit_hw(ctx, &mut st);
                return Err(HwMgrError::CdmAcquire(format!("stream on failed: {e}")));
            }
        }
        Ok(())
    }

    fn bring_down(&self, ctx: &HwMgrContext) {
        let mut st = ctx.state.lock();
        if let Some(handle) = st.cdm_handle {
            if let Err(e) = self.cdm.stream_off(handle) {
                warn!(ctx = ctx.index(), error = %e, "CDM stream off failed");
            }
        }
        if st.init_done {
            self.deinit_hw(ctx, &mut st);
        }
    }

    pub(crate) async fn start_hw(&self, handle: CtxHandle, args: StartArgs) -> AppResult<()> {
        let ctx = self.ctx_in_use(handle)?.clone();
        let idx = ctx.index();

        if args.start_only {
            if !ctx.state.lock().init_done {
                return Err(HwMgrError::InvalidArgument(format!(
                    "start_only on context {idx} before init"
                )));
            }
        } else {
            self.bring_up(&ctx)?;
        }

        if let Err(e) = self.config_hw(&ctx, args.config).await {
            error!(ctx = idx, error = %e, "Initial config failed");
            if !args.start_only {
                self.bring_down(&ctx);
            }
            return Err(e);
        }

        let started = {
            let st = ctx.state.lock();
            start_resources(&ctx, &st)
        };
        if let Err(e) = started {
            error!(ctx = idx, error = %e, "Start failed, rolling back through stop");
            let rollback = StopArgs {
                halt: HaltMode::Immediate,
                stop_only: args.start_only,
            };
            if let Err(stop_err) = self.stop_ctx(&ctx, rollback).await {
                warn!(ctx = idx, error = %stop_err, "Rollback stop failed");
            }
            return Err(e);
        }

        ctx.streaming.store(true, Ordering::Release);
        info!(ctx = idx, start_only = args.start_only, "Context streaming");
        Ok(())
    }

    pub(crate) async fn stop_hw(&self, handle: CtxHandle, args: StopArgs) -> AppResult<()> {
        let ctx = self.ctx_in_use(handle)?.clone();
        self.stop_ctx(&ctx, args).await
    }

    async fn stop_ctx(&self, ctx: &Arc<HwMgrContext>, args: StopArgs) -> AppResult<()> {
        let idx = ctx.index();
        let master = ctx.bases.read().master().ok_or(HwMgrError::NoBases(idx))?;
        ctx.streaming.store(false, Ordering::Release);
        let mut first_err = None;

        {
            let st = ctx.state.lock();
            for node in csid_nodes_master_first(&st, master) {
                if node.node().state() != NodeState::Streaming {
                    continue;
                }
                if let Err(e) = node.stop(args.halt) {
                    note_err(&mut first_err, idx, HwMgrError::hw("stop CSID path")(e));
                }
            }
            stop_entries(
                st.tfe_out_entries(),
                args.halt,
                "stop TFE output",
                idx,
                &mut first_err,
            );
            stop_entries(
                st.tfe_in_entries(),
                args.halt,
                "stop TFE input",
                idx,
                &mut first_err,
            );
            for input in st.tfe_in_entries() {
                for (_, node) in input.nodes() {
                    if let Err(e) = node.command(HwCommand::BwControl(BwControl::Exclude)) {
                        note_err(&mut first_err, idx, HwMgrError::hw("pause bandwidth")(e));
                    }
                }
            }
        }

        let timeout = self.config.stop_wait_timeout();
        if !ctx.config_done.wait_timeout(timeout).await {
            warn!(ctx = idx, ?timeout, "Config done not signalled before stop, continuing");
        }

        if !args.stop_only {
            let mut st = ctx.state.lock();
            if let Some(handle) = st.cdm_handle {
                if let Err(e) = self.cdm.stream_off(handle) {
                    warn!(ctx = idx, error = %e, "CDM stream off failed");
                }
            }
            if let Some(tpg) = st.tpg_entry() {
                for (_, node) in tpg.nodes() {
                    if let Err(e) = node.stop(args.halt) {
                        note_err(&mut first_err, idx, HwMgrError::hw("stop pattern generator")(e));
                    }
                }
            }
            if st.init_done {
                self.deinit_hw(ctx, &mut st);
            }
        }

        info!(ctx = idx, master, halt = ?args.halt, stop_only = args.stop_only, "Context stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Stop used by recovery: immediate halt, no bandwidth pause, no wait.
    pub(crate) fn stop_hw_in_overflow(&self, ctx: &HwMgrContext) -> AppResult<()> {
        let idx = ctx.index();
        let master = ctx.bases.read().master().ok_or(HwMgrError::NoBases(idx))?;
        let st = ctx.state.lock();

        for node in csid_nodes_master_first(&st, master) {
            node.stop(HaltMode::Immediate)
                .map_err(HwMgrError::hw("stop CSID path in overflow"))?;
        }
        for input in st.tfe_in_entries() {
            for (_, node) in input.nodes() {
                node.stop(HaltMode::Immediate)
                    .map_err(HwMgrError::hw("stop TFE input in overflow"))?;
            }
        }
        for out in st.tfe_out_entries() {
            for (_, node) in out.nodes() {
                node.stop(HaltMode::Immediate)
                    .map_err(HwMgrError::hw("stop TFE output in overflow"))?;
            }
        }
        if let Some(tpg) = st.tpg_entry() {
            for (_, node) in tpg.nodes() {
                node.stop(HaltMode::Immediate)
                    .map_err(HwMgrError::hw("stop pattern generator in overflow"))?;
            }
        }
        debug!(ctx = idx, master, "Context halted for recovery");
        Ok(())
    }

    /// Start resources again after recovery. Init is skipped.
    pub(crate) fn restart(&self, ctx: &HwMgrContext) -> AppResult<()> {
        let result = {
            let st = ctx.state.lock();
            start_resources(ctx, &st)
        };
        if let Err(e) = &result {
            error!(ctx = ctx.index(), error = %e, "Restart failed, halting");
            ctx.streaming.store(false, Ordering::Release);
            if let Err(stop_err) = self.stop_hw_in_overflow(ctx) {
                warn!(ctx = ctx.index(), error = %stop_err, "Halt after failed restart failed");
            }
        }
        result
    }

    pub(crate) fn release_hw(&self, handle: CtxHandle) -> AppResult<()> {
        let ctx = self.ctx_in_use(handle)?.clone();
        let idx = ctx.index();
        {
            let mut st = ctx.state.lock();
            if st.init_done {
                self.deinit_hw(&ctx, &mut st);
            }
            st.release_resources();
            if let Some(cdm) = st.cdm_handle.take() {
                if let Err(e) = self.cdm.release(cdm) {
                    warn!(ctx = idx, error = %e, "CDM release failed");
                }
            }
            st.reset();
        }
        ctx.reset_runtime();
        self.put_free_ctx(idx);
        info!(ctx = idx, "Context released");
        Ok(())
    }

    /// Reset every CSID path, then each TFE core recorded in the base table.
    pub(crate) fn reset_hw(&self, handle: CtxHandle) -> AppResult<()> {
        let ctx = self.ctx_in_use(handle)?;
        self.reset_csid_paths(ctx)?;
        let bases: Vec<u32> = ctx.bases.read().entries().iter().map(|b| b.idx).collect();
        for hw_idx in bases {
            self.reset_core(hw_idx)?;
        }
        debug!(ctx = ctx.index(), "Context reset");
        Ok(())
    }

    pub(crate) fn reset_csid_paths(&self, ctx: &HwMgrContext) -> AppResult<()> {
        let st = ctx.state.lock();
        for csid in st.csid_entries() {
            for (_, node) in csid.nodes() {
                let done = node
                    .reset(ResetType::Path)
                    .map_err(HwMgrError::hw("reset CSID path"))?;
                if done == 0 {
                    return Err(HwMgrError::ResetIncomplete {
                        hw_idx: node.hw_idx(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn reset_core(&self, hw_idx: u32) -> AppResult<()> {
        let Some(tfe) = self.devices.tfe_by_idx(hw_idx) else {
            return Err(HwMgrError::InvalidArgument(format!("no TFE core {hw_idx}")));
        };
        tfe.reset(None, ResetType::Hw)
            .map_err(HwMgrError::hw("reset TFE core"))?;
        Ok(())
    }
}
