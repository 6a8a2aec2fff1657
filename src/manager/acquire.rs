//! Acquisition: port description in, wired resource graph out.
//!
//! Order per input port: CSID pixel path (dual-aware), CSID per-channel paths,
//! TFE inputs for every CSID entry without a child, TFE outputs for every TFE
//! input without a child. A pattern generator, when requested, is reserved once
//! up front. Every entry is linked into the context's lists before any node is
//! bound to it, so a failure at any step leaves all bound nodes reachable by the
//! teardown path.

use super::{CtxHandle, Shared};
use crate::cdm::{CdmAcquireArgs, CdmCallback, CdmPriority, CdmStatus};
use crate::context::{ContextState, EntryId, HwMgrContext, ResEntry};
use crate::error::{AppResult, HwMgrError};
use crate::event::CallbackTable;
use crate::hw::{
    BoundNode, CsidPathId, EventSink, HwInterface, OutResId, ReserveArgs, ResourceKind, SplitId,
    SyncMode, TfeInId, OUT_RES_MAX,
};
use crate::limits::TPG_INPUTS_MAX;
use crate::ports::{InPortId, InPortInfo, OutPortInfo};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Arguments for [`super::TfeHwManager::acquire`].
#[derive(Debug, Clone, Default)]
pub struct AcquireArgs {
    pub in_ports: Vec<InPortInfo>,
    pub callbacks: CallbackTable,
}

impl AcquireArgs {
    pub fn new(in_ports: Vec<InPortInfo>) -> Self {
        Self {
            in_ports,
            callbacks: CallbackTable::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: CallbackTable) -> Self {
        self.callbacks = callbacks;
        self
    }
}

fn try_reserve(hw: &Arc<dyn HwInterface>, args: &ReserveArgs) -> Option<BoundNode> {
    match hw.reserve(args) {
        Ok(node) => Some(BoundNode::new(hw.clone(), node)),
        Err(e) => {
            debug!(hw_idx = hw.hw_idx(), kind = ?args.kind, res_id = args.res_id, error = %e, "Reserve refused");
            None
        }
    }
}

fn pool_entry(st: &mut ContextState, id: EntryId) -> AppResult<&mut ResEntry> {
    st.pool
        .get_mut(id)
        .ok_or_else(|| HwMgrError::InvalidArgument(format!("stale resource entry {id:?}")))
}

/// Hardware indices of existing CSID entries that may host another path.
fn reusable_csid_units(st: &ContextState, secure: bool) -> Vec<u32> {
    let mut units: Vec<u32> = Vec::new();
    for entry in st.csid_entries() {
        if entry.is_secure || secure {
            continue;
        }
        for idx in entry.hw_indices() {
            if !units.contains(&idx) {
                units.push(idx);
            }
        }
    }
    units
}

fn validate_ports(ports: &[InPortInfo]) -> AppResult<()> {
    if ports.is_empty() {
        return Err(HwMgrError::InvalidArgument(
            "acquire requires at least one input port".to_string(),
        ));
    }
    for port in ports {
        if port.out_ports.len() > OUT_RES_MAX {
            return Err(HwMgrError::InvalidArgument(format!(
                "{} outputs requested, at most {}",
                port.out_ports.len(),
                OUT_RES_MAX
            )));
        }
        port.preprocess()?;
    }

    let tpg_ports = ports.iter().filter(|p| p.is_tpg()).count();
    if tpg_ports > 0 && (tpg_ports != ports.len() || ports.len() > TPG_INPUTS_MAX) {
        return Err(HwMgrError::InvalidArgument(format!(
            "pattern generator acquisition needs 1-{} inputs, all from the generator ({} of {})",
            TPG_INPUTS_MAX,
            tpg_ports,
            ports.len()
        )));
    }
    Ok(())
}

impl Shared {
    pub(crate) fn acquire(&self, args: AcquireArgs) -> AppResult<CtxHandle> {
        validate_ports(&args.in_ports)?;

        let ctx = self.get_free_ctx()?;
        let idx = ctx.index();
        *ctx.callbacks.write() = args.callbacks;

        match self.acquire_for_ctx(&ctx, &args.in_ports) {
            Ok(()) => {
                ctx.in_use.store(true, Ordering::Release);
                self.move_to_used(idx);
                info!(
                    ctx = idx,
                    is_dual = ctx.is_dual(),
                    rdi_only = ctx.rdi_only(),
                    num_base = ctx.bases.read().len(),
                    "Context acquired"
                );
                Ok(CtxHandle(idx))
            }
            Err(e) => {
                error!(ctx = idx, error = %e, "Acquire failed, releasing context");
                self.teardown_failed_acquire(&ctx);
                self.dump_all_ctx();
                Err(e)
            }
        }
    }

    fn teardown_failed_acquire(&self, ctx: &Arc<HwMgrContext>) {
        {
            let mut st = ctx.state.lock();
            st.release_resources();
            if let Some(handle) = st.cdm_handle.take() {
                if let Err(e) = self.cdm.release(handle) {
                    warn!(ctx = ctx.index(), error = %e, "CDM release failed");
                }
            }
            st.reset();
        }
        ctx.reset_runtime();
        self.put_free_ctx(ctx.index());
    }

    fn cdm_callback(&self, ctx: &Arc<HwMgrContext>) -> CdmCallback {
        let weak = Arc::downgrade(ctx);
        let debug = self.debug.clone();
        Arc::new(move |handle, status, req_id| {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            match status {
                CdmStatus::Success => {
                    ctx.cdm_done.store(true, Ordering::Release);
                    ctx.config_done.complete_all();
                    if debug.per_req_reg_dump() {
                        if let Some(st) = ctx.state.try_lock() {
                            super::cmd::dump_registers(ctx.index(), &st, "per-request");
                        }
                    }
                    debug!(ctx = ctx.index(), req_id, "Config applied");
                }
                other => {
                    error!(ctx = ctx.index(), cdm = handle, req_id, status = ?other, "CDM reported failure");
                }
            }
        })
    }

    fn acquire_for_ctx(&self, ctx: &Arc<HwMgrContext>, ports: &[InPortInfo]) -> AppResult<()> {
        let idx = ctx.index();
        let mut st = ctx.state.lock();

        let handle = self
            .cdm
            .acquire(CdmAcquireArgs {
                client: format!("tfe-ctx{idx}"),
                base_windows: self.devices.tfe.iter().map(|hw| hw.hw_idx()).collect(),
                priority: CdmPriority::Fifo0,
                callback: self.cdm_callback(ctx),
            })
            .map_err(|e| HwMgrError::CdmAcquire(e.to_string()))?;
        st.cdm_handle = Some(handle);
        ctx.cdm_done.store(true, Ordering::Release);

        let sink = self.event_sink(idx);

        if ports.iter().any(InPortInfo::is_tpg) {
            self.acquire_tpg(&mut st, &ports[0])?;
        }

        let mut total_pix = 0;
        for port in ports {
            total_pix += self.acquire_hw_for_port(ctx, &mut st, port, &sink)?;
        }
        ctx.rdi_only.store(total_pix == 0, Ordering::Release);

        self.process_base_info(ctx, &st)?;

        let time_source = st
            .csid_entries()
            .find(|e| e.res_id == CsidPathId::Ipp.raw())
            .or_else(|| st.csid_entries().next())
            .and_then(|e| e.node(SplitId::Left).cloned());
        *ctx.time_source.write() = time_source;

        Ok(())
    }

    /// Reserve resources for one input port. Returns its pixel output count.
    fn acquire_hw_for_port(
        &self,
        ctx: &HwMgrContext,
        st: &mut ContextState,
        port: &InPortInfo,
        sink: &Arc<dyn EventSink>,
    ) -> AppResult<usize> {
        let counts = port.preprocess()?;
        let phy_sel = match port.res_id {
            InPortId::Phy(n) => n,
            InPortId::Tpg => st
                .tpg_entry()
                .and_then(|e| e.node(SplitId::Left))
                .map(BoundNode::hw_idx)
                .unwrap_or_default(),
        };

        if counts.pix > 0 {
            self.acquire_csid_pix(ctx, st, port, phy_sel)?;
        }
        if counts.rdi > 0 {
            self.acquire_csid_rdi(ctx, st, port, phy_sel)?;
        }
        self.acquire_tfe_in(st, port, sink)?;
        self.acquire_tfe_out(st, port, sink)?;

        debug!(
            ctx = ctx.index(),
            port = ?port.res_id,
            pix = counts.pix,
            rdi = counts.rdi,
            "In-port acquired"
        );
        Ok(counts.pix)
    }

    fn acquire_tpg(&self, st: &mut ContextState, port: &InPortInfo) -> AppResult<()> {
        let id = st.pool.acquire(ResourceKind::Tpg, 0)?;
        st.tpg = Some(id);

        let mut args = ReserveArgs::new(ResourceKind::Tpg, 0);
        args.width = port.width;
        args.height = port.height;
        args.format = port.format;

        let node = self
            .devices
            .tpg
            .iter()
            .find_map(|hw| try_reserve(hw, &args))
            .ok_or_else(|| HwMgrError::Reservation {
                kind: ResourceKind::Tpg,
                reason: "no pattern generator available".to_string(),
            })?;
        pool_entry(st, id)?.bind(SplitId::Left, node);
        st.is_tpg = true;
        Ok(())
    }

    fn csid_args(port: &InPortInfo, path: CsidPathId, phy_sel: u32, secure: bool) -> ReserveArgs {
        let mut args = ReserveArgs::new(ResourceKind::CsidPath, path.raw());
        args.phy_sel = phy_sel;
        args.width = port.width;
        args.height = port.height;
        args.format = port.format;
        args.secure = secure;
        args
    }

    /// Reuse a unit already bound to this context, else scan all units.
    fn reserve_csid(
        &self,
        st: &ContextState,
        args: &ReserveArgs,
        ascending: bool,
    ) -> Option<BoundNode> {
        let reused = reusable_csid_units(st, args.secure)
            .into_iter()
            .filter_map(|idx| self.devices.csid_by_idx(idx))
            .find_map(|hw| try_reserve(hw, args));
        if reused.is_some() {
            return reused;
        }

        if ascending {
            self.devices.csid.iter().find_map(|hw| try_reserve(hw, args))
        } else {
            self.devices
                .csid
                .iter()
                .rev()
                .find_map(|hw| try_reserve(hw, args))
        }
    }

    fn acquire_csid_pix(
        &self,
        ctx: &HwMgrContext,
        st: &mut ContextState,
        port: &InPortInfo,
        phy_sel: u32,
    ) -> AppResult<()> {
        let dual = port.is_dual();
        let secure = port.is_secure();
        let mut args = Self::csid_args(port, CsidPathId::Ipp, phy_sel, secure);
        if dual {
            args.sync_mode = SyncMode::Master;
        }

        let id = st.pool.acquire(ResourceKind::CsidPath, CsidPathId::Ipp.raw())?;
        st.csid.push(id);

        // Ascending when dual so the lowest free unit becomes master; descending
        // when single to keep low units free for dual sessions.
        let left = self
            .reserve_csid(st, &args, dual)
            .ok_or_else(|| HwMgrError::Reservation {
                kind: ResourceKind::CsidPath,
                reason: "no CSID pixel path available".to_string(),
            })?;
        let left_idx = left.hw_idx();
        {
            let entry = pool_entry(st, id)?;
            entry.bind(SplitId::Left, left);
            entry.is_secure = secure;
        }

        if dual {
            let mut slave_args = args.clone();
            slave_args.sync_mode = SyncMode::Slave;
            slave_args.partner_hw_idx = Some(left_idx);
            let right = self
                .devices
                .csid
                .iter()
                .filter(|hw| hw.hw_idx() != left_idx)
                .find_map(|hw| try_reserve(hw, &slave_args))
                .ok_or_else(|| HwMgrError::Reservation {
                    kind: ResourceKind::CsidPath,
                    reason: format!("no slave CSID pixel path to pair with hw {left_idx}"),
                })?;
            pool_entry(st, id)?.bind(SplitId::Right, right);
            ctx.is_dual.store(true, Ordering::Release);
        }
        ctx.master_hw_idx.store(left_idx, Ordering::Release);
        Ok(())
    }

    fn acquire_csid_rdi(
        &self,
        ctx: &HwMgrContext,
        st: &mut ContextState,
        port: &InPortInfo,
        phy_sel: u32,
    ) -> AppResult<()> {
        let rdi_outs: Vec<OutPortInfo> = port.rdi_outputs().copied().collect();
        for out in rdi_outs {
            let path = out
                .res_id
                .rdi_index()
                .and_then(CsidPathId::rdi)
                .ok_or_else(|| {
                    HwMgrError::InvalidArgument(format!("{:?} is not a per-channel output", out.res_id))
                })?;
            let args = Self::csid_args(port, path, phy_sel, out.secure);

            let id = st.pool.acquire(ResourceKind::CsidPath, path.raw())?;
            st.csid.push(id);

            let node = self
                .reserve_csid(st, &args, ctx.is_dual())
                .ok_or_else(|| HwMgrError::Reservation {
                    kind: ResourceKind::CsidPath,
                    reason: format!("no CSID {path:?} path available"),
                })?;
            let entry = pool_entry(st, id)?;
            entry.bind(SplitId::Left, node);
            entry.is_secure = out.secure;
        }
        Ok(())
    }

    /// One TFE input per CSID entry that has no child yet, on the same unit index.
    fn acquire_tfe_in(
        &self,
        st: &mut ContextState,
        port: &InPortInfo,
        sink: &Arc<dyn EventSink>,
    ) -> AppResult<()> {
        let pending: Vec<EntryId> = st
            .csid
            .iter()
            .copied()
            .filter(|id| st.pool.get(*id).is_some_and(|e| e.num_children == 0))
            .collect();

        for csid_id in pending {
            let (path, units, is_dual) = {
                let csid = pool_entry(st, csid_id)?;
                let path = CsidPathId::from_raw(csid.res_id).ok_or_else(|| {
                    HwMgrError::InvalidArgument(format!("unknown CSID path {}", csid.res_id))
                })?;
                let units: Vec<(SplitId, u32)> =
                    csid.nodes().map(|(split, n)| (split, n.hw_idx())).collect();
                (path, units, csid.is_dual)
            };
            let in_id = path.tfe_in();

            let tfe_id = st.pool.acquire(ResourceKind::TfeIn, in_id.raw())?;
            st.tfe_in.push(tfe_id);

            for &(split, hw_idx) in &units {
                let hw = self
                    .devices
                    .tfe_by_idx(hw_idx)
                    .ok_or_else(|| HwMgrError::Reservation {
                        kind: ResourceKind::TfeIn,
                        reason: format!("no TFE core {hw_idx}"),
                    })?;

                let mut args = ReserveArgs::new(ResourceKind::TfeIn, in_id.raw());
                args.width = port.width;
                args.height = port.height;
                args.format = port.format;
                args.event_sink = Some(sink.clone());
                if is_dual && in_id == TfeInId::Camif {
                    args.sync_mode = match split {
                        SplitId::Left => SyncMode::Master,
                        SplitId::Right => SyncMode::Slave,
                    };
                    args.partner_hw_idx = units
                        .iter()
                        .find(|(other, _)| *other != split)
                        .map(|(_, idx)| *idx);
                }

                let node = hw.reserve(&args).map_err(|e| HwMgrError::Reservation {
                    kind: ResourceKind::TfeIn,
                    reason: e.to_string(),
                })?;
                pool_entry(st, tfe_id)?.bind(split, BoundNode::new(hw.clone(), node));
            }
            pool_entry(st, csid_id)?.num_children += 1;
        }
        Ok(())
    }

    fn reserve_out(
        &self,
        st: &mut ContextState,
        out: &OutPortInfo,
        units: &[(SplitId, u32)],
        dual: bool,
        sink: &Arc<dyn EventSink>,
    ) -> AppResult<()> {
        let slot = st.tfe_out_mut(out.res_id);
        if slot.is_some() {
            return Err(HwMgrError::InvalidArgument(format!(
                "output {:?} requested twice",
                out.res_id
            )));
        }
        let mut entry = ResEntry::new(ResourceKind::TfeOut, out.res_id.raw());
        entry.is_secure = out.secure;
        *slot = Some(entry);

        for &(split, hw_idx) in units {
            let hw = self
                .devices
                .tfe_by_idx(hw_idx)
                .ok_or_else(|| HwMgrError::Reservation {
                    kind: ResourceKind::TfeOut,
                    reason: format!("no TFE core {hw_idx}"),
                })?;
            let mut args = ReserveArgs::new(ResourceKind::TfeOut, out.res_id.raw());
            args.width = out.width;
            args.height = out.height;
            args.format = out.format;
            args.secure = out.secure;
            args.is_master = dual && split == SplitId::Left;
            args.event_sink = Some(sink.clone());

            let node = hw.reserve(&args).map_err(|e| HwMgrError::Reservation {
                kind: ResourceKind::TfeOut,
                reason: e.to_string(),
            })?;
            if let Some(entry) = st.tfe_out_mut(out.res_id).as_mut() {
                entry.bind(split, BoundNode::new(hw.clone(), node));
            }
        }
        Ok(())
    }

    /// Outputs for every TFE input without a child. Per-channel inputs take their
    /// one matching output; CAMIF takes every pixel output on both splits.
    fn acquire_tfe_out(
        &self,
        st: &mut ContextState,
        port: &InPortInfo,
        sink: &Arc<dyn EventSink>,
    ) -> AppResult<()> {
        let pending: Vec<EntryId> = st
            .tfe_in
            .iter()
            .copied()
            .filter(|id| st.pool.get(*id).is_some_and(|e| e.num_children == 0))
            .collect();

        for in_entry_id in pending {
            let (in_id, units, dual) = {
                let entry = pool_entry(st, in_entry_id)?;
                let in_id = TfeInId::from_raw(entry.res_id).ok_or_else(|| {
                    HwMgrError::InvalidArgument(format!("unknown TFE input {}", entry.res_id))
                })?;
                let units: Vec<(SplitId, u32)> =
                    entry.nodes().map(|(split, n)| (split, n.hw_idx())).collect();
                (in_id, units, entry.is_dual)
            };

            match in_id.rdi_out() {
                Some(out_id) => {
                    let out = port
                        .out_ports
                        .iter()
                        .find(|o| o.res_id == out_id)
                        .copied()
                        .ok_or_else(|| {
                            HwMgrError::InvalidArgument(format!(
                                "no output requested for TFE input {in_id:?}"
                            ))
                        })?;
                    let left: Vec<(SplitId, u32)> = units.iter().take(1).copied().collect();
                    self.reserve_out(st, &out, &left, false, sink)?;
                }
                None => {
                    let pix: Vec<OutPortInfo> = port.pix_outputs().copied().collect();
                    for out in &pix {
                        self.reserve_out(st, out, &units, dual, sink)?;
                    }
                }
            }
            pool_entry(st, in_entry_id)?.num_children += 1;
        }
        Ok(())
    }

    /// Record every TFE core bound by the context's inputs in its base table.
    fn process_base_info(&self, ctx: &HwMgrContext, st: &ContextState) -> AppResult<()> {
        let mut bases = ctx.bases.write();
        for entry in st.tfe_in_entries() {
            for (split, node) in entry.nodes() {
                let role = entry.is_dual.then_some(split);
                bases.add(node.hw_idx(), role)?;
            }
        }
        if bases.is_empty() {
            return Err(HwMgrError::NoBases(ctx.index()));
        }
        Ok(())
    }
}
