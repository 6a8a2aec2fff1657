//! Per-pipeline context and its bookkeeping.
//!
//! A [`HwMgrContext`] is one slot of the manager's fixed context pool. Its
//! resource graph lives in [`ContextState`] behind a mutex taken by the control
//! path. The event path only touches the atomics, the base table, the event
//! counters and the callback table, so it never waits on a control operation.
//!
//! Resource entries come from a bounded per-context [`EntryPool`]; the lists in
//! `ContextState` hold indices into it, and TFE outputs live in a fixed table
//! indexed by output id.

use crate::cdm::{CdmHandle, Completion};
use crate::error::{AppResult, HwMgrError};
use crate::event::CallbackTable;
use crate::hw::{
    BoundNode, NodeState, OutResId, ResourceKind, SplitId, SyncMode, OUT_RES_MAX,
};
use crate::limits::{SPLIT_MAX, TFE_HW_NUM_MAX};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::warn;

/// Index of an entry in a context's [`EntryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

/// One logical resource, bound to up to two physical nodes (left/right).
#[derive(Debug, Clone)]
pub struct ResEntry {
    pub kind: ResourceKind,
    pub res_id: u32,
    pub hw_res: [Option<BoundNode>; SPLIT_MAX],
    pub is_dual: bool,
    /// Downstream entries built on this one. Non-zero blocks re-acquisition.
    pub num_children: u32,
    pub is_secure: bool,
}

impl ResEntry {
    pub fn new(kind: ResourceKind, res_id: u32) -> Self {
        Self {
            kind,
            res_id,
            hw_res: [None, None],
            is_dual: false,
            num_children: 0,
            is_secure: false,
        }
    }

    pub fn bind(&mut self, split: SplitId, node: BoundNode) {
        self.hw_res[split.index()] = Some(node);
        self.is_dual = self.hw_res.iter().all(Option::is_some);
    }

    pub fn node(&self, split: SplitId) -> Option<&BoundNode> {
        self.hw_res[split.index()].as_ref()
    }

    /// Bound nodes with their split, left first.
    pub fn nodes(&self) -> impl Iterator<Item = (SplitId, &BoundNode)> {
        SplitId::ALL
            .into_iter()
            .filter_map(move |split| self.node(split).map(|n| (split, n)))
    }

    /// Bound nodes slave (right) first, the order required when starting.
    pub fn nodes_slave_first(&self) -> impl Iterator<Item = (SplitId, &BoundNode)> {
        [SplitId::Right, SplitId::Left]
            .into_iter()
            .filter_map(move |split| self.node(split).map(|n| (split, n)))
    }

    pub fn bound_count(&self) -> usize {
        self.hw_res.iter().filter(|n| n.is_some()).count()
    }

    /// Hardware indices of the bound nodes.
    pub fn hw_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes().map(|(_, n)| n.hw_idx())
    }

    /// Return every bound node to its adapter. Release errors are logged, not propagated.
    pub fn release_nodes(&mut self) {
        for slot in self.hw_res.iter_mut() {
            if let Some(node) = slot.take() {
                if let Err(e) = node.release() {
                    warn!(
                        kind = ?self.kind,
                        res_id = self.res_id,
                        hw_idx = node.hw_idx(),
                        error = %e,
                        "Failed to release resource node"
                    );
                }
            }
        }
        self.is_dual = false;
    }
}

/// Fixed-capacity pool of resource entries with an O(1) free list.
#[derive(Debug)]
pub struct EntryPool {
    slots: Vec<Option<ResEntry>>,
    free: VecDeque<usize>,
}

impl EntryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn acquire(&mut self, kind: ResourceKind, res_id: u32) -> AppResult<EntryId> {
        let idx = self.free.pop_front().ok_or(HwMgrError::NoFreeResource {
            capacity: self.slots.len(),
        })?;
        self.slots[idx] = Some(ResEntry::new(kind, res_id));
        Ok(EntryId(idx))
    }

    /// Release the entry's nodes and return its slot to the free list.
    pub fn release(&mut self, id: EntryId) {
        if let Some(mut entry) = self.slots.get_mut(id.0).and_then(Option::take) {
            entry.release_nodes();
            self.free.push_back(id.0);
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&ResEntry> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut ResEntry> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }
}

/// Split role recorded for one physical TFE core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseInfo {
    pub idx: u32,
    /// `None` until a dual-pipe resource fixes the role.
    pub split: Option<SplitId>,
}

/// Physical units bound by a context, at most one entry per index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseTable {
    entries: Vec<BaseInfo>,
}

impl BaseTable {
    /// Record `idx`. Re-adding an index only upgrades an unknown split to a
    /// concrete one; a concrete split is never overwritten.
    pub fn add(&mut self, idx: u32, split: Option<SplitId>) -> AppResult<()> {
        if let Some(base) = self.entries.iter_mut().find(|b| b.idx == idx) {
            if base.split.is_none() {
                base.split = split;
            }
            return Ok(());
        }
        if self.entries.len() >= TFE_HW_NUM_MAX {
            return Err(HwMgrError::InvalidArgument(format!(
                "base table full ({TFE_HW_NUM_MAX} entries), cannot add hw {idx}"
            )));
        }
        self.entries.push(BaseInfo { idx, split });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BaseInfo] {
        &self.entries
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.entries.iter().any(|b| b.idx == idx)
    }

    /// The unit whose split role is left, else the first recorded one.
    pub fn master(&self) -> Option<u32> {
        self.entries
            .iter()
            .find(|b| b.split == Some(SplitId::Left))
            .or_else(|| self.entries.first())
            .map(|b| b.idx)
    }

    /// First two recorded units, the pair dual-pipe correlation compares.
    pub fn pair(&self) -> Option<(u32, u32)> {
        match self.entries.as_slice() {
            [a, b, ..] => Some((a.idx, b.idx)),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Periodic events subject to dual-pipe correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicEvent {
    Sof,
    Epoch,
    Eof,
}

/// Result of feeding one periodic event into [`EventCounters::correlate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Both units reported; deliver once.
    Deliver,
    /// Waiting for the partner unit.
    Pending,
    /// Counters drifted and were pulled back; suppress. `first` asks for an IRQ dump.
    Mismatch { first: bool },
    /// Mismatch budget exhausted.
    HardFailure,
}

/// Per-unit counters for the periodic events of a dual-pipe context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCounters {
    pub sof: [u32; TFE_HW_NUM_MAX],
    pub epoch: [u32; TFE_HW_NUM_MAX],
    pub eof: [u32; TFE_HW_NUM_MAX],
    pub mismatch: u32,
}

impl EventCounters {
    /// Count `event` from `hw_idx` and compare the `pair` of units.
    pub fn correlate(
        &mut self,
        event: PeriodicEvent,
        hw_idx: u32,
        pair: (u32, u32),
        budget: u32,
    ) -> Correlation {
        let EventCounters {
            sof,
            epoch,
            eof,
            mismatch,
        } = self;
        let counts = match event {
            PeriodicEvent::Sof => sof,
            PeriodicEvent::Epoch => epoch,
            PeriodicEvent::Eof => eof,
        };
        let (a, b) = (pair.0 as usize, pair.1 as usize);
        let reporter = hw_idx as usize;
        if a >= TFE_HW_NUM_MAX || b >= TFE_HW_NUM_MAX || reporter >= TFE_HW_NUM_MAX {
            return Correlation::Pending;
        }

        counts[reporter] = counts[reporter].saturating_add(1);
        if counts[a] == counts[b] {
            counts[a] = 0;
            counts[b] = 0;
            return Correlation::Deliver;
        }
        if counts[a].abs_diff(counts[b]) <= 1 {
            return Correlation::Pending;
        }
        if *mismatch > budget {
            return Correlation::HardFailure;
        }

        let first = *mismatch == 0;
        for idx in [a, b] {
            if counts[idx] >= 2 {
                counts[idx] -= 1;
                *mismatch += 1;
            }
        }
        Correlation::Mismatch { first }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Control-path state of a context.
#[derive(Debug)]
pub struct ContextState {
    pub pool: EntryPool,
    pub csid: Vec<EntryId>,
    pub tfe_in: Vec<EntryId>,
    pub tfe_out: [Option<ResEntry>; OUT_RES_MAX],
    pub tpg: Option<EntryId>,
    pub cdm_handle: Option<CdmHandle>,
    pub init_done: bool,
    pub is_tpg: bool,
    pub applied_req_id: u64,
    pub last_dump_flush_req_id: u64,
    pub last_dump_err_req_id: u64,
}

impl ContextState {
    pub fn new(res_pool_size: usize) -> Self {
        Self {
            pool: EntryPool::new(res_pool_size),
            csid: Vec::new(),
            tfe_in: Vec::new(),
            tfe_out: std::array::from_fn(|_| None),
            tpg: None,
            cdm_handle: None,
            init_done: false,
            is_tpg: false,
            applied_req_id: 0,
            last_dump_flush_req_id: 0,
            last_dump_err_req_id: 0,
        }
    }

    pub fn csid_entries(&self) -> impl Iterator<Item = &ResEntry> {
        self.csid.iter().filter_map(|id| self.pool.get(*id))
    }

    pub fn tfe_in_entries(&self) -> impl Iterator<Item = &ResEntry> {
        self.tfe_in.iter().filter_map(|id| self.pool.get(*id))
    }

    pub fn tfe_out_entries(&self) -> impl Iterator<Item = &ResEntry> {
        self.tfe_out.iter().flatten()
    }

    pub fn tfe_out_mut(&mut self, id: OutResId) -> &mut Option<ResEntry> {
        &mut self.tfe_out[id.index()]
    }

    pub fn tpg_entry(&self) -> Option<&ResEntry> {
        self.tpg.and_then(|id| self.pool.get(id))
    }

    /// Every bound node: CSID, TFE inputs, TFE outputs, pattern generator.
    pub fn all_nodes(&self) -> Vec<BoundNode> {
        self.csid_entries()
            .chain(self.tfe_in_entries())
            .chain(self.tfe_out_entries())
            .chain(self.tpg_entry())
            .flat_map(|e| e.nodes().map(|(_, n)| n.clone()).collect::<Vec<_>>())
            .collect()
    }

    /// Release every entry back to the pool and its nodes back to their adapters.
    pub fn release_resources(&mut self) {
        for id in self.csid.drain(..).chain(self.tfe_in.drain(..)).collect::<Vec<_>>() {
            self.pool.release(id);
        }
        for slot in self.tfe_out.iter_mut() {
            if let Some(mut entry) = slot.take() {
                entry.release_nodes();
            }
        }
        if let Some(id) = self.tpg.take() {
            self.pool.release(id);
        }
    }

    /// Back to post-init defaults. Resources must already be released.
    pub fn reset(&mut self) {
        self.cdm_handle = None;
        self.init_done = false;
        self.is_tpg = false;
        self.applied_req_id = 0;
        self.last_dump_flush_req_id = 0;
        self.last_dump_err_req_id = 0;
    }
}

/// One slot of the context pool.
pub struct HwMgrContext {
    index: usize,
    pub(crate) in_use: AtomicBool,
    pub(crate) overflow_pending: AtomicBool,
    pub(crate) cdm_done: AtomicBool,
    pub(crate) is_dual: AtomicBool,
    pub(crate) master_hw_idx: AtomicU32,
    pub(crate) rdi_only: AtomicBool,
    /// Set by a successful start, cleared by stop and release.
    pub(crate) streaming: AtomicBool,
    pub(crate) config_done: Completion,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) bases: RwLock<BaseTable>,
    pub(crate) counters: Mutex<EventCounters>,
    pub(crate) callbacks: RwLock<CallbackTable>,
    /// Left CSID pixel path; SOF timestamps are read from it.
    pub(crate) time_source: RwLock<Option<BoundNode>>,
}

impl HwMgrContext {
    pub fn new(index: usize, res_pool_size: usize) -> Self {
        Self {
            index,
            in_use: AtomicBool::new(false),
            overflow_pending: AtomicBool::new(false),
            cdm_done: AtomicBool::new(false),
            is_dual: AtomicBool::new(false),
            master_hw_idx: AtomicU32::new(0),
            rdi_only: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            config_done: Completion::new(),
            state: Mutex::new(ContextState::new(res_pool_size)),
            bases: RwLock::new(BaseTable::default()),
            counters: Mutex::new(EventCounters::default()),
            callbacks: RwLock::new(CallbackTable::default()),
            time_source: RwLock::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn overflow_pending(&self) -> bool {
        self.overflow_pending.load(Ordering::Acquire)
    }

    pub fn is_dual(&self) -> bool {
        self.is_dual.load(Ordering::Acquire)
    }

    pub fn master_hw_idx(&self) -> u32 {
        self.master_hw_idx.load(Ordering::Acquire)
    }

    pub fn rdi_only(&self) -> bool {
        self.rdi_only.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Clear every flag and table the event path reads.
    pub(crate) fn reset_runtime(&self) {
        self.in_use.store(false, Ordering::Release);
        self.overflow_pending.store(false, Ordering::Release);
        self.cdm_done.store(false, Ordering::Release);
        self.is_dual.store(false, Ordering::Release);
        self.master_hw_idx.store(0, Ordering::Release);
        self.rdi_only.store(false, Ordering::Release);
        self.streaming.store(false, Ordering::Release);
        self.config_done.complete_all();
        self.bases.write().clear();
        *self.counters.lock() = EventCounters::default();
        *self.callbacks.write() = CallbackTable::default();
        *self.time_source.write() = None;
    }

    /// Point-in-time copy of the context's bookkeeping.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock();
        let entry = |e: &ResEntry| EntrySnapshot::from(e);
        ContextSnapshot {
            index: self.index,
            in_use: self.in_use(),
            overflow_pending: self.overflow_pending(),
            is_dual: self.is_dual(),
            master_hw_idx: self.master_hw_idx(),
            rdi_only: self.rdi_only(),
            streaming: self.is_streaming(),
            init_done: state.init_done,
            is_tpg: state.is_tpg,
            has_cdm: state.cdm_handle.is_some(),
            applied_req_id: state.applied_req_id,
            last_dump_flush_req_id: state.last_dump_flush_req_id,
            last_dump_err_req_id: state.last_dump_err_req_id,
            bases: self.bases.read().entries().to_vec(),
            counters: self.counters.lock().clone(),
            csid: state.csid_entries().map(entry).collect(),
            tfe_in: state.tfe_in_entries().map(entry).collect(),
            tfe_out: state.tfe_out_entries().map(entry).collect(),
            tpg: state.tpg_entry().map(entry),
            free_entries: state.pool.available(),
            entry_capacity: state.pool.capacity(),
            callbacks_registered: !self.callbacks.read().is_empty(),
        }
    }
}

/// Snapshot of one bound node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub split: SplitId,
    pub hw_idx: u32,
    pub sync_mode: SyncMode,
    pub partner_hw_idx: Option<u32>,
    pub is_master: bool,
    pub state: NodeState,
    pub primary_rdi: bool,
}

/// Snapshot of one resource entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub kind: ResourceKind,
    pub res_id: u32,
    pub is_dual: bool,
    pub num_children: u32,
    pub nodes: Vec<NodeSnapshot>,
}

impl From<&ResEntry> for EntrySnapshot {
    fn from(e: &ResEntry) -> Self {
        Self {
            kind: e.kind,
            res_id: e.res_id,
            is_dual: e.is_dual,
            num_children: e.num_children,
            nodes: e
                .nodes()
                .map(|(split, n)| {
                    let node = n.node();
                    NodeSnapshot {
                        split,
                        hw_idx: node.hw_idx(),
                        sync_mode: node.sync_mode(),
                        partner_hw_idx: node.partner_hw_idx(),
                        is_master: node.is_master(),
                        state: node.state(),
                        primary_rdi: node.is_primary_rdi(),
                    }
                })
                .collect(),
        }
    }
}

/// Point-in-time view of a context, for clients and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub index: usize,
    pub in_use: bool,
    pub overflow_pending: bool,
    pub is_dual: bool,
    pub master_hw_idx: u32,
    pub rdi_only: bool,
    pub streaming: bool,
    pub init_done: bool,
    pub is_tpg: bool,
    pub has_cdm: bool,
    pub applied_req_id: u64,
    pub last_dump_flush_req_id: u64,
    pub last_dump_err_req_id: u64,
    pub bases: Vec<BaseInfo>,
    pub counters: EventCounters,
    pub csid: Vec<EntrySnapshot>,
    pub tfe_in: Vec<EntrySnapshot>,
    pub tfe_out: Vec<EntrySnapshot>,
    pub tpg: Option<EntrySnapshot>,
    pub free_entries: usize,
    pub entry_capacity: usize,
    pub callbacks_registered: bool,
}

impl ContextSnapshot {
    pub fn num_base(&self) -> usize {
        self.bases.len()
    }

    /// True when the context holds nothing and every flag is at its default.
    pub fn is_pristine(&self) -> bool {
        !self.in_use
            && !self.overflow_pending
            && !self.is_dual
            && self.master_hw_idx == 0
            && !self.rdi_only
            && !self.streaming
            && !self.init_done
            && !self.is_tpg
            && !self.has_cdm
            && self.applied_req_id == 0
            && self.last_dump_flush_req_id == 0
            && self.last_dump_err_req_id == 0
            && self.bases.is_empty()
            && self.counters.is_zero()
            && self.csid.is_empty()
            && self.tfe_in.is_empty()
            && self.tfe_out.is_empty()
            && self.tpg.is_none()
            && self.free_entries == self.entry_capacity
            && !self.callbacks_registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_recording_is_idempotent_and_upgrades_unknown_split() {
        let mut bases = BaseTable::default();
        bases.add(1, None).unwrap();
        bases.add(1, Some(SplitId::Right)).unwrap();
        assert_eq!(bases.len(), 1);
        assert_eq!(bases.entries()[0].split, Some(SplitId::Right));

        // A concrete role is never overwritten.
        bases.add(1, Some(SplitId::Left)).unwrap();
        bases.add(1, None).unwrap();
        assert_eq!(bases.len(), 1);
        assert_eq!(bases.entries()[0].split, Some(SplitId::Right));
    }

    #[test]
    fn base_table_capacity_is_an_error() {
        let mut bases = BaseTable::default();
        for idx in 0..TFE_HW_NUM_MAX as u32 {
            bases.add(idx, None).unwrap();
        }
        assert!(bases.add(99, None).is_err());
    }

    #[test]
    fn master_prefers_left_split() {
        let mut bases = BaseTable::default();
        bases.add(2, Some(SplitId::Right)).unwrap();
        bases.add(0, Some(SplitId::Left)).unwrap();
        assert_eq!(bases.master(), Some(0));

        let mut single = BaseTable::default();
        single.add(2, None).unwrap();
        assert_eq!(single.master(), Some(2));
    }

    #[test]
    fn entry_pool_is_bounded_and_recycles() {
        let mut pool = EntryPool::new(2);
        let a = pool.acquire(ResourceKind::CsidPath, 0).unwrap();
        let _b = pool.acquire(ResourceKind::TfeIn, 0).unwrap();
        assert!(matches!(
            pool.acquire(ResourceKind::TfeIn, 1),
            Err(HwMgrError::NoFreeResource { capacity: 2 })
        ));
        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire(ResourceKind::TfeIn, 1).is_ok());
    }

    #[test]
    fn paired_events_deliver_and_reset() {
        let mut counters = EventCounters::default();
        assert_eq!(
            counters.correlate(PeriodicEvent::Sof, 1, (0, 1), 10),
            Correlation::Pending
        );
        assert_eq!(
            counters.correlate(PeriodicEvent::Sof, 0, (0, 1), 10),
            Correlation::Deliver
        );
        assert!(counters.is_zero());
    }

    #[test]
    fn drift_is_pulled_back_and_first_mismatch_flagged() {
        let mut counters = EventCounters::default();
        counters.correlate(PeriodicEvent::Eof, 0, (0, 1), 10);
        assert_eq!(
            counters.correlate(PeriodicEvent::Eof, 0, (0, 1), 10),
            Correlation::Mismatch { first: true }
        );
        assert_eq!(counters.eof[0], 1);
        assert_eq!(counters.mismatch, 1);
        assert_eq!(
            counters.correlate(PeriodicEvent::Eof, 0, (0, 1), 10),
            Correlation::Mismatch { first: false }
        );
    }

    #[test]
    fn exhausted_budget_saturates_instead_of_wrapping() {
        let mut counters = EventCounters {
            mismatch: 11,
            ..EventCounters::default()
        };
        counters.sof[0] = u32::MAX;
        assert_eq!(
            counters.correlate(PeriodicEvent::Sof, 0, (0, 1), 10),
            Correlation::HardFailure
        );
        assert_eq!(counters.sof[0], u32::MAX);
    }
}
