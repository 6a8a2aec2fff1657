//! Mock Hardware Implementations
//!
//! Simulated CSID, TFE and pattern-generator units plus a mock command-DMA
//! engine, for exercising the manager without real hardware.
//!
//! # Available Mocks
//!
//! - `MockHwUnit` - one physical unit of any [`HwType`], enforcing exclusive reservation
//! - `MockCdm` - command-DMA engine that completes batches immediately or on demand
//! - `MockRig` - a full set of units sharing one [`OpLog`]
//!
//! Every adapter call is appended to the shared [`OpLog`], so tests can assert
//! start/stop ordering across units.

use crate::cdm::{CdmAcquireArgs, CdmBatch, CdmCallback, CdmEngine, CdmError, CdmHandle, CdmStatus};
use crate::error::{HwError, HwResult};
use crate::hw::{
    CommandReply, CsidPathId, EventSink, HaltMode, HwCaps, HwCommand, HwDevices, HwEvent,
    HwEventKind, HwInterface, HwType, NodeState, OutResId, ResetType, ResourceKind, ResourceNode,
    ReserveArgs, TfeInId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Adapter operation recorded by a mock unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Reserve,
    Release,
    Init,
    Deinit,
    Start,
    Stop(HaltMode),
    Reset(ResetType),
    Command(HwCommand),
}

/// One entry in the shared operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub op: MockOp,
    pub hw_type: HwType,
    pub hw_idx: u32,
    pub kind: Option<ResourceKind>,
    pub res_id: Option<u32>,
}

/// Shared, ordered log of adapter calls.
#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<OpRecord>>>);

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: OpRecord) {
        self.0.lock().push(record);
    }

    pub fn snapshot(&self) -> Vec<OpRecord> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Records whose operation matches `pred`, in call order.
    pub fn filter(&self, pred: impl Fn(&MockOp) -> bool) -> Vec<OpRecord> {
        self.0.lock().iter().filter(|r| pred(&r.op)).cloned().collect()
    }

    pub fn starts(&self) -> Vec<OpRecord> {
        self.filter(|op| matches!(op, MockOp::Start))
    }

    pub fn stops(&self) -> Vec<OpRecord> {
        self.filter(|op| matches!(op, MockOp::Stop(_)))
    }

    pub fn resets(&self) -> Vec<OpRecord> {
        self.filter(|op| matches!(op, MockOp::Reset(_)))
    }
}

/// Operations a test can make fail on a mock unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Reserve,
    Init,
    Start,
    Stop,
    /// `reset` returns zero instead of a completed count.
    Reset,
}

type NodeKey = (ResourceKind, u32);

/// A simulated physical unit.
pub struct MockHwUnit {
    hw_type: HwType,
    hw_idx: u32,
    log: OpLog,
    nodes: Mutex<HashMap<NodeKey, Arc<ResourceNode>>>,
    sinks: Mutex<HashMap<NodeKey, Arc<dyn EventSink>>>,
    failures: Mutex<HashSet<FailPoint>>,
    sof_ts: AtomicU64,
}

impl MockHwUnit {
    pub fn new(hw_type: HwType, hw_idx: u32, log: OpLog) -> Self {
        Self {
            hw_type,
            hw_idx,
            log,
            nodes: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            sof_ts: AtomicU64::new(0),
        }
    }

    pub fn csid(hw_idx: u32, log: OpLog) -> Arc<Self> {
        Arc::new(Self::new(HwType::Csid, hw_idx, log))
    }

    pub fn tfe(hw_idx: u32, log: OpLog) -> Arc<Self> {
        Arc::new(Self::new(HwType::Tfe, hw_idx, log))
    }

    pub fn tpg(hw_idx: u32, log: OpLog) -> Arc<Self> {
        Arc::new(Self::new(HwType::Tpg, hw_idx, log))
    }

    pub fn fail(&self, point: FailPoint) {
        self.failures.lock().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Number of resources currently reserved on this unit.
    pub fn reserved_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn node(&self, kind: ResourceKind, res_id: u32) -> Option<Arc<ResourceNode>> {
        self.nodes.lock().get(&(kind, res_id)).cloned()
    }

    /// Raise an event from a reserved resource. Returns `false` if nothing listens.
    pub fn raise(&self, res_kind: ResourceKind, res_id: u32, kind: HwEventKind) -> bool {
        let sink = self.sinks.lock().get(&(res_kind, res_id)).cloned();
        match sink {
            Some(sink) => {
                sink.on_event(HwEvent::new(kind, self.hw_idx, res_kind, res_id));
                true
            }
            None => false,
        }
    }

    /// Raise an event on this unit's CAMIF input.
    pub fn raise_camif(&self, kind: HwEventKind) -> bool {
        self.raise(ResourceKind::TfeIn, TfeInId::Camif.raw(), kind)
    }

    fn failing(&self, point: FailPoint) -> bool {
        self.failures.lock().contains(&point)
    }

    fn record(&self, op: MockOp, node: Option<&ResourceNode>) {
        self.log.push(OpRecord {
            op,
            hw_type: self.hw_type,
            hw_idx: self.hw_idx,
            kind: node.map(ResourceNode::kind),
            res_id: node.map(ResourceNode::res_id),
        });
    }

    fn supports(&self, kind: ResourceKind, res_id: u32) -> bool {
        match (self.hw_type, kind) {
            (HwType::Csid, ResourceKind::CsidPath) => CsidPathId::from_raw(res_id).is_some(),
            (HwType::Tfe, ResourceKind::TfeIn) => TfeInId::from_raw(res_id).is_some(),
            (HwType::Tfe, ResourceKind::TfeOut) => OutResId::from_raw(res_id).is_some(),
            (HwType::Tpg, ResourceKind::Tpg) => true,
            _ => false,
        }
    }

    fn check_owned(&self, node: &ResourceNode) -> HwResult<()> {
        if self.nodes.lock().contains_key(&(node.kind(), node.res_id())) {
            Ok(())
        } else {
            Err(HwError::UnknownResource {
                hw_idx: self.hw_idx,
                res_id: node.res_id(),
            })
        }
    }

    fn injected(&self, point: FailPoint, what: &str) -> HwResult<()> {
        if self.failing(point) {
            Err(HwError::Failed {
                hw_idx: self.hw_idx,
                reason: format!("injected {what} failure"),
            })
        } else {
            Ok(())
        }
    }
}

impl HwInterface for MockHwUnit {
    fn hw_idx(&self) -> u32 {
        self.hw_idx
    }

    fn hw_type(&self) -> HwType {
        self.hw_type
    }

    fn get_hw_caps(&self) -> HwCaps {
        HwCaps {
            hw_type: self.hw_type,
            hw_idx: self.hw_idx,
            version: 0x0100_0000,
            num_rdi: if self.hw_type == HwType::Tpg { 0 } else { 3 },
            supports_pix: self.hw_type != HwType::Tpg,
        }
    }

    fn reserve(&self, args: &ReserveArgs) -> HwResult<Arc<ResourceNode>> {
        if !self.supports(args.kind, args.res_id) {
            return Err(HwError::Unsupported {
                hw_idx: self.hw_idx,
                kind: args.kind,
            });
        }
        self.injected(FailPoint::Reserve, "reserve")?;

        let key = (args.kind, args.res_id);
        let node = {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(&key) {
                return Err(HwError::Busy {
                    hw_idx: self.hw_idx,
                    kind: args.kind,
                    res_id: args.res_id,
                });
            }
            let node = Arc::new(ResourceNode::reserved(self.hw_idx, args));
            nodes.insert(key, node.clone());
            node
        };
        if let Some(sink) = &args.event_sink {
            self.sinks.lock().insert(key, sink.clone());
        }
        self.record(MockOp::Reserve, Some(&node));
        Ok(node)
    }

    fn release(&self, node: &ResourceNode) -> HwResult<()> {
        self.check_owned(node)?;
        let key = (node.kind(), node.res_id());
        self.nodes.lock().remove(&key);
        self.sinks.lock().remove(&key);
        node.set_state(NodeState::Available);
        self.record(MockOp::Release, Some(node));
        Ok(())
    }

    fn init(&self, node: &ResourceNode) -> HwResult<()> {
        self.check_owned(node)?;
        self.record(MockOp::Init, Some(node));
        self.injected(FailPoint::Init, "init")?;
        node.set_state(NodeState::Initialized);
        Ok(())
    }

    fn deinit(&self, node: &ResourceNode) -> HwResult<()> {
        self.check_owned(node)?;
        self.record(MockOp::Deinit, Some(node));
        node.set_state(NodeState::Reserved);
        Ok(())
    }

    fn start(&self, node: &ResourceNode) -> HwResult<()> {
        self.check_owned(node)?;
        self.record(MockOp::Start, Some(node));
        self.injected(FailPoint::Start, "start")?;
        node.set_state(NodeState::Streaming);
        Ok(())
    }

    fn stop(&self, node: &ResourceNode, halt: HaltMode) -> HwResult<()> {
        self.check_owned(node)?;
        self.record(MockOp::Stop(halt), Some(node));
        self.injected(FailPoint::Stop, "stop")?;
        if node.state() == NodeState::Streaming {
            node.set_state(NodeState::Initialized);
        }
        Ok(())
    }

    fn reset(&self, node: Option<&ResourceNode>, reset: ResetType) -> HwResult<u32> {
        self.record(MockOp::Reset(reset), node);
        if self.failing(FailPoint::Reset) {
            Ok(0)
        } else {
            Ok(1)
        }
    }

    fn process_command(
        &self,
        node: Option<&ResourceNode>,
        cmd: HwCommand,
    ) -> HwResult<CommandReply> {
        let reply = match cmd {
            HwCommand::GetTime => {
                let sof_ts = self.sof_ts.fetch_add(33_333_333, Ordering::Relaxed) + 33_333_333;
                CommandReply::Time {
                    sof_ts,
                    boot_ts: sof_ts + 1_000,
                }
            }
            _ => CommandReply::Done,
        };
        self.record(MockOp::Command(cmd), node);
        Ok(reply)
    }
}

struct MockCdmChannel {
    callback: CdmCallback,
    streaming: bool,
    pending: Option<u64>,
}

/// Mock command-DMA engine.
///
/// By default a submitted batch completes inside `submit_batch`. With
/// auto-complete off, the batch stays pending until [`MockCdm::complete_pending`].
pub struct MockCdm {
    channels: Mutex<HashMap<CdmHandle, MockCdmChannel>>,
    next_handle: AtomicU32,
    auto_complete: AtomicBool,
    fail_acquire: AtomicBool,
    fail_submit: AtomicBool,
    submitted: Mutex<Vec<(CdmHandle, CdmBatch)>>,
}

impl Default for MockCdm {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            auto_complete: AtomicBool::new(true),
            fail_acquire: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

impl MockCdm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_acquire(&self, on: bool) {
        self.fail_acquire.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_submit(&self, on: bool) {
        self.fail_submit.store(on, Ordering::SeqCst);
    }

    /// Number of channels currently acquired.
    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_streaming(&self, handle: CdmHandle) -> bool {
        self.channels
            .lock()
            .get(&handle)
            .is_some_and(|ch| ch.streaming)
    }

    /// Every batch submitted so far, in order.
    pub fn submitted(&self) -> Vec<(CdmHandle, CdmBatch)> {
        self.submitted.lock().clone()
    }

    /// Complete every pending batch with `status`. Returns how many fired.
    pub fn complete_pending(&self, status: CdmStatus) -> usize {
        let fired: Vec<(CdmHandle, CdmCallback, u64)> = self
            .channels
            .lock()
            .iter_mut()
            .filter_map(|(handle, ch)| {
                ch.pending
                    .take()
                    .map(|cookie| (*handle, ch.callback.clone(), cookie))
            })
            .collect();
        for (handle, callback, cookie) in &fired {
            callback(*handle, status, *cookie);
        }
        fired.len()
    }
}

impl CdmEngine for MockCdm {
    fn acquire(&self, args: CdmAcquireArgs) -> Result<CdmHandle, CdmError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(CdmError::NoChannel);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().insert(
            handle,
            MockCdmChannel {
                callback: args.callback,
                streaming: false,
                pending: None,
            },
        );
        Ok(handle)
    }

    fn submit_batch(&self, handle: CdmHandle, batch: CdmBatch) -> Result<(), CdmError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(CdmError::Rejected("injected submit failure".to_string()));
        }
        let cookie = batch.cookie;
        let callback = {
            let mut channels = self.channels.lock();
            let ch = channels
                .get_mut(&handle)
                .ok_or(CdmError::UnknownHandle(handle))?;
            ch.pending = Some(cookie);
            ch.callback.clone()
        };
        self.submitted.lock().push((handle, batch));

        if self.auto_complete.load(Ordering::SeqCst) {
            if let Some(ch) = self.channels.lock().get_mut(&handle) {
                ch.pending = None;
            }
            callback(handle, CdmStatus::Success, cookie);
        }
        Ok(())
    }

    fn stream_on(&self, handle: CdmHandle) -> Result<(), CdmError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(&handle)
            .ok_or(CdmError::UnknownHandle(handle))?;
        ch.streaming = true;
        Ok(())
    }

    fn stream_off(&self, handle: CdmHandle) -> Result<(), CdmError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(&handle)
            .ok_or(CdmError::UnknownHandle(handle))?;
        ch.streaming = false;
        Ok(())
    }

    fn release(&self, handle: CdmHandle) -> Result<(), CdmError> {
        self.channels
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(CdmError::UnknownHandle(handle))
    }
}

/// A complete set of mock units: `units` CSIDs and TFEs, one pattern generator.
pub struct MockRig {
    pub csid: Vec<Arc<MockHwUnit>>,
    pub tfe: Vec<Arc<MockHwUnit>>,
    pub tpg: Vec<Arc<MockHwUnit>>,
    pub cdm: Arc<MockCdm>,
    pub log: OpLog,
}

impl MockRig {
    pub fn new(units: u32) -> Self {
        let log = OpLog::new();
        Self {
            csid: (0..units).map(|i| MockHwUnit::csid(i, log.clone())).collect(),
            tfe: (0..units).map(|i| MockHwUnit::tfe(i, log.clone())).collect(),
            tpg: vec![MockHwUnit::tpg(0, log.clone())],
            cdm: MockCdm::new(),
            log,
        }
    }

    /// Device tables for the manager.
    pub fn devices(&self) -> HwDevices {
        HwDevices {
            csid: self
                .csid
                .iter()
                .map(|u| u.clone() as Arc<dyn HwInterface>)
                .collect(),
            tfe: self
                .tfe
                .iter()
                .map(|u| u.clone() as Arc<dyn HwInterface>)
                .collect(),
            tpg: self
                .tpg
                .iter()
                .map(|u| u.clone() as Arc<dyn HwInterface>)
                .collect(),
        }
    }

    pub fn cdm_engine(&self) -> Arc<dyn CdmEngine> {
        self.cdm.clone()
    }

    /// Resources still reserved across every unit.
    pub fn reserved_total(&self) -> usize {
        self.csid
            .iter()
            .chain(self.tfe.iter())
            .chain(self.tpg.iter())
            .map(|u| u.reserved_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_reservation_is_refused() {
        let unit = MockHwUnit::csid(0, OpLog::new());
        let args = ReserveArgs::new(ResourceKind::CsidPath, CsidPathId::Ipp.raw());
        let node = unit.reserve(&args).unwrap();
        assert!(matches!(unit.reserve(&args), Err(HwError::Busy { .. })));

        unit.release(&node).unwrap();
        assert!(unit.reserve(&args).is_ok());
    }

    #[test]
    fn unsupported_kind_is_rejected() {
        let unit = MockHwUnit::tpg(0, OpLog::new());
        let args = ReserveArgs::new(ResourceKind::TfeIn, TfeInId::Camif.raw());
        assert!(matches!(
            unit.reserve(&args),
            Err(HwError::Unsupported { .. })
        ));
    }

    #[test]
    fn cdm_completes_pending_batch_on_demand() {
        let cdm = MockCdm::new();
        cdm.set_auto_complete(false);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let handle = cdm
            .acquire(CdmAcquireArgs {
                client: "test".to_string(),
                base_windows: vec![0],
                priority: Default::default(),
                callback: Arc::new(move |_, _, cookie| {
                    seen_cb.store(cookie, Ordering::SeqCst);
                }),
            })
            .unwrap();

        cdm.submit_batch(
            handle,
            CdmBatch {
                cookie: 42,
                entries: vec![],
            },
        )
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(cdm.complete_pending(CdmStatus::Success), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }
}
