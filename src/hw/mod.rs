//! Hardware adapter abstraction
//!
//! Every hardware block the manager drives (CSID paths, TFE inputs and outputs,
//! the pattern generator) sits behind the [`HwInterface`] trait. The manager
//! never branches on the concrete block; it reserves [`ResourceNode`]s through
//! the trait and calls back into the owning adapter through [`BoundNode`].
//!
//! Adapters own their nodes. A context only holds shared references, so a node
//! is never copied and is returned to its adapter with `release`.
//!
//! Hardware events flow the other way: the manager hands an [`EventSink`] to the
//! adapter in [`ReserveArgs`], and the adapter's interrupt path reports
//! [`HwEvent`]s through it.

pub mod mock;
pub mod types;

pub use types::{
    BwControl, CsidPathId, HaltMode, HwType, NodeState, OutResId, ResetType, ResourceKind,
    SplitId, SyncMode, TfeInId, UsageType, OUT_RES_MAX,
};

use crate::error::HwResult;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_NODE_HANDLE: AtomicU32 = AtomicU32::new(1);

/// One concrete reservation on one physical hardware unit.
pub struct ResourceNode {
    kind: ResourceKind,
    res_id: u32,
    hw_idx: u32,
    handle: u32,
    sync_mode: SyncMode,
    partner_hw_idx: Option<u32>,
    is_master: bool,
    state: AtomicU8,
    primary_rdi: AtomicBool,
}

impl ResourceNode {
    /// Create a node in the `Reserved` state from the reservation arguments.
    pub fn reserved(hw_idx: u32, args: &ReserveArgs) -> Self {
        Self {
            kind: args.kind,
            res_id: args.res_id,
            hw_idx,
            handle: NEXT_NODE_HANDLE.fetch_add(1, Ordering::Relaxed),
            sync_mode: args.sync_mode,
            partner_hw_idx: args.partner_hw_idx,
            is_master: args.is_master,
            state: AtomicU8::new(NodeState::Reserved as u8),
            primary_rdi: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn res_id(&self) -> u32 {
        self.res_id
    }

    pub fn hw_idx(&self) -> u32 {
        self.hw_idx
    }

    /// Process-unique handle reported in buffer-done events.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Hardware index of the opposite split, if reserved as part of a pair.
    pub fn partner_hw_idx(&self) -> Option<u32> {
        self.partner_hw_idx
    }

    /// True for the left output of a dual-pipe pair.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Marks the per-channel path that owns IRQ subscription in an RDI-only context.
    pub fn set_primary_rdi(&self, primary: bool) {
        self.primary_rdi.store(primary, Ordering::Release);
    }

    pub fn is_primary_rdi(&self) -> bool {
        self.primary_rdi.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("kind", &self.kind)
            .field("res_id", &self.res_id)
            .field("hw_idx", &self.hw_idx)
            .field("sync_mode", &self.sync_mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Receives events raised by an adapter's interrupt path.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: HwEvent);
}

/// Arguments for [`HwInterface::reserve`].
#[derive(Clone)]
pub struct ReserveArgs {
    pub kind: ResourceKind,
    pub res_id: u32,
    pub sync_mode: SyncMode,
    pub partner_hw_idx: Option<u32>,
    /// Left output of a dual pair.
    pub is_master: bool,
    /// Sensor PHY (or pattern generator) feeding a CSID path.
    pub phy_sel: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub secure: bool,
    pub event_sink: Option<Arc<dyn EventSink>>,
}

impl ReserveArgs {
    pub fn new(kind: ResourceKind, res_id: u32) -> Self {
        Self {
            kind,
            res_id,
            sync_mode: SyncMode::None,
            partner_hw_idx: None,
            is_master: false,
            phy_sel: 0,
            width: 0,
            height: 0,
            format: 0,
            secure: false,
            event_sink: None,
        }
    }
}

impl fmt::Debug for ReserveArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReserveArgs")
            .field("kind", &self.kind)
            .field("res_id", &self.res_id)
            .field("sync_mode", &self.sync_mode)
            .field("partner_hw_idx", &self.partner_hw_idx)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Commands routed through [`HwInterface::process_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCommand {
    /// Read the SOF timestamp latched by a CSID path.
    GetTime,
    BwControl(BwControl),
    BwUpdate { camnoc_bw: u64, axi_bw: u64 },
    SetCsidDebug(u32),
    SetCamifDebug(u32),
    SofIrqDebug(bool),
    DumpRegisters,
    DumpIrqRegisters,
}

/// Reply to a [`HwCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    Done,
    Time { sof_ts: u64, boot_ts: u64 },
}

/// Capability summary returned by [`HwInterface::get_hw_caps`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HwCaps {
    pub hw_type: HwType,
    pub hw_idx: u32,
    pub version: u32,
    pub num_rdi: u32,
    pub supports_pix: bool,
}

/// Fault subtype reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwFault {
    Overflow,
    Violation,
}

/// What happened on a reporting resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEventKind {
    RegUpdate,
    Sof,
    Epoch,
    Eof,
    Done { handles: Vec<u32> },
    Error(HwFault),
}

/// An event raised by an adapter for one of its reserved resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwEvent {
    pub kind: HwEventKind,
    pub hw_idx: u32,
    pub res_kind: ResourceKind,
    pub res_id: u32,
}

impl HwEvent {
    pub fn new(kind: HwEventKind, hw_idx: u32, res_kind: ResourceKind, res_id: u32) -> Self {
        Self {
            kind,
            hw_idx,
            res_kind,
            res_id,
        }
    }

    /// Event on the CAMIF input of TFE `hw_idx`.
    pub fn camif(kind: HwEventKind, hw_idx: u32) -> Self {
        Self::new(kind, hw_idx, ResourceKind::TfeIn, TfeInId::Camif.raw())
    }

    /// Event on RDI input `rdi` of TFE `hw_idx`.
    pub fn rdi(kind: HwEventKind, hw_idx: u32, rdi: TfeInId) -> Self {
        Self::new(kind, hw_idx, ResourceKind::TfeIn, rdi.raw())
    }
}

/// Uniform operation set every hardware block implements.
///
/// Calls may block and must not be made from the event path.
pub trait HwInterface: Send + Sync {
    fn hw_idx(&self) -> u32;

    fn hw_type(&self) -> HwType;

    fn get_hw_caps(&self) -> HwCaps;

    /// Reserve a resource. A second reservation of the same resource must fail.
    fn reserve(&self, args: &ReserveArgs) -> HwResult<Arc<ResourceNode>>;

    fn release(&self, node: &ResourceNode) -> HwResult<()>;

    fn init(&self, node: &ResourceNode) -> HwResult<()>;

    fn deinit(&self, node: &ResourceNode) -> HwResult<()>;

    fn start(&self, node: &ResourceNode) -> HwResult<()>;

    fn stop(&self, node: &ResourceNode, halt: HaltMode) -> HwResult<()>;

    /// Reset a path, or the whole core when `node` is `None`.
    /// A return value greater than zero means the reset completed.
    fn reset(&self, node: Option<&ResourceNode>, reset: ResetType) -> HwResult<u32>;

    fn process_command(
        &self,
        node: Option<&ResourceNode>,
        cmd: HwCommand,
    ) -> HwResult<CommandReply>;
}

/// A reserved node together with the adapter that owns it.
#[derive(Clone)]
pub struct BoundNode {
    hw: Arc<dyn HwInterface>,
    node: Arc<ResourceNode>,
}

impl BoundNode {
    pub fn new(hw: Arc<dyn HwInterface>, node: Arc<ResourceNode>) -> Self {
        Self { hw, node }
    }

    pub fn node(&self) -> &ResourceNode {
        &self.node
    }

    pub fn hw_idx(&self) -> u32 {
        self.node.hw_idx()
    }

    pub fn init(&self) -> HwResult<()> {
        self.hw.init(&self.node)
    }

    pub fn deinit(&self) -> HwResult<()> {
        self.hw.deinit(&self.node)
    }

    pub fn start(&self) -> HwResult<()> {
        self.hw.start(&self.node)
    }

    pub fn stop(&self, halt: HaltMode) -> HwResult<()> {
        self.hw.stop(&self.node, halt)
    }

    pub fn release(&self) -> HwResult<()> {
        self.hw.release(&self.node)
    }

    pub fn reset(&self, reset: ResetType) -> HwResult<u32> {
        self.hw.reset(Some(&self.node), reset)
    }

    pub fn command(&self, cmd: HwCommand) -> HwResult<CommandReply> {
        self.hw.process_command(Some(&self.node), cmd)
    }
}

impl fmt::Debug for BoundNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.fmt(f)
    }
}

/// Device tables handed to the manager at construction. Read-only afterwards.
#[derive(Clone, Default)]
pub struct HwDevices {
    /// CSID units, indexed by hardware index.
    pub csid: Vec<Arc<dyn HwInterface>>,
    /// TFE cores, indexed by hardware index. CSID `n` feeds TFE `n`.
    pub tfe: Vec<Arc<dyn HwInterface>>,
    pub tpg: Vec<Arc<dyn HwInterface>>,
}

impl HwDevices {
    pub fn csid_by_idx(&self, hw_idx: u32) -> Option<&Arc<dyn HwInterface>> {
        self.csid.iter().find(|hw| hw.hw_idx() == hw_idx)
    }

    pub fn tfe_by_idx(&self, hw_idx: u32) -> Option<&Arc<dyn HwInterface>> {
        self.tfe.iter().find(|hw| hw.hw_idx() == hw_idx)
    }

    /// Capability summaries sorted by hardware type, then index.
    pub fn sorted_caps(&self) -> Vec<HwCaps> {
        let mut caps: Vec<HwCaps> = self
            .csid
            .iter()
            .chain(self.tfe.iter())
            .chain(self.tpg.iter())
            .map(|hw| hw.get_hw_caps())
            .collect();
        caps.sort_by_key(|c| (c.hw_type, c.hw_idx));
        caps
    }
}
