//! TFE hardware manager
//!
//! Owns the fixed context pool and exposes the public verbs: acquire, start,
//! stop, config, release, reset and cmd. Hardware events enter through
//! [`TfeHwManager::handle_hw_event`] (or through the [`EventSink`] each adapter
//! receives at reservation) and are correlated and forwarded to the owning
//! context's callbacks without blocking.
//!
//! # Design
//!
//! - The context pool is split into free and used lists behind one mutex.
//! - Per-context control operations are serialized by the caller; each one
//!   takes the context's state lock for its synchronous part only.
//! - Fault recovery needs blocking stop/reset/restart calls, so it is handed to
//!   a dedicated worker task over an unbounded channel. Each cycle's outcome is
//!   published on a broadcast channel.
//!
//! # Example
//!
//! ```no_run
//! use tfe_hw_mgr::config::ManagerConfig;
//! use tfe_hw_mgr::hw::mock::MockRig;
//! use tfe_hw_mgr::hw::{OutResId, UsageType};
//! use tfe_hw_mgr::manager::{AcquireArgs, StartArgs, StopArgs, TfeHwManager};
//! use tfe_hw_mgr::ports::InPortInfo;
//!
//! # tokio_test::block_on(async {
//! let rig = MockRig::new(3);
//! let mgr = TfeHwManager::new(ManagerConfig::default(), rig.devices(), rig.cdm_engine())?;
//!
//! let ctx = mgr.acquire(AcquireArgs::new(vec![InPortInfo::sensor(
//!     0,
//!     UsageType::Single,
//!     &[OutResId::Full],
//! )]))?;
//! mgr.start(ctx, StartArgs::default()).await?;
//! mgr.stop(ctx, StopArgs::default()).await?;
//! mgr.release(ctx)?;
//! # Ok::<(), tfe_hw_mgr::error::HwMgrError>(())
//! # });
//! ```

mod acquire;
mod cmd;
mod config_hw;
mod events;
mod lifecycle;
mod recovery;

pub use acquire::AcquireArgs;
pub use cmd::{CmdReply, CtxType, DumpReason, HwMgrCmd, IoBufInfo};
pub use config_hw::{BwUpdate, ConfigArgs, HwUpdateEntry, UpdateKind};
pub use lifecycle::{StartArgs, StopArgs};
pub use recovery::{RecoveryOutcome, RecoveryRecord};

use crate::cdm::CdmEngine;
use crate::config::{DebugFlags, ManagerConfig};
use crate::context::{ContextSnapshot, HwMgrContext};
use crate::error::{AppResult, HwMgrError};
use crate::hw::{EventSink, HwCaps, HwDevices, HwEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to an acquired context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtxHandle(usize);

impl CtxHandle {
    /// Pool index of the context.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CtxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

#[derive(Debug)]
struct CtxLists {
    free: VecDeque<usize>,
    used: Vec<usize>,
}

/// State shared between the public handle, the event sinks and the recovery worker.
pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    pub(crate) debug: Arc<DebugFlags>,
    pub(crate) devices: HwDevices,
    pub(crate) cdm: Arc<dyn CdmEngine>,
    pub(crate) contexts: Vec<Arc<HwMgrContext>>,
    lists: Mutex<CtxLists>,
    pub(crate) active_ctx_cnt: AtomicUsize,
    recovery_tx: Mutex<Option<mpsc::UnboundedSender<RecoveryRecord>>>,
    pub(crate) recovery_events: broadcast::Sender<RecoveryOutcome>,
    self_ref: Weak<Shared>,
}

impl Shared {
    pub(crate) fn ctx(&self, handle: CtxHandle) -> AppResult<&Arc<HwMgrContext>> {
        self.contexts
            .get(handle.0)
            .ok_or(HwMgrError::InvalidContext(handle.0))
    }

    /// Look up a context and require it to be acquired.
    pub(crate) fn ctx_in_use(&self, handle: CtxHandle) -> AppResult<&Arc<HwMgrContext>> {
        let ctx = self.ctx(handle)?;
        if !ctx.in_use() {
            return Err(HwMgrError::ContextNotInUse(handle.0));
        }
        Ok(ctx)
    }

    pub(crate) fn get_free_ctx(&self) -> AppResult<Arc<HwMgrContext>> {
        let idx = self
            .lists
            .lock()
            .free
            .pop_front()
            .ok_or(HwMgrError::NoFreeContext)?;
        Ok(self.contexts[idx].clone())
    }

    pub(crate) fn move_to_used(&self, idx: usize) {
        let mut lists = self.lists.lock();
        lists.free.retain(|i| *i != idx);
        if !lists.used.contains(&idx) {
            lists.used.push(idx);
        }
    }

    pub(crate) fn put_free_ctx(&self, idx: usize) {
        let mut lists = self.lists.lock();
        lists.used.retain(|i| *i != idx);
        if !lists.free.contains(&idx) {
            lists.free.push_back(idx);
        }
    }

    pub(crate) fn used_ctx_indices(&self) -> Vec<usize> {
        self.lists.lock().used.clone()
    }

    pub(crate) fn event_sink(&self, ctx_idx: usize) -> Arc<dyn EventSink> {
        Arc::new(HwEventHandler {
            shared: self.self_ref.clone(),
            ctx_idx,
        })
    }

    pub(crate) fn enqueue_recovery(&self, record: RecoveryRecord) {
        let sent = match self.recovery_tx.lock().as_ref() {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        };
        if !sent {
            warn!("Recovery worker unavailable, dropping recovery request");
        }
    }

    pub(crate) fn dec_active(&self) {
        let _ = self
            .active_ctx_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Log a one-line summary of every used context.
    pub(crate) fn dump_all_ctx(&self) {
        for idx in self.used_ctx_indices() {
            let snap = self.contexts[idx].snapshot();
            debug!(
                ctx = idx,
                is_dual = snap.is_dual,
                num_base = snap.num_base(),
                csid = snap.csid.len(),
                tfe_in = snap.tfe_in.len(),
                tfe_out = snap.tfe_out.len(),
                overflow_pending = snap.overflow_pending,
                "Used context"
            );
        }
    }
}

/// Routes adapter events for one context back into the manager.
struct HwEventHandler {
    shared: Weak<Shared>,
    ctx_idx: usize,
}

impl EventSink for HwEventHandler {
    fn on_event(&self, event: HwEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_event(self.ctx_idx, event);
        }
    }
}

/// The hardware manager service object.
pub struct TfeHwManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TfeHwManager {
    /// Build the manager and spawn its recovery worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid and `RuntimeUnavailable`
    /// when called outside a tokio runtime.
    pub fn new(
        config: ManagerConfig,
        devices: HwDevices,
        cdm: Arc<dyn CdmEngine>,
    ) -> AppResult<Self> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| HwMgrError::RuntimeUnavailable)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(32);
        let debug = Arc::new(DebugFlags::from_config(&config.debug));
        let contexts = (0..config.ctx_pool_size)
            .map(|i| Arc::new(HwMgrContext::new(i, config.res_pool_size)))
            .collect();
        let lists = CtxLists {
            free: (0..config.ctx_pool_size).collect(),
            used: Vec::new(),
        };

        let shared = Arc::new_cyclic(|weak| Shared {
            config,
            debug,
            devices,
            cdm,
            contexts,
            lists: Mutex::new(lists),
            active_ctx_cnt: AtomicUsize::new(0),
            recovery_tx: Mutex::new(Some(tx)),
            recovery_events: events_tx,
            self_ref: weak.clone(),
        });

        let worker = runtime.spawn(recovery::run_worker(Arc::downgrade(&shared), rx));

        info!(
            contexts = shared.config.ctx_pool_size,
            csid = shared.devices.csid.len(),
            tfe = shared.devices.tfe.len(),
            tpg = shared.devices.tpg.len(),
            "TFE hardware manager initialized"
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Runtime debug toggles.
    pub fn debug_flags(&self) -> Arc<DebugFlags> {
        self.shared.debug.clone()
    }

    /// Acquire a context and reserve the hardware for `args`.
    pub fn acquire(&self, args: AcquireArgs) -> AppResult<CtxHandle> {
        self.shared.acquire(args)
    }

    /// Decode an acquire payload (see [`crate::wire`]) and acquire.
    pub fn acquire_from_wire(
        &self,
        num_acq: u32,
        payload: &[u8],
        callbacks: crate::event::CallbackTable,
    ) -> AppResult<CtxHandle> {
        let in_ports = crate::wire::decode_acquire(num_acq, payload)?;
        self.shared.acquire(AcquireArgs {
            in_ports,
            callbacks,
        })
    }

    pub async fn start(&self, handle: CtxHandle, args: StartArgs) -> AppResult<()> {
        self.shared.start_hw(handle, args).await
    }

    pub async fn stop(&self, handle: CtxHandle, args: StopArgs) -> AppResult<()> {
        self.shared.stop_hw(handle, args).await
    }

    /// Apply a prepared command list.
    pub async fn config_hw(&self, handle: CtxHandle, args: ConfigArgs) -> AppResult<()> {
        let ctx = self.shared.ctx_in_use(handle)?.clone();
        self.shared.config_hw(&ctx, args).await
    }

    pub fn release(&self, handle: CtxHandle) -> AppResult<()> {
        self.shared.release_hw(handle)
    }

    /// Reset every CSID path of the context, then every TFE core it uses.
    pub fn reset(&self, handle: CtxHandle) -> AppResult<()> {
        self.shared.reset_hw(handle)
    }

    pub fn cmd(&self, handle: CtxHandle, cmd: HwMgrCmd) -> AppResult<CmdReply> {
        self.shared.cmd(handle, cmd)
    }

    /// Capabilities of every hardware unit, sorted by type and index.
    pub fn hw_caps(&self) -> Vec<HwCaps> {
        self.shared.devices.sorted_caps()
    }

    /// Feed a hardware event for `handle` into the event path. Never blocks.
    pub fn handle_hw_event(&self, handle: CtxHandle, event: HwEvent) {
        self.shared.handle_event(handle.0, event);
    }

    pub fn snapshot(&self, handle: CtxHandle) -> AppResult<ContextSnapshot> {
        Ok(self.shared.ctx(handle)?.snapshot())
    }

    /// Receive the outcome of each recovery cycle.
    pub fn subscribe_recovery(&self) -> broadcast::Receiver<RecoveryOutcome> {
        self.shared.recovery_events.subscribe()
    }

    pub fn free_contexts(&self) -> usize {
        self.shared.lists.lock().free.len()
    }

    pub fn used_contexts(&self) -> usize {
        self.shared.lists.lock().used.len()
    }

    /// Contexts that are initialized and counted as active.
    pub fn active_contexts(&self) -> usize {
        self.shared.active_ctx_cnt.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.contexts.len()
    }

    /// Close the recovery queue and wait for the worker to drain.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.shared.recovery_tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let timeout = self.shared.config.recovery_shutdown_timeout();
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(())) => debug!("Recovery worker stopped"),
                Ok(Err(e)) => warn!(error = %e, "Recovery worker panicked"),
                Err(_) => warn!(?timeout, "Recovery worker did not stop in time"),
            }
        }
        info!("TFE hardware manager shut down");
        Ok(())
    }
}
