//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tfe_hw_mgr::config::{DebugConfig, ManagerConfig};
use tfe_hw_mgr::event::{CallbackTable, IspErrorType, IspEvent, IspEventKind};
use tfe_hw_mgr::hw::mock::MockRig;
use tfe_hw_mgr::hw::{OutResId, UsageType};
use tfe_hw_mgr::manager::{AcquireArgs, CtxHandle, RecoveryOutcome, TfeHwManager};
use tfe_hw_mgr::ports::InPortInfo;
use tokio::sync::broadcast;

/// A manager wired to a mock rig.
pub struct Harness {
    pub rig: MockRig,
    pub mgr: TfeHwManager,
}

impl Harness {
    pub fn new(units: u32) -> Self {
        Self::with_config(units, ManagerConfig::default())
    }

    pub fn with_config(units: u32, config: ManagerConfig) -> Self {
        let rig = MockRig::new(units);
        let mgr = TfeHwManager::new(config, rig.devices(), rig.cdm_engine())
            .expect("Failed to create manager");
        Self { rig, mgr }
    }

    pub fn acquire(&self, port: InPortInfo) -> CtxHandle {
        self.mgr
            .acquire(AcquireArgs::new(vec![port]))
            .expect("acquire failed")
    }

    pub fn acquire_recorded(&self, port: InPortInfo) -> (CtxHandle, EventRecorder) {
        let recorder = EventRecorder::default();
        let ctx = self
            .mgr
            .acquire(AcquireArgs::new(vec![port]).with_callbacks(recorder.callbacks()))
            .expect("acquire failed");
        (ctx, recorder)
    }
}

pub fn recovery_config() -> ManagerConfig {
    ManagerConfig {
        debug: DebugConfig {
            enable_recovery: true,
            ..DebugConfig::default()
        },
        ..ManagerConfig::default()
    }
}

pub fn single_pix() -> InPortInfo {
    InPortInfo::sensor(0, UsageType::Single, &[OutResId::Full, OutResId::StatsBf])
}

pub fn dual_pix() -> InPortInfo {
    InPortInfo::sensor(1, UsageType::Dual, &[OutResId::Full, OutResId::StatsAwbBg])
}

pub fn rdi_only(outs: &[OutResId]) -> InPortInfo {
    InPortInfo::sensor(2, UsageType::Single, outs)
}

/// Records every event delivered to a context's callbacks.
#[derive(Clone, Default)]
pub struct EventRecorder(Arc<Mutex<Vec<IspEvent>>>);

impl EventRecorder {
    pub fn callbacks(&self) -> CallbackTable {
        let events = self.0.clone();
        CallbackTable::uniform(Arc::new(move |event: &IspEvent| {
            events.lock().push(event.clone());
        }))
    }

    pub fn events(&self) -> Vec<IspEvent> {
        self.0.lock().clone()
    }

    pub fn count(&self, kind: IspEventKind) -> usize {
        self.0.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn errors(&self) -> Vec<(IspErrorType, bool)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                IspEvent::Error {
                    error_type,
                    recovery_enabled,
                } => Some((*error_type, *recovery_enabled)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Wait for the next recovery outcome.
pub async fn next_outcome(rx: &mut broadcast::Receiver<RecoveryOutcome>) -> RecoveryOutcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no recovery outcome within 5s")
        .expect("recovery channel closed")
}

pub fn sorted(mut handles: Vec<CtxHandle>) -> Vec<CtxHandle> {
    handles.sort();
    handles
}
