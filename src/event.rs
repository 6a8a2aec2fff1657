//! Events delivered to clients and the per-context callback table.

use std::fmt;
use std::sync::Arc;

/// Classification of a hardware fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IspErrorType {
    /// Input side could not keep up (TFE input or CSID pixel path).
    Overflow,
    /// An output bus client overflowed; hardware drains it on its own.
    BusOverflow,
    /// A protocol rule was broken.
    Violation,
}

/// Event kinds a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IspEventKind {
    Sof,
    Eof,
    Epoch,
    RegUpdate,
    Done,
    Error,
}

impl IspEventKind {
    pub const ALL: [IspEventKind; 6] = [
        IspEventKind::Sof,
        IspEventKind::Eof,
        IspEventKind::Epoch,
        IspEventKind::RegUpdate,
        IspEventKind::Done,
        IspEventKind::Error,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Payload handed to a client callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IspEvent {
    Sof {
        hw_idx: u32,
        timestamp: u64,
        boot_time: u64,
    },
    Eof {
        hw_idx: u32,
    },
    Epoch {
        hw_idx: u32,
    },
    RegUpdate {
        hw_idx: u32,
        res_id: u32,
    },
    Done {
        handles: Vec<u32>,
    },
    Error {
        error_type: IspErrorType,
        recovery_enabled: bool,
    },
}

impl IspEvent {
    pub fn kind(&self) -> IspEventKind {
        match self {
            IspEvent::Sof { .. } => IspEventKind::Sof,
            IspEvent::Eof { .. } => IspEventKind::Eof,
            IspEvent::Epoch { .. } => IspEventKind::Epoch,
            IspEvent::RegUpdate { .. } => IspEventKind::RegUpdate,
            IspEvent::Done { .. } => IspEventKind::Done,
            IspEvent::Error { .. } => IspEventKind::Error,
        }
    }
}

/// Client callback. The opaque client context is whatever the closure captures.
pub type EventCallback = Arc<dyn Fn(&IspEvent) + Send + Sync>;

/// One optional callback per event kind.
#[derive(Clone, Default)]
pub struct CallbackTable {
    slots: [Option<EventCallback>; 6],
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same callback for every event kind.
    pub fn uniform(cb: EventCallback) -> Self {
        let mut table = Self::new();
        for kind in IspEventKind::ALL {
            table.slots[kind.slot()] = Some(cb.clone());
        }
        table
    }

    /// Builder-style registration of one kind.
    pub fn on(mut self, kind: IspEventKind, cb: EventCallback) -> Self {
        self.slots[kind.slot()] = Some(cb);
        self
    }

    pub fn get(&self, kind: IspEventKind) -> Option<EventCallback> {
        self.slots[kind.slot()].clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<IspEventKind> = IspEventKind::ALL
            .into_iter()
            .filter(|k| self.slots[k.slot()].is_some())
            .collect();
        f.debug_struct("CallbackTable")
            .field("registered", &registered)
            .finish()
    }
}
