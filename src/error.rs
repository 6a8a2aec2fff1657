//! Error types for the hardware manager.
//!
//! Two layers, both built with `thiserror`:
//!
//! - **`HwError`**: what a hardware adapter reports from a single operation
//!   (reserve, init, start, stop, reset, ...).
//! - **`HwMgrError`**: what the manager's public verbs return. Adapter errors are
//!   wrapped with the operation that produced them so the caller can tell a
//!   reservation failure from a start failure.
//!
//! Configuration loading has its own `ConfigError` in [`crate::config`], which
//! converts into `HwMgrError` via `#[from]`.

use crate::config::ConfigError;
use crate::hw::ResourceKind;
use crate::wire::WireError;
use thiserror::Error;

/// Convenience alias for results using the manager error type.
pub type AppResult<T> = std::result::Result<T, HwMgrError>;

/// Result of a single adapter operation.
pub type HwResult<T> = std::result::Result<T, HwError>;

/// Failure reported by a hardware adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    #[error("hardware unit {hw_idx} busy: {kind:?} {res_id} already reserved")]
    Busy {
        hw_idx: u32,
        kind: ResourceKind,
        res_id: u32,
    },

    #[error("hardware unit {hw_idx} does not provide {kind:?}")]
    Unsupported { hw_idx: u32, kind: ResourceKind },

    #[error("hardware unit {hw_idx} has no reserved resource {res_id}")]
    UnknownResource { hw_idx: u32, res_id: u32 },

    #[error("hardware unit {hw_idx} failed: {reason}")]
    Failed { hw_idx: u32, reason: String },
}

/// Errors returned by the manager's entry points.
#[derive(Error, Debug)]
pub enum HwMgrError {
    #[error("no free context in pool")]
    NoFreeContext,

    #[error("no free resource entry (capacity {capacity})")]
    NoFreeResource { capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid context handle {0}")]
    InvalidContext(usize),

    #[error("context {0} is not in use")]
    ContextNotInUse(usize),

    #[error("context {0} has an overflow pending")]
    OverflowPending(usize),

    #[error("no {kind:?} resource could be reserved: {reason}")]
    Reservation { kind: ResourceKind, reason: String },

    #[error("{op} failed: {source}")]
    Hardware {
        op: &'static str,
        #[source]
        source: HwError,
    },

    #[error("CSID reset on hw {hw_idx} did not complete")]
    ResetIncomplete { hw_idx: u32 },

    #[error("command DMA acquire failed: {0}")]
    CdmAcquire(String),

    #[error("command DMA submit failed for request {req_id}: {reason}")]
    Submit { req_id: u64, reason: String },

    #[error("config for request {req_id} timed out after {timeout_ms} ms")]
    ConfigTimeout { req_id: u64, timeout_ms: u64 },

    #[error("context {0} has no recorded hardware base")]
    NoBases(usize),

    #[error("acquire payload rejected: {0}")]
    Wire(#[from] WireError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no tokio runtime available to host the recovery worker")]
    RuntimeUnavailable,
}

impl HwMgrError {
    /// Wraps an adapter error with the name of the failing operation.
    pub fn hw(op: &'static str) -> impl FnOnce(HwError) -> Self {
        move |source| HwMgrError::Hardware { op, source }
    }
}
