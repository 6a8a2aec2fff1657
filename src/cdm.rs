//! Command-DMA engine interface and the config-done completion signal.
//!
//! The CDM executes register-write command lists asynchronously. Each context
//! owns exactly one CDM channel for its whole lifetime and registers a callback
//! that the engine invokes when a submitted batch has been applied. The
//! callback fires a [`Completion`] which the config path (init requests) and the
//! stop path wait on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Opaque channel handle issued by the engine.
pub type CdmHandle = u32;

/// Outcome reported to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmStatus {
    Success,
    Error,
    PageFault,
}

/// Invoked by the engine with `(handle, status, cookie)` once a batch is done.
/// The cookie is the request id the batch was submitted for.
pub type CdmCallback = Arc<dyn Fn(CdmHandle, CdmStatus, u64) + Send + Sync>;

/// Queue priority of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdmPriority {
    #[default]
    Fifo0,
    Fifo1,
}

/// Channel acquisition request.
#[derive(Clone)]
pub struct CdmAcquireArgs {
    pub client: String,
    /// Hardware indices whose register windows the channel may write.
    pub base_windows: Vec<u32>,
    pub priority: CdmPriority,
    pub callback: CdmCallback,
}

impl fmt::Debug for CdmAcquireArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdmAcquireArgs")
            .field("client", &self.client)
            .field("base_windows", &self.base_windows)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// One buffer-list entry of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdmBlEntry {
    pub mem_handle: u32,
    pub offset: u32,
    pub len: u32,
    pub arbitrate: bool,
}

/// An ordered batch of command buffers submitted in one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CdmBatch {
    pub cookie: u64,
    pub entries: Vec<CdmBlEntry>,
}

/// Errors reported by a CDM engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CdmError {
    #[error("no free CDM channel")]
    NoChannel,
    #[error("unknown CDM handle {0}")]
    UnknownHandle(CdmHandle),
    #[error("CDM rejected request: {0}")]
    Rejected(String),
}

/// Operations the manager needs from the command-DMA engine.
pub trait CdmEngine: Send + Sync {
    fn acquire(&self, args: CdmAcquireArgs) -> Result<CdmHandle, CdmError>;

    /// Queue a batch. Completion is reported through the channel's callback.
    fn submit_batch(&self, handle: CdmHandle, batch: CdmBatch) -> Result<(), CdmError>;

    fn stream_on(&self, handle: CdmHandle) -> Result<(), CdmError>;

    fn stream_off(&self, handle: CdmHandle) -> Result<(), CdmError>;

    fn release(&self, handle: CdmHandle) -> Result<(), CdmError>;
}

/// Re-armable "all waiters" completion.
///
/// Starts out completed so a stop with nothing in flight does not wait.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<bool>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    /// Wake every current and future waiter until the next [`Self::reinit`].
    pub fn complete_all(&self) {
        self.tx.send_replace(true);
    }

    pub fn reinit(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until completed. Returns `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let done = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }
}
