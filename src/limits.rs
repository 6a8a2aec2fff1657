//! Hard limits for the TFE hardware generation handled by this crate.
//!
//! Containers sized by these constants are bounded; overflowing one is an
//! explicit error, never silent truncation.

/// Number of splits (left/right) a dual-pipe resource can bind.
pub const SPLIT_MAX: usize = 2;

/// Number of physical TFE cores (and matching CSID units).
pub const TFE_HW_NUM_MAX: usize = 3;

/// Upper bound on the context pool size accepted by configuration.
pub const CTX_MAX: usize = 16;

/// Default number of contexts in the pool.
pub const DEFAULT_CTX_POOL_SIZE: usize = 8;

/// Default per-context resource entry pool capacity.
pub const DEFAULT_RES_POOL_SIZE: usize = 20;

/// Default maximum number of entries in one command-DMA batch.
pub const DEFAULT_ENTRIES_MAX: usize = 20;

/// Default wait for the first ("init") command batch, in milliseconds.
pub const DEFAULT_CONFIG_TIMEOUT_MS: u64 = 60;

/// Default bound on the stop path's config-done wait, in milliseconds.
pub const DEFAULT_STOP_WAIT_TIMEOUT_MS: u64 = 200;

/// Dual-pipe IRQ mismatches tolerated before correlation gives up.
pub const DEFAULT_MISMATCH_BUDGET: u32 = 10;

/// Maximum number of inputs an acquisition may route from one pattern generator.
pub const TPG_INPUTS_MAX: usize = 4;

/// `num_acq` value selecting the packed acquire wire format.
pub const ACQUIRE_COMPAT_SENTINEL: u32 = 0x8000;
