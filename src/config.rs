//! Manager configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `TFEHW_` (nested keys split on `__`)
//!
//! ```text
//! TFEHW_CTX_POOL_SIZE=4
//! TFEHW_CONFIG_TIMEOUT_MS=100
//! TFEHW_DEBUG__ENABLE_RECOVERY=true
//! ```
//!
//! The `debug` table only seeds [`DebugFlags`]; the flags themselves are atomics
//! that can be flipped while the manager runs.
//!
//! # Example
//!
//! ```no_run
//! use tfe_hw_mgr::config::ManagerConfig;
//!
//! let config = ManagerConfig::load_from("config/tfe_hw_mgr.toml")?;
//! println!("contexts: {}", config.ctx_pool_size);
//! # Ok::<(), tfe_hw_mgr::config::ConfigError>(())
//! ```

use crate::limits::{
    CTX_MAX, DEFAULT_CONFIG_TIMEOUT_MS, DEFAULT_CTX_POOL_SIZE, DEFAULT_ENTRIES_MAX,
    DEFAULT_MISMATCH_BUDGET, DEFAULT_RES_POOL_SIZE, DEFAULT_STOP_WAIT_TIMEOUT_MS,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TFEHW_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of contexts in the pool
    #[serde(default = "default_ctx_pool_size")]
    pub ctx_pool_size: usize,
    /// Resource entries available to each context
    #[serde(default = "default_res_pool_size")]
    pub res_pool_size: usize,
    /// Largest command-DMA batch a single config may submit
    #[serde(default = "default_entries_max")]
    pub entries_max: usize,
    /// Wait for the init config batch, in milliseconds
    #[serde(default = "default_config_timeout")]
    pub config_timeout_ms: u64,
    /// Bound on the stop path's wait for the last batch, in milliseconds
    #[serde(default = "default_stop_wait_timeout")]
    pub stop_wait_timeout_ms: u64,
    /// Dual-pipe IRQ mismatches tolerated before correlation fails hard
    #[serde(default = "default_mismatch_budget")]
    pub mismatch_budget: u32,
    /// Time allowed for the recovery worker to drain on shutdown, in milliseconds
    #[serde(default = "default_recovery_shutdown_timeout")]
    pub recovery_shutdown_timeout_ms: u64,
    /// Initial values of the runtime debug toggles
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Seed values for [`DebugFlags`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugConfig {
    /// Run stop/reset/restart after an input overflow or violation
    #[serde(default)]
    pub enable_recovery: bool,
    /// Dump registers of affected contexts on error
    #[serde(default)]
    pub enable_reg_dump: bool,
    /// Dump registers after every completed request
    #[serde(default)]
    pub per_req_reg_dump: bool,
    /// Debug mask pushed to every CSID path on start
    #[serde(default)]
    pub csid_debug: u32,
    /// Debug mask pushed to every CAMIF input on start
    #[serde(default)]
    pub camif_debug: u32,
}

fn default_ctx_pool_size() -> usize {
    DEFAULT_CTX_POOL_SIZE
}

fn default_res_pool_size() -> usize {
    DEFAULT_RES_POOL_SIZE
}

fn default_entries_max() -> usize {
    DEFAULT_ENTRIES_MAX
}

fn default_config_timeout() -> u64 {
    DEFAULT_CONFIG_TIMEOUT_MS
}

fn default_stop_wait_timeout() -> u64 {
    DEFAULT_STOP_WAIT_TIMEOUT_MS
}

fn default_mismatch_budget() -> u32 {
    DEFAULT_MISMATCH_BUDGET
}

fn default_recovery_shutdown_timeout() -> u64 {
    1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ctx_pool_size: default_ctx_pool_size(),
            res_pool_size: default_res_pool_size(),
            entries_max: default_entries_max(),
            config_timeout_ms: default_config_timeout(),
            stop_wait_timeout_ms: default_stop_wait_timeout(),
            mismatch_budget: default_mismatch_budget(),
            recovery_shutdown_timeout_ms: default_recovery_shutdown_timeout(),
            debug: DebugConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from defaults and `TFEHW_` environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file layered over the defaults, then apply
    /// environment overrides.
    ///
    /// A missing file is not an error; Figment simply contributes nothing for it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ManagerConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(ManagerConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ctx_pool_size == 0 || self.ctx_pool_size > CTX_MAX {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ctx_pool_size {}. Must be 1-{}",
                self.ctx_pool_size, CTX_MAX
            )));
        }
        if self.res_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "res_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.entries_max == 0 {
            return Err(ConfigError::ValidationError(
                "entries_max must be greater than 0".to_string(),
            ));
        }
        if self.config_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "config_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Init config wait as a `Duration`.
    pub fn config_timeout(&self) -> Duration {
        Duration::from_millis(self.config_timeout_ms)
    }

    /// Stop path wait as a `Duration`.
    pub fn stop_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_wait_timeout_ms)
    }

    /// Recovery worker drain timeout as a `Duration`.
    pub fn recovery_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_shutdown_timeout_ms)
    }
}

/// Process-wide debug toggles read by the manager at runtime.
#[derive(Debug, Default)]
pub struct DebugFlags {
    enable_recovery: AtomicBool,
    enable_reg_dump: AtomicBool,
    per_req_reg_dump: AtomicBool,
    csid_debug: AtomicU32,
    camif_debug: AtomicU32,
}

impl DebugFlags {
    /// Build the runtime flags from their configured seed values.
    pub fn from_config(config: &DebugConfig) -> Self {
        Self {
            enable_recovery: AtomicBool::new(config.enable_recovery),
            enable_reg_dump: AtomicBool::new(config.enable_reg_dump),
            per_req_reg_dump: AtomicBool::new(config.per_req_reg_dump),
            csid_debug: AtomicU32::new(config.csid_debug),
            camif_debug: AtomicU32::new(config.camif_debug),
        }
    }

    pub fn recovery_enabled(&self) -> bool {
        self.enable_recovery.load(Ordering::Acquire)
    }

    pub fn set_recovery_enabled(&self, on: bool) {
        self.enable_recovery.store(on, Ordering::Release);
    }

    pub fn reg_dump_enabled(&self) -> bool {
        self.enable_reg_dump.load(Ordering::Acquire)
    }

    pub fn set_reg_dump_enabled(&self, on: bool) {
        self.enable_reg_dump.store(on, Ordering::Release);
    }

    pub fn per_req_reg_dump(&self) -> bool {
        self.per_req_reg_dump.load(Ordering::Acquire)
    }

    pub fn set_per_req_reg_dump(&self, on: bool) {
        self.per_req_reg_dump.store(on, Ordering::Release);
    }

    pub fn csid_debug(&self) -> u32 {
        self.csid_debug.load(Ordering::Acquire)
    }

    pub fn set_csid_debug(&self, mask: u32) {
        self.csid_debug.store(mask, Ordering::Release);
    }

    pub fn camif_debug(&self) -> u32 {
        self.camif_debug.load(Ordering::Acquire)
    }

    pub fn set_camif_debug(&self, mask: u32) {
        self.camif_debug.store(mask, Ordering::Release);
    }
}
