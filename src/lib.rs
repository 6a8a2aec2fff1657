//! TFE camera ISP hardware manager.
//!
//! This library owns the resource and context lifecycle of the TFE image
//! pipeline: acquiring CSID decode paths, TFE input and output ports and an
//! optional pattern generator for a client's port description, driving them
//! through init/start/stop/release, submitting prepared command lists to the
//! command-DMA engine, and correlating, filtering and recovering from hardware
//! events. Concrete hardware sits behind the [`hw::HwInterface`] and
//! [`cdm::CdmEngine`] traits; [`hw::mock`] provides simulated units.

pub mod cdm;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod hw;
pub mod limits;
pub mod manager;
pub mod ports;
pub mod wire;

pub use config::ManagerConfig;
pub use error::{AppResult, HwMgrError};
pub use manager::{CtxHandle, TfeHwManager};
