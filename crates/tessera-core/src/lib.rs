//! # tessera-core
//!
//! Foundation types for the tessera host/device tensor bridge.
//!
//! Provides:
//! - The error taxonomy every crate reports through (`TesseraError`)
//! - Rank-bounded tensor shapes (`Shape`, `MAX_RANK`)
//! - The engine-side host tensor container (`HostTensor`)
//! - Session configuration (`BridgeConfig`)

pub mod config;
pub mod error;
pub mod host;
pub mod shape;

pub use config::{BackendKind, BridgeConfig, SimDeviceConfig, StreamPolicy};
pub use error::{check_status, TesseraError, STATUS_SUCCESS};
pub use host::HostTensor;
pub use shape::{Dims, Shape, MAX_RANK};

pub type Result<T> = std::result::Result<T, TesseraError>;
