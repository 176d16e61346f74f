//! Content-addressable patch and installation engine.
//!
//! Parses the binary build manifest format (chunk directory, file manifest
//! list, custom fields), fetches compressed chunks from a prioritized mirror
//! set, reconstructs installed files by splicing chunk byte ranges, and
//! verifies the result with parallel SHA-1 hashing. [`InstallManager`] is
//! the entry point; it runs queued install, update, repair, verify, move and
//! uninstall operations one at a time and reports progress over a broadcast
//! channel.

pub mod errors;
pub mod logging;
pub mod manifest;
pub mod models;
pub mod services;
pub mod utils;

pub use errors::{EngineError, Result};
pub use manifest::Manifest;
pub use models::{EngineEvent, InstallAction, InstallItem, InstallRequest, InstallStatus};
pub use services::{
    CancelHandle, CancelToken, EngineConfig, HttpRepository, InstallManager, ManifestRepository,
};
