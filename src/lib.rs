//! Incremental Singer tap for Zuora's AQuA (batch) and REST (sync) export
//! APIs. See `main.rs` for the CLI surface; this crate is organized the
//! way the tap itself is organized: resolve credentials and a base URL,
//! discover or load a catalog, then drive an export-and-emit loop per
//! selected stream.

pub mod catalog;
pub mod config;
pub mod csv_stream;
pub mod discovery;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod resolver;
pub mod state;
pub mod transport;

use std::sync::Arc;

use drivers::{batch::BatchDriver, sync::SyncDriver, ExportDriver};

/// Picks the export driver implied by `config.api_type`, sharing one
/// `Transport` between discovery and sync so both reuse the same cached
/// OAuth token (if any).
pub fn build_driver(config: &config::Config, transport: Arc<transport::Transport>) -> Arc<dyn ExportDriver> {
    if config.is_aqua() {
        Arc::new(BatchDriver::new(transport))
    } else {
        Arc::new(SyncDriver::new(transport))
    }
}
