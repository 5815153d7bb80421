//! # congregate-sync
//!
//! Bidirectional People/Households sync between Planning Center (Source A)
//! and Fibery (Source B).
//!
//! Build an [`Orchestrator`] over two connectors and a [`CursorStore`], then
//! call [`Orchestrator::run`]. [`run_once`] wires the production connectors
//! from a [`SyncConfig`](congregate_core::SyncConfig).

pub mod connector;
pub mod cursor_store;
pub mod error;
pub mod mapper;
pub mod pipeline;
pub mod reconcile;
pub mod transport;

use congregate_core::SyncConfig;

pub use connector::{Destination, FiberyConnector, HouseholdLink, PcoConnector, Source};
pub use cursor_store::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use error::{MappingError, SyncError, TransportError};
pub use pipeline::{Orchestrator, RunMode, RunReport, RunSettings, RunStage};
pub use transport::Transport;

/// Production connectors for `config`, sharing one HTTP agent.
pub fn connectors(config: &SyncConfig) -> Result<(PcoConnector, FiberyConnector), SyncError> {
    let transport = Transport::from_config(&config.transport);
    let pco = PcoConnector::new(&config.pco, transport.clone());
    let fibery = FiberyConnector::new(config, transport)?;
    Ok((pco, fibery))
}

/// One complete run against the live systems.
pub fn run_once(
    config: &SyncConfig,
    cursors: &mut dyn CursorStore,
    settings: RunSettings,
) -> Result<RunReport, SyncError> {
    let (pco, fibery) = connectors(config)?;
    let report = Orchestrator::new(&pco, &fibery, cursors, settings).run();
    report
}
