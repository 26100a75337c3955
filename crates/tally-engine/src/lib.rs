//! Ingestion, retirement and export for the classification tally.
//!
//! [`Engine`] drives the loop: it polls an
//! [`EventSource`](tally_core::io::EventSource), applies each classification
//! to a [`TallyStore`](tally_core::store::TallyStore), retires subjects that
//! cross the configured threshold and hands them to the sinks through an
//! [`ExportDispatcher`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod evaluate;
pub mod ingest;
pub mod jsonl;

pub use config::{EngineConfig, StoreFailurePolicy};
pub use dispatch::{DispatchReport, ExportDispatcher};
pub use error::{Error, Result};
pub use ingest::{Engine, IngestStats};
