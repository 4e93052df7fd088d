//! # Harvest Core
//!
//! Shared vocabulary for the batch ingestion engine: configuration, the error
//! taxonomy, the data model (work items, batches, outcomes, summaries) and the
//! narrow traits through which the engine talks to its collaborators.
//!
//! ```text
//! Processor  : per-item work against the external API
//! Notifier   : delivers the end-of-run summary
//! BatchStore : persists the roster and the batch cursor
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use traits::{BatchStore, ItemError, Notifier, Processed, Processor};
pub use types::{
    Batch, Cursor, FailureKind, FailureSample, Outcome, OutcomeKind, RunStatus, RunSummary,
    WorkItem,
};
