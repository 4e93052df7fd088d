//! Error taxonomy for Harvest.
//!
//! Run-level failures live here. Per-item failures are modelled separately by
//! [`crate::traits::ItemError`] and never escape the worker pool except as
//! outcomes.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Another instance holds the run lock. Benign: the run is skipped.
    #[error("lock busy: {path} is held by another process")]
    LockBusy { path: PathBuf },

    /// The lock could not be taken within the configured wait.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Requested cost can never be satisfied, or the bucket itself is invalid.
    #[error("quota misconfiguration: {0}")]
    QuotaMisconfiguration(String),

    /// The run (or a suspend point inside it) was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Notifier handoff failed. Logged by the reporter, never fatal.
    #[error("notifier error: {0}")]
    Notifier(String),

    /// A batch is already in flight; it must be completed first.
    #[error("batch in flight: {0}")]
    BatchInFlight(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// `true` for outcomes that mean "did not run" rather than "broke".
    pub fn is_benign(&self) -> bool {
        matches!(self, HarvestError::LockBusy { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarvestError::Cancelled(_))
    }
}
