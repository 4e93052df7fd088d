//! Processor trait: per-item work against an external API.

use async_trait::async_trait;

use crate::types::WorkItem;

/// Successful processing result.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Item was processed; the payload is opaque to the engine.
    Success(serde_json::Value),
    /// Item was deliberately not processed (e.g. private or banned target).
    Skipped(String),
}

/// Per-item error. Translated from the adapter's native errors exactly once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// Worth retrying: rate limited, timeouts, upstream 5xx.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ItemError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ItemError::Transient(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            ItemError::Transient(d) | ItemError::Permanent(d) => d,
        }
    }
}

/// Domain-specific collector. Called concurrently from several tasks.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "processor"
    }

    async fn process(&self, item: &WorkItem) -> Result<Processed, ItemError>;
}
