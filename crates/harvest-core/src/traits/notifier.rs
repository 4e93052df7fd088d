//! Notifier trait: end-of-run summary delivery.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::RunSummary;

/// Delivers a run summary somewhere a human will see it.
///
/// The engine wraps every call in its own timeout and never lets an error
/// here change the outcome of the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, summary: &RunSummary) -> Result<()>;
}
