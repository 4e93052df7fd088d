//! # Harvest Scheduler
//!
//! Rate-limited, lock-guarded, bounded-concurrency batch orchestration.
//!
//! ## Design Principles
//! - One instance per job: OS-level `flock`, released on every exit path
//! - One shared token bucket per run: outbound quota is never exceeded
//! - One outcome per item: errors and panics stay inside their item
//! - Cursor moves only after outcomes are reported: at-least-once delivery
//!
//! ## Architecture
//! ```text
//! JobRunner
//!   ├── ExclusiveRunLock   (fail-fast → exit 2, or blocking with timeout)
//!   ├── BatchSource        requeued items first, then roster from cursor
//!   │     └── BatchStore   Json / Sqlite / Memory
//!   ├── WorkerPool         semaphore(concurrency) × TokenBucket × Processor
//!   │     └── RetryPolicy  capped exponential backoff for transient errors
//!   └── RunReporter        aggregate → Notifier (log / webhook) under timeout
//!
//! engine::spawn_job_loop   cron ticks → JobRunner::run
//! ```

pub mod batch;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod limiter;
pub mod lock;
pub mod persistence;
pub mod pool;
pub mod report;
pub mod retry;
pub mod runner;
pub mod store;

pub use batch::{BatchSource, Completion};
pub use dispatch::{LogNotifier, WebhookNotifier, notifier_from_config};
pub use engine::{LoopStats, spawn_job_loop};
pub use limiter::TokenBucket;
pub use lock::{ExclusiveRunLock, LockHolder, RunLockGuard, current_holder};
pub use persistence::SqliteBatchStore;
pub use pool::{PoolReport, WorkerPool};
pub use report::{RunMeta, RunReporter};
pub use retry::RetryPolicy;
pub use runner::{JobRunner, RunReport};
pub use store::{JsonBatchStore, MemoryBatchStore};

use std::sync::Arc;

use harvest_core::config::{HarvestConfig, StoreBackend};
use harvest_core::error::Result;
use harvest_core::traits::BatchStore;

/// Open the batch store the config asks for.
pub fn open_store(config: &HarvestConfig) -> Result<Arc<dyn BatchStore>> {
    let path = config.batch.resolve_state_path(&config.job);
    let store: Arc<dyn BatchStore> = match config.batch.backend {
        StoreBackend::Json => Arc::new(JsonBatchStore::new(&path)?),
        StoreBackend::Sqlite => Arc::new(SqliteBatchStore::open(&path)?),
    };
    tracing::debug!("📂 Batch state at {}", path.display());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_per_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarvestConfig::default();
        config.batch.state_path = dir.path().join("state.json").to_string_lossy().into_owned();
        let store = open_store(&config).unwrap();
        store.replace_roster(&["a".into()]).unwrap();
        assert!(dir.path().join("state.json").exists());

        config.batch.backend = StoreBackend::Sqlite;
        config.batch.state_path = dir.path().join("state.db").to_string_lossy().into_owned();
        let store = open_store(&config).unwrap();
        assert!(store.load_roster().unwrap().is_empty());
        assert!(dir.path().join("state.db").exists());
    }
}
