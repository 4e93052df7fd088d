//! Worker pool: fans a batch out to the processor.
//!
//! At most `concurrency_limit` items are in flight (semaphore), every
//! processor call first takes a token from the shared bucket, and each item
//! runs in its own task so an error or panic only ever produces a failed
//! outcome for that item.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use harvest_core::config::PoolConfig;
use harvest_core::traits::{ItemError, Processed, Processor};
use harvest_core::types::{Batch, FailureKind, Outcome, WorkItem};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::limiter::TokenBucket;
use crate::retry::RetryPolicy;

/// Outcomes of one batch.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Exactly one per submitted item. Completion order, then never-finished
    /// items in batch order.
    pub outcomes: Vec<Outcome>,
    pub cancelled: bool,
}

impl PoolReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

pub struct WorkerPool {
    limiter: Arc<TokenBucket>,
    concurrency_limit: usize,
    grace_period: Duration,
    retry: RetryPolicy,
}

impl WorkerPool {
    pub fn new(limiter: Arc<TokenBucket>, concurrency_limit: usize, grace_period: Duration) -> Self {
        Self {
            limiter,
            concurrency_limit: concurrency_limit.max(1),
            grace_period,
            retry: RetryPolicy::none(),
        }
    }

    pub fn from_config(config: &PoolConfig, limiter: Arc<TokenBucket>) -> Self {
        Self::new(limiter, config.concurrency_limit, config.grace_period())
            .with_retry(RetryPolicy::from_config(config))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Process every item of `batch`.
    ///
    /// When `cancel` fires, undispatched items are reported cancelled, and
    /// in-flight items get the grace period before they are aborted.
    pub async fn run(
        &self,
        batch: &Batch,
        processor: Arc<dyn Processor>,
        cancel: &CancellationToken,
    ) -> PoolReport {
        let total = batch.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut tasks: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut slots = Slots::new(total);

        tracing::info!(
            "🚀 Dispatching batch {} ({} item(s), concurrency {}) to {}",
            batch.id,
            total,
            self.concurrency_limit,
            processor.name()
        );

        for (index, item) in batch.items.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let item = item.clone();
            let processor = processor.clone();
            let limiter = self.limiter.clone();
            let retry = self.retry.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let guarded = AssertUnwindSafe(process_item(
                    item.clone(),
                    processor,
                    limiter,
                    retry,
                    cancel,
                ))
                .catch_unwind();
                let outcome = match guarded.await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let msg = panic_message(&*panic);
                        tracing::error!("💥 Processor panicked on {item}: {msg}");
                        Outcome::failure(
                            item,
                            FailureKind::Permanent,
                            format!("processor panicked: {msg}"),
                            1,
                            Utc::now(),
                        )
                    }
                };
                (index, outcome)
            });

            while let Some(joined) = tasks.try_join_next() {
                slots.record(joined);
            }
        }

        // Drain until done or until cancellation starts the grace period.
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(joined) => slots.record(joined),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled && !tasks.is_empty() {
            tracing::warn!(
                "🛑 Cancelled: giving {} in-flight item(s) {:?} to finish",
                tasks.len(),
                self.grace_period
            );
            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    slots.record(joined);
                }
            };
            if tokio::time::timeout(self.grace_period, drain).await.is_err() {
                tracing::warn!("⏱️ Grace period over, aborting {} item(s)", tasks.len());
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    slots.record(joined);
                }
            }
        }
        cancelled |= cancel.is_cancelled();

        let report = PoolReport {
            outcomes: slots.finish(&batch.items),
            cancelled,
        };
        tracing::info!(
            "🏁 Batch {} drained: {} succeeded, {} failed{}",
            batch.id,
            report.succeeded(),
            report.failed(),
            if cancelled { " (cancelled)" } else { "" }
        );
        report
    }
}

/// Outcomes in completion order plus which batch positions have one.
struct Slots {
    done: Vec<bool>,
    outcomes: Vec<Outcome>,
}

impl Slots {
    fn new(total: usize) -> Self {
        Self {
            done: vec![false; total],
            outcomes: Vec::with_capacity(total),
        }
    }

    fn record(&mut self, joined: std::result::Result<(usize, Outcome), JoinError>) {
        match joined {
            Ok((index, outcome)) => {
                if let Some(done) = self.done.get_mut(index) {
                    *done = true;
                    self.outcomes.push(outcome);
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!("item task failed: {e}"),
        }
    }

    fn finish(mut self, items: &[WorkItem]) -> Vec<Outcome> {
        for (item, done) in items.iter().zip(&self.done) {
            if !done {
                self.outcomes.push(Outcome::cancelled(item.clone(), "run cancelled before the item finished"));
            }
        }
        self.outcomes
    }
}

async fn process_item(
    item: WorkItem,
    processor: Arc<dyn Processor>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Outcome {
    let started_at = Utc::now();
    let mut attempts = 0;
    loop {
        if let Err(e) = limiter.acquire_with_cancel(1.0, &cancel).await {
            let kind = if e.is_cancelled() { FailureKind::Cancelled } else { FailureKind::Permanent };
            return Outcome::failure(item, kind, e.to_string(), attempts, started_at);
        }

        attempts += 1;
        let err = match processor.process(&item).await {
            Ok(Processed::Success(payload)) => {
                tracing::debug!("✅ {item} processed (attempt {attempts})");
                return Outcome::success(item, payload, attempts, started_at);
            }
            Ok(Processed::Skipped(reason)) => {
                tracing::info!("⏭️ {item} skipped: {reason}");
                return Outcome::skipped(item, reason, attempts, started_at);
            }
            Err(e) => e,
        };

        match err {
            ItemError::Permanent(detail) => {
                tracing::warn!("❌ {item} failed permanently: {detail}");
                return Outcome::failure(item, FailureKind::Permanent, detail, attempts, started_at);
            }
            ItemError::Transient(detail) if !retry.should_retry(attempts) => {
                tracing::warn!("❌ {item} still failing after {attempts} attempt(s): {detail}");
                return Outcome::failure(item, FailureKind::Transient, detail, attempts, started_at);
            }
            ItemError::Transient(detail) => {
                let delay = retry.delay_for(attempts - 1);
                tracing::warn!("🔁 {item} transient error ({detail}), retrying in {delay:?}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Outcome::failure(
                            item,
                            FailureKind::Cancelled,
                            format!("cancelled during retry backoff after: {detail}"),
                            attempts,
                            started_at,
                        );
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
