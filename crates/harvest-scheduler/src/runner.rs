//! Job runner: one complete, lock-guarded run of a job.
//!
//! ```text
//! lock ─► open source ─► [cut batch ─► pool ─► complete]* ─► summary ─► unlock
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harvest_core::config::HarvestConfig;
use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::{BatchStore, Notifier, Processor};
use harvest_core::types::{Outcome, RunStatus, RunSummary};
use tokio_util::sync::CancellationToken;

use crate::batch::BatchSource;
use crate::limiter::TokenBucket;
use crate::lock::ExclusiveRunLock;
use crate::pool::WorkerPool;
use crate::report::{RunMeta, RunReporter};

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Present whenever at least one batch was cut.
    pub summary: Option<RunSummary>,
    pub outcomes: Vec<Outcome>,
    pub notified: bool,
}

impl RunReport {
    fn early(run_id: String, status: RunStatus) -> Self {
        Self {
            run_id,
            status,
            summary: None,
            outcomes: Vec::new(),
            notified: false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

pub struct JobRunner {
    job: String,
    lock: ExclusiveRunLock,
    store: Arc<dyn BatchStore>,
    limiter: Arc<TokenBucket>,
    pool: WorkerPool,
    reporter: RunReporter,
    max_batch_size: usize,
    batches_per_run: usize,
    rotate: bool,
    run_timeout: Option<Duration>,
}

impl JobRunner {
    pub fn from_config(
        config: &HarvestConfig,
        store: Arc<dyn BatchStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(TokenBucket::from_config(&config.limiter)?);
        Ok(Self {
            job: config.job.clone(),
            lock: ExclusiveRunLock::from_config(&config.lock, &config.job),
            store,
            pool: WorkerPool::from_config(&config.pool, limiter.clone()),
            limiter,
            reporter: RunReporter::from_config(&config.report, notifier),
            max_batch_size: config.batch.max_size,
            batches_per_run: config.batch.batches_per_run.max(1),
            rotate: config.batch.rotate,
            run_timeout: config.pool.run_timeout(),
        })
    }

    /// Replace the lock, e.g. to tune blocking-mode polling.
    pub fn with_lock(mut self, lock: ExclusiveRunLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }

    /// Run the job once. Never panics on run-level errors: they become
    /// [`RunStatus::Failed`].
    pub async fn run(&self, processor: Arc<dyn Processor>, cancel: &CancellationToken) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let run_cancel = cancel.child_token();
        let timer = self.run_timeout.map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!("⏱️ Run timeout of {limit:?} reached, cancelling");
                token.cancel();
            })
        });

        let report = self.run_inner(run_id, processor, &run_cancel).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        match &report.status {
            RunStatus::Failed(e) => tracing::error!("❌ Run {} of '{}' failed: {e}", report.run_id, self.job),
            status => tracing::info!("🏁 Run {} of '{}' finished: {status}", report.run_id, self.job),
        }
        report
    }

    async fn run_inner(
        &self,
        run_id: String,
        processor: Arc<dyn Processor>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        tracing::info!("🏃 Run {run_id} of '{}' starting", self.job);

        let mut guard = match self.lock.acquire_with_cancel(cancel).await {
            Ok(guard) => guard,
            Err(e) if e.is_benign() => return RunReport::early(run_id, RunStatus::LockBusy),
            Err(e) if e.is_cancelled() => return RunReport::early(run_id, RunStatus::Cancelled),
            Err(e) => return RunReport::early(run_id, RunStatus::Failed(e.to_string())),
        };

        let mut source = match self.open_source() {
            Ok(Some(source)) => source,
            Ok(None) => {
                tracing::info!("💤 Nothing pending for '{}'", self.job);
                return RunReport::early(run_id, RunStatus::NoWork);
            }
            Err(e) => return RunReport::early(run_id, RunStatus::Failed(e.to_string())),
        };

        let mut outcomes = Vec::new();
        let mut batch_ids = Vec::new();
        let mut cancelled = false;
        let mut failure: Option<HarvestError> = None;

        for _ in 0..self.batches_per_run {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let batch = match source.next_batch(self.max_batch_size) {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => batch,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            batch_ids.push(batch.id.clone());
            tracing::debug!("dispatching batch {} of generation {}", batch.id, batch.generation());

            let report = self.pool.run(&batch, processor.clone(), cancel).await;
            let completed = source.complete(&batch, &report.outcomes);
            outcomes.extend(report.outcomes);
            if let Err(e) = completed {
                failure = Some(e);
                break;
            }
            if report.cancelled {
                cancelled = true;
                break;
            }
        }

        let mut summary = None;
        let mut notified = false;
        if !batch_ids.is_empty() {
            let meta = RunMeta {
                job: self.job.clone(),
                run_id: run_id.clone(),
                batch_ids,
                started_at,
                finished_at: Utc::now(),
                cancelled,
            };
            let built = self.reporter.aggregate(&meta, &outcomes);
            notified = self.reporter.finalize(&built).await;
            summary = Some(built);
        }

        guard.release();

        let status = match failure {
            Some(e) => RunStatus::Failed(e.to_string()),
            None if cancelled => RunStatus::Cancelled,
            None if summary.is_none() => RunStatus::NoWork,
            None => RunStatus::Completed,
        };
        RunReport {
            run_id,
            status,
            summary,
            outcomes,
            notified,
        }
    }

    /// Open the source, rotating once if the current pass is exhausted.
    fn open_source(&self) -> Result<Option<BatchSource>> {
        let mut source = BatchSource::open(self.store.clone())?;
        if source.pending_len() == 0 && self.rotate && source.roster_len() > 0 {
            source.rotate()?;
        }
        Ok((source.pending_len() > 0).then_some(source))
    }
}
