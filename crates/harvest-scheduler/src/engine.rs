//! Recurring engine: fires the job runner on a cron schedule.
//! Uses tokio timers only: zero overhead between ticks.
//!
//! Every tick is an ordinary lock-guarded run, so a tick overlapping an
//! externally triggered run of the same job is skipped as lock-busy.

use std::sync::Arc;

use chrono::Utc;
use harvest_core::error::Result;
use harvest_core::traits::Processor;
use harvest_core::types::RunStatus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cron::Schedule;
use crate::runner::JobRunner;

/// Tally of the runs a loop performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub runs: u64,
    pub completed: u64,
    pub no_work: u64,
    pub lock_busy: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl LoopStats {
    fn record(&mut self, status: &RunStatus) {
        self.runs += 1;
        match status {
            RunStatus::Completed => self.completed += 1,
            RunStatus::NoWork => self.no_work += 1,
            RunStatus::LockBusy => self.lock_busy += 1,
            RunStatus::Cancelled => self.cancelled += 1,
            RunStatus::Failed(_) => self.failed += 1,
        }
    }
}

/// Spawn the recurring loop. Fails fast on a malformed cron expression.
///
/// With `run_immediately` the first run starts right away instead of at the
/// first cron tick. The loop ends when `cancel` fires.
pub fn spawn_job_loop(
    runner: Arc<JobRunner>,
    processor: Arc<dyn Processor>,
    cron: &str,
    run_immediately: bool,
    cancel: CancellationToken,
) -> Result<JoinHandle<LoopStats>> {
    let schedule = Schedule::parse(cron)?;
    let cron = cron.to_string();
    tracing::info!("⏰ Scheduling '{}' on \"{cron}\"", runner.job());

    Ok(tokio::spawn(async move {
        let mut stats = LoopStats::default();
        let mut due_now = run_immediately;
        loop {
            if !due_now {
                let now = Utc::now();
                let Some(next) = schedule.next_after(now) else {
                    tracing::error!("❌ Cron \"{cron}\" has no future tick, stopping");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tracing::debug!("next run of '{}' at {next} (in {wait:?})", runner.job());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            due_now = false;

            let report = runner.run(processor.clone(), &cancel).await;
            stats.record(&report.status);
            if cancel.is_cancelled() {
                break;
            }
        }
        tracing::info!(
            "🛑 Loop for '{}' stopped after {} run(s) ({} completed, {} skipped as lock-busy, {} failed)",
            runner.job(),
            stats.runs,
            stats.completed,
            stats.lock_busy,
            stats.failed
        );
        stats
    }))
}
