//! Run reporter: one summary per run, handed to the notifier.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::config::ReportConfig;
use harvest_core::traits::Notifier;
use harvest_core::types::{FailureSample, Outcome, OutcomeKind, RunSummary};

/// Everything about a run the summary needs besides its outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMeta {
    pub job: String,
    pub run_id: String,
    pub batch_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

pub struct RunReporter {
    notifier: Arc<dyn Notifier>,
    max_failure_samples: usize,
    notify_timeout: Duration,
}

impl RunReporter {
    pub fn new(notifier: Arc<dyn Notifier>, max_failure_samples: usize, notify_timeout: Duration) -> Self {
        Self {
            notifier,
            max_failure_samples,
            notify_timeout,
        }
    }

    pub fn from_config(config: &ReportConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self::new(notifier, config.max_failure_samples, config.notify_timeout())
    }

    /// Fold outcomes into a summary. Pure: same input, same summary.
    pub fn aggregate(&self, meta: &RunMeta, outcomes: &[Outcome]) -> RunSummary {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();
        let mut failures_omitted = 0;

        for outcome in outcomes {
            match &outcome.kind {
                OutcomeKind::Success { .. } => succeeded += 1,
                OutcomeKind::Skipped { .. } => skipped += 1,
                OutcomeKind::Failure { kind, detail } => {
                    failed += 1;
                    if failures.len() < self.max_failure_samples {
                        failures.push(FailureSample {
                            item: outcome.item.clone(),
                            kind: *kind,
                            detail: detail.clone(),
                        });
                    } else {
                        failures_omitted += 1;
                    }
                }
            }
        }

        let duration_ms = (meta.finished_at - meta.started_at).num_milliseconds().max(0) as u64;
        RunSummary {
            job: meta.job.clone(),
            run_id: meta.run_id.clone(),
            batch_ids: meta.batch_ids.clone(),
            total: outcomes.len(),
            succeeded,
            failed,
            skipped,
            failures,
            failures_omitted,
            started_at: meta.started_at,
            duration_ms,
            cancelled: meta.cancelled,
        }
    }

    /// Deliver `summary`. Never fails the run: errors and timeouts are
    /// logged and reported as `false`.
    pub async fn finalize(&self, summary: &RunSummary) -> bool {
        let name = self.notifier.name().to_string();
        match tokio::time::timeout(self.notify_timeout, self.notifier.deliver(summary)).await {
            Ok(Ok(())) => {
                tracing::info!("📨 Run summary delivered via {name}");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Notifier {name} failed: {e}");
                false
            }
            Err(_) => {
                tracing::warn!("⚠️ Notifier {name} timed out after {:?}", self.notify_timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::error::{HarvestError, Result};
    use harvest_core::types::FailureKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<RunSummary>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn deliver(&self, summary: &RunSummary) -> Result<()> {
            self.delivered.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _summary: &RunSummary) -> Result<()> {
            Err(HarvestError::Notifier("webhook returned 500".into()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Notifier for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn deliver(&self, _summary: &RunSummary) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn meta() -> RunMeta {
        let started_at = Utc::now();
        RunMeta {
            job: "subreddit-snapshot".into(),
            run_id: "run-1".into(),
            batch_ids: vec!["g0-o0".into()],
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(2500),
            cancelled: false,
        }
    }

    fn outcomes(failures: usize) -> Vec<Outcome> {
        let now = Utc::now();
        let mut out = vec![
            Outcome::success("ok".into(), serde_json::json!({"subscribers": 1}), 1, now),
            Outcome::skipped("private".into(), "403", 1, now),
        ];
        for i in 0..failures {
            out.push(Outcome::failure(
                format!("bad{i}").into(),
                FailureKind::Permanent,
                "400 bad request",
                1,
                now,
            ));
        }
        out
    }

    #[test]
    fn test_aggregate_counts_and_idempotence() {
        let reporter = RunReporter::new(Arc::new(Recorder::default()), 10, Duration::from_secs(1));
        let meta = meta();
        let outcomes = outcomes(2);
        let a = reporter.aggregate(&meta, &outcomes);
        let b = reporter.aggregate(&meta, &outcomes);
        assert_eq!(a, b);
        assert_eq!(a.total, 4);
        assert_eq!(a.succeeded, 1);
        assert_eq!(a.skipped, 1);
        assert_eq!(a.failed, 2);
        assert_eq!(a.duration_ms, 2500);
        assert!(!a.is_clean());
    }

    #[test]
    fn test_failure_samples_are_bounded() {
        let reporter = RunReporter::new(Arc::new(Recorder::default()), 3, Duration::from_secs(1));
        let summary = reporter.aggregate(&meta(), &outcomes(5));
        assert_eq!(summary.failures.len(), 3);
        assert_eq!(summary.failures_omitted, 2);
        assert_eq!(summary.failures[0].item.as_str(), "bad0");
    }

    #[tokio::test]
    async fn test_finalize_delivers() {
        let recorder = Arc::new(Recorder::default());
        let reporter = RunReporter::new(recorder.clone(), 10, Duration::from_secs(1));
        let summary = reporter.aggregate(&meta(), &outcomes(0));
        assert!(reporter.finalize(&summary).await);
        assert_eq!(recorder.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_swallows_notifier_error() {
        let reporter = RunReporter::new(Arc::new(Broken), 10, Duration::from_secs(1));
        let summary = reporter.aggregate(&meta(), &outcomes(1));
        assert!(!reporter.finalize(&summary).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_times_out() {
        let reporter = RunReporter::new(Arc::new(Stuck), 10, Duration::from_secs(5));
        let summary = reporter.aggregate(&meta(), &outcomes(0));
        assert!(!reporter.finalize(&summary).await);
    }
}
