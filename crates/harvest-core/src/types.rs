//! Data model shared by the engine and its adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of one unit of work (e.g. a subreddit name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(pub String);

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItem {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkItem {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Persisted position of a batch source.
///
/// `offset` indexes into the ordered roster. `requeued` items are served
/// before any roster item. `generation` counts completed passes over the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub requeued: Vec<WorkItem>,
}

impl Cursor {
    /// Items still pending given a roster of `roster_len` entries.
    pub fn pending_len(&self, roster_len: usize) -> usize {
        self.requeued.len() + roster_len.saturating_sub(self.offset)
    }
}

/// A bounded group of work items cut from a cursor and tracked as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// `g{generation}-o{offset}` of the cursor the batch was cut from.
    pub id: String,
    pub items: Vec<WorkItem>,
    /// Cursor snapshot at the moment the batch was cut.
    pub cursor: Cursor,
    /// How many leading items came from the requeue list.
    pub from_requeue: usize,
    /// Roster positions the batch covers. Roster entries already present in
    /// the requeued part are covered but not repeated in `items`.
    pub from_roster: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn generation(&self) -> u64 {
        self.cursor.generation
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable error that exhausted its in-run retries.
    Transient,
    /// Non-retryable error.
    Permanent,
    /// Never started or abandoned because the run was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Whether the item should go back to the pending queue for a later run.
    pub fn requeues(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Cancelled)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeKind {
    Success { payload: serde_json::Value },
    Failure { kind: FailureKind, detail: String },
    Skipped { reason: String },
}

/// The single recorded result of processing one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub item: WorkItem,
    pub kind: OutcomeKind,
    /// Processor invocations made for this item (0 if never dispatched).
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    pub fn success(item: WorkItem, payload: serde_json::Value, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self::finish(item, OutcomeKind::Success { payload }, attempts, started_at)
    }

    pub fn failure(
        item: WorkItem,
        kind: FailureKind,
        detail: impl Into<String>,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let kind = OutcomeKind::Failure {
            kind,
            detail: detail.into(),
        };
        Self::finish(item, kind, attempts, started_at)
    }

    pub fn skipped(item: WorkItem, reason: impl Into<String>, attempts: u32, started_at: DateTime<Utc>) -> Self {
        let kind = OutcomeKind::Skipped {
            reason: reason.into(),
        };
        Self::finish(item, kind, attempts, started_at)
    }

    /// Outcome for an item the run never got to.
    pub fn cancelled(item: WorkItem, detail: impl Into<String>) -> Self {
        Self::failure(item, FailureKind::Cancelled, detail, 0, Utc::now())
    }

    fn finish(item: WorkItem, kind: OutcomeKind, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            item,
            kind,
            attempts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failure { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.kind {
            OutcomeKind::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the item must be handed back to the batch source for a later run.
    pub fn needs_requeue(&self) -> bool {
        self.failure_kind().is_some_and(|k| k.requeues())
    }
}

/// One failed item as it appears in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSample {
    pub item: WorkItem,
    pub kind: FailureKind,
    pub detail: String,
}

/// End-of-run summary handed to the notifier. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job: String,
    pub run_id: String,
    pub batch_ids: Vec<String>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// First N failures in outcome order.
    pub failures: Vec<FailureSample>,
    /// Failures beyond the sample bound.
    pub failures_omitted: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Human-readable message used by chat-style notifiers.
    pub fn render_text(&self, header: &str) -> String {
        let batches = if self.batch_ids.is_empty() {
            "-".to_string()
        } else {
            self.batch_ids.join(", ")
        };
        let mut text = format!(
            "*📊 {header}*\n> *Job:* `{}` | *Run Time:* {:.1}s | *Batch:* {batches}\n\n\
             *Items Processed:* `{}`\n\
             • ✅ Successful: `{}`\n\
             • ⏭️ Skipped: `{}`\n\
             • ❌ Failed: `{}`\n",
            self.job,
            self.duration_ms as f64 / 1000.0,
            self.total,
            self.succeeded,
            self.skipped,
            self.failed,
        );

        if !self.failures.is_empty() {
            text.push_str("\n*Failures:*\n");
            for f in &self.failures {
                text.push_str(&format!("• `{}` ({}): {}\n", f.item, f.kind, f.detail));
            }
            if self.failures_omitted > 0 {
                text.push_str(&format!("• …and {} more\n", self.failures_omitted));
            }
        }

        let closing = if self.cancelled {
            "🛑 Run was cancelled before completing."
        } else if self.failed == 0 {
            "🎉 All good!"
        } else {
            "🚨 Some errors occurred. Check logs."
        };
        text.push_str(&format!("\n_{closing}_"));
        text
    }
}

/// How a run ended. Each variant maps to a distinct process exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RunStatus {
    /// Ran to completion; the summary may still contain item failures.
    Completed,
    /// Nothing was pending.
    NoWork,
    /// Another instance holds the lock; this run was skipped.
    LockBusy,
    /// Cancelled by signal or run timeout.
    Cancelled,
    /// Unrecoverable run-level error.
    Failed(String),
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed | RunStatus::NoWork => 0,
            RunStatus::Failed(_) => 1,
            RunStatus::LockBusy => 2,
            RunStatus::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::NoWork => write!(f, "no work"),
            RunStatus::LockBusy => write!(f, "lock busy"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}
