//! Batch source: deterministic, rotating supply of work-item groups.
//!
//! The persisted cursor only moves when a batch is completed. Anything cut but
//! not completed (crash, abandon) is served again by the next source opened
//! against the same store, so delivery is at-least-once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::BatchStore;
use harvest_core::types::{Batch, Cursor, Outcome, WorkItem};

/// What `complete` did with a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub consumed: usize,
    pub requeued: usize,
}

pub struct BatchSource {
    store: Arc<dyn BatchStore>,
    roster: Vec<WorkItem>,
    cursor: Cursor,
    in_flight: Option<String>,
}

impl BatchSource {
    /// Load roster and cursor from `store`.
    pub fn open(store: Arc<dyn BatchStore>) -> Result<Self> {
        let roster = store.load_roster()?;
        let cursor = store.load_cursor()?;
        tracing::debug!(
            "📦 Batch source opened: {} roster item(s), cursor g{}/o{}, {} requeued",
            roster.len(),
            cursor.generation,
            cursor.offset,
            cursor.requeued.len()
        );
        Ok(Self {
            store,
            roster,
            cursor,
            in_flight: None,
        })
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    /// Items not yet consumed in the current generation, requeued included.
    pub fn pending_len(&self) -> usize {
        self.cursor.pending_len(self.roster.len())
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    /// Cut the next batch of at most `max_size` items.
    ///
    /// Requeued items come first, then roster items from the cursor offset.
    /// An empty batch means the drain cycle is over; it is not marked in flight.
    pub fn next_batch(&mut self, max_size: usize) -> Result<Batch> {
        if let Some(id) = &self.in_flight {
            return Err(HarvestError::BatchInFlight(format!(
                "batch {id} must be completed before the next one is cut"
            )));
        }
        let max_size = max_size.max(1);

        let mut items: Vec<WorkItem> = Vec::with_capacity(max_size);
        let mut seen: HashSet<WorkItem> = HashSet::new();
        let mut from_requeue = 0;
        for item in &self.cursor.requeued {
            if items.len() >= max_size {
                break;
            }
            from_requeue += 1;
            if seen.insert(item.clone()) {
                items.push(item.clone());
            }
        }

        let start = self.offset();
        let mut from_roster = 0;
        for item in &self.roster[start..] {
            if items.len() >= max_size {
                break;
            }
            from_roster += 1;
            if seen.insert(item.clone()) {
                items.push(item.clone());
            }
        }

        let batch = Batch {
            id: format!("g{}-o{}", self.cursor.generation, start),
            items,
            cursor: self.cursor.clone(),
            from_requeue,
            from_roster,
        };
        if !batch.is_empty() {
            tracing::info!(
                "📦 Batch {} cut: {} item(s) ({} requeued, {} from roster)",
                batch.id,
                batch.len(),
                from_requeue,
                from_roster
            );
            self.in_flight = Some(batch.id.clone());
        }
        Ok(batch)
    }

    /// Report the outcomes of the in-flight batch and persist the new cursor.
    ///
    /// Success, skipped and permanent failures are consumed. Transient and
    /// cancelled failures, and items with no outcome at all, are requeued.
    pub fn complete(&mut self, batch: &Batch, outcomes: &[Outcome]) -> Result<Completion> {
        if self.in_flight.as_deref() != Some(batch.id.as_str()) {
            return Err(HarvestError::BatchInFlight(format!(
                "batch {} is not the batch in flight",
                batch.id
            )));
        }
        self.in_flight = None;

        let by_item: HashMap<&WorkItem, &Outcome> = outcomes.iter().map(|o| (&o.item, o)).collect();
        let mut consumed = Vec::new();
        let mut requeue = Vec::new();
        for item in &batch.items {
            match by_item.get(item) {
                Some(outcome) if !outcome.needs_requeue() => consumed.push(item.clone()),
                Some(_) => requeue.push(item.clone()),
                None => {
                    tracing::warn!("⚠️ No outcome reported for {item}, requeueing");
                    requeue.push(item.clone());
                }
            }
        }
        for outcome in outcomes {
            if !batch.items.contains(&outcome.item) {
                tracing::warn!("⚠️ Outcome for {} is not part of batch {}", outcome.item, batch.id);
            }
        }

        let base = Cursor {
            generation: batch.generation(),
            offset: (self.offset() + batch.from_roster).min(self.roster.len()),
            requeued: self.cursor.requeued[batch.from_requeue.min(self.cursor.requeued.len())..].to_vec(),
        };
        let mut next = base.clone();
        next.requeued.extend(requeue.iter().cloned());

        // Both writes describe `next`; replaying either after a crash is harmless.
        if !requeue.is_empty() {
            self.store.requeue(&base, &requeue)?;
        }
        self.store.advance_cursor(&next, &consumed)?;
        self.cursor = next;

        tracing::info!(
            "✅ Batch {} completed: {} consumed, {} requeued, {} pending",
            batch.id,
            consumed.len(),
            requeue.len(),
            self.pending_len()
        );
        Ok(Completion {
            consumed: consumed.len(),
            requeued: requeue.len(),
        })
    }

    /// Drop the in-flight batch without touching persisted state.
    pub fn abandon(&mut self, batch: &Batch) {
        if self.in_flight.as_deref() == Some(batch.id.as_str()) {
            tracing::warn!("🗑️ Batch {} abandoned, its items stay pending", batch.id);
            self.in_flight = None;
        }
    }

    /// Start a new pass over the roster: offset 0, next generation.
    ///
    /// The roster is reloaded so a reseeded store takes effect. Requeued
    /// items carry over.
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(id) = &self.in_flight {
            return Err(HarvestError::BatchInFlight(format!(
                "cannot rotate while batch {id} is in flight"
            )));
        }
        self.roster = self.store.load_roster()?;
        let next = Cursor {
            generation: self.cursor.generation + 1,
            offset: 0,
            requeued: self.cursor.requeued.clone(),
        };
        self.store.advance_cursor(&next, &[])?;
        tracing::info!(
            "🔄 Rotated to generation {} ({} roster item(s))",
            next.generation,
            self.roster.len()
        );
        self.cursor = next;
        Ok(())
    }

    // A roster that shrank under a persisted cursor is treated as exhausted.
    fn offset(&self) -> usize {
        self.cursor.offset.min(self.roster.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBatchStore;
    use chrono::Utc;
    use harvest_core::types::FailureKind;

    fn source(store: &MemoryBatchStore) -> BatchSource {
        BatchSource::open(Arc::new(store.clone())).unwrap()
    }

    fn names(batch: &Batch) -> Vec<&str> {
        batch.items.iter().map(|i| i.as_str()).collect()
    }

    fn all_ok(batch: &Batch) -> Vec<Outcome> {
        batch
            .items
            .iter()
            .map(|i| Outcome::success(i.clone(), serde_json::json!({}), 1, Utc::now()))
            .collect()
    }

    #[test]
    fn test_batches_progress_through_roster() {
        let store = MemoryBatchStore::with_roster(["a", "b", "c", "d", "e"]);
        let mut src = source(&store);

        let b1 = src.next_batch(2).unwrap();
        assert_eq!(names(&b1), ["a", "b"]);
        assert_eq!(b1.id, "g0-o0");
        src.complete(&b1, &all_ok(&b1)).unwrap();

        let b2 = src.next_batch(2).unwrap();
        assert_eq!(names(&b2), ["c", "d"]);
        src.complete(&b2, &all_ok(&b2)).unwrap();

        let b3 = src.next_batch(2).unwrap();
        assert_eq!(names(&b3), ["e"]);
        src.complete(&b3, &all_ok(&b3)).unwrap();

        assert!(src.next_batch(2).unwrap().is_empty());
        assert_eq!(src.pending_len(), 0);
        assert_eq!(store.consumed().len(), 5);
    }

    #[test]
    fn test_only_one_batch_in_flight() {
        let store = MemoryBatchStore::with_roster(["a", "b", "c"]);
        let mut src = source(&store);
        let b1 = src.next_batch(1).unwrap();
        assert!(matches!(src.next_batch(1), Err(HarvestError::BatchInFlight(_))));
        assert!(matches!(src.rotate(), Err(HarvestError::BatchInFlight(_))));
        src.complete(&b1, &all_ok(&b1)).unwrap();
        assert!(src.next_batch(1).is_ok());
    }

    #[test]
    fn test_transient_failures_requeued_first() {
        let store = MemoryBatchStore::with_roster(["a", "b", "c", "d"]);
        let mut src = source(&store);
        let now = Utc::now();

        let b1 = src.next_batch(3).unwrap();
        let outcomes = vec![
            Outcome::success("a".into(), serde_json::json!({}), 1, now),
            Outcome::failure("b".into(), FailureKind::Transient, "429", 3, now),
            Outcome::failure("c".into(), FailureKind::Permanent, "400", 1, now),
        ];
        let done = src.complete(&b1, &outcomes).unwrap();
        assert_eq!(done, Completion { consumed: 2, requeued: 1 });

        let b2 = src.next_batch(3).unwrap();
        assert_eq!(names(&b2), ["b", "d"]);
        assert_eq!(b2.from_requeue, 1);
        assert_eq!(b2.from_roster, 1);
    }

    #[test]
    fn test_missing_outcomes_are_requeued() {
        let store = MemoryBatchStore::with_roster(["a", "b"]);
        let mut src = source(&store);
        let b1 = src.next_batch(2).unwrap();
        let partial = vec![Outcome::success("a".into(), serde_json::json!({}), 1, Utc::now())];
        src.complete(&b1, &partial).unwrap();
        assert_eq!(src.cursor().requeued, vec![WorkItem::new("b")]);
        assert_eq!(src.cursor().offset, 2);
    }

    #[test]
    fn test_crash_before_complete_replays_batch() {
        let store = MemoryBatchStore::with_roster(["a", "b", "c"]);
        let first = {
            let mut src = source(&store);
            let b = src.next_batch(2).unwrap();
            names(&b).iter().map(|s| s.to_string()).collect::<Vec<_>>()
            // dropped without complete
        };

        let mut reopened = source(&store);
        let again = reopened.next_batch(2).unwrap();
        assert_eq!(names(&again), first);
        assert_eq!(reopened.cursor().offset, 0);
    }

    #[test]
    fn test_abandon_keeps_items_pending() {
        let store = MemoryBatchStore::with_roster(["a", "b"]);
        let mut src = source(&store);
        let b = src.next_batch(2).unwrap();
        src.abandon(&b);
        assert_eq!(src.pending_len(), 2);
        assert_eq!(names(&src.next_batch(2).unwrap()), ["a", "b"]);
    }

    #[test]
    fn test_rotate_starts_next_generation() {
        let store = MemoryBatchStore::with_roster(["a", "b"]);
        let mut src = source(&store);
        let b = src.next_batch(5).unwrap();
        src.complete(&b, &all_ok(&b)).unwrap();
        assert!(src.next_batch(5).unwrap().is_empty());

        src.rotate().unwrap();
        assert_eq!(src.cursor().generation, 1);
        let b = src.next_batch(5).unwrap();
        assert_eq!(b.id, "g1-o0");
        assert_eq!(names(&b), ["a", "b"]);
        assert_eq!(store.load_cursor().unwrap().generation, 1);
    }

    #[test]
    fn test_requeued_item_not_repeated_from_roster() {
        let store = MemoryBatchStore::with_roster(["a", "b"]);
        let mut src = source(&store);
        let now = Utc::now();
        let b = src.next_batch(2).unwrap();
        let outcomes = vec![
            Outcome::success("a".into(), serde_json::json!({}), 1, now),
            Outcome::failure("b".into(), FailureKind::Cancelled, "shutdown", 0, now),
        ];
        src.complete(&b, &outcomes).unwrap();
        src.rotate().unwrap();

        let b = src.next_batch(3).unwrap();
        assert_eq!(names(&b), ["b", "a"]);
        assert_eq!(b.from_roster, 2);
        src.complete(&b, &all_ok(&b)).unwrap();
        assert_eq!(src.pending_len(), 0);
    }

    #[test]
    fn test_complete_rejects_unknown_batch() {
        let store = MemoryBatchStore::with_roster(["a"]);
        let mut src = source(&store);
        let b = src.next_batch(1).unwrap();
        src.complete(&b, &all_ok(&b)).unwrap();
        assert!(matches!(src.complete(&b, &all_ok(&b)), Err(HarvestError::BatchInFlight(_))));
    }
}
