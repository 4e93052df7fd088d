//! BatchStore trait: durable batch state.

use crate::error::Result;
use crate::types::{Cursor, WorkItem};

/// Persists the ordered roster of work items and the cursor into it.
///
/// Implementations must make each write durable before returning: the batch
/// source relies on "persisted cursor == last completed batch" for crash
/// consistency.
pub trait BatchStore: Send + Sync {
    /// Ordered list of every item the job cycles over.
    fn load_roster(&self) -> Result<Vec<WorkItem>>;

    /// Replace the roster and reset the cursor to its initial state.
    fn replace_roster(&self, items: &[WorkItem]) -> Result<()>;

    fn load_cursor(&self) -> Result<Cursor>;

    /// Persist `cursor` as the new position. `consumed` are the items the
    /// cursor moved past with a final outcome.
    fn advance_cursor(&self, cursor: &Cursor, consumed: &[WorkItem]) -> Result<()>;

    /// Persist `cursor` with `items` appended to its requeue list.
    fn requeue(&self, cursor: &Cursor, items: &[WorkItem]) -> Result<()>;

    /// Items consumed so far, for stores that keep a consumed log.
    fn consumed_count(&self) -> Result<Option<usize>> {
        Ok(None)
    }
}
