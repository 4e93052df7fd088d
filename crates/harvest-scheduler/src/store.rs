//! File-based and in-memory batch stores.
//!
//! The JSON store keeps the whole state (roster + cursor) in one
//! human-readable file and replaces it atomically on every write, so a crash
//! leaves either the old or the new cursor on disk, never a torn one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::BatchStore;
use harvest_core::types::{Cursor, WorkItem};
use serde::{Deserialize, Serialize};

/// On-disk (and in-memory) layout of a batch state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub roster: Vec<WorkItem>,
    #[serde(flatten)]
    pub cursor: Cursor,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateFile {
    fn with_requeued(cursor: &Cursor, items: &[WorkItem]) -> Cursor {
        let mut next = cursor.clone();
        next.requeued.extend(items.iter().cloned());
        next
    }
}

/// Make a rename inside `path`'s directory durable. Best effort: not every
/// platform lets a directory be opened for syncing.
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Ok(dir) = std::fs::File::open(parent) {
        if let Err(e) = dir.sync_all() {
            tracing::debug!("could not sync {}: {e}", parent.display());
        }
    }
}

/// JSON file store.
pub struct JsonBatchStore {
    path: PathBuf,
}

impl JsonBatchStore {
    /// Create a store backed by `path`. Parent directories are created.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StateFile> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        let json = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&json).map_err(|e| {
            HarvestError::Store(format!("Failed to parse {}: {e}", self.path.display()))
        })
    }

    fn write(&self, mut state: StateFile) -> Result<()> {
        state.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path);
        tracing::debug!(
            "💾 Saved cursor g{}/o{} (+{} requeued) to {}",
            state.cursor.generation,
            state.cursor.offset,
            state.cursor.requeued.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_cursor(&self, cursor: Cursor) -> Result<()> {
        let mut state = self.read()?;
        state.cursor = cursor;
        self.write(state)
    }
}

impl BatchStore for JsonBatchStore {
    fn load_roster(&self) -> Result<Vec<WorkItem>> {
        Ok(self.read()?.roster)
    }

    fn replace_roster(&self, items: &[WorkItem]) -> Result<()> {
        self.write(StateFile {
            roster: items.to_vec(),
            cursor: Cursor::default(),
            updated_at: None,
        })
    }

    fn load_cursor(&self) -> Result<Cursor> {
        Ok(self.read()?.cursor)
    }

    fn advance_cursor(&self, cursor: &Cursor, consumed: &[WorkItem]) -> Result<()> {
        tracing::debug!("advancing past {} consumed item(s)", consumed.len());
        self.write_cursor(cursor.clone())
    }

    fn requeue(&self, cursor: &Cursor, items: &[WorkItem]) -> Result<()> {
        self.write_cursor(StateFile::with_requeued(cursor, items))
    }
}

/// In-memory store. Clones share state, which lets tests drop a batch source
/// mid-batch and reopen another one against the "persisted" cursor.
#[derive(Clone, Default)]
pub struct MemoryBatchStore {
    state: Arc<Mutex<StateFile>>,
    consumed: Arc<Mutex<Vec<WorkItem>>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkItem>,
    {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            state.roster = items.into_iter().map(Into::into).collect();
        }
        store
    }

    /// Every item ever reported as consumed, in order.
    pub fn consumed(&self) -> Vec<WorkItem> {
        self.consumed.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, StateFile>> {
        self.state
            .lock()
            .map_err(|_| HarvestError::Store("memory store poisoned".into()))
    }
}

impl BatchStore for MemoryBatchStore {
    fn load_roster(&self) -> Result<Vec<WorkItem>> {
        Ok(self.lock_state()?.roster.clone())
    }

    fn replace_roster(&self, items: &[WorkItem]) -> Result<()> {
        let mut state = self.lock_state()?;
        state.roster = items.to_vec();
        state.cursor = Cursor::default();
        state.updated_at = Some(Utc::now());
        Ok(())
    }

    fn load_cursor(&self) -> Result<Cursor> {
        Ok(self.lock_state()?.cursor.clone())
    }

    fn advance_cursor(&self, cursor: &Cursor, consumed: &[WorkItem]) -> Result<()> {
        let mut state = self.lock_state()?;
        state.cursor = cursor.clone();
        state.updated_at = Some(Utc::now());
        if let Ok(mut log) = self.consumed.lock() {
            log.extend(consumed.iter().cloned());
        }
        Ok(())
    }

    fn requeue(&self, cursor: &Cursor, items: &[WorkItem]) -> Result<()> {
        let mut state = self.lock_state()?;
        state.cursor = StateFile::with_requeued(cursor, items);
        state.updated_at = Some(Utc::now());
        Ok(())
    }

    fn consumed_count(&self) -> Result<Option<usize>> {
        Ok(Some(self.consumed().len()))
    }
}
