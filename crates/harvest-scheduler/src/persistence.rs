//! SQLite-backed batch store. Survives restarts, keeps a log of every
//! consumed item.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use harvest_core::error::{HarvestError, Result};
use harvest_core::traits::BatchStore;
use harvest_core::types::{Cursor, WorkItem};
use rusqlite::{Connection, Transaction, params};

pub struct SqliteBatchStore {
    conn: Mutex<Connection>,
}

impl SqliteBatchStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db("open"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db("open"))?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Ordered list of items the job cycles over
            CREATE TABLE IF NOT EXISTS roster (
                position INTEGER PRIMARY KEY,
                item TEXT NOT NULL
            );

            -- Single-row cursor
            CREATE TABLE IF NOT EXISTS batch_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                generation INTEGER NOT NULL DEFAULT 0,
                roster_offset INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            -- Items handed back for a later run, served before the roster
            CREATE TABLE IF NOT EXISTS requeued_items (
                position INTEGER PRIMARY KEY,
                item TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consumed_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item TEXT NOT NULL,
                generation INTEGER NOT NULL,
                consumed_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db("migration"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HarvestError::Store("sqlite connection poisoned".into()))
    }

    fn write_cursor(&self, cursor: &Cursor, consumed: &[WorkItem]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin"))?;
        save_cursor(&tx, cursor)?;
        let now = Utc::now().to_rfc3339();
        for item in consumed {
            tx.execute(
                "INSERT INTO consumed_log (item, generation, consumed_at) VALUES (?1, ?2, ?3)",
                params![item.as_str(), cursor.generation as i64, now],
            )
            .map_err(db("log consumed"))?;
        }
        tx.commit().map_err(db("commit"))
    }
}

fn save_cursor(tx: &Transaction<'_>, cursor: &Cursor) -> Result<()> {
    tx.execute(
        "INSERT INTO batch_cursor (id, generation, roster_offset, updated_at) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET generation = ?1, roster_offset = ?2, updated_at = ?3",
        params![cursor.generation as i64, cursor.offset as i64, Utc::now().to_rfc3339()],
    )
    .map_err(db("save cursor"))?;
    tx.execute("DELETE FROM requeued_items", [])
        .map_err(db("clear requeue"))?;
    for (position, item) in cursor.requeued.iter().enumerate() {
        tx.execute(
            "INSERT INTO requeued_items (position, item) VALUES (?1, ?2)",
            params![position as i64, item.as_str()],
        )
        .map_err(db("save requeue"))?;
    }
    Ok(())
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> HarvestError {
    move |e| HarvestError::Store(format!("{context}: {e}"))
}

impl BatchStore for SqliteBatchStore {
    fn load_roster(&self) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT item FROM roster ORDER BY position")
            .map_err(db("load roster"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db("load roster"))?;
        let mut items = Vec::new();
        for row in rows {
            items.push(WorkItem::new(row.map_err(db("load roster"))?));
        }
        Ok(items)
    }

    fn replace_roster(&self, items: &[WorkItem]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db("begin"))?;
        tx.execute("DELETE FROM roster", []).map_err(db("clear roster"))?;
        for (position, item) in items.iter().enumerate() {
            tx.execute(
                "INSERT INTO roster (position, item) VALUES (?1, ?2)",
                params![position as i64, item.as_str()],
            )
            .map_err(db("save roster"))?;
        }
        save_cursor(&tx, &Cursor::default())?;
        tx.commit().map_err(db("commit"))?;
        tracing::info!("🌱 Roster replaced: {} item(s)", items.len());
        Ok(())
    }

    fn load_cursor(&self) -> Result<Cursor> {
        let conn = self.conn()?;
        let head: Option<(i64, i64)> = match conn.query_row(
            "SELECT generation, roster_offset FROM batch_cursor WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(head) => Some(head),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(db("load cursor")(e)),
        };

        let mut stmt = conn
            .prepare("SELECT item FROM requeued_items ORDER BY position")
            .map_err(db("load requeue"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db("load requeue"))?;
        let mut requeued = Vec::new();
        for row in rows {
            requeued.push(WorkItem::new(row.map_err(db("load requeue"))?));
        }

        let (generation, offset) = head.unwrap_or((0, 0));
        Ok(Cursor {
            generation: generation.max(0) as u64,
            offset: offset.max(0) as usize,
            requeued,
        })
    }

    fn advance_cursor(&self, cursor: &Cursor, consumed: &[WorkItem]) -> Result<()> {
        self.write_cursor(cursor, consumed)
    }

    fn requeue(&self, cursor: &Cursor, items: &[WorkItem]) -> Result<()> {
        let mut next = cursor.clone();
        next.requeued.extend(items.iter().cloned());
        self.write_cursor(&next, &[])
    }

    fn consumed_count(&self) -> Result<Option<usize>> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM consumed_log", [], |row| row.get(0))
            .map_err(db("count consumed"))?;
        Ok(Some(count.max(0) as usize))
    }
}
