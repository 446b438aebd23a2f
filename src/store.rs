//! Durable output storage.
//!
//! Rendered output lines are appended to a single SQLite table. Ids come from
//! the table's autoincrement key, so id order is the one ordering callers can
//! rely on. Two read modes are supported:
//!
//! * bootstrap (`since_id == 0`): the most recent K lines per process, merged
//!   back into global id order, so a chatty process cannot drown out a quiet one;
//! * incremental (`since_id > 0`): every line after `since_id`.
//!
//! The writer and readers use separate connections; the database runs in WAL
//! mode so readers never block the writer.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_BOOTSTRAP_LIMIT: usize = 5000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS output (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process TEXT NOT NULL,
    html TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS output_process_id ON output (process, id);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("output store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to reset output store {path}: {source}")]
    Reset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub id: i64,
    pub process: String,
    pub html: String,
}

/// Per-process summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub process: String,
    pub count: u64,
    pub min_id: i64,
    pub max_id: i64,
}

/// A connection to the output table.
#[derive(Debug)]
pub struct OutputStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl OutputStore {
    /// Deletes any existing store at `path` and creates an empty one.
    pub fn create(path: &Path) -> Result<Self> {
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Reset { path: file, source }),
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "created output store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Opens an existing store without resetting it.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Opens a second connection to the same file.
    pub fn reopen(&self) -> Result<Self> {
        Self::open(&self.path)
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Appends one line and returns its id.
    pub fn append(&self, process: &str, html: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO output (process, html) VALUES (?1, ?2)",
            params![process, html],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Appends `lines` as `(process, html)` pairs in a single transaction.
    pub fn append_batch(&self, lines: &[(String, String)]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(lines.len());
        {
            let mut stmt = tx.prepare_cached("INSERT INTO output (process, html) VALUES (?1, ?2)")?;
            for (process, html) in lines {
                stmt.execute(params![process, html])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Dispatches between the bootstrap and incremental read modes.
    pub fn read(
        &self,
        since_id: i64,
        limit: Option<usize>,
        per_process: usize,
    ) -> Result<Vec<OutputLine>> {
        if since_id <= 0 {
            self.read_bootstrap(per_process)
        } else {
            self.read_since(since_id, limit)
        }
    }

    /// Returns lines with `id > since_id` in id order.
    ///
    /// With a `limit`, the oldest `limit` such lines are returned; the caller
    /// resumes from the last id it received.
    pub fn read_since(&self, since_id: i64, limit: Option<usize>) -> Result<Vec<OutputLine>> {
        let conn = self.conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare_cached(
            "SELECT id, process, html FROM output WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since_id, limit], row_to_line)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Returns the most recent `per_process` lines of each process, in id order.
    pub fn read_bootstrap(&self, per_process: usize) -> Result<Vec<OutputLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, process, html FROM (
                 SELECT id, process, html,
                        ROW_NUMBER() OVER (PARTITION BY process ORDER BY id DESC) AS rn
                 FROM output
             )
             WHERE rn <= ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![per_process as i64], row_to_line)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn process_stats(&self) -> Result<Vec<ProcessStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT process, COUNT(*), MIN(id), MAX(id)
             FROM output GROUP BY process ORDER BY MIN(id)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcessStats {
                process: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                min_id: row.get(2)?,
                max_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Highest id written so far, or 0 for an empty store.
    pub fn latest_id(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM output", [], |row| {
            row.get(0)
        })?)
    }

    /// Deletes all but the newest `keep` lines of each process.
    pub fn retain_latest(&self, keep: usize) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM output WHERE id IN (
                 SELECT id FROM (
                     SELECT id, ROW_NUMBER() OVER (PARTITION BY process ORDER BY id DESC) AS rn
                     FROM output
                 )
                 WHERE rn > ?1
             )",
            params![keep as i64],
        )?;
        Ok(deleted)
    }
}

fn row_to_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutputLine> {
    Ok(OutputLine {
        id: row.get(0)?,
        process: row.get(1)?,
        html: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, OutputStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::create(&dir.path().join("out.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_returns_increasing_ids() {
        let (_dir, store) = temp_store();
        let a = store.append("web", "one").unwrap();
        let b = store.append("worker", "two").unwrap();
        let batch = store
            .append_batch(&[("web".into(), "three".into()), ("web".into(), "four".into())])
            .unwrap();
        assert!(a < b);
        assert_eq!(batch, vec![b + 1, b + 2]);
        assert_eq!(store.latest_id().unwrap(), b + 2);
    }

    #[test]
    fn bootstrap_then_incremental_partitions_everything() {
        let (_dir, store) = temp_store();
        for i in 0..10 {
            store.append(if i % 2 == 0 { "a" } else { "b" }, &i.to_string()).unwrap();
        }
        let first = store.read(0, None, DEFAULT_BOOTSTRAP_LIMIT).unwrap();
        assert_eq!(first.len(), 10);
        let last = first.last().unwrap().id;
        for i in 10..15 {
            store.append("a", &i.to_string()).unwrap();
        }
        let second = store.read(last, None, DEFAULT_BOOTSTRAP_LIMIT).unwrap();
        assert_eq!(second.len(), 5);

        let ids: Vec<i64> = first.iter().chain(second.iter()).map(|l| l.id).collect();
        let expected: Vec<i64> = (ids[0]..ids[0] + 15).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn incremental_limit_returns_oldest_first() {
        let (_dir, store) = temp_store();
        for i in 0..6 {
            store.append("a", &i.to_string()).unwrap();
        }
        let page = store.read_since(1, Some(2)).unwrap();
        assert_eq!(page.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 3]);
        let rest = store.read_since(3, None).unwrap();
        assert_eq!(rest.iter().map(|l| l.id).collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[test]
    fn bootstrap_caps_each_process() {
        let (_dir, store) = temp_store();
        store.append("quiet", "q1").unwrap();
        for i in 0..20 {
            store.append("chatty", &format!("c{}", i)).unwrap();
        }
        store.append("quiet", "q2").unwrap();
        for i in 20..25 {
            store.append("chatty", &format!("c{}", i)).unwrap();
        }

        let lines = store.read_bootstrap(3).unwrap();
        let texts: Vec<&str> = lines.iter().map(|l| l.html.as_str()).collect();
        assert_eq!(texts, vec!["q1", "q2", "c22", "c23", "c24"]);
        assert!(lines.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn stats_per_process() {
        let (_dir, store) = temp_store();
        store.append("a", "1").unwrap();
        store.append("b", "2").unwrap();
        store.append("a", "3").unwrap();
        let stats = store.process_stats().unwrap();
        assert_eq!(
            stats,
            vec![
                ProcessStats { process: "a".into(), count: 2, min_id: 1, max_id: 3 },
                ProcessStats { process: "b".into(), count: 1, min_id: 2, max_id: 2 },
            ]
        );
    }

    #[test]
    fn retention_keeps_newest_per_process() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store.append("a", &i.to_string()).unwrap();
        }
        store.append("b", "only").unwrap();
        assert_eq!(store.retain_latest(2).unwrap(), 3);
        let lines = store.read_bootstrap(100).unwrap();
        let texts: Vec<&str> = lines.iter().map(|l| l.html.as_str()).collect();
        assert_eq!(texts, vec!["3", "4", "only"]);
    }

    #[test]
    fn create_discards_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.db");
        {
            let store = OutputStore::create(&path).unwrap();
            store.append("a", "old").unwrap();
        }
        let store = OutputStore::create(&path).unwrap();
        assert_eq!(store.latest_id().unwrap(), 0);
        assert!(store.read_bootstrap(10).unwrap().is_empty());
    }

    #[test]
    fn reader_connection_sees_writes() {
        let (_dir, store) = temp_store();
        let reader = store.reopen().unwrap();
        store.append("a", "x").unwrap();
        assert_eq!(reader.read_since(0, None).unwrap().len(), 1);
    }

    #[test]
    fn open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OutputStore::open(&dir.path().join("missing.db")).is_err());
    }
}
