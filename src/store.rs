//! Persistent per-object read progress.
//!
//! One SQLite table, `objects`, keyed by `(bucket, key)`. Every access goes through a single
//! connection behind a mutex, so transactions from concurrent workers never interleave.

use crate::config::Durability;
use crate::paths::ObservedObject;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "s3in.sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket     TEXT    NOT NULL,
    key        TEXT    NOT NULL,
    size       INTEGER NOT NULL DEFAULT 0,
    current    INTEGER NOT NULL DEFAULT 0,
    position   INTEGER NOT NULL DEFAULT 0,
    modified   TEXT    NOT NULL,
    first_line TEXT,
    last_line  TEXT,
    UNIQUE (bucket, key)
);
CREATE INDEX IF NOT EXISTS objects_current ON objects (current);
CREATE INDEX IF NOT EXISTS objects_first_line ON objects (first_line);
CREATE INDEX IF NOT EXISTS objects_last_line ON objects (last_line);
";

const COLUMNS: &str = "id, bucket, key, size, current, position, modified, first_line, last_line";

/// One row of `objects`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: i64,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Next unread byte offset.
    pub position: u64,
    /// Source-reported modification time; a change fingerprint, not wall-clock.
    pub modified: DateTime<Utc>,
    pub current: bool,
    pub first_line: Option<String>,
    pub last_line: Option<String>,
}

impl ObjectRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let modified: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            bucket: row.get(1)?,
            key: row.get(2)?,
            size: row.get::<_, i64>(3)?.max(0) as u64,
            current: row.get(4)?,
            position: row.get::<_, i64>(5)?.max(0) as u64,
            modified: decode_time(&modified),
            first_line: row.get(7)?,
            last_line: row.get(8)?,
        })
    }
}

/// Fingerprint of a row whose object has not been read to the end yet. It never equals a
/// listed modification time, so the object stays on the worklist until it is finished.
pub fn pending_fingerprint() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn decode_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| pending_fingerprint())
}

/// What a record commit writes besides the position.
#[derive(Clone, Debug)]
pub struct Progress<'a> {
    pub position: u64,
    pub last_line: &'a str,
    pub first_line: Option<&'a str>,
}

pub struct OffsetStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl OffsetStore {
    /// Open (or create) `s3in.sqlite` under `work_dir`.
    pub fn open(work_dir: &Path, durability: Durability, clear: bool) -> rusqlite::Result<Self> {
        let path = work_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&path)?;
        Self::init(conn, path, durability, clear)
    }

    /// Private in-memory store.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"), Durability::Relaxed, false)
    }

    fn init(conn: Connection, path: PathBuf, durability: Durability, clear: bool) -> rusqlite::Result<Self> {
        conn.busy_timeout(Duration::from_millis(50_000))?;
        let (journal, sync) = match durability {
            Durability::Durable => ("WAL", "FULL"),
            Durability::Relaxed => ("MEMORY", "OFF"),
        };
        // journal_mode answers with the mode actually chosen (in-memory databases stay "memory").
        conn.pragma_update_and_check(None, "journal_mode", journal, |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", sync)?;
        if clear {
            conn.execute("DROP TABLE IF EXISTS objects", [])?;
        }
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), ?durability, "offset store open");
        Ok(Self { path, conn: Mutex::new(Some(conn)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside one transaction under the store-wide lock. Commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| rusqlite::Error::InvalidPath(self.path.clone()))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Decide whether `observed` is work for this cycle.
    ///
    /// - unknown object: insert a row (with the pending fingerprint) and return it, read from 0
    /// - same fingerprint as stored: `None`
    /// - changed fingerprint: the observed metadata with the stored position and boundary lines
    pub fn reconcile_candidate(&self, observed: &ObservedObject) -> rusqlite::Result<Option<ObjectRecord>> {
        self.transaction(|tx| {
            let stored = find_by_key(tx, &observed.bucket, &observed.key)?;
            match stored {
                None => {
                    tx.execute(
                        "INSERT INTO objects (bucket, key, size, current, position, modified)
                         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                        params![
                            observed.bucket,
                            observed.key,
                            observed.size as i64,
                            observed.current,
                            encode_time(&pending_fingerprint())
                        ],
                    )?;
                    Ok(Some(ObjectRecord {
                        id: tx.last_insert_rowid(),
                        bucket: observed.bucket.clone(),
                        key: observed.key.clone(),
                        size: observed.size,
                        position: 0,
                        modified: observed.modified,
                        current: observed.current,
                        first_line: None,
                        last_line: None,
                    }))
                }
                Some(row) if row.modified == observed.modified => Ok(None),
                Some(row) => Ok(Some(ObjectRecord {
                    id: row.id,
                    bucket: row.bucket,
                    key: row.key,
                    size: observed.size,
                    position: row.position,
                    modified: observed.modified,
                    current: observed.current,
                    first_line: row.first_line,
                    last_line: row.last_line,
                })),
            }
        })
    }

    /// Find the live-tail row that `record` supersedes.
    ///
    /// Only meaningful for current objects. A predecessor is another current row of the same
    /// bucket that has emitted something and either has the same first/last line pair as
    /// `record`, or whose last line is the line `record` now starts with. Candidates are tried
    /// oldest first; `same_stream` rejects rows that belong to a different tail stream.
    pub fn find_rotation_predecessor(
        &self,
        record: &ObjectRecord,
        same_stream: impl Fn(&ObjectRecord) -> bool,
    ) -> rusqlite::Result<Option<ObjectRecord>> {
        if !record.current {
            return Ok(None);
        }
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM objects
                 WHERE current = 1
                   AND bucket = ?1
                   AND key <> ?2
                   AND last_line IS NOT NULL
                   AND ((first_line IS ?3 AND last_line IS ?4) OR last_line = ?3)
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                params![record.bucket, record.key, record.first_line, record.last_line],
                ObjectRecord::from_row,
            )?;
            for row in rows {
                let row = row?;
                if same_stream(&row) {
                    return Ok(Some(row));
                }
            }
            Ok(None)
        })
    }

    /// Emit one record and persist the new position as a single unit.
    ///
    /// Inside one transaction: zero `predecessor` (if given), call `emit`, then advance the row.
    /// If `emit` fails nothing is written. The stored position never moves backwards.
    /// The fingerprint is left alone; see `finish_object`.
    pub fn commit_record<E>(
        &self,
        record: &ObjectRecord,
        progress: &Progress<'_>,
        predecessor: Option<i64>,
        emit: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<rusqlite::Error>,
    {
        self.transaction(|tx| {
            if let Some(prev) = predecessor {
                zero_row(tx, prev)?;
            }
            emit()?;
            tx.execute(
                "UPDATE objects
                 SET position = MAX(position, ?1), last_line = ?2, first_line = COALESCE(?3, first_line),
                     size = ?4, current = ?5
                 WHERE id = ?6",
                params![
                    progress.position as i64,
                    progress.last_line,
                    progress.first_line,
                    record.size as i64,
                    record.current,
                    record.id
                ],
            )?;
            Ok(())
        })
    }

    /// Persist the observed fingerprint of an object that was read to the end. Until this runs,
    /// a changed or new object keeps showing up as work and resumes from its committed position.
    pub fn finish_object(&self, record: &ObjectRecord) -> rusqlite::Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "UPDATE objects
                 SET size = ?1, modified = ?2, current = ?3, first_line = COALESCE(?4, first_line)
                 WHERE id = ?5",
                params![
                    record.size as i64,
                    encode_time(&record.modified),
                    record.current,
                    record.first_line,
                    record.id
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, bucket: &str, key: &str) -> rusqlite::Result<Option<ObjectRecord>> {
        self.transaction(|tx| find_by_key(tx, bucket, key))
    }

    pub fn get_by_id(&self, id: i64) -> rusqlite::Result<Option<ObjectRecord>> {
        self.transaction(|tx| {
            tx.query_row(
                &format!("SELECT {COLUMNS} FROM objects WHERE id = ?1"),
                params![id],
                ObjectRecord::from_row,
            )
            .optional()
        })
    }

    pub fn all(&self) -> rusqlite::Result<Vec<ObjectRecord>> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(&format!("SELECT {COLUMNS} FROM objects ORDER BY id"))?;
            let rows = stmt.query_map([], ObjectRecord::from_row)?;
            rows.collect()
        })
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Close the connection; later calls fail instead of touching the file.
    pub fn close(&self) -> rusqlite::Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }
}

fn find_by_key(tx: &Transaction<'_>, bucket: &str, key: &str) -> rusqlite::Result<Option<ObjectRecord>> {
    tx.query_row(
        &format!("SELECT {COLUMNS} FROM objects WHERE bucket = ?1 AND key = ?2"),
        params![bucket, key],
        ObjectRecord::from_row,
    )
    .optional()
}

fn zero_row(tx: &Transaction<'_>, id: i64) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE objects SET size = 0, position = 0, first_line = NULL, last_line = NULL WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}
