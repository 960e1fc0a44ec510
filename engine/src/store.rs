//! Local store - the durable record container.
//!
//! The local store is the source of truth while offline. Deletes leave a
//! tombstone behind; the row is only erased once the remote backend has
//! confirmed the delete.

use crate::{
    clock::{write_stamp, Clock},
    db::Database,
    error::{Result, StorageError},
    Error, Fields, Record, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

const SYNC_CURSOR_KEY: &str = "last_sync_time";

/// Durable table/record storage.
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Get a live record.
    pub fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .get_including_deleted(table, id)?
            .filter(Record::is_active))
    }

    /// Get a record, tombstones included.
    pub fn get_including_deleted(&self, table: &str, id: &str) -> Result<Option<Record>> {
        self.db.read(|conn| load(conn, table, id))
    }

    /// All live records of a table, in first-insertion order.
    pub fn get_table(&self, table: &str) -> Result<Vec<Record>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tbl, id, fields, updated_at, deleted FROM records
                 WHERE tbl = ?1 AND deleted = 0 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([table], raw_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawRecord::decode).collect()
        })
    }

    /// Insert or overwrite a record. An overwrite keeps the original position.
    pub fn put(&self, record: &Record) -> Result<()> {
        self.db.write(|tx| save(tx, record))
    }

    /// Replace a record with a tombstone. Returns the tombstone, or `None` if
    /// there was no live record.
    pub fn remove(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let Some(mut record) = load(tx, table, id)?.filter(Record::is_active) else {
                return Ok(None);
            };
            record.mark_deleted(write_stamp(now, Some(record.updated_at)));
            save(tx, &record)?;
            Ok(Some(record))
        })
    }

    /// Physically erase a record. Only valid after a remote-confirmed delete.
    pub fn purge(&self, table: &str, id: &str) -> Result<bool> {
        self.db.write(|tx| erase(tx, table, id))
    }

    /// Server-observed time of the last completed pull.
    pub fn sync_cursor(&self) -> Result<Option<Timestamp>> {
        self.db.read(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    [SYNC_CURSOR_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            value
                .map(|v| {
                    v.parse::<Timestamp>()
                        .map_err(|_| Error::from(StorageError::Corrupt(format!("sync cursor: {v}"))))
                })
                .transpose()
        })
    }

    pub fn set_sync_cursor(&self, at: Timestamp) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![SYNC_CURSOR_KEY, at.to_string()],
            )?;
            Ok(())
        })
    }
}

struct RawRecord {
    table: String,
    id: String,
    fields: String,
    updated_at: Timestamp,
    deleted: bool,
}

impl RawRecord {
    fn decode(self) -> Result<Record> {
        let fields: Fields = serde_json::from_str(&self.fields)?;
        Ok(Record {
            table: self.table,
            id: self.id,
            fields,
            updated_at: self.updated_at,
            deleted: self.deleted,
        })
    }
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        table: row.get(0)?,
        id: row.get(1)?,
        fields: row.get(2)?,
        updated_at: row.get(3)?,
        deleted: row.get(4)?,
    })
}

pub(crate) fn load(conn: &Connection, table: &str, id: &str) -> Result<Option<Record>> {
    conn.query_row(
        "SELECT tbl, id, fields, updated_at, deleted FROM records WHERE tbl = ?1 AND id = ?2",
        params![table, id],
        raw_row,
    )
    .optional()?
    .map(RawRecord::decode)
    .transpose()
}

pub(crate) fn save(conn: &Connection, record: &Record) -> Result<()> {
    let fields = serde_json::to_string(&record.fields)?;
    conn.execute(
        "INSERT INTO records (tbl, id, fields, updated_at, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(tbl, id) DO UPDATE SET
            fields = excluded.fields,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted",
        params![record.table, record.id, fields, record.updated_at, record.deleted],
    )?;
    Ok(())
}

pub(crate) fn erase(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
        params![table, id],
    )?;
    Ok(removed > 0)
}

/// Fail with `RecordNotFound` unless a live record exists.
pub(crate) fn require_live(conn: &Connection, table: &str, id: &str) -> Result<Record> {
    load(conn, table, id)?
        .filter(Record::is_active)
        .ok_or_else(|| Error::RecordNotFound {
            table: table.to_string(),
            id: id.to_string(),
        })
}
