//! Database operations for the records table.

use custody_engine::{Fields, Record};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub table: String,
    pub record_id: String,
    pub fields: Fields,
    pub updated_at: i64,
    pub deleted: bool,
    /// Server time of the last accepted write
    pub changed_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let Json(fields) = row.try_get::<Json<Fields>, _>("fields")?;
        Ok(StoredRecord {
            table: row.try_get("tbl")?,
            record_id: row.try_get("record_id")?,
            fields,
            updated_at: row.try_get("updated_at")?,
            deleted: row.try_get("deleted")?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert the row to the engine's wire type.
    pub fn to_record(&self) -> Record {
        Record {
            table: self.table.clone(),
            id: self.record_id.clone(),
            fields: self.fields.clone(),
            // the column is CHECKed non-negative
            updated_at: u64::try_from(self.updated_at).unwrap_or_default(),
            deleted: self.deleted,
        }
    }
}

const COLUMNS: &str = "tbl, record_id, fields, updated_at, deleted, changed_at";

/// Store `record` unless the stored version is at least as new.
///
/// Returns `false` when a concurrent writer got there first; the caller
/// should reload and answer with a conflict.
pub async fn write_if_newer(pool: &PgPool, record: &Record, updated_at: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (tbl, record_id, fields, updated_at, deleted, changed_at)
        VALUES ($1, $2, $3, $4, $5, (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT)
        ON CONFLICT (tbl, record_id) DO UPDATE SET
            fields = EXCLUDED.fields,
            updated_at = EXCLUDED.updated_at,
            deleted = EXCLUDED.deleted,
            changed_at = EXCLUDED.changed_at
        WHERE records.updated_at < EXCLUDED.updated_at
        "#,
    )
    .bind(&record.table)
    .bind(&record.id)
    .bind(Json(&record.fields))
    .bind(updated_at)
    .bind(record.deleted)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a record by table and ID, tombstones included.
pub async fn get_record(
    pool: &PgPool,
    table: &str,
    record_id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE tbl = $1 AND record_id = $2"
    ))
    .bind(table)
    .bind(record_id)
    .fetch_optional(pool)
    .await
}

/// Records written at or after `since`, oldest change first. Everything when
/// `since` is `None`.
pub async fn changes_since(
    pool: &PgPool,
    since: Option<i64>,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(&format!(
        "SELECT {COLUMNS} FROM records WHERE changed_at >= $1 ORDER BY changed_at, tbl, record_id"
    ))
    .bind(since.unwrap_or(i64::MIN))
    .fetch_all(pool)
    .await
}
