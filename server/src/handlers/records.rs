//! Record write handlers - apply one client mutation each.
//!
//! The acceptance rule is the engine's [`ConflictResolver`] with the incoming
//! write on the local side: it is stored only if it is strictly newer than
//! the stored version. An identical resend is acknowledged with the stored
//! record, which makes client retries idempotent.

use crate::db;
use crate::error::{AppError, Result};
use custody_engine::{ConflictResolver, Record, Resolution, Schema};
use serde::Deserialize;
use sqlx::PgPool;

/// Query parameters for a delete.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    /// Stamp of the client's tombstone
    pub updated_at: u64,
}

/// Outcome of checking an incoming write against the stored version.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteDecision {
    /// Store the incoming version
    Accept,
    /// Already stored; answer with the stored record
    AlreadyApplied(Record),
    /// The stored version wins
    Stale(Record),
}

/// Decide whether `incoming` may replace `stored`.
pub fn decide(stored: Option<&Record>, incoming: &Record) -> WriteDecision {
    let Some(stored) = stored else {
        return WriteDecision::Accept;
    };
    match ConflictResolver::default().resolve(incoming, stored).resolution {
        Resolution::LocalWins => WriteDecision::Accept,
        Resolution::Identical => WriteDecision::AlreadyApplied(stored.clone()),
        Resolution::RemoteWins => WriteDecision::Stale(stored.clone()),
    }
}

/// POST /tables/{table}
pub async fn create_record(pool: &PgPool, table: &str, record: Record) -> Result<Record> {
    check_target(table, None, &record)?;
    let stored = load(pool, table, &record.id).await?;
    apply(pool, stored, record).await
}

/// PUT /tables/{table}/{id}
pub async fn update_record(pool: &PgPool, table: &str, id: &str, record: Record) -> Result<Record> {
    check_target(table, Some(id), &record)?;
    match load(pool, table, id).await? {
        // a tombstone still takes part in the ordering
        Some(stored) => apply(pool, Some(stored), record).await,
        None => Err(not_found(table, id)),
    }
}

/// DELETE /tables/{table}/{id}?updatedAt=
pub async fn delete_record(pool: &PgPool, table: &str, id: &str, query: DeleteQuery) -> Result<Record> {
    let stored = match load(pool, table, id).await? {
        Some(stored) if stored.is_active() => stored,
        _ => return Err(not_found(table, id)),
    };

    let mut tombstone = stored.clone();
    tombstone.mark_deleted(query.updated_at);
    apply(pool, Some(stored), tombstone).await
}

async fn apply(pool: &PgPool, stored: Option<Record>, incoming: Record) -> Result<Record> {
    let updated_at = i64::try_from(incoming.updated_at)
        .map_err(|_| AppError::BadRequest("updatedAt out of range".to_string()))?;

    match decide(stored.as_ref(), &incoming) {
        WriteDecision::Accept => {}
        WriteDecision::AlreadyApplied(stored) => {
            tracing::debug!(key = %stored.key(), "write already applied");
            return Ok(stored);
        }
        WriteDecision::Stale(current) => {
            tracing::info!(
                key = %current.key(),
                incoming = incoming.updated_at,
                stored = current.updated_at,
                "stale write refused"
            );
            return Err(AppError::Conflict {
                current: Box::new(current),
            });
        }
    }

    if db::write_if_newer(pool, &incoming, updated_at).await? {
        tracing::info!(
            key = %incoming.key(),
            updated_at = incoming.updated_at,
            deleted = incoming.deleted,
            "record stored"
        );
        return Ok(incoming);
    }

    // lost a race with a concurrent writer
    let current = load(pool, &incoming.table, &incoming.id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("{} vanished during write", incoming.key())))?;
    match decide(Some(&current), &incoming) {
        WriteDecision::AlreadyApplied(stored) => Ok(stored),
        _ => Err(AppError::Conflict {
            current: Box::new(current),
        }),
    }
}

async fn load(pool: &PgPool, table: &str, id: &str) -> Result<Option<Record>> {
    Ok(db::get_record(pool, table, id)
        .await?
        .map(|row| row.to_record()))
}

/// The body must describe the record addressed by the path.
fn check_target(table: &str, id: Option<&str>, record: &Record) -> Result<()> {
    if record.table != table {
        return Err(AppError::BadRequest(format!(
            "body table {:?} does not match path table {table:?}",
            record.table
        )));
    }
    if let Some(id) = id {
        if record.id != id {
            return Err(AppError::BadRequest(format!(
                "body id {:?} does not match path id {id:?}",
                record.id
            )));
        }
    }
    if record.id.is_empty() {
        return Err(AppError::BadRequest("record id is empty".to_string()));
    }
    Schema::default().validate_record(record)?;
    Ok(())
}

fn not_found(table: &str, id: &str) -> AppError {
    AppError::NotFound {
        table: table.to_string(),
        id: id.to_string(),
    }
}
