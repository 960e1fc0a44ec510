//! Conflict resolution between a local and a remote copy of one record.
//!
//! Resolution is whole-record last-write-wins on `updated_at`. Equal stamps
//! go to the remote copy so every replica converges on the backend's view.
//! Tombstones take part like any other version: a newer local tombstone wins
//! and is propagated as a delete, a newer remote update resurrects a record
//! deleted locally.
//!
//! Most resolutions are only logged. Two cases are flagged for manual
//! review and persisted in the conflict log until someone resolves them:
//!
//! - the tie-break picked between two different contents, and
//! - the remote won over a local version that still had a queued mutation,
//!   so the user's edit was dropped.

use crate::{
    clock::Clock,
    db::Database,
    error::{Result, StorageError},
    Error, Record, RecordKey, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Merge strategy applied by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum MergeStrategy {
    /// Higher `updated_at` wins, ties go to the remote copy
    #[default]
    LastWriteWins,
}

/// Which side a resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Local copy is newer
    LocalWins,
    /// Remote copy is newer, or won the tie-break
    RemoteWins,
    /// Both copies are the same version
    Identical,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::LocalWins => "local_wins",
            Resolution::RemoteWins => "remote_wins",
            Resolution::Identical => "identical",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local_wins" => Ok(Resolution::LocalWins),
            "remote_wins" => Ok(Resolution::RemoteWins),
            "identical" => Ok(Resolution::Identical),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// Why a resolution needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReviewReason {
    /// Equal timestamps, different contents; the remote copy was kept
    TieBreak,
    /// The remote copy replaced a local edit that had not reached it yet
    LocalIntentLost,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::TieBreak => "tie_break",
            ReviewReason::LocalIntentLost => "local_intent_lost",
        }
    }
}

impl FromStr for ReviewReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tie_break" => Ok(ReviewReason::TieBreak),
            "local_intent_lost" => Ok(ReviewReason::LocalIntentLost),
            other => Err(format!("unknown review reason: {other}")),
        }
    }
}

/// Outcome of resolving one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub local: Record,
    pub remote: Record,
    pub strategy: MergeStrategy,
    pub resolution: Resolution,
    /// The version to keep
    pub result: Record,
    /// Set when the resolution must be confirmed by a user
    pub review: Option<ReviewReason>,
}

impl ConflictRecord {
    pub fn key(&self) -> RecordKey {
        self.result.key()
    }

    pub fn needs_review(&self) -> bool {
        self.review.is_some()
    }

    /// Flag the resolution for manual review. The first reason sticks.
    pub fn flag(mut self, reason: ReviewReason) -> Self {
        self.review.get_or_insert(reason);
        self
    }

    /// Write the audit line for this resolution.
    pub fn log(&self) {
        match self.review {
            Some(reason) => tracing::warn!(
                key = %self.key(),
                resolution = %self.resolution,
                reason = reason.as_str(),
                local = ?self.local,
                remote = ?self.remote,
                "conflict flagged for review"
            ),
            None => tracing::info!(
                key = %self.key(),
                resolution = %self.resolution,
                local_updated_at = self.local.updated_at,
                remote_updated_at = self.remote.updated_at,
                local = ?self.local,
                remote = ?self.remote,
                "conflict resolved"
            ),
        }
    }
}

/// Stateless conflict resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: MergeStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Pick the version to keep.
    pub fn resolve(&self, local: &Record, remote: &Record) -> ConflictRecord {
        let (resolution, review) = match self.strategy {
            MergeStrategy::LastWriteWins => last_write_wins(local, remote),
        };
        let result = match resolution {
            Resolution::LocalWins => local.clone(),
            Resolution::RemoteWins | Resolution::Identical => remote.clone(),
        };

        ConflictRecord {
            local: local.clone(),
            remote: remote.clone(),
            strategy: self.strategy,
            resolution,
            result,
            review,
        }
    }
}

fn last_write_wins(local: &Record, remote: &Record) -> (Resolution, Option<ReviewReason>) {
    if local.updated_at > remote.updated_at {
        (Resolution::LocalWins, None)
    } else if local.updated_at < remote.updated_at {
        (Resolution::RemoteWins, None)
    } else if local.same_version(remote) {
        (Resolution::Identical, None)
    } else {
        (Resolution::RemoteWins, Some(ReviewReason::TieBreak))
    }
}

/// A flagged conflict as kept in the conflict log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedConflict {
    pub id: i64,
    pub local: Record,
    pub remote: Record,
    pub resolution: Resolution,
    pub reason: ReviewReason,
    /// The version that was applied locally
    pub result: Record,
    pub detected_at: Timestamp,
    pub resolved: bool,
}

impl FlaggedConflict {
    pub fn key(&self) -> RecordKey {
        self.result.key()
    }
}

/// Durable log of conflicts awaiting manual review.
#[derive(Debug, Clone)]
pub struct ConflictLog {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ConflictLog {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Persist a flagged resolution. Unflagged ones are ignored.
    pub fn record(&self, conflict: &ConflictRecord) -> Result<Option<i64>> {
        let now = self.clock.now();
        self.db.write(|tx| record_in(tx, now, conflict))
    }

    pub fn get(&self, id: i64) -> Result<Option<FlaggedConflict>> {
        self.db.read(|conn| load(conn, id))
    }

    /// Conflicts not yet resolved, oldest first.
    pub fn unresolved(&self) -> Result<Vec<FlaggedConflict>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM conflicts WHERE resolved = 0 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], raw_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RawConflict::decode).collect()
        })
    }

    pub fn unresolved_len(&self) -> Result<usize> {
        self.db.read(unresolved_len_in)
    }

    /// Close a conflict. Fails if it is unknown or already closed.
    pub fn mark_resolved(&self, id: i64) -> Result<FlaggedConflict> {
        self.db.write(|tx| mark_resolved_in(tx, id))
    }
}

pub(crate) fn record_in(
    conn: &Connection,
    now: Timestamp,
    conflict: &ConflictRecord,
) -> Result<Option<i64>> {
    let Some(reason) = conflict.review else {
        return Ok(None);
    };
    conn.execute(
        "INSERT INTO conflicts (tbl, record_id, local, remote, resolution, reason, result, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conflict.result.table,
            conflict.result.id,
            serde_json::to_string(&conflict.local)?,
            serde_json::to_string(&conflict.remote)?,
            conflict.resolution.as_str(),
            reason.as_str(),
            serde_json::to_string(&conflict.result)?,
            now
        ],
    )?;
    Ok(Some(conn.last_insert_rowid()))
}

pub(crate) fn unresolved_len_in(conn: &Connection) -> Result<usize> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM conflicts WHERE resolved = 0",
        [],
        |row| row.get(0),
    )?)
}

pub(crate) fn mark_resolved_in(conn: &Connection, id: i64) -> Result<FlaggedConflict> {
    let mut conflict = load(conn, id)?.ok_or(Error::ConflictNotFound(id))?;
    if conflict.resolved {
        return Err(Error::InvalidTransition(format!(
            "conflict {id} is already resolved"
        )));
    }
    conn.execute("UPDATE conflicts SET resolved = 1 WHERE id = ?1", [id])?;
    conflict.resolved = true;
    tracing::info!(id, key = %conflict.key(), "conflict resolved by user");
    Ok(conflict)
}

const COLUMNS: &str = "id, local, remote, resolution, reason, result, detected_at, resolved";

struct RawConflict {
    id: i64,
    local: String,
    remote: String,
    resolution: String,
    reason: String,
    result: String,
    detected_at: Timestamp,
    resolved: bool,
}

impl RawConflict {
    fn decode(self) -> Result<FlaggedConflict> {
        Ok(FlaggedConflict {
            id: self.id,
            local: serde_json::from_str(&self.local)?,
            remote: serde_json::from_str(&self.remote)?,
            resolution: self.resolution.parse().map_err(StorageError::Corrupt)?,
            reason: self.reason.parse().map_err(StorageError::Corrupt)?,
            result: serde_json::from_str(&self.result)?,
            detected_at: self.detected_at,
            resolved: self.resolved,
        })
    }
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConflict> {
    Ok(RawConflict {
        id: row.get(0)?,
        local: row.get(1)?,
        remote: row.get(2)?,
        resolution: row.get(3)?,
        reason: row.get(4)?,
        result: row.get(5)?,
        detected_at: row.get(6)?,
        resolved: row.get(7)?,
    })
}

fn load(conn: &Connection, id: i64) -> Result<Option<FlaggedConflict>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM conflicts WHERE id = ?1"),
        [id],
        raw_row,
    )
    .optional()?
    .map(RawConflict::decode)
    .transpose()
}
