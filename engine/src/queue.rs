//! Mutation queue - the durable, ordered log of writes bound for the remote.
//!
//! Each entry is one SQLite row keyed by an autoincrement `sequence`, written
//! inside a transaction, so an entry is either fully durable or absent.
//!
//! # Entry lifecycle
//!
//! ```text
//! enqueue ─▶ pending ─peek_batch─▶ in_flight ─ack─▶ (removed)
//!               ▲                     │
//!               ├──────requeue────────┤ (transient, or rejected < max_attempts)
//!               ├──────release────────┘ (cancelled / connectivity lost)
//!               │
//!          retry_review ◀── needs_review ◀─requeue─ (rejected >= max_attempts)
//! ```
//!
//! Only pending entries are coalesced into. Borrowed and escalated entries are
//! left alone, and a later mutation for the same record is appended behind
//! them instead.

use crate::{
    clock::Clock,
    db::Database,
    error::{Result, StorageError},
    operation::{coalesce, Coalesce},
    Error, Operation, Record, RecordKey, Schema, Sequence, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be drained (possibly inside a backoff window)
    Pending,
    /// Borrowed by a running drain
    InFlight,
    /// Retries exhausted; waits for an explicit user decision
    NeedsReview,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::NeedsReview => "needs_review",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "in_flight" => Ok(EntryState::InFlight),
            "needs_review" => Ok(EntryState::NeedsReview),
            other => Err(format!("unknown entry state: {other}")),
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Position in the queue; never reused
    pub sequence: Sequence,
    pub table: String,
    pub record_id: String,
    pub operation: Operation,
    /// Record snapshot at enqueue time (or at the last coalesce)
    pub payload: Record,
    pub enqueued_at: Timestamp,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the entry may be drained again
    pub next_attempt_at: Timestamp,
    pub state: EntryState,
}

impl QueueEntry {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.record_id.clone())
    }
}

/// Per-entry exponential backoff and the escalation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure is `base_delay_ms * 2`
    pub base_delay_ms: u64,
    /// Upper bound on the backoff exponent
    pub max_exponent: u32,
    /// Rejections tolerated before an entry needs review
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_exponent: 6,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff after `attempts` failures: `base * 2^min(attempts, cap)`.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.min(self.max_exponent);
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
    }
}

/// Why a drain attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble; retried forever
    Transient,
    /// The remote refused the mutation; retried up to `max_attempts`
    Rejected,
}

/// Durable mutation queue.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    db: Database,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    schema: Arc<Schema>,
}

impl MutationQueue {
    /// Open the queue. Entries a crashed drain left borrowed go back to
    /// pending, keeping their position.
    pub fn open(
        db: Database,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        schema: Arc<Schema>,
    ) -> Result<Self> {
        let recovered = db.write(|tx| {
            Ok(tx.execute(
                "UPDATE queue SET state = 'pending' WHERE state = 'in_flight'",
                [],
            )?)
        })?;
        if recovered > 0 {
            tracing::warn!(recovered, "returned interrupted queue entries to pending");
        }

        Ok(Self {
            db,
            clock,
            policy,
            schema,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a mutation, coalescing with the open entry for the same record.
    pub fn enqueue(&self, operation: Operation, payload: Record) -> Result<QueueEntry> {
        self.schema.validate_record(&payload)?;
        let now = self.clock.now();
        self.db.write(|tx| enqueue_in(tx, now, operation, &payload))
    }

    /// Borrow up to `max` drainable entries, oldest first.
    ///
    /// An entry is skipped while it is inside its backoff window, and so is
    /// every later entry for the same record, keeping per-record FIFO.
    pub fn peek_batch(&self, max: usize) -> Result<Vec<QueueEntry>> {
        self.peek_batch_excluding(max, &HashSet::new())
    }

    /// [`peek_batch`](Self::peek_batch) that also passes over the `skip`
    /// sequences, holding back later entries for their records the same way
    /// a backoff window does.
    pub fn peek_batch_excluding(
        &self,
        max: usize,
        skip: &HashSet<Sequence>,
    ) -> Result<Vec<QueueEntry>> {
        let now = self.clock.now();
        self.db.write(|tx| {
            let mut blocked: HashSet<RecordKey> = HashSet::new();
            let mut batch = Vec::new();

            for entry in load_entries(tx, None)? {
                if batch.len() >= max {
                    break;
                }
                let key = entry.key();
                if blocked.contains(&key) {
                    continue;
                }
                if entry.state != EntryState::Pending
                    || entry.next_attempt_at > now
                    || skip.contains(&entry.sequence)
                {
                    blocked.insert(key);
                    continue;
                }
                batch.push(entry);
            }

            for entry in &mut batch {
                tx.execute(
                    "UPDATE queue SET state = 'in_flight' WHERE sequence = ?1",
                    [entry.sequence],
                )?;
                entry.state = EntryState::InFlight;
            }
            Ok(batch)
        })
    }

    /// Remove an entry after the remote confirmed it.
    pub fn ack(&self, sequence: Sequence) -> Result<()> {
        self.db.write(|tx| ack_in(tx, sequence))
    }

    /// Return a failed entry to the queue at its original position.
    pub fn requeue(
        &self,
        sequence: Sequence,
        error: &str,
        kind: FailureKind,
    ) -> Result<QueueEntry> {
        let now = self.clock.now();
        let policy = self.policy;
        self.db.write(|tx| {
            let mut entry = load_entry(tx, sequence)?.ok_or(Error::EntryNotFound(sequence))?;
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(error.to_string());

            if kind == FailureKind::Rejected && entry.attempts >= policy.max_attempts {
                entry.state = EntryState::NeedsReview;
                tracing::warn!(
                    sequence,
                    key = %entry.key(),
                    attempts = entry.attempts,
                    error,
                    "mutation escalated to manual review"
                );
            } else {
                entry.state = EntryState::Pending;
                entry.next_attempt_at = now.saturating_add(policy.delay_ms(entry.attempts));
                tracing::debug!(
                    sequence,
                    key = %entry.key(),
                    attempts = entry.attempts,
                    retry_at = entry.next_attempt_at,
                    "mutation requeued"
                );
            }

            tx.execute(
                "UPDATE queue SET attempts = ?1, last_error = ?2, next_attempt_at = ?3, state = ?4
                 WHERE sequence = ?5",
                params![
                    entry.attempts,
                    entry.last_error,
                    entry.next_attempt_at,
                    entry.state.as_str(),
                    sequence
                ],
            )?;
            Ok(entry)
        })
    }

    /// Give back a borrowed entry without counting an attempt.
    pub fn release(&self, sequence: Sequence) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                "UPDATE queue SET state = 'pending' WHERE sequence = ?1 AND state = 'in_flight'",
                [sequence],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, sequence: Sequence) -> Result<Option<QueueEntry>> {
        self.db.read(|conn| load_entry(conn, sequence))
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        self.db.read(|conn| load_entries(conn, None))
    }

    /// Entries that exhausted their retries.
    pub fn needs_review(&self) -> Result<Vec<QueueEntry>> {
        self.db
            .read(|conn| load_entries(conn, Some(EntryState::NeedsReview)))
    }

    /// Entries still headed for the remote (review entries excluded).
    pub fn len(&self) -> Result<usize> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE state != 'needs_review'",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn review_len(&self) -> Result<usize> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE state = 'needs_review'",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Whether any entry, in any state, exists for the record.
    pub fn has_outstanding(&self, table: &str, id: &str) -> Result<bool> {
        self.db.read(|conn| has_outstanding_in(conn, table, id))
    }

    /// Drop the queued entries for a record whose local intent lost a
    /// conflict. Callers must flag the conflict alongside.
    pub fn supersede(&self, table: &str, id: &str) -> Result<Vec<QueueEntry>> {
        self.db.write(|tx| supersede_in(tx, table, id))
    }

    /// Put an escalated entry back in line with a fresh retry budget.
    pub fn retry_review(&self, sequence: Sequence) -> Result<QueueEntry> {
        self.db.write(|tx| {
            let mut entry = load_entry(tx, sequence)?.ok_or(Error::EntryNotFound(sequence))?;
            if entry.state != EntryState::NeedsReview {
                return Err(Error::NotInReview(sequence));
            }
            entry.state = EntryState::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = 0;
            tx.execute(
                "UPDATE queue SET state = 'pending', attempts = 0, next_attempt_at = 0
                 WHERE sequence = ?1",
                [sequence],
            )?;
            tracing::info!(sequence, key = %entry.key(), "review entry returned to queue");
            Ok(entry)
        })
    }

    /// Drop an escalated entry on explicit user request.
    pub fn discard_review(&self, sequence: Sequence) -> Result<QueueEntry> {
        self.db.write(|tx| {
            let entry = load_entry(tx, sequence)?.ok_or(Error::EntryNotFound(sequence))?;
            if entry.state != EntryState::NeedsReview {
                return Err(Error::NotInReview(sequence));
            }
            ack_in(tx, sequence)?;
            tracing::warn!(
                sequence,
                key = %entry.key(),
                operation = %entry.operation,
                payload = ?entry.payload,
                "review entry discarded by user"
            );
            Ok(entry)
        })
    }
}

pub(crate) fn enqueue_in(
    conn: &Connection,
    now: Timestamp,
    operation: Operation,
    payload: &Record,
) -> Result<QueueEntry> {
    // newest entry for the key, whatever its state
    let newest: Option<(Sequence, String, String)> = conn
        .query_row(
            "SELECT sequence, operation, state FROM queue
             WHERE tbl = ?1 AND record_id = ?2
             ORDER BY sequence DESC LIMIT 1",
            params![payload.table, payload.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let open = match &newest {
        Some((sequence, op, state)) if state == EntryState::Pending.as_str() => {
            Some((*sequence, parse_operation(op)?))
        }
        _ => None,
    };

    let body = serde_json::to_string(payload)?;
    let sequence = match coalesce(open.map(|(_, op)| op), operation) {
        Coalesce::Replace { operation } => {
            let (sequence, _) = open.ok_or_else(|| {
                StorageError::Corrupt("coalesce without an open entry".to_string())
            })?;
            conn.execute(
                "UPDATE queue SET operation = ?1, payload = ?2 WHERE sequence = ?3",
                params![operation.as_str(), body, sequence],
            )?;
            tracing::debug!(sequence, key = %payload.key(), %operation, "coalesced mutation");
            sequence
        }
        Coalesce::CancelAndAppend => {
            let cancelled = conn.execute(
                "DELETE FROM queue WHERE tbl = ?1 AND record_id = ?2
                 AND state = 'pending' AND operation IN ('create', 'update')",
                params![payload.table, payload.id],
            )?;
            tracing::debug!(cancelled, key = %payload.key(), "delete cancelled pending writes");
            insert_entry(conn, now, operation, payload, &body)?
        }
        Coalesce::Append => insert_entry(conn, now, operation, payload, &body)?,
    };

    load_entry(conn, sequence)?.ok_or_else(|| Error::EntryNotFound(sequence))
}

fn insert_entry(
    conn: &Connection,
    now: Timestamp,
    operation: Operation,
    payload: &Record,
    body: &str,
) -> Result<Sequence> {
    conn.execute(
        "INSERT INTO queue (tbl, record_id, operation, payload, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![payload.table, payload.id, operation.as_str(), body, now],
    )?;
    let sequence = conn.last_insert_rowid();
    tracing::debug!(sequence, key = %payload.key(), %operation, "enqueued mutation");
    Ok(sequence)
}

pub(crate) fn ack_in(conn: &Connection, sequence: Sequence) -> Result<()> {
    let removed = conn.execute("DELETE FROM queue WHERE sequence = ?1", [sequence])?;
    if removed == 0 {
        return Err(Error::EntryNotFound(sequence));
    }
    Ok(())
}

pub(crate) fn has_outstanding_in(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM queue WHERE tbl = ?1 AND record_id = ?2)",
        params![table, id],
        |row| row.get(0),
    )?)
}

/// Whether an entry queued after `sequence` exists for the record.
pub(crate) fn has_newer_in(
    conn: &Connection,
    table: &str,
    id: &str,
    sequence: Sequence,
) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM queue WHERE tbl = ?1 AND record_id = ?2 AND sequence > ?3)",
        params![table, id, sequence],
        |row| row.get(0),
    )?)
}

/// Newest entry for the record, whatever its state.
pub(crate) fn newest_in(conn: &Connection, table: &str, id: &str) -> Result<Option<QueueEntry>> {
    conn.query_row(
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM queue WHERE tbl = ?1 AND record_id = ?2
             ORDER BY sequence DESC LIMIT 1"
        ),
        params![table, id],
        raw_entry,
    )
    .optional()?
    .map(RawEntry::decode)
    .transpose()
}

/// Remove the entries whose local intent lost a conflict. Entries waiting for
/// review are kept; they need a user decision either way.
pub(crate) fn supersede_in(conn: &Connection, table: &str, id: &str) -> Result<Vec<QueueEntry>> {
    let superseded: Vec<_> = load_entries(conn, None)?
        .into_iter()
        .filter(|e| e.table == table && e.record_id == id && e.state != EntryState::NeedsReview)
        .collect();
    for entry in &superseded {
        ack_in(conn, entry.sequence)?;
    }
    Ok(superseded)
}

pub(crate) fn count_in(conn: &Connection) -> Result<(usize, usize)> {
    Ok(conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN state != 'needs_review' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'needs_review' THEN 1 ELSE 0 END), 0)
         FROM queue",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}

struct RawEntry {
    sequence: Sequence,
    table: String,
    record_id: String,
    operation: String,
    payload: String,
    enqueued_at: Timestamp,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: Timestamp,
    state: String,
}

impl RawEntry {
    fn decode(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            sequence: self.sequence,
            table: self.table,
            record_id: self.record_id,
            operation: parse_operation(&self.operation)?,
            payload: serde_json::from_str(&self.payload)?,
            enqueued_at: self.enqueued_at,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            state: self.state.parse().map_err(StorageError::Corrupt)?,
        })
    }
}

fn parse_operation(raw: &str) -> Result<Operation> {
    Ok(raw.parse().map_err(StorageError::Corrupt)?)
}

const ENTRY_COLUMNS: &str = "sequence, tbl, record_id, operation, payload, enqueued_at,
    attempts, last_error, next_attempt_at, state";

fn raw_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        sequence: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        operation: row.get(3)?,
        payload: row.get(4)?,
        enqueued_at: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_attempt_at: row.get(8)?,
        state: row.get(9)?,
    })
}

fn load_entry(conn: &Connection, sequence: Sequence) -> Result<Option<QueueEntry>> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM queue WHERE sequence = ?1"),
        [sequence],
        raw_entry,
    )
    .optional()?
    .map(RawEntry::decode)
    .transpose()
}

fn load_entries(conn: &Connection, state: Option<EntryState>) -> Result<Vec<QueueEntry>> {
    let rows = match state {
        Some(state) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM queue WHERE state = ?1 ORDER BY sequence"
            ))?;
            let rows = stmt
                .query_map([state.as_str()], raw_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM queue ORDER BY sequence"))?;
            let rows = stmt
                .query_map([], raw_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    rows.into_iter().map(RawEntry::decode).collect()
}
