//! Sync orchestrator - drives one sync cycle at a time.
//!
//! ```text
//! Idle ─▶ Draining ─▶ Pulling ─▶ Reconciling ─▶ Idle
//!   ▲         │           │            │
//!   └─────────┴───────────┴────────────┘  cancelled, offline, or failed
//! ```
//!
//! Draining pushes queued mutations to the remote. Pulling fetches records
//! changed since the cursor. Reconciling folds them into the local store,
//! running the conflict resolver where a local mutation is still queued.
//! The cursor only moves once reconciling finished, so an interrupted cycle
//! is simply repeated.
//!
//! At most one cycle runs at a time. Triggers that arrive while one is
//! running collapse into a single follow-up cycle.

use crate::{
    clock::Clock,
    db::Database,
    error::{RemoteError, Result},
    network::NetworkMonitor,
    queue::{self, FailureKind, MutationQueue, QueueEntry},
    reconcile::{self, ConflictResolver, Resolution, ReviewReason},
    remote::RemoteBackend,
    status::StatusHandle,
    store::{self, LocalStore},
    Operation, Record, RecordKey, Sequence,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// Phase of the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
    Pulling,
    Reconciling,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleOutcome {
    #[default]
    Completed,
    /// The remote was unreachable; nothing past the drain ran
    Offline,
    /// Shutdown was requested mid-cycle
    Cancelled,
    /// A local storage failure aborted the cycle
    Failed(String),
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Completed => f.write_str("completed"),
            CycleOutcome::Offline => f.write_str("offline"),
            CycleOutcome::Cancelled => f.write_str("cancelled"),
            CycleOutcome::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Mutations acknowledged by the remote
    pub applied: usize,
    /// Mutations requeued after a failure
    pub failed: usize,
    /// Mutations returned untried behind a failed one
    pub deferred: usize,
    /// Records received from the pull
    pub pulled: usize,
    /// Conflicts the resolver ran on
    pub conflicts: usize,
    /// Conflicts flagged for manual review
    pub flagged: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    /// Fold a follow-up cycle into this report; its outcome replaces ours.
    fn absorb(&mut self, next: CycleReport) {
        self.applied += next.applied;
        self.failed += next.failed;
        self.deferred += next.deferred;
        self.pulled += next.pulled;
        self.conflicts += next.conflicts;
        self.flagged += next.flagged;
        self.outcome = next.outcome;
    }

    fn log(&self, elapsed_ms: u64) {
        match self.outcome {
            CycleOutcome::Failed(_) => tracing::error!(
                applied = self.applied,
                failed = self.failed,
                pulled = self.pulled,
                outcome = %self.outcome,
                elapsed_ms,
                "sync cycle failed"
            ),
            _ => tracing::info!(
                applied = self.applied,
                failed = self.failed,
                deferred = self.deferred,
                pulled = self.pulled,
                conflicts = self.conflicts,
                flagged = self.flagged,
                outcome = %self.outcome,
                elapsed_ms,
                "sync cycle finished"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Flight {
    running: bool,
    rerun: bool,
    /// The running cycle is probing the remote before it drains
    probing: bool,
    /// Something else brought the remote back during that probe
    reconnected: bool,
}

enum DrainEnd {
    Done,
    Offline,
    Cancelled,
}

enum Pushed {
    Next,
    Offline,
}

/// Keys the current batch must not push again.
#[derive(Default)]
struct BatchKeys {
    failed: HashSet<RecordKey>,
    superseded: HashSet<RecordKey>,
}

/// Runs sync cycles against one remote backend.
pub struct Orchestrator {
    db: Database,
    store: LocalStore,
    queue: MutationQueue,
    remote: Arc<dyn RemoteBackend>,
    monitor: Arc<NetworkMonitor>,
    resolver: ConflictResolver,
    status: StatusHandle,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    phase: watch::Sender<SyncPhase>,
    flight: Mutex<Flight>,
    shutdown: watch::Receiver<bool>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phase", &*self.phase.borrow())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Components the orchestrator works with.
pub(crate) struct Parts {
    pub db: Database,
    pub store: LocalStore,
    pub queue: MutationQueue,
    pub remote: Arc<dyn RemoteBackend>,
    pub monitor: Arc<NetworkMonitor>,
    pub resolver: ConflictResolver,
    pub status: StatusHandle,
    pub clock: Arc<dyn Clock>,
    pub batch_size: usize,
    pub shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub(crate) fn new(parts: Parts) -> Self {
        let (phase, _rx) = watch::channel(SyncPhase::Idle);
        Self {
            db: parts.db,
            store: parts.store,
            queue: parts.queue,
            remote: parts.remote,
            monitor: parts.monitor,
            resolver: parts.resolver,
            status: parts.status,
            clock: parts.clock,
            batch_size: parts.batch_size.max(1),
            phase,
            flight: Mutex::new(Flight::default()),
            shutdown: parts.shutdown,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Request a cycle in the background. Safe to call from anywhere, any
    /// number of times.
    pub fn trigger(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("sync trigger ignored outside of a tokio runtime");
            return;
        };
        if self.claim() {
            let this = Arc::clone(self);
            runtime.spawn(async move {
                this.drive().await;
            });
        }
    }

    /// Reconnect trigger for the network monitor. A reconnect caused by the
    /// running cycle's own probe does not queue another cycle.
    pub(crate) fn reconnected(self: &Arc<Self>) {
        {
            let mut flight = self.flight();
            if flight.probing {
                flight.reconnected = true;
                return;
            }
        }
        self.trigger();
    }

    /// Run a cycle (plus any follow-ups requested meanwhile) on the caller's
    /// task and return their combined report. Returns `None` if a cycle was
    /// already running; it will run again once it finishes.
    pub async fn sync_now(&self) -> Option<CycleReport> {
        if self.claim() {
            Some(self.drive().await)
        } else {
            None
        }
    }

    /// Whether a cycle is running or about to.
    pub fn is_running(&self) -> bool {
        self.flight().running
    }

    fn flight(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> bool {
        let mut flight = self.flight();
        if flight.running {
            flight.rerun = true;
            tracing::debug!("sync already running, scheduling one more cycle");
            return false;
        }
        flight.running = true;
        self.status.update(|s| s.sync_in_progress = true);
        true
    }

    async fn drive(&self) -> CycleReport {
        let mut total = self.cycle().await;
        loop {
            {
                let mut flight = self.flight();
                if !flight.rerun || self.cancelled() {
                    flight.running = false;
                    flight.rerun = false;
                    self.status.update(|s| s.sync_in_progress = false);
                    return total;
                }
                flight.rerun = false;
            }
            let next = self.cycle().await;
            total.absorb(next);
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_phase(&self, phase: SyncPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(?previous, ?phase, "sync phase");
        }
    }

    async fn cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        report.outcome = match self.run_phases(&mut report).await {
            Ok(outcome) => outcome,
            Err(err) => CycleOutcome::Failed(err.to_string()),
        };

        self.set_phase(SyncPhase::Idle);
        if let Err(err) = refresh_counts(&self.db, &self.status) {
            tracing::warn!(error = %err, "could not refresh queue counters");
        }
        report.log(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        report
    }

    async fn run_phases(&self, report: &mut CycleReport) -> Result<CycleOutcome> {
        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        if self.monitor.is_online() != Some(true) && !self.probe().await {
            return Ok(CycleOutcome::Offline);
        }

        self.set_phase(SyncPhase::Draining);
        match self.drain(report).await? {
            DrainEnd::Done => {}
            DrainEnd::Offline => return Ok(CycleOutcome::Offline),
            DrainEnd::Cancelled => return Ok(CycleOutcome::Cancelled),
        }
        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        self.set_phase(SyncPhase::Pulling);
        let since = self.store.sync_cursor()?;
        let changes = match self.remote.pull(since).await {
            Ok(changes) => changes,
            Err(err) if err.is_transient() => {
                tracing::warn!(error = %err, "pull failed");
                self.monitor.record_probe(false);
                return Ok(CycleOutcome::Offline);
            }
            Err(err) => return Err(err.into()),
        };
        self.monitor.record_probe(true);
        report.pulled = changes.records.len();
        if self.cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        self.set_phase(SyncPhase::Reconciling);
        for record in changes.records {
            if self.cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
            self.reconcile(record, report)?;
        }

        self.store.set_sync_cursor(changes.server_time)?;
        self.status
            .update(|s| s.last_sync_time = Some(changes.server_time));
        Ok(CycleOutcome::Completed)
    }

    /// Pre-drain probe. The reconnect it may cause is this cycle's own.
    async fn probe(&self) -> bool {
        self.flight().probing = true;
        let reachable = self.monitor.probe_now().await;

        let mut flight = self.flight();
        flight.probing = false;
        if std::mem::take(&mut flight.reconnected) && !reachable {
            // another probe succeeded while ours failed
            flight.rerun = true;
        }
        reachable
    }

    async fn drain(&self, report: &mut CycleReport) -> Result<DrainEnd> {
        // entries pushed once wait for the next cycle
        let mut attempted: HashSet<Sequence> = HashSet::new();

        loop {
            if self.cancelled() {
                return Ok(DrainEnd::Cancelled);
            }
            let batch = self.queue.peek_batch_excluding(self.batch_size, &attempted)?;
            if batch.is_empty() {
                return Ok(DrainEnd::Done);
            }

            let mut keys = BatchKeys::default();
            let mut entries = batch.into_iter();

            while let Some(entry) = entries.next() {
                let key = entry.key();
                if keys.superseded.contains(&key) {
                    continue;
                }
                if self.cancelled() {
                    self.release_all(std::iter::once(entry).chain(entries));
                    return Ok(DrainEnd::Cancelled);
                }
                if keys.failed.contains(&key) {
                    self.release_all([entry]);
                    report.deferred += 1;
                    continue;
                }

                attempted.insert(entry.sequence);
                match self.push(&entry, report, &mut keys).await {
                    Ok(Pushed::Next) => {}
                    Ok(Pushed::Offline) => {
                        self.release_all(entries);
                        return Ok(DrainEnd::Offline);
                    }
                    Err(err) => {
                        // settled entries are gone; releasing them is a no-op
                        self.release_all(std::iter::once(entry).chain(entries));
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Apply one borrowed entry remotely and settle it locally.
    async fn push(
        &self,
        entry: &QueueEntry,
        report: &mut CycleReport,
        keys: &mut BatchKeys,
    ) -> Result<Pushed> {
        let key = entry.key();
        match self.remote.apply(entry).await {
            Ok(stored) => {
                self.acknowledge(entry, Some(stored))?;
                report.applied += 1;
            }
            Err(RemoteError::NotFound) if entry.operation == Operation::Delete => {
                self.acknowledge(entry, None)?;
                report.applied += 1;
            }
            Err(RemoteError::Conflict { current }) => {
                report.conflicts += 1;
                let settled = self.settle_conflict(entry, *current)?;
                if settled.flagged {
                    report.flagged += 1;
                }
                if settled.superseded {
                    keys.superseded.insert(key);
                }
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(sequence = entry.sequence, key = %key, error = %err, "mutation deferred");
                self.queue
                    .requeue(entry.sequence, &err.to_string(), FailureKind::Transient)?;
                report.failed += 1;
                self.monitor.record_probe(false);
                if self.monitor.is_online() == Some(false) {
                    return Ok(Pushed::Offline);
                }
                keys.failed.insert(key);
            }
            Err(err) => {
                tracing::warn!(sequence = entry.sequence, key = %key, error = %err, "mutation rejected");
                self.queue
                    .requeue(entry.sequence, &err.to_string(), FailureKind::Rejected)?;
                report.failed += 1;
                keys.failed.insert(key);
            }
        }
        refresh_counts(&self.db, &self.status)?;
        Ok(Pushed::Next)
    }

    /// Hand borrowed entries back. Failures are logged; reopening the queue
    /// recovers anything left borrowed.
    fn release_all(&self, entries: impl IntoIterator<Item = QueueEntry>) {
        for entry in entries {
            if let Err(err) = self.queue.release(entry.sequence) {
                tracing::warn!(sequence = entry.sequence, error = %err, "could not release queue entry");
            }
        }
    }

    /// Remove an acknowledged entry and store what the remote kept, unless a
    /// newer local mutation for the record is already queued.
    fn acknowledge(&self, entry: &QueueEntry, stored: Option<Record>) -> Result<()> {
        self.db.write(|tx| {
            queue::ack_in(tx, entry.sequence)?;
            if queue::has_newer_in(tx, &entry.table, &entry.record_id, entry.sequence)? {
                return Ok(());
            }
            if entry.operation == Operation::Delete {
                store::erase(tx, &entry.table, &entry.record_id)?;
            } else if let Some(record) = stored {
                store::save(tx, &record)?;
            }
            Ok(())
        })?;
        tracing::debug!(sequence = entry.sequence, key = %entry.key(), "mutation acknowledged");
        Ok(())
    }

    /// The remote refused a write because it holds a newer version.
    fn settle_conflict(&self, entry: &QueueEntry, current: Record) -> Result<Settled> {
        let now = self.clock.now();
        let resolver = self.resolver;

        let (outcome, settled) = self.db.write(|tx| {
            queue::ack_in(tx, entry.sequence)?;
            let local = store::load(tx, &entry.table, &entry.record_id)?
                .unwrap_or_else(|| entry.payload.clone());

            let outcome = resolver.resolve(&local, &current);
            let mut settled = Settled::default();
            let outcome = match outcome.resolution {
                Resolution::LocalWins => {
                    correct_remote(tx, now, &local)?;
                    outcome
                }
                Resolution::RemoteWins => {
                    let outcome = outcome.flag(ReviewReason::LocalIntentLost);
                    settled.superseded =
                        !queue::supersede_in(tx, &entry.table, &entry.record_id)?.is_empty();
                    keep_remote(tx, &current)?;
                    reconcile::record_in(tx, now, &outcome)?;
                    outcome
                }
                Resolution::Identical => outcome,
            };
            settled.flagged = outcome.needs_review();
            Ok((outcome, settled))
        })?;

        outcome.log();
        Ok(settled)
    }

    /// Fold one pulled record into the local store.
    fn reconcile(&self, remote: Record, report: &mut CycleReport) -> Result<()> {
        let now = self.clock.now();
        let resolver = self.resolver;

        let outcome = self.db.write(|tx| {
            let Some(local) = store::load(tx, &remote.table, &remote.id)? else {
                if remote.is_active() {
                    store::save(tx, &remote)?;
                }
                return Ok(None);
            };
            if local.same_version(&remote) {
                return Ok(None);
            }
            if !queue::has_outstanding_in(tx, &remote.table, &remote.id)? {
                keep_remote(tx, &remote)?;
                return Ok(None);
            }

            let outcome = resolver.resolve(&local, &remote);
            let outcome = match outcome.resolution {
                Resolution::LocalWins => {
                    correct_remote(tx, now, &local)?;
                    outcome
                }
                Resolution::RemoteWins => {
                    let outcome = outcome.flag(ReviewReason::LocalIntentLost);
                    queue::supersede_in(tx, &remote.table, &remote.id)?;
                    keep_remote(tx, &remote)?;
                    reconcile::record_in(tx, now, &outcome)?;
                    outcome
                }
                Resolution::Identical => outcome,
            };
            Ok(Some(outcome))
        })?;

        if let Some(outcome) = outcome {
            report.conflicts += 1;
            if outcome.needs_review() {
                report.flagged += 1;
            }
            outcome.log();
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Settled {
    flagged: bool,
    superseded: bool,
}

/// Store the remote version; a remote tombstone erases the local copy.
fn keep_remote(tx: &rusqlite::Connection, remote: &Record) -> Result<()> {
    if remote.deleted {
        store::erase(tx, &remote.table, &remote.id)?;
    } else {
        store::save(tx, remote)?;
    }
    Ok(())
}

/// Queue the winning local version unless it is already on its way.
fn correct_remote(tx: &rusqlite::Connection, now: crate::Timestamp, local: &Record) -> Result<()> {
    let queued = queue::newest_in(tx, &local.table, &local.id)?
        .is_some_and(|entry| entry.payload.same_version(local));
    if !queued {
        let operation = if local.deleted {
            Operation::Delete
        } else {
            Operation::Update
        };
        queue::enqueue_in(tx, now, operation, local)?;
    }
    Ok(())
}

/// Push the queue and review counters into the status.
pub(crate) fn refresh_counts(db: &Database, status: &StatusHandle) -> Result<()> {
    let (queued, review, conflicts) = db.read(|conn| {
        let (queued, review) = queue::count_in(conn)?;
        Ok((queued, review, reconcile::unresolved_len_in(conn)?))
    })?;
    status.update(|s| {
        s.queue_length = queued;
        s.pending_review = review + conflicts;
    });
    Ok(())
}
