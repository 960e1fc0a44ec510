//! The engine facade used by the application.
//!
//! [`SyncEngine`] owns every component and exposes the three surfaces the
//! UI needs: the mutation path, the trigger interface and the status
//! interface. Mutations are local-only: each one writes the record and its
//! queue entry in a single transaction and returns without touching the
//! network.

use crate::{
    clock::{write_stamp, Clock, SystemClock},
    config::SyncConfig,
    db::Database,
    error::Result,
    network::NetworkMonitor,
    orchestrator::{self, CycleReport, Orchestrator, Parts, SyncPhase},
    queue::{self, MutationQueue, QueueEntry},
    reconcile::{self, ConflictLog, ConflictResolver, FlaggedConflict},
    remote::{Disconnected, HttpRemote, RemoteBackend},
    status::{StatusHandle, SyncStatus},
    store::{self, LocalStore},
    Error, Fields, Operation, Record, Schema, Sequence,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Host hook for background wake-ups (OS background task, timer, push).
///
/// The host calls [`Scheduler::on_wake`] whenever it grants the app time to
/// run; the engine answers with a sync cycle.
pub trait Scheduler: Send + Sync {
    fn on_wake(&self);
}

/// What to keep when closing a flagged conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Keep the version that was applied
    KeepResult,
    /// Re-apply the losing local version as a new edit
    KeepLocal,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    remote: Option<Arc<dyn RemoteBackend>>,
    schema: Schema,
    clock: Arc<dyn Clock>,
    database: Option<Database>,
}

impl SyncEngineBuilder {
    /// Use a specific backend instead of the HTTP client from the config.
    pub fn remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an already opened database instead of `config.db_path`.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let db = match self.database {
            Some(db) => db,
            None => Database::open(&self.config.db_path)?,
        };

        let (remote, remote_ready): (Arc<dyn RemoteBackend>, bool) = match self.remote {
            Some(remote) => (remote, true),
            None => match &self.config.remote_url {
                Some(url) => (
                    Arc::new(HttpRemote::new(
                        url.clone(),
                        self.config.auth_token.clone(),
                        self.config.probe_timeout,
                    )?),
                    true,
                ),
                None => {
                    tracing::warn!("no remote backend configured, running local-only");
                    (Arc::new(Disconnected), false)
                }
            },
        };

        let schema = Arc::new(self.schema);
        let status = StatusHandle::new();
        let store = LocalStore::new(db.clone(), self.clock.clone());
        let queue = MutationQueue::open(
            db.clone(),
            self.clock.clone(),
            self.config.retry,
            schema.clone(),
        )?;
        let conflicts = ConflictLog::new(db.clone(), self.clock.clone());
        let monitor = Arc::new(NetworkMonitor::new(
            remote.clone(),
            status.clone(),
            self.config.offline_after,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let orchestrator = Arc::new(Orchestrator::new(Parts {
            db: db.clone(),
            store: store.clone(),
            queue: queue.clone(),
            remote,
            monitor: monitor.clone(),
            resolver: ConflictResolver::default(),
            status: status.clone(),
            clock: self.clock.clone(),
            batch_size: self.config.batch_size,
            shutdown: shutdown_rx,
        }));

        // every reconnect drains the queue
        let on_reconnect = Arc::downgrade(&orchestrator);
        monitor.on_transition(move || {
            if let Some(orchestrator) = on_reconnect.upgrade() {
                orchestrator.reconnected();
            }
        });

        orchestrator::refresh_counts(&db, &status)?;
        status.update(|s| s.remote_ready = remote_ready);

        Ok(SyncEngine {
            db,
            store,
            queue,
            conflicts,
            schema,
            clock: self.clock,
            status,
            monitor,
            orchestrator,
            config: self.config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Offline-first sync engine.
pub struct SyncEngine {
    db: Database,
    store: LocalStore,
    queue: MutationQueue,
    conflicts: ConflictLog,
    schema: Arc<Schema>,
    clock: Arc<dyn Clock>,
    status: StatusHandle,
    monitor: Arc<NetworkMonitor>,
    orchestrator: Arc<Orchestrator>,
    config: SyncConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status.get())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            remote: None,
            schema: Schema::default(),
            clock: Arc::new(SystemClock),
            database: None,
        }
    }

    /// Open the engine described by `config` with the HTTP backend.
    pub fn open(config: SyncConfig, schema: Schema) -> Result<Self> {
        Self::builder(config).schema(schema).build()
    }

    /// Start the background probe loop and the periodic sync timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        let monitor = self.monitor.clone();
        let interval = self.config.probe_interval;
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            monitor.run(interval, shutdown).await;
        }));

        let orchestrator = self.orchestrator.clone();
        let period = self.config.sync_interval;
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(periodic_sync(orchestrator, period, shutdown)));

        tracing::info!(
            sync_interval_secs = period.as_secs(),
            probe_interval_secs = interval.as_secs(),
            "sync engine started"
        );
    }

    /// Stop background work. A running cycle stops at its next checkpoint;
    /// borrowed queue entries are returned.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
        self.wait_idle().await;
        tracing::info!("sync engine stopped");
    }

    // Mutation path

    /// Create a record locally and queue it for the remote.
    pub fn create(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let now = self.clock.now();
        let schema = &self.schema;
        let record = self.db.write(|tx| {
            let existing = store::load(tx, table, id)?;
            if existing.as_ref().is_some_and(Record::is_active) {
                return Err(Error::RecordAlreadyExists {
                    table: table.to_string(),
                    id: id.to_string(),
                });
            }
            let stamp = write_stamp(now, existing.map(|r| r.updated_at));
            let record = Record::new(table, id, fields, stamp);
            schema.validate_record(&record)?;
            store::save(tx, &record)?;
            queue::enqueue_in(tx, now, Operation::Create, &record)?;
            Ok(record)
        })?;
        self.after_mutation(Operation::Create, &record);
        Ok(record)
    }

    /// Replace the fields of a live record.
    pub fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let now = self.clock.now();
        let schema = &self.schema;
        let record = self.db.write(|tx| {
            let mut record = store::require_live(tx, table, id)?;
            let stamp = write_stamp(now, Some(record.updated_at));
            record.update_fields(fields, stamp);
            schema.validate_record(&record)?;
            store::save(tx, &record)?;
            queue::enqueue_in(tx, now, Operation::Update, &record)?;
            Ok(record)
        })?;
        self.after_mutation(Operation::Update, &record);
        Ok(record)
    }

    /// Delete a live record. Returns the tombstone.
    pub fn delete(&self, table: &str, id: &str) -> Result<Record> {
        let now = self.clock.now();
        let schema = &self.schema;
        let tombstone = self.db.write(|tx| {
            let mut record = store::require_live(tx, table, id)?;
            record.mark_deleted(write_stamp(now, Some(record.updated_at)));
            schema.validate_record(&record)?;
            store::save(tx, &record)?;
            queue::enqueue_in(tx, now, Operation::Delete, &record)?;
            Ok(record)
        })?;
        self.after_mutation(Operation::Delete, &tombstone);
        Ok(tombstone)
    }

    pub fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        self.store.get(table, id)
    }

    /// Live records of a table in insertion order.
    pub fn list(&self, table: &str) -> Result<Vec<Record>> {
        self.store.get_table(table)
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    fn after_mutation(&self, operation: Operation, record: &Record) {
        tracing::debug!(%operation, key = %record.key(), updated_at = record.updated_at, "local mutation");
        self.refresh_counts();
    }

    fn refresh_counts(&self) {
        if let Err(err) = orchestrator::refresh_counts(&self.db, &self.status) {
            tracing::warn!(error = %err, "could not refresh queue counters");
        }
    }

    // Trigger interface

    /// Request a sync cycle. Never blocks; concurrent requests collapse.
    pub fn trigger_sync(&self) {
        self.orchestrator.trigger();
    }

    /// Run a cycle on the caller's task. `None` if one was already running.
    pub async fn sync_now(&self) -> Option<CycleReport> {
        self.orchestrator.sync_now().await
    }

    /// Platform connectivity event.
    pub fn on_connectivity_change(&self, is_online: bool) {
        self.monitor.on_platform_change(is_online);
    }

    /// Probe the remote right away.
    pub async fn probe_now(&self) -> bool {
        self.monitor.probe_now().await
    }

    /// Resolve once no cycle is running or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.status.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|s| !s.sync_in_progress).await;
    }

    pub fn phase(&self) -> SyncPhase {
        self.orchestrator.phase()
    }

    // Status interface

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_fn<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&SyncStatus) + Send + 'static,
    {
        self.status.subscribe_fn(callback)
    }

    /// Whether the remote is reachable (`None` while unknown).
    pub fn is_online(&self) -> Option<bool> {
        self.monitor.is_online()
    }

    // Manual review

    /// Mutations the remote kept rejecting.
    pub fn needs_review(&self) -> Result<Vec<QueueEntry>> {
        self.queue.needs_review()
    }

    pub fn retry_review(&self, sequence: Sequence) -> Result<QueueEntry> {
        let entry = self.queue.retry_review(sequence)?;
        self.refresh_counts();
        Ok(entry)
    }

    pub fn discard_review(&self, sequence: Sequence) -> Result<QueueEntry> {
        let entry = self.queue.discard_review(sequence)?;
        self.refresh_counts();
        Ok(entry)
    }

    /// Flagged conflicts not yet resolved.
    pub fn conflicts(&self) -> Result<Vec<FlaggedConflict>> {
        self.conflicts.unresolved()
    }

    /// Close a flagged conflict, optionally restoring the local version.
    pub fn resolve_conflict(&self, id: i64, choice: ConflictChoice) -> Result<FlaggedConflict> {
        let conflict = match choice {
            ConflictChoice::KeepResult => self.conflicts.mark_resolved(id)?,
            ConflictChoice::KeepLocal => {
                let now = self.clock.now();
                let schema = &self.schema;
                self.db.write(|tx| {
                    let conflict = reconcile::mark_resolved_in(tx, id)?;
                    restore_local(tx, now, schema, &conflict.local)?;
                    Ok(conflict)
                })?
            }
        };
        self.refresh_counts();
        Ok(conflict)
    }
}

impl Scheduler for SyncEngine {
    fn on_wake(&self) {
        tracing::debug!("host wake-up");
        self.trigger_sync();
    }
}

/// Write `local` again as a fresh edit on top of whatever is stored now.
fn restore_local(
    tx: &rusqlite::Connection,
    now: crate::Timestamp,
    schema: &Schema,
    local: &Record,
) -> Result<()> {
    let current = store::load(tx, &local.table, &local.id)?;
    let live = current.as_ref().is_some_and(Record::is_active);
    let stamp = write_stamp(now, current.map(|r| r.updated_at));

    let mut record = local.clone();
    record.updated_at = stamp;
    let operation = match (record.deleted, live) {
        (true, true) => Operation::Delete,
        // nothing live to delete
        (true, false) => return Ok(()),
        (false, true) => Operation::Update,
        (false, false) => Operation::Create,
    };

    schema.validate_record(&record)?;
    store::save(tx, &record)?;
    queue::enqueue_in(tx, now, operation, &record)?;
    Ok(())
}

async fn periodic_sync(
    orchestrator: Arc<Orchestrator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => orchestrator.trigger(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("periodic sync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, FieldType, TableSchema};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn engine_with(schema: Schema) -> (SyncEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = SyncEngine::builder(SyncConfig::default())
            .database(Database::open_in_memory().unwrap())
            .schema(schema)
            .clock(clock.clone())
            .build()
            .unwrap();
        (engine, clock)
    }

    fn engine() -> (SyncEngine, Arc<ManualClock>) {
        engine_with(Schema::default())
    }

    #[test]
    fn create_writes_record_and_queue_entry() {
        let (engine, _) = engine();
        let record = engine
            .create("tools", "42", fields(json!({"status": "available"})))
            .unwrap();

        assert_eq!(engine.get("tools", "42").unwrap(), Some(record));
        assert_eq!(engine.status().queue_length, 1);
        assert_eq!(engine.queue().entries().unwrap()[0].operation, Operation::Create);
    }

    #[test]
    fn duplicate_create_is_refused() {
        let (engine, _) = engine();
        engine.create("tools", "42", Fields::new()).unwrap();
        assert!(matches!(
            engine.create("tools", "42", Fields::new()),
            Err(Error::RecordAlreadyExists { .. })
        ));
        assert_eq!(engine.status().queue_length, 1);
    }

    #[test]
    fn update_of_missing_record_is_refused() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.update("tools", "nope", Fields::new()),
            Err(Error::RecordNotFound { .. })
        ));
        assert_eq!(engine.status().queue_length, 0);
    }

    #[test]
    fn edits_coalesce_and_stamps_increase() {
        let (engine, _) = engine();
        let created = engine
            .create("tools", "42", fields(json!({"status": "available"})))
            .unwrap();
        // same millisecond
        let updated = engine
            .update("tools", "42", fields(json!({"status": "checked_out"})))
            .unwrap();

        assert!(updated.updated_at > created.updated_at);
        let entries = engine.queue().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Create);
        assert_eq!(entries[0].payload, updated);
    }

    #[test]
    fn delete_leaves_tombstone_and_delete_entry() {
        let (engine, clock) = engine();
        engine.create("kits", "k1", Fields::new()).unwrap();
        clock.advance(10);
        let tombstone = engine.delete("kits", "k1").unwrap();

        assert!(tombstone.deleted);
        assert_eq!(engine.get("kits", "k1").unwrap(), None);
        let entries = engine.queue().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Delete);
    }

    #[test]
    fn invalid_payload_leaves_no_trace() {
        let schema =
            Schema::strict().table("tools", TableSchema::new().require("status", FieldType::Text));
        let (engine, _) = engine_with(schema);

        assert!(engine.create("tools", "1", fields(json!({"status": 3}))).is_err());
        assert!(engine.create("chemicals", "1", Fields::new()).is_err());
        assert_eq!(engine.get("tools", "1").unwrap(), None);
        assert!(engine.queue().entries().unwrap().is_empty());
    }

    #[test]
    fn starts_with_unknown_status() {
        let (engine, _) = engine();
        let status = engine.status();
        assert_eq!(status.is_online, None);
        assert_eq!(status.last_sync_time, None);
        assert!(!status.sync_in_progress);
        // no remote url in the default config
        assert!(!status.remote_ready);
    }

    #[tokio::test]
    async fn unconfigured_remote_keeps_mutations_queued() {
        let (engine, _) = engine();
        engine.create("tools", "1", Fields::new()).unwrap();

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.outcome, crate::CycleOutcome::Offline);
        assert_eq!(engine.status().queue_length, 1);
        assert_eq!(engine.is_online(), Some(false));
    }

    /// Accepts every write, but drops the local records table first.
    struct DropsRecordsTable {
        db: Database,
    }

    #[async_trait::async_trait]
    impl RemoteBackend for DropsRecordsTable {
        async fn apply(
            &self,
            entry: &QueueEntry,
        ) -> std::result::Result<Record, crate::RemoteError> {
            self.db
                .write(|tx| Ok(tx.execute_batch("DROP TABLE IF EXISTS records")?))
                .unwrap();
            Ok(entry.payload.clone())
        }

        async fn pull(
            &self,
            _since: Option<crate::Timestamp>,
        ) -> std::result::Result<crate::PullResponse, crate::RemoteError> {
            Ok(crate::PullResponse {
                records: Vec::new(),
                server_time: 1_000,
            })
        }

        async fn probe(&self) -> std::result::Result<(), crate::RemoteError> {
            Ok(())
        }
    }

    fn engine_over_broken_store() -> SyncEngine {
        let db = Database::open_in_memory().unwrap();
        SyncEngine::builder(SyncConfig::default())
            .remote(Arc::new(DropsRecordsTable { db: db.clone() }))
            .database(db)
            .clock(Arc::new(ManualClock::new(1_000)))
            .build()
            .unwrap()
    }

    #[test]
    fn injected_remote_is_ready_before_start() {
        let engine = engine_over_broken_store();
        assert!(engine.status().remote_ready);
        assert_eq!(engine.status().is_online, None);
    }

    #[tokio::test]
    async fn storage_failure_mid_drain_returns_borrowed_entries() {
        let engine = engine_over_broken_store();
        engine.create("tools", "a", Fields::new()).unwrap();
        engine.create("tools", "b", Fields::new()).unwrap();

        let report = engine.sync_now().await.unwrap();
        assert!(matches!(report.outcome, crate::CycleOutcome::Failed(_)));
        assert_eq!(report.applied, 0);

        // both entries are drainable again, nothing is left borrowed
        let entries = engine.queue().entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.state == crate::EntryState::Pending && e.attempts == 0));
        assert_eq!(engine.queue().peek_batch(10).unwrap().len(), 2);
    }
}
