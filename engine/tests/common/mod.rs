//! In-memory remote backend with call instrumentation.

#![allow(dead_code)]

use async_trait::async_trait;
use custody_engine::{
    ConflictResolver, Database, FieldType, Fields, ManualClock, Operation, PullResponse,
    QueueEntry, Record, RecordKey, RemoteBackend, RemoteError, Resolution, Schema, SyncConfig,
    SyncEngine, TableSchema, Timestamp,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// One `apply` call as the backend saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operation: Operation,
    pub key: RecordKey,
    pub updated_at: Timestamp,
}

#[derive(Debug, Default)]
struct RemoteState {
    /// Stored record and the server tick it changed at
    records: HashMap<RecordKey, (Record, u64)>,
    server_time: u64,
    calls: Vec<Call>,
    rejected: HashSet<RecordKey>,
    flaky: HashSet<RecordKey>,
    probes: usize,
}

impl RemoteState {
    fn store(&mut self, record: Record) -> Record {
        self.server_time += 1;
        self.records
            .insert(record.key(), (record.clone(), self.server_time));
        record
    }
}

/// Backend that behaves like the reference server: last write wins by
/// `updated_at`, ties keep the stored version.
#[derive(Debug)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    gate: watch::Sender<bool>,
    pulls_started: watch::Sender<usize>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState::default()),
            online: AtomicBool::new(true),
            gate: watch::channel(false).0,
            pulls_started: watch::channel(0).0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("connection refused".to_string()))
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Write from another device.
    pub fn seed(&self, record: Record) {
        self.lock().store(record);
    }

    pub fn record(&self, table: &str, id: &str) -> Option<Record> {
        self.lock()
            .records
            .get(&RecordKey::new(table, id))
            .map(|(r, _)| r.clone())
    }

    pub fn reject(&self, table: &str, id: &str) {
        self.lock().rejected.insert(RecordKey::new(table, id));
    }

    pub fn accept(&self, table: &str, id: &str) {
        let key = RecordKey::new(table, id);
        let mut state = self.lock();
        state.rejected.remove(&key);
        state.flaky.remove(&key);
    }

    /// Drop the connection on every write to the record.
    pub fn reset_writes(&self, table: &str, id: &str) {
        self.lock().flaky.insert(RecordKey::new(table, id));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, table: &str, id: &str) -> Vec<Call> {
        let key = RecordKey::new(table, id);
        self.calls().into_iter().filter(|c| c.key == key).collect()
    }

    pub fn probes(&self) -> usize {
        self.lock().probes
    }

    pub fn pulls(&self) -> usize {
        *self.pulls_started.borrow()
    }

    /// Wait until more than `count` pulls have started.
    pub async fn wait_for_pulls(&self, count: usize) {
        let mut rx = self.pulls_started.subscribe();
        let _ = rx.wait_for(|n| *n > count).await;
    }

    /// Block every pull until released.
    pub fn hold_pulls(&self, held: bool) {
        self.gate.send_replace(held);
    }
}

#[async_trait]
impl RemoteBackend for MockRemote {
    async fn apply(&self, entry: &QueueEntry) -> Result<Record, RemoteError> {
        self.check_online()?;
        let mut state = self.lock();
        let key = entry.key();
        state.calls.push(Call {
            operation: entry.operation,
            key: key.clone(),
            updated_at: entry.payload.updated_at,
        });

        if state.flaky.contains(&key) {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        if state.rejected.contains(&key) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("{key} refused"),
            });
        }

        let incoming = entry.payload.clone();
        let current = state.records.get(&key).map(|(r, _)| r.clone());
        let current = match (entry.operation, current) {
            (Operation::Delete, None) | (Operation::Update, None) => {
                return Err(RemoteError::NotFound)
            }
            (Operation::Delete, Some(current)) if current.deleted => {
                return Err(RemoteError::NotFound)
            }
            (_, None) => return Ok(state.store(incoming)),
            (_, Some(current)) => current,
        };

        match ConflictResolver::default()
            .resolve(&incoming, &current)
            .resolution
        {
            Resolution::LocalWins => Ok(state.store(incoming)),
            Resolution::Identical => Ok(current),
            Resolution::RemoteWins => Err(RemoteError::Conflict {
                current: Box::new(current),
            }),
        }
    }

    async fn pull(&self, since: Option<Timestamp>) -> Result<PullResponse, RemoteError> {
        self.check_online()?;
        self.pulls_started.send_modify(|n| *n += 1);
        {
            let mut rx = self.gate.subscribe();
            let _ = rx.wait_for(|held| !*held).await;
        }
        self.check_online()?;

        let state = self.lock();
        let since = since.unwrap_or(0);
        let mut changed: Vec<_> = state
            .records
            .values()
            .filter(|(_, changed_at)| *changed_at > since)
            .cloned()
            .collect();
        changed.sort_by_key(|(_, changed_at)| *changed_at);

        Ok(PullResponse {
            records: changed.into_iter().map(|(r, _)| r).collect(),
            server_time: state.server_time,
        })
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.lock().probes += 1;
        self.check_online()
    }
}

pub fn schema() -> Schema {
    Schema::strict()
        .table(
            "tools",
            TableSchema::new()
                .require("status", FieldType::Text)
                .allow("holder", FieldType::Text),
        )
        .table("kits", TableSchema::new().allow("name", FieldType::Text))
}

pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

pub fn status(value: &str) -> Fields {
    fields(json!({ "status": value }))
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<MockRemote>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::build(config, Database::open_in_memory().unwrap(), MockRemote::new())
    }

    pub fn build(config: SyncConfig, db: Database, remote: Arc<MockRemote>) -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = SyncEngine::builder(config)
            .remote(remote.clone())
            .database(db)
            .schema(schema())
            .clock(clock.clone())
            .build()
            .unwrap();
        Self {
            engine,
            remote,
            clock,
        }
    }

    /// Go online and let the reconnect cycle finish.
    pub async fn settle_online(&self) {
        self.remote.set_online(true);
        assert!(self.engine.probe_now().await);
        self.engine.wait_idle().await;
    }

    /// Drop offline the way the platform reports it.
    pub fn go_offline(&self) {
        self.remote.set_online(false);
        self.engine.on_connectivity_change(false);
    }
}
