//! # Custody Engine
//!
//! An offline-first sync engine for the custody inventory client.
//!
//! Field users check tools, chemicals and kits in and out where there is no
//! signal. Every change is written locally first and succeeds without the
//! network; the engine pushes it to the remote backend once the backend is
//! reachable and folds remote changes back into the local copy.
//!
//! ## Components
//!
//! - [`LocalStore`] - records on the device, one SQLite database
//! - [`MutationQueue`] - durable, ordered log of writes not yet acknowledged
//! - [`NetworkMonitor`] - platform events plus reachability probes
//! - [`ConflictResolver`] - last-write-wins by `updated_at`, ties to the remote
//! - [`Orchestrator`] - single-flight sync cycles: drain, pull, reconcile
//! - [`SyncEngine`] - the facade the application talks to
//!
//! ## Records
//!
//! A [`Record`] is identified by table and id and carries a field map, an
//! `updated_at` stamp in milliseconds and a tombstone flag. Local writes get
//! a stamp strictly greater than the one they replace, see
//! [`clock::write_stamp`].
//!
//! ## Guarantees
//!
//! - A mutation that returned `Ok` is durable: it is in the store and in the
//!   queue, and survives a crash or restart.
//! - Mutations for one record reach the remote in the order they were made.
//! - A failing record never holds up the others.
//! - The pull cursor only moves after a complete reconcile.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use custody_engine::{FieldType, Schema, SyncConfig, SyncEngine, TableSchema};
//! use serde_json::json;
//!
//! # async fn run() -> custody_engine::Result<()> {
//! let schema = Schema::strict().table(
//!     "tools",
//!     TableSchema::new()
//!         .require("name", FieldType::Text)
//!         .allow("holder", FieldType::Text),
//! );
//!
//! let config = SyncConfig {
//!     remote_url: Some("https://custody.example.com".to_string()),
//!     ..SyncConfig::default()
//! };
//! let engine = SyncEngine::open(config, schema)?;
//! engine.start();
//!
//! let fields = json!({"name": "torque wrench", "holder": "crew-7"});
//! engine.create("tools", "tw-1", fields.as_object().cloned().unwrap_or_default())?;
//!
//! // pushes in the background; or wait for it
//! engine.sync_now().await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod network;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod schema;
pub mod status;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use db::Database;
pub use engine::{ConflictChoice, Scheduler, SyncEngine, SyncEngineBuilder};
pub use error::{Error, RemoteError, Result, StorageError};
pub use network::NetworkMonitor;
pub use operation::Operation;
pub use orchestrator::{CycleOutcome, CycleReport, Orchestrator, SyncPhase};
pub use queue::{EntryState, MutationQueue, QueueEntry, RetryPolicy};
pub use reconcile::{
    ConflictLog, ConflictRecord, ConflictResolver, FlaggedConflict, MergeStrategy, Resolution,
    ReviewReason,
};
pub use record::{Fields, Record, RecordKey};
pub use remote::{Disconnected, HttpRemote, PullResponse, RemoteBackend};
pub use schema::{FieldDef, FieldType, Schema, TableSchema};
pub use status::{StatusHandle, SyncStatus};
pub use store::LocalStore;

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
/// Position in the mutation queue
pub type Sequence = i64;
