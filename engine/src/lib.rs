//! # Tether Engine
//!
//! An offline-first sync engine for local-first applications.
//!
//! Reads and writes complete against a local SQLite database without waiting
//! on the network. Every write is queued as an operation in the same
//! transaction, and a background worker reconciles the queue with a remote
//! authority whenever a trigger fires.
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] is a JSON payload in a named collection, identified by a
//! client-generated `local_id` and, once pushed, a `remote_id` assigned by the
//! authority. Its `version` is used for optimistic concurrency and its
//! [`SyncStatus`] says what the engine still owes the authority.
//!
//! ### Operations
//!
//! Each write appends an [`Operation`] (create, update or delete) carrying a
//! snapshot of the payload and the remote version it was based on. Operations
//! of one entity are pushed strictly in order. A create that is deleted before
//! it was ever pushed is cancelled locally.
//!
//! ### Sync cycles
//!
//! The [`SyncOrchestrator`] pulls remote tombstones and changes since the
//! [`Checkpoint`], applies them in one transaction, then drains the queue
//! through a [`RemoteGateway`]. Collisions go to a [`ConflictResolver`]
//! picked when the repository is built:
//! - [`LastWriteWins`] - later timestamp wins, ties go to the remote (default)
//! - [`RemoteWins`] / [`LocalWins`] - one side always wins
//! - [`FieldMerge`] - caller-supplied payload merge
//! - [`UserPrompt`] - park the entity as `Conflicted` until the host decides
//!
//! The [`TriggerCoordinator`] runs at most one cycle at a time and coalesces
//! triggers that arrive while a cycle is running.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use std::sync::Arc;
//! use tether_engine::{EngineConfig, MemoryGateway, Mutation, Repository, SyncStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tether_engine::error::Result<()> {
//! let gateway = Arc::new(MemoryGateway::new());
//! let config = EngineConfig::default().with_sync_interval(None);
//! let repo = Repository::open(config, gateway.clone()).await?;
//!
//! // Writes succeed offline.
//! gateway.set_online(false);
//! let todo = repo
//!     .write(Mutation::create("todos", json!({"title": "A"})))
//!     .await?;
//! assert_eq!(todo.sync_status, SyncStatus::PendingCreate);
//!
//! // Back online, one cycle pushes the create.
//! gateway.set_online(true);
//! repo.sync_now().await?;
//! let todo = repo.read(&todo.local_id).await?.unwrap();
//! assert_eq!(todo.sync_status, SyncStatus::Synced);
//! assert!(todo.remote_id.is_some());
//! # repo.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! [`MemoryGateway`] is an in-process authority for tests and demos. With the
//! `http` feature, `gateway::http::HttpGateway` talks to `tether-server`.

pub mod config;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod operation;
pub mod orchestrator;
pub mod repository;
pub mod schema;
pub mod status;
pub mod store;
pub mod trigger;

// Re-export main types at crate root
pub use config::{BackoffConfig, ConfigError, EngineConfig};
pub use conflict::{
    object_union, ConflictRecord, ConflictResolver, FieldMerge, LastWriteWins, LocalWins,
    MergeStrategy, RemoteWins, Resolution, ResolutionKind, UserPrompt,
};
pub use entity::{Entity, EntityFilter, SyncStatus};
pub use error::{Error, Result};
#[cfg(feature = "http")]
pub use gateway::http::HttpGateway;
pub use gateway::memory::MemoryGateway;
pub use gateway::{
    ChangeSet, Checkpoint, DeletionSet, NetworkError, PushRequest, PushResult, Rejection,
    RemoteGateway,
};
pub use operation::{Operation, OperationId, OperationKind, OperationState};
pub use orchestrator::{CyclePhase, SyncOrchestrator, SyncReport};
pub use repository::{ConflictChoice, Mutation, Repository, RepositoryBuilder};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use status::{EngineStatus, StatusHub, StatusStream};
pub use store::LocalStore;
pub use trigger::{
    Backoff, CoordinatorState, CoordinatorStatus, PeriodicTrigger, Trigger, TriggerCoordinator,
    TriggerHandle, TriggerSource,
};

/// Type aliases for clarity
pub type LocalId = String;
pub type RemoteId = String;
pub type CollectionName = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
