//! The public facade.
//!
//! Reads and writes go straight to the local store and never wait on the
//! network. Each write updates the entity and enqueues its operation in one
//! transaction. Syncing happens in the background worker owned by the
//! [`TriggerCoordinator`]; its progress is visible through
//! [`Repository::observe_sync_status`].

use crate::conflict::ConflictResolver;
use crate::gateway::RemoteGateway;
use crate::orchestrator::{SyncOrchestrator, SyncReport};
use crate::status::{EngineStatus, StatusHub, StatusStream};
use crate::store::{self, entities, operations, LocalStore};
use crate::trigger::{
    CoordinatorState, PeriodicTrigger, Trigger, TriggerCoordinator, TriggerHandle, TriggerSource,
};
use crate::{
    error::Result, CollectionName, ConflictRecord, EngineConfig, Entity, EntityFilter, Error,
    LocalId, Operation, OperationKind, Schema, SyncStatus, Timestamp,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::sync::Arc;

/// A caller write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    Create {
        collection: CollectionName,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        local_id: LocalId,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Delete { local_id: LocalId },
}

impl Mutation {
    pub fn create(collection: impl Into<CollectionName>, payload: serde_json::Value) -> Self {
        Mutation::Create {
            collection: collection.into(),
            payload,
        }
    }

    pub fn update(local_id: impl Into<LocalId>, payload: serde_json::Value) -> Self {
        Mutation::Update {
            local_id: local_id.into(),
            payload,
        }
    }

    pub fn delete(local_id: impl Into<LocalId>) -> Self {
        Mutation::Delete {
            local_id: local_id.into(),
        }
    }
}

/// How to settle a parked conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ConflictChoice {
    /// Push the local copy on top of the remote one. If the authority deleted
    /// the entity, it is created again.
    KeepLocal,
    /// Take the remote copy, or drop the entity if the authority deleted it.
    KeepRemote,
    /// Push this payload on top of the remote copy.
    Merge(serde_json::Value),
}

/// Builds a [`Repository`].
pub struct RepositoryBuilder {
    config: EngineConfig,
    gateway: Arc<dyn RemoteGateway>,
    schema: Schema,
    resolver: Option<Arc<dyn ConflictResolver>>,
    sources: Vec<Box<dyn TriggerSource>>,
}

impl RepositoryBuilder {
    pub fn new(config: EngineConfig, gateway: Arc<dyn RemoteGateway>) -> Self {
        Self {
            config,
            gateway,
            schema: Schema::permissive(),
            resolver: None,
            sources: Vec::new(),
        }
    }

    /// Validate payloads against `schema`.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Use a custom resolver instead of the configured merge strategy.
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Add a trigger source next to the periodic timer.
    pub fn trigger_source(mut self, source: impl TriggerSource) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Open the store and start the sync worker. Needs a Tokio runtime.
    pub async fn build(self) -> Result<Repository> {
        let config = self.config;
        let store = LocalStore::open(&config.database_url)
            .await?
            .with_max_attempts(config.max_attempts);
        let status = StatusHub::new();
        let resolver = self
            .resolver
            .unwrap_or_else(|| config.merge_strategy.resolver());
        tracing::info!(
            resolver = resolver.name(),
            sync_interval_secs = config.sync_interval.map(|i| i.as_secs()),
            max_attempts = config.max_attempts,
            "starting repository"
        );

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            self.gateway,
            resolver,
            status.clone(),
            &config,
        ));

        let mut sources = self.sources;
        if let Some(interval) = config.sync_interval {
            sources.push(Box::new(PeriodicTrigger::new(interval)));
        }
        let coordinator = TriggerCoordinator::start(orchestrator, config.backoff.clone(), sources);

        Ok(Repository {
            store,
            schema: self.schema,
            status,
            coordinator,
        })
    }
}

/// Local-first data access with background sync.
pub struct Repository {
    store: LocalStore,
    schema: Schema,
    status: StatusHub,
    coordinator: TriggerCoordinator,
}

impl Repository {
    pub fn builder(config: EngineConfig, gateway: Arc<dyn RemoteGateway>) -> RepositoryBuilder {
        RepositoryBuilder::new(config, gateway)
    }

    /// Open with defaults for everything but config and gateway.
    pub async fn open(config: EngineConfig, gateway: Arc<dyn RemoteGateway>) -> Result<Self> {
        RepositoryBuilder::new(config, gateway).build().await
    }

    /// The underlying store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    // Reads

    /// One visible entity.
    pub async fn read(&self, local_id: &str) -> Result<Option<Entity>> {
        Ok(self
            .store
            .get(local_id)
            .await?
            .filter(Entity::is_visible))
    }

    pub async fn read_all(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        self.store.get_all(filter).await
    }

    // Writes

    /// Apply a mutation locally and queue it for sync.
    pub async fn write(&self, mutation: Mutation) -> Result<Entity> {
        self.write_at(mutation, crate::now_millis()).await
    }

    /// [`Repository::write`] with an explicit local timestamp.
    pub async fn write_at(&self, mutation: Mutation, timestamp: Timestamp) -> Result<Entity> {
        let mut tx = self.store.begin().await?;

        let (entity, operation) = match mutation {
            Mutation::Create {
                collection,
                payload,
            } => {
                self.schema.validate(&collection, &payload)?;
                let entity = Entity::new_local(collection, payload, timestamp);
                let operation = Operation::create(&entity, timestamp);
                (entity, operation)
            }
            Mutation::Update { local_id, payload } => {
                let mut entity = writable(&mut tx, &local_id).await?;
                self.schema.validate(&entity.collection, &payload)?;
                let base = base_version(&mut tx, &entity).await?;
                entity.apply_local_update(payload, timestamp);
                let operation = Operation::update(&entity, base, timestamp);
                (entity, operation)
            }
            Mutation::Delete { local_id } => {
                let mut entity = writable(&mut tx, &local_id).await?;
                let base = base_version(&mut tx, &entity).await?;
                entity.mark_pending_delete(timestamp);
                let operation = Operation::delete(&entity, base, timestamp);
                (entity, operation)
            }
        };

        entities::upsert(&mut tx, &entity).await?;
        operations::insert(&mut tx, &operation).await?;
        tx.commit().await?;

        tracing::debug!(
            local_id = %entity.local_id,
            kind = operation.kind.as_str(),
            version = entity.version,
            "local write queued"
        );
        self.emit_pending().await?;
        Ok(entity)
    }

    // Sync control

    /// Ask the worker for a cycle. Returns immediately.
    pub fn request_sync_now(&self) -> Result<()> {
        self.coordinator.handle().fire(Trigger::Explicit)
    }

    /// Tell the worker the network is back.
    pub fn connectivity_restored(&self) -> Result<()> {
        self.coordinator.handle().fire(Trigger::ConnectivityRestored)
    }

    /// Run a cycle and wait for its report.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.coordinator.run_now().await
    }

    /// Handle for firing triggers from elsewhere in the host.
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.coordinator.handle()
    }

    pub fn sync_state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    /// Stop the running cycle after its current operation.
    pub fn cancel_sync(&self) {
        self.coordinator.cancel_cycle();
    }

    /// Rewind the checkpoint to zero and request a cycle, re-pulling
    /// everything the authority has.
    pub async fn full_resync(&self) -> Result<()> {
        self.store.reset_checkpoint().await?;
        tracing::info!("full resync requested");
        self.request_sync_now()
    }

    // Status

    pub fn observe_sync_status(&self) -> StatusStream {
        self.status.subscribe()
    }

    /// Last phase-level status.
    pub fn current_status(&self) -> EngineStatus {
        self.status.current()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.store.pending_count().await
    }

    // Failures

    pub async fn failed_operations(&self) -> Result<Vec<Operation>> {
        self.store.failed_operations().await
    }

    /// Re-queue an entity's terminally failed operations. Returns false if
    /// nothing was failed.
    pub async fn retry_failed(&self, local_id: &str) -> Result<bool> {
        let retried = self.store.retry_failed(local_id).await?;
        if retried {
            tracing::info!(local_id, "failed operations re-queued");
            self.emit_pending().await?;
            self.request_sync_now()?;
        }
        Ok(retried)
    }

    /// Drop an entity's stuck operations. A never-pushed entity is removed;
    /// a pushed one is restored from the authority by a full resync.
    pub async fn discard_failed(&self, local_id: &str) -> Result<Option<Entity>> {
        let entity = self.store.discard_failed(local_id).await?;
        tracing::info!(local_id, "failed operations discarded");
        if entity.is_some() {
            self.full_resync().await?;
        }
        self.emit_pending().await?;
        Ok(entity)
    }

    // Conflicts

    /// Conflicts waiting for a decision.
    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.store.conflicts().await
    }

    /// Settle a parked conflict. Returns the entity as stored afterwards, or
    /// `None` if it was removed.
    pub async fn resolve_conflict(
        &self,
        local_id: &str,
        choice: ConflictChoice,
    ) -> Result<Option<Entity>> {
        let now = crate::now_millis();
        let mut tx = self.store.begin().await?;

        let Some(record) = store::conflicts::get(&mut tx, local_id).await? else {
            return Err(Error::NoConflict(local_id.to_string()));
        };
        let Some(mut entity) = entities::get(&mut tx, local_id).await? else {
            store::conflicts::delete(&mut tx, local_id).await?;
            tx.commit().await?;
            return Err(Error::EntityNotFound(local_id.to_string()));
        };
        let queued = operations::for_entity(&mut tx, local_id).await?;
        let deleting = queued.iter().any(|op| op.kind == OperationKind::Delete);

        let resolved = match (choice, record.remote) {
            (ConflictChoice::KeepRemote, Some(remote)) => {
                entity.accept_remote(&remote);
                operations::delete_for_entity(&mut tx, local_id).await?;
                Some(entity)
            }
            // Both sides want it gone.
            (ConflictChoice::KeepRemote, None) | (ConflictChoice::KeepLocal, None) if deleting => {
                None
            }
            (ConflictChoice::KeepRemote, None) => None,
            (ConflictChoice::KeepLocal, Some(remote)) => {
                entity.remote_id = remote.remote_id.clone().or(entity.remote_id);
                entity.version = remote.version + 1;
                entity.updated_at_remote = remote.updated_at_remote;
                operations::rebase(&mut tx, local_id, entity.remote_id.as_deref(), remote.version)
                    .await?;
                operations::reset_failed(&mut tx, local_id).await?;
                match queued.first() {
                    Some(head) => entity.sync_status = store::status_for(head.kind),
                    None => {
                        entity.sync_status = SyncStatus::PendingUpdate;
                        operations::insert(&mut tx, &Operation::update(&entity, remote.version, now))
                            .await?;
                    }
                }
                Some(entity)
            }
            (ConflictChoice::KeepLocal, None) => {
                let payload = entity.payload.clone();
                Some(recreate(&mut tx, entity, payload, now).await?)
            }
            (ConflictChoice::Merge(payload), remote) => {
                self.schema.validate(&entity.collection, &payload)?;
                match remote {
                    Some(remote) => {
                        operations::delete_for_entity(&mut tx, local_id).await?;
                        entity.payload = payload;
                        entity.remote_id = remote.remote_id.clone().or(entity.remote_id);
                        entity.version = remote.version + 1;
                        entity.updated_at_local = now;
                        entity.updated_at_remote = remote.updated_at_remote;
                        entity.sync_status = SyncStatus::PendingUpdate;
                        operations::insert(&mut tx, &Operation::update(&entity, remote.version, now))
                            .await?;
                        Some(entity)
                    }
                    None => Some(recreate(&mut tx, entity, payload, now).await?),
                }
            }
        };

        match &resolved {
            Some(entity) => entities::upsert(&mut tx, entity).await?,
            None => {
                operations::delete_for_entity(&mut tx, local_id).await?;
                entities::delete(&mut tx, local_id).await?;
            }
        }
        store::conflicts::delete(&mut tx, local_id).await?;
        tx.commit().await?;

        tracing::info!(local_id, removed = resolved.is_none(), "conflict resolved externally");
        self.emit_pending().await?;
        Ok(resolved)
    }

    /// Stop the sync worker and close the store.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.store.close().await;
    }

    async fn emit_pending(&self) -> Result<()> {
        let count = self.store.pending_count().await?;
        self.status.emit(EngineStatus::PendingCount { count });
        Ok(())
    }
}

/// Load an entity that may take another local write.
async fn writable(conn: &mut SqliteConnection, local_id: &str) -> Result<Entity> {
    let entity = entities::get(conn, local_id)
        .await?
        .ok_or_else(|| Error::EntityNotFound(local_id.to_string()))?;
    match entity.sync_status {
        SyncStatus::Conflicted => Err(Error::UnresolvedConflict(entity.local_id)),
        SyncStatus::PendingDelete => Err(Error::EntityDeleted(entity.local_id)),
        _ => Ok(entity),
    }
}

/// Remote version the next operation builds on.
async fn base_version(conn: &mut SqliteConnection, entity: &Entity) -> Result<u64> {
    let queued = operations::for_entity(conn, &entity.local_id).await?;
    Ok(match queued.last() {
        Some(last) => last.base_version,
        None => entity.version,
    })
}

/// Queue a fresh create for an entity the authority no longer has.
async fn recreate(
    conn: &mut SqliteConnection,
    mut entity: Entity,
    payload: serde_json::Value,
    now: Timestamp,
) -> Result<Entity> {
    operations::delete_for_entity(conn, &entity.local_id).await?;
    entity.remote_id = None;
    entity.payload = payload;
    entity.version = 1;
    entity.updated_at_local = now;
    entity.updated_at_remote = None;
    entity.sync_status = SyncStatus::PendingCreate;
    operations::insert(conn, &Operation::create(&entity, now)).await?;
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::MemoryGateway;
    use crate::{CollectionSchema, FieldDef, FieldType, ResolutionKind, UserPrompt};
    use serde_json::json;

    async fn repo_with(gateway: Arc<MemoryGateway>, schema: Schema) -> Repository {
        Repository::builder(EngineConfig::default().with_sync_interval(None), gateway)
            .schema(schema)
            .build()
            .await
            .unwrap()
    }

    async fn repo() -> (Repository, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        (repo_with(gateway.clone(), Schema::permissive()).await, gateway)
    }

    #[tokio::test]
    async fn write_is_visible_immediately() {
        let (repo, _) = repo().await;

        let created = repo
            .write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();
        assert_eq!(created.sync_status, SyncStatus::PendingCreate);
        assert_eq!(created.version, 1);

        let updated = repo
            .write(Mutation::update(&created.local_id, json!({"title": "B"})))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.sync_status, SyncStatus::PendingCreate);

        let read = repo.read(&created.local_id).await.unwrap().unwrap();
        assert_eq!(read.payload, json!({"title": "B"}));
        assert_eq!(repo.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_writes_leave_nothing_behind() {
        let schema = Schema::new(1).with_collection(CollectionSchema::new(
            "todos",
            vec![FieldDef::required("title", FieldType::String)],
        ));
        let repo = repo_with(Arc::new(MemoryGateway::new()), schema).await;

        let err = repo
            .write(Mutation::create("todos", json!({"done": true})))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = repo
            .write(Mutation::create("notes", json!({"title": "A"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CollectionNotFound(_)));

        assert!(repo.read_all(&EntityFilter::all()).await.unwrap().is_empty());
        assert_eq!(repo.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleted_entities_reject_writes() {
        let (repo, _) = repo().await;
        let created = repo
            .write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();
        repo.write(Mutation::delete(&created.local_id)).await.unwrap();

        assert_eq!(repo.read(&created.local_id).await.unwrap(), None);
        let err = repo
            .write(Mutation::update(&created.local_id, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityDeleted(_)));

        let err = repo.write(Mutation::delete("missing")).await.unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn updates_build_on_the_synced_version() {
        let (repo, _) = repo().await;
        let created = repo
            .write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();
        repo.sync_now().await.unwrap();

        repo.write(Mutation::update(&created.local_id, json!({"title": "B"})))
            .await
            .unwrap();
        repo.write(Mutation::update(&created.local_id, json!({"title": "C"})))
            .await
            .unwrap();

        let ops = repo.store().operations_for(&created.local_id).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.base_version == 1));
        assert!(ops.iter().all(|op| op.remote_id.is_some()));
    }

    #[tokio::test]
    async fn parked_conflict_blocks_writes_until_resolved() {
        let gateway = Arc::new(MemoryGateway::new());
        let repo = Repository::builder(
            EngineConfig::default().with_sync_interval(None),
            gateway.clone(),
        )
        .resolver(Arc::new(UserPrompt))
        .build()
        .await
        .unwrap();

        let created = repo
            .write(Mutation::create("todos", json!({"title": "A", "tags": ["a"]})))
            .await
            .unwrap();
        repo.sync_now().await.unwrap();
        let remote_id = repo
            .read(&created.local_id)
            .await
            .unwrap()
            .unwrap()
            .remote_id
            .unwrap();

        repo.write(Mutation::update(&created.local_id, json!({"title": "local"})))
            .await
            .unwrap();
        gateway.remote_edit(&remote_id, json!({"title": "remote"}), 5000);
        repo.sync_now().await.unwrap();

        let conflicts = repo.conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].decision, ResolutionKind::RequiresUserInput);
        let err = repo
            .write(Mutation::update(&created.local_id, json!({"title": "again"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedConflict(_)));

        let merged = repo
            .resolve_conflict(
                &created.local_id,
                ConflictChoice::Merge(json!({"title": "merged"})),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.sync_status, SyncStatus::PendingUpdate);
        assert_eq!(merged.version, 3);
        assert!(repo.conflicts().await.unwrap().is_empty());

        let report = repo.sync_now().await.unwrap();
        assert_eq!(report.operations_pushed, 1);
        let synced = repo.read(&created.local_id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.version, 3);
        assert_eq!(gateway.get(&remote_id).unwrap().payload, json!({"title": "merged"}));
    }

    #[tokio::test]
    async fn resolving_without_conflict_is_an_error() {
        let (repo, _) = repo().await;
        let err = repo
            .resolve_conflict("nope", ConflictChoice::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoConflict(_)));
    }

    #[tokio::test]
    async fn keep_local_recreates_remotely_deleted_entity() {
        let gateway = Arc::new(MemoryGateway::new());
        let repo = repo_with(gateway.clone(), Schema::permissive()).await;
        let created = repo
            .write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();
        repo.sync_now().await.unwrap();
        let old_remote = repo
            .read(&created.local_id)
            .await
            .unwrap()
            .unwrap()
            .remote_id
            .unwrap();

        repo.write(Mutation::update(&created.local_id, json!({"title": "B"})))
            .await
            .unwrap();
        gateway.remote_delete(&old_remote);
        repo.sync_now().await.unwrap();

        let conflict = &repo.conflicts().await.unwrap()[0];
        assert!(conflict.remote_deleted());

        let kept = repo
            .resolve_conflict(&created.local_id, ConflictChoice::KeepLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.sync_status, SyncStatus::PendingCreate);
        assert_eq!(kept.remote_id, None);

        repo.sync_now().await.unwrap();
        let synced = repo.read(&created.local_id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_ne!(synced.remote_id.as_deref(), Some(old_remote.as_str()));
        assert_eq!(synced.payload, json!({"title": "B"}));
    }

    #[tokio::test]
    async fn discard_failed_restores_remote_copy() {
        let gateway = Arc::new(MemoryGateway::new());
        let repo = repo_with(gateway.clone(), Schema::permissive()).await;
        let created = repo
            .write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();
        repo.sync_now().await.unwrap();

        repo.write(Mutation::update(&created.local_id, json!({"title": "bad"})))
            .await
            .unwrap();
        gateway.fail_next_pushes(1, false);
        let report = repo.sync_now().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(repo.failed_operations().await.unwrap().len(), 1);
        let failed = repo.store().get(&created.local_id).await.unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);

        repo.discard_failed(&created.local_id).await.unwrap();
        repo.sync_now().await.unwrap();

        let restored = repo.read(&created.local_id).await.unwrap().unwrap();
        assert_eq!(restored.sync_status, SyncStatus::Synced);
        assert_eq!(restored.payload, json!({"title": "A"}));
        assert!(repo.failed_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_stream_reports_pending_count() {
        let (repo, _) = repo().await;
        let mut stream = repo.observe_sync_status();

        repo.write(Mutation::create("todos", json!({"title": "A"})))
            .await
            .unwrap();

        assert_eq!(
            stream.recv().await,
            Some(EngineStatus::PendingCount { count: 1 })
        );
    }

    #[test]
    fn mutation_wire_format() {
        let json = serde_json::to_value(Mutation::update("l-1", json!({"n": 1}))).unwrap();
        assert_eq!(
            json,
            json!({"type": "update", "localId": "l-1", "payload": {"n": 1}})
        );
    }
}
