//! In-process remote authority.
//!
//! Applies the same rules as `tether-server`: operation-id dedup, optimistic
//! version checks, tombstones and a global change sequence. Tests drive it
//! offline, inject failures and simulate edits from other devices.

use super::{ChangeSet, Checkpoint, DeletionSet, NetworkError, PushResult, RemoteGateway};
use crate::{
    CollectionName, Entity, Operation, OperationId, OperationKind, RemoteId, Timestamp,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct RemoteRow {
    entity: Entity,
    deleted: bool,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum Injected {
    /// Refuse without applying
    Fail { retryable: bool },
    /// Apply, then report a retryable failure as if the response was lost
    LoseResponse,
}

#[derive(Debug, Default)]
struct State {
    offline: bool,
    seq: u64,
    rows: HashMap<RemoteId, RemoteRow>,
    applied: HashMap<OperationId, PushResult>,
    injected: Vec<Injected>,
    push_log: Vec<Operation>,
    latency: Option<Duration>,
}

/// A remote authority that lives in memory.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle connectivity. Offline calls fail with retryable errors.
    pub fn set_online(&self, online: bool) {
        self.state.lock().offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !self.state.lock().offline
    }

    /// Make the next `n` pushes fail without being applied.
    pub fn fail_next_pushes(&self, n: usize, retryable: bool) {
        let mut state = self.state.lock();
        state
            .injected
            .extend(std::iter::repeat(Injected::Fail { retryable }).take(n));
    }

    /// Apply the next `n` pushes but report them as failed.
    pub fn lose_next_responses(&self, n: usize) {
        let mut state = self.state.lock();
        state
            .injected
            .extend(std::iter::repeat(Injected::LoseResponse).take(n));
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Every operation that reached the authority, in arrival order.
    pub fn push_log(&self) -> Vec<Operation> {
        self.state.lock().push_log.clone()
    }

    /// Live entity by remote id.
    pub fn get(&self, remote_id: &str) -> Option<Entity> {
        let state = self.state.lock();
        state
            .rows
            .get(remote_id)
            .filter(|row| !row.deleted)
            .map(|row| row.entity.clone())
    }

    /// All live entities.
    pub fn entities(&self) -> Vec<Entity> {
        let state = self.state.lock();
        let mut rows: Vec<&RemoteRow> = state.rows.values().filter(|row| !row.deleted).collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.entity.clone()).collect()
    }

    /// Current head of the change stream.
    pub fn head(&self) -> Checkpoint {
        Checkpoint(self.state.lock().seq)
    }

    /// Create an entity as another device would.
    pub fn remote_create(
        &self,
        collection: impl Into<CollectionName>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Entity {
        let mut state = self.state.lock();
        let remote_id = uuid::Uuid::new_v4().to_string();
        let entity = Entity::remote(
            uuid::Uuid::new_v4().to_string(),
            remote_id.clone(),
            collection,
            1,
            payload,
            timestamp,
        );
        state.seq += 1;
        let seq = state.seq;
        state.rows.insert(
            remote_id,
            RemoteRow {
                entity: entity.clone(),
                deleted: false,
                seq,
            },
        );
        entity
    }

    /// Edit an entity as another device would. Bumps its version.
    pub fn remote_edit(
        &self,
        remote_id: &str,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Option<Entity> {
        let mut state = self.state.lock();
        let seq = state.seq + 1;
        let row = state.rows.get_mut(remote_id).filter(|row| !row.deleted)?;
        row.entity.payload = payload;
        row.entity.version += 1;
        row.entity.updated_at_local = timestamp;
        row.entity.updated_at_remote = Some(timestamp);
        row.seq = seq;
        let entity = row.entity.clone();
        state.seq = seq;
        Some(entity)
    }

    /// Delete an entity as another device would.
    pub fn remote_delete(&self, remote_id: &str) -> bool {
        let mut state = self.state.lock();
        let seq = state.seq + 1;
        match state.rows.get_mut(remote_id) {
            Some(row) if !row.deleted => {
                row.deleted = true;
                row.entity.version += 1;
                row.seq = seq;
                state.seq = seq;
                true
            }
            _ => false,
        }
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl State {
    fn apply(&mut self, op: &Operation) -> PushResult {
        match op.kind {
            OperationKind::Create => {
                let remote_id = uuid::Uuid::new_v4().to_string();
                let mut entity = Entity::remote(
                    op.entity_local_id.clone(),
                    remote_id.clone(),
                    op.collection.clone(),
                    1,
                    op.payload_snapshot.clone().unwrap_or_default(),
                    op.created_at,
                );
                entity.updated_at_local = op.created_at;
                self.seq += 1;
                self.rows.insert(
                    remote_id.clone(),
                    RemoteRow {
                        entity,
                        deleted: false,
                        seq: self.seq,
                    },
                );
                PushResult::accepted(Some(remote_id), 1)
            }
            OperationKind::Update | OperationKind::Delete => {
                let Some(remote_id) = op.remote_id.as_deref() else {
                    return PushResult::failed(false, "operation has no remote id");
                };
                let next_seq = self.seq + 1;
                let row = match self.rows.get_mut(remote_id) {
                    Some(row) if !row.deleted => row,
                    _ if op.kind == OperationKind::Delete => {
                        return PushResult::accepted(Some(remote_id.to_string()), op.base_version)
                    }
                    _ => return PushResult::gone(),
                };
                if row.entity.version != op.base_version {
                    return PushResult::conflict(row.entity.clone());
                }

                row.entity.version += 1;
                row.seq = next_seq;
                if op.kind == OperationKind::Delete {
                    row.deleted = true;
                } else {
                    row.entity.payload = op.payload_snapshot.clone().unwrap_or_default();
                    row.entity.updated_at_local = op.created_at;
                    row.entity.updated_at_remote = Some(op.created_at);
                }
                let new_version = row.entity.version;
                self.seq = next_seq;
                PushResult::accepted(Some(remote_id.to_string()), new_version)
            }
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn push(&self, operation: &Operation) -> PushResult {
        self.delay().await;
        let mut state = self.state.lock();
        if state.offline {
            return PushResult::failed(true, "authority unreachable");
        }
        state.push_log.push(operation.clone());

        let injected = if state.injected.is_empty() {
            None
        } else {
            Some(state.injected.remove(0))
        };
        if let Some(Injected::Fail { retryable }) = injected {
            return PushResult::failed(retryable, "injected failure");
        }

        let result = match state.applied.get(&operation.operation_id) {
            Some(previous) => previous.clone(),
            None => {
                let result = state.apply(operation);
                if matches!(result, PushResult::Accepted { .. }) {
                    state
                        .applied
                        .insert(operation.operation_id.clone(), result.clone());
                }
                result
            }
        };

        match injected {
            Some(Injected::LoseResponse) => PushResult::failed(true, "response lost"),
            _ => result,
        }
    }

    async fn pull_changes(&self, since: Checkpoint) -> Result<ChangeSet, NetworkError> {
        self.delay().await;
        let state = self.state.lock();
        if state.offline {
            return Err(NetworkError::retryable("authority unreachable"));
        }
        let mut rows: Vec<&RemoteRow> = state
            .rows
            .values()
            .filter(|row| !row.deleted && row.seq > since.0)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(ChangeSet {
            entities: rows.into_iter().map(|row| row.entity.clone()).collect(),
            next_checkpoint: Checkpoint(state.seq),
        })
    }

    async fn pull_deletions(&self, since: Checkpoint) -> Result<DeletionSet, NetworkError> {
        self.delay().await;
        let state = self.state.lock();
        if state.offline {
            return Err(NetworkError::retryable("authority unreachable"));
        }
        let mut rows: Vec<&RemoteRow> = state
            .rows
            .values()
            .filter(|row| row.deleted && row.seq > since.0)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(DeletionSet {
            remote_ids: rows
                .into_iter()
                .filter_map(|row| row.entity.remote_id.clone())
                .collect(),
            next_checkpoint: Checkpoint(state.seq),
        })
    }
}
