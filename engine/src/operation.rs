//! Operation types for queued mutations.
//!
//! Every accepted caller write becomes an [`Operation`] in the durable log.
//! The payload is captured at enqueue time, so what gets pushed is exactly
//! what was queued.

use crate::{CollectionName, Entity, Error, LocalId, RemoteId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Unique identifier for an operation. Used for idempotent dedup at the remote.
pub type OperationId = String;

/// The kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::CorruptRow(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// Whether an operation is still eligible for automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Waiting in the queue
    #[default]
    Pending,
    /// Terminal: retries exhausted or rejected as non-retryable
    Failed,
}

impl OperationState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Failed => "failed",
        }
    }
}

impl FromStr for OperationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "failed" => Ok(OperationState::Failed),
            other => Err(Error::CorruptRow(format!("unknown operation state '{other}'"))),
        }
    }
}

/// A queued mutation awaiting transmission to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation ID (UUID)
    pub operation_id: OperationId,
    /// Entity this operation targets
    pub entity_local_id: LocalId,
    /// Collection of the target entity
    pub collection: CollectionName,
    /// Remote identity of the target, once known
    pub remote_id: Option<RemoteId>,
    /// Mutation kind
    pub kind: OperationKind,
    /// Payload captured at enqueue time (absent for deletes)
    pub payload_snapshot: Option<serde_json::Value>,
    /// Remote version this mutation is based on
    pub base_version: Version,
    /// When the operation was enqueued
    pub created_at: Timestamp,
    /// Number of failed push attempts
    pub attempt_count: u32,
    /// When the last push attempt failed
    pub last_attempt_at: Option<Timestamp>,
    /// Error from the last failed attempt
    pub last_error: Option<String>,
    /// Pending or terminally failed
    #[serde(default)]
    pub state: OperationState,
    /// Position in the log, assigned by the store on enqueue
    #[serde(default)]
    pub sequence: u64,
}

impl Operation {
    fn new(
        kind: OperationKind,
        entity: &Entity,
        payload_snapshot: Option<serde_json::Value>,
        base_version: Version,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            entity_local_id: entity.local_id.clone(),
            collection: entity.collection.clone(),
            remote_id: entity.remote_id.clone(),
            kind,
            payload_snapshot,
            base_version,
            created_at: timestamp,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            state: OperationState::Pending,
            sequence: 0,
        }
    }

    /// A create for a freshly authored entity.
    pub fn create(entity: &Entity, timestamp: Timestamp) -> Self {
        Self::new(
            OperationKind::Create,
            entity,
            Some(entity.payload.clone()),
            0,
            timestamp,
        )
    }

    /// An update carrying the entity's current payload.
    pub fn update(entity: &Entity, base_version: Version, timestamp: Timestamp) -> Self {
        Self::new(
            OperationKind::Update,
            entity,
            Some(entity.payload.clone()),
            base_version,
            timestamp,
        )
    }

    /// A delete of the entity.
    pub fn delete(entity: &Entity, base_version: Version, timestamp: Timestamp) -> Self {
        Self::new(OperationKind::Delete, entity, None, base_version, timestamp)
    }

    /// Whether this operation sits in the terminal failed set.
    pub fn is_terminal(&self) -> bool {
        self.state == OperationState::Failed
    }

    /// Whether this operation may already have reached the remote.
    pub fn was_attempted(&self) -> bool {
        self.attempt_count > 0 || self.last_attempt_at.is_some()
    }
}

/// Changes the queue compaction wants applied to the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compaction {
    /// Operations whose payload snapshot absorbed later updates
    pub rewritten: Vec<Operation>,
    /// Operations to drop from the log
    pub removed: Vec<OperationId>,
    /// Entities whose entire queued history cancelled out (create then delete)
    pub cancelled_entities: Vec<LocalId>,
}

impl Compaction {
    /// True when nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.rewritten.is_empty() && self.removed.is_empty() && self.cancelled_entities.is_empty()
    }
}

/// Compute the compaction of a queue ordered by sequence.
///
/// Only a never-attempted create heading an entity's queue is touched:
/// - a later delete cancels the create and everything in between;
/// - updates directly behind it fold into it, keeping the latest payload.
///
/// Operations behind a terminally failed one are held and never rewritten.
pub fn compact(queue: &[Operation]) -> Compaction {
    let mut per_entity: HashMap<&str, Vec<&Operation>> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for op in queue {
        let entry = per_entity.entry(op.entity_local_id.as_str()).or_insert_with(|| {
            order.push(op.entity_local_id.as_str());
            Vec::new()
        });
        entry.push(op);
    }

    let mut compaction = Compaction::default();

    for local_id in order {
        let ops = &per_entity[local_id];
        let runnable: Vec<&Operation> = ops.iter().copied().take_while(|op| !op.is_terminal()).collect();

        let Some(head) = runnable.first() else {
            continue;
        };
        if head.kind != OperationKind::Create || head.was_attempted() {
            continue;
        }

        if let Some(delete_at) = runnable.iter().position(|op| op.kind == OperationKind::Delete) {
            compaction
                .removed
                .extend(runnable[..=delete_at].iter().map(|op| op.operation_id.clone()));
            if delete_at + 1 == ops.len() {
                compaction.cancelled_entities.push(local_id.to_string());
            }
            continue;
        }

        let folded: Vec<&Operation> = runnable[1..]
            .iter()
            .copied()
            .take_while(|op| op.kind == OperationKind::Update)
            .collect();
        if let Some(last) = folded.last() {
            let mut create = (*head).clone();
            create.payload_snapshot = last.payload_snapshot.clone();
            compaction.rewritten.push(create);
            compaction
                .removed
                .extend(folded.iter().map(|op| op.operation_id.clone()));
        }
    }

    compaction
}
