//! Remote gateway: the engine's view of the remote authority.
//!
//! The engine only fixes the contract. Hosts supply the transport; two
//! implementations ship with the crate:
//! - [`memory::MemoryGateway`] keeps the authority in process
//! - `http::HttpGateway` (feature `http`) talks to `tether-server`
//!
//! Every call must be safe to retry. Pushes are deduplicated by
//! `operation_id` at the authority.

pub mod memory;

#[cfg(feature = "http")]
pub mod http;

use crate::{Entity, Operation, RemoteId, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque monotonic cursor into the authority's change stream.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    /// The cursor before any change.
    pub const ZERO: Checkpoint = Checkpoint(0);

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the authority refused an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Rejection {
    /// The operation's base version is stale; carries the authority's copy
    VersionConflict { remote: Entity },
    /// The entity no longer exists at the authority
    Gone,
}

/// Outcome of pushing one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushResult {
    /// Applied. Creates report the assigned remote id.
    #[serde(rename_all = "camelCase")]
    Accepted {
        remote_id: Option<RemoteId>,
        new_version: Version,
    },
    /// Refused by the authority
    Rejected { rejection: Rejection },
    /// Not applied
    Failed { retryable: bool, message: String },
}

impl PushResult {
    pub fn accepted(remote_id: Option<RemoteId>, new_version: Version) -> Self {
        PushResult::Accepted {
            remote_id,
            new_version,
        }
    }

    pub fn conflict(remote: Entity) -> Self {
        PushResult::Rejected {
            rejection: Rejection::VersionConflict { remote },
        }
    }

    pub fn gone() -> Self {
        PushResult::Rejected {
            rejection: Rejection::Gone,
        }
    }

    pub fn failed(retryable: bool, message: impl Into<String>) -> Self {
        PushResult::Failed {
            retryable,
            message: message.into(),
        }
    }
}

impl From<NetworkError> for PushResult {
    fn from(err: NetworkError) -> Self {
        PushResult::Failed {
            retryable: err.retryable,
            message: err.message,
        }
    }
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub operation: Operation,
}

/// Entities changed at the authority since a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Live entities, each carrying its remote id and version
    pub entities: Vec<Entity>,
    /// Head of the change stream when the changes were read
    pub next_checkpoint: Checkpoint,
}

/// Tombstones recorded at the authority since a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSet {
    pub remote_ids: Vec<RemoteId>,
    /// Head of the change stream when the tombstones were read
    pub next_checkpoint: Checkpoint,
}

/// Transport-level failure talking to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network error: {message}")]
pub struct NetworkError {
    pub message: String,
    /// Whether trying again later may succeed
    pub retryable: bool,
}

impl NetworkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A call that exceeded its deadline. Always retryable.
    pub fn timeout(after: Duration) -> Self {
        Self::retryable(format!("timed out after {}ms", after.as_millis()))
    }
}

/// The remote authority, as seen by the sync orchestrator.
///
/// Implementations must be idempotent: the orchestrator retries a push
/// whose response was lost with the same `operation_id`.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Push one operation.
    async fn push(&self, operation: &Operation) -> PushResult;

    /// Fetch live entities changed after `since`.
    async fn pull_changes(&self, since: Checkpoint) -> Result<ChangeSet, NetworkError>;

    /// Fetch remote ids deleted after `since`.
    async fn pull_deletions(&self, since: Checkpoint) -> Result<DeletionSet, NetworkError>;
}

#[async_trait]
impl<G: RemoteGateway + ?Sized> RemoteGateway for std::sync::Arc<G> {
    async fn push(&self, operation: &Operation) -> PushResult {
        (**self).push(operation).await
    }

    async fn pull_changes(&self, since: Checkpoint) -> Result<ChangeSet, NetworkError> {
        (**self).pull_changes(since).await
    }

    async fn pull_deletions(&self, since: Checkpoint) -> Result<DeletionSet, NetworkError> {
        (**self).pull_deletions(since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_result_wire_format() {
        let accepted = PushResult::accepted(Some("r-1".into()), 3);
        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(
            value,
            json!({"type": "accepted", "remoteId": "r-1", "newVersion": 3})
        );

        let gone = serde_json::to_value(PushResult::gone()).unwrap();
        assert_eq!(gone, json!({"type": "rejected", "rejection": {"kind": "gone"}}));

        let failed = serde_json::to_value(PushResult::failed(true, "busy")).unwrap();
        assert_eq!(
            failed,
            json!({"type": "failed", "retryable": true, "message": "busy"})
        );
    }

    #[test]
    fn conflict_carries_remote_entity() {
        let remote = Entity::remote("l-1", "r-1", "todos", 4, json!({"title": "B"}), 1000);
        let json = serde_json::to_string(&PushResult::conflict(remote.clone())).unwrap();
        let parsed: PushResult = serde_json::from_str(&json).unwrap();

        assert_eq!(
            parsed,
            PushResult::Rejected {
                rejection: Rejection::VersionConflict { remote }
            }
        );
    }

    #[test]
    fn checkpoint_is_a_bare_number() {
        let set = DeletionSet {
            remote_ids: vec!["r-1".into()],
            next_checkpoint: Checkpoint(7),
        };
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({"remoteIds": ["r-1"], "nextCheckpoint": 7})
        );
        assert!(Checkpoint(3) > Checkpoint::ZERO);
    }

    #[test]
    fn network_error_into_push_result() {
        let result = PushResult::from(NetworkError::timeout(Duration::from_secs(30)));
        assert_eq!(
            result,
            PushResult::failed(true, "timed out after 30000ms")
        );
    }
}
