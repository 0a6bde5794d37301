//! Entity types: domain records plus their sync metadata.

use crate::{CollectionName, Error, LocalId, RemoteId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sync state of a locally stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// Local copy matches the last version acknowledged by the remote
    Synced,
    /// Created locally, never pushed
    PendingCreate,
    /// Modified locally since the last acknowledged version
    PendingUpdate,
    /// Deleted locally, delete not yet acknowledged
    PendingDelete,
    /// An operation for this entity exhausted its retries
    Failed,
    /// Waiting for an external conflict decision
    Conflicted,
}

impl SyncStatus {
    /// All statuses, in declaration order.
    pub const ALL: [SyncStatus; 6] = [
        SyncStatus::Synced,
        SyncStatus::PendingCreate,
        SyncStatus::PendingUpdate,
        SyncStatus::PendingDelete,
        SyncStatus::Failed,
        SyncStatus::Conflicted,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::PendingCreate => "pending_create",
            SyncStatus::PendingUpdate => "pending_update",
            SyncStatus::PendingDelete => "pending_delete",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflicted => "conflicted",
        }
    }

    /// Whether a local change is waiting to be pushed.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncStatus::PendingCreate | SyncStatus::PendingUpdate | SyncStatus::PendingDelete
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::CorruptRow(format!("unknown sync status '{s}'")))
    }
}

/// A domain record with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Client-generated identifier, stable for the entity's lifetime
    pub local_id: LocalId,
    /// Identifier assigned by the remote authority on first successful push
    pub remote_id: Option<RemoteId>,
    /// Collection this entity belongs to
    pub collection: CollectionName,
    /// Incremented on every local or remote-accepted write
    pub version: Version,
    /// Last local write (milliseconds since epoch)
    pub updated_at_local: Timestamp,
    /// Last write known to the remote (milliseconds since epoch)
    pub updated_at_remote: Option<Timestamp>,
    /// Sync state
    pub sync_status: SyncStatus,
    /// Domain fields
    pub payload: serde_json::Value,
}

impl Entity {
    /// Create a new locally authored entity, pending its first push.
    pub fn new_local(
        collection: impl Into<CollectionName>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            collection: collection.into(),
            version: 1,
            updated_at_local: timestamp,
            updated_at_remote: None,
            sync_status: SyncStatus::PendingCreate,
            payload,
        }
    }

    /// Create an entity as the remote authority reports it.
    pub fn remote(
        local_id: impl Into<LocalId>,
        remote_id: impl Into<RemoteId>,
        collection: impl Into<CollectionName>,
        version: Version,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: Some(remote_id.into()),
            collection: collection.into(),
            version,
            updated_at_local: timestamp,
            updated_at_remote: Some(timestamp),
            sync_status: SyncStatus::Synced,
            payload,
        }
    }

    /// Whether reads should return this entity by default.
    pub fn is_visible(&self) -> bool {
        self.sync_status != SyncStatus::PendingDelete
    }

    /// Apply a local payload change.
    ///
    /// `Failed` stays sticky so the caller keeps seeing the stuck operation;
    /// a pending create stays a pending create.
    pub fn apply_local_update(&mut self, payload: serde_json::Value, timestamp: Timestamp) {
        self.payload = payload;
        self.version += 1;
        self.updated_at_local = timestamp;
        self.sync_status = match self.sync_status {
            SyncStatus::PendingCreate => SyncStatus::PendingCreate,
            SyncStatus::Failed => SyncStatus::Failed,
            _ => SyncStatus::PendingUpdate,
        };
    }

    /// Mark the entity as locally deleted.
    pub fn mark_pending_delete(&mut self, timestamp: Timestamp) {
        self.version += 1;
        self.updated_at_local = timestamp;
        self.sync_status = SyncStatus::PendingDelete;
    }

    /// Overwrite this entity with the remote copy, keeping the local identity.
    pub fn accept_remote(&mut self, remote: &Entity) {
        self.remote_id = remote.remote_id.clone();
        self.collection = remote.collection.clone();
        self.version = remote.version;
        self.payload = remote.payload.clone();
        self.updated_at_remote = remote.updated_at_remote;
        self.updated_at_local = remote.updated_at_remote.unwrap_or(self.updated_at_local);
        self.sync_status = SyncStatus::Synced;
    }
}

/// Filter for [`crate::Repository::read_all`] and [`crate::LocalStore::get_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub(crate) collection: Option<CollectionName>,
    pub(crate) statuses: Option<Vec<SyncStatus>>,
    pub(crate) include_deleted: bool,
}

impl EntityFilter {
    /// Match every visible entity.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one collection.
    pub fn collection(mut self, collection: impl Into<CollectionName>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Restrict to the given statuses.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = SyncStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Include entities that are pending deletion.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Check an entity against this filter.
    pub fn matches(&self, entity: &Entity) -> bool {
        if !self.include_deleted && !entity.is_visible() {
            return false;
        }
        if let Some(collection) = &self.collection {
            if &entity.collection != collection {
                return false;
            }
        }
        match &self.statuses {
            Some(statuses) => statuses.contains(&entity.sync_status),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_local_entity() {
        let entity = Entity::new_local("todos", json!({"title": "A"}), 1000);

        assert_eq!(entity.collection, "todos");
        assert_eq!(entity.version, 1);
        assert_eq!(entity.sync_status, SyncStatus::PendingCreate);
        assert!(entity.remote_id.is_none());
        assert!(uuid::Uuid::parse_str(&entity.local_id).is_ok());
    }

    #[test]
    fn local_ids_are_unique() {
        let a = Entity::new_local("todos", json!({}), 1000);
        let b = Entity::new_local("todos", json!({}), 1000);
        assert_ne!(a.local_id, b.local_id);
    }

    #[test]
    fn update_escalates_status() {
        let mut entity = Entity::remote("l-1", "r-1", "todos", 3, json!({"title": "A"}), 1000);
        entity.apply_local_update(json!({"title": "B"}), 2000);

        assert_eq!(entity.version, 4);
        assert_eq!(entity.updated_at_local, 2000);
        assert_eq!(entity.sync_status, SyncStatus::PendingUpdate);
    }

    #[test]
    fn update_keeps_pending_create() {
        let mut entity = Entity::new_local("todos", json!({"title": "A"}), 1000);
        entity.apply_local_update(json!({"title": "B"}), 2000);
        assert_eq!(entity.sync_status, SyncStatus::PendingCreate);
    }

    #[test]
    fn update_keeps_failed() {
        let mut entity = Entity::new_local("todos", json!({"title": "A"}), 1000);
        entity.sync_status = SyncStatus::Failed;
        entity.apply_local_update(json!({"title": "B"}), 2000);
        assert_eq!(entity.sync_status, SyncStatus::Failed);
    }

    #[test]
    fn pending_delete_is_hidden() {
        let mut entity = Entity::remote("l-1", "r-1", "todos", 1, json!({}), 1000);
        entity.mark_pending_delete(2000);

        assert!(!entity.is_visible());
        assert!(!EntityFilter::all().matches(&entity));
        assert!(EntityFilter::all().include_deleted().matches(&entity));
    }

    #[test]
    fn accept_remote_keeps_local_id() {
        let mut local = Entity::new_local("todos", json!({"title": "A"}), 1000);
        let local_id = local.local_id.clone();
        let remote = Entity::remote("other", "r-9", "todos", 7, json!({"title": "Z"}), 5000);

        local.accept_remote(&remote);

        assert_eq!(local.local_id, local_id);
        assert_eq!(local.remote_id.as_deref(), Some("r-9"));
        assert_eq!(local.version, 7);
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.updated_at_remote, Some(5000));
    }

    #[test]
    fn filter_by_collection_and_status() {
        let todo = Entity::new_local("todos", json!({}), 1000);
        let note = Entity::remote("l-2", "r-2", "notes", 1, json!({}), 1000);

        let filter = EntityFilter::all().collection("todos");
        assert!(filter.matches(&todo));
        assert!(!filter.matches(&note));

        let filter = EntityFilter::all().statuses([SyncStatus::Synced]);
        assert!(!filter.matches(&todo));
        assert!(filter.matches(&note));
    }

    #[test]
    fn status_storage_names() {
        for status in SyncStatus::ALL {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn serialization_format() {
        let entity = Entity::remote("l-1", "r-1", "todos", 2, json!({"title": "A"}), 1000);
        let json = serde_json::to_string(&entity).unwrap();

        assert!(json.contains("\"localId\":\"l-1\""));
        assert!(json.contains("\"syncStatus\":\"synced\""));

        let parsed: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entity);
    }
}
