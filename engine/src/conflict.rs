//! Conflict resolution.
//!
//! A conflict exists when a pending local operation was based on a version the
//! authority has since moved past. The orchestrator detects that; a
//! [`ConflictResolver`] decides what wins. Strategies are picked once, when the
//! repository is built.

use crate::{Entity, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decision for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entity", rename_all = "camelCase")]
pub enum Resolution {
    /// Keep the local version and push it again on top of the remote one
    UseLocal,
    /// Take the remote version and drop the local change
    UseRemote,
    /// Push a merged version on top of the remote one
    Merged(Entity),
    /// Park the entity as `Conflicted` until someone decides
    RequiresUserInput,
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::UseLocal => ResolutionKind::UseLocal,
            Resolution::UseRemote => ResolutionKind::UseRemote,
            Resolution::Merged(_) => ResolutionKind::Merged,
            Resolution::RequiresUserInput => ResolutionKind::RequiresUserInput,
        }
    }
}

/// [`Resolution`] without its payload, for reports and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionKind {
    UseLocal,
    UseRemote,
    Merged,
    RequiresUserInput,
}

/// A detected conflict with both sides and the decision taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Local copy when the conflict was detected
    pub local: Entity,
    /// Remote copy; `None` when the authority deleted the entity
    pub remote: Option<Entity>,
    pub decision: ResolutionKind,
    pub detected_at: Timestamp,
}

impl ConflictRecord {
    pub fn new(
        local: Entity,
        remote: Option<Entity>,
        decision: ResolutionKind,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            local,
            remote,
            decision,
            detected_at,
        }
    }

    /// Whether the authority deleted the entity while it was edited locally.
    pub fn remote_deleted(&self) -> bool {
        self.remote.is_none()
    }
}

/// Conflict policy.
pub trait ConflictResolver: Send + Sync {
    /// Decide between the local and remote copies of one entity.
    fn resolve(&self, local: &Entity, remote: &Entity) -> Resolution;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Later write wins. Ties go to the remote copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, local: &Entity, remote: &Entity) -> Resolution {
        let remote_at = remote.updated_at_remote.unwrap_or(remote.updated_at_local);
        if local.updated_at_local > remote_at {
            Resolution::UseLocal
        } else {
            Resolution::UseRemote
        }
    }

    fn name(&self) -> &'static str {
        "last-write-wins"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictResolver for RemoteWins {
    fn resolve(&self, _local: &Entity, _remote: &Entity) -> Resolution {
        Resolution::UseRemote
    }

    fn name(&self) -> &'static str {
        "remote-wins"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictResolver for LocalWins {
    fn resolve(&self, _local: &Entity, _remote: &Entity) -> Resolution {
        Resolution::UseLocal
    }

    fn name(&self) -> &'static str {
        "local-wins"
    }
}

/// Leaves every conflict to the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserPrompt;

impl ConflictResolver for UserPrompt {
    fn resolve(&self, _local: &Entity, _remote: &Entity) -> Resolution {
        Resolution::RequiresUserInput
    }

    fn name(&self) -> &'static str {
        "user-prompt"
    }
}

/// Merges the two payloads with a caller-supplied function.
///
/// The function receives `(local, remote)` payloads. The merged entity keeps
/// the local identity and takes the remote version as its base.
pub struct FieldMerge<F> {
    merge: F,
}

impl<F> FieldMerge<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync,
{
    pub fn new(merge: F) -> Self {
        Self { merge }
    }
}

impl<F> ConflictResolver for FieldMerge<F>
where
    F: Fn(&serde_json::Value, &serde_json::Value) -> serde_json::Value + Send + Sync,
{
    fn resolve(&self, local: &Entity, remote: &Entity) -> Resolution {
        let mut merged = local.clone();
        merged.remote_id = remote.remote_id.clone().or(merged.remote_id);
        merged.version = remote.version;
        merged.updated_at_remote = remote.updated_at_remote;
        merged.payload = (self.merge)(&local.payload, &remote.payload);
        Resolution::Merged(merged)
    }

    fn name(&self) -> &'static str {
        "field-merge"
    }
}

/// Union of two JSON objects.
///
/// Keys present on one side are kept. For keys on both sides nested objects
/// are merged recursively, arrays become the union of their elements and
/// anything else takes the local value.
pub fn object_union(local: &serde_json::Value, remote: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = r.clone();
            for (key, lv) in l {
                let merged = match r.get(key) {
                    Some(rv) => object_union(lv, rv),
                    None => lv.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut out = l.clone();
            for item in r {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (l, _) => l.clone(),
    }
}

/// Built-in strategies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    #[default]
    LastWriteWins,
    RemoteWins,
    LocalWins,
    /// [`FieldMerge`] with [`object_union`]
    ObjectUnion,
    UserPrompt,
}

impl MergeStrategy {
    pub fn resolver(self) -> Arc<dyn ConflictResolver> {
        match self {
            MergeStrategy::LastWriteWins => Arc::new(LastWriteWins),
            MergeStrategy::RemoteWins => Arc::new(RemoteWins),
            MergeStrategy::LocalWins => Arc::new(LocalWins),
            MergeStrategy::ObjectUnion => Arc::new(FieldMerge::new(object_union)),
            MergeStrategy::UserPrompt => Arc::new(UserPrompt),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" | "lww" => Ok(MergeStrategy::LastWriteWins),
            "remote-wins" => Ok(MergeStrategy::RemoteWins),
            "local-wins" => Ok(MergeStrategy::LocalWins),
            "object-union" | "field-merge" => Ok(MergeStrategy::ObjectUnion),
            "user-prompt" => Ok(MergeStrategy::UserPrompt),
            other => Err(format!("unknown merge strategy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(local_at: Timestamp, remote_at: Timestamp) -> (Entity, Entity) {
        let mut local = Entity::remote("l-1", "r-1", "todos", 3, json!({"title": "L"}), 0);
        local.apply_local_update(json!({"title": "L2"}), local_at);
        let remote = Entity::remote("l-1", "r-1", "todos", 4, json!({"title": "R"}), remote_at);
        (local, remote)
    }

    #[test]
    fn last_write_wins_prefers_newer() {
        let (local, remote) = pair(2000, 1000);
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseLocal);

        let (local, remote) = pair(1000, 2000);
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseRemote);
    }

    #[test]
    fn last_write_wins_tie_goes_to_remote() {
        let (local, remote) = pair(1500, 1500);
        assert_eq!(LastWriteWins.resolve(&local, &remote), Resolution::UseRemote);
    }

    #[test]
    fn fixed_strategies() {
        let (local, remote) = pair(1000, 2000);
        assert_eq!(RemoteWins.resolve(&local, &remote), Resolution::UseRemote);
        assert_eq!(LocalWins.resolve(&local, &remote), Resolution::UseLocal);
        assert_eq!(
            UserPrompt.resolve(&local, &remote),
            Resolution::RequiresUserInput
        );
    }

    #[test]
    fn field_merge_builds_on_remote_version() {
        let mut local = Entity::remote("l-1", "r-1", "todos", 1, json!({}), 0);
        local.apply_local_update(json!({"title": "A", "tags": ["x"]}), 2000);
        let remote = Entity::remote(
            "l-1",
            "r-1",
            "todos",
            2,
            json!({"done": true, "tags": ["y"]}),
            1500,
        );

        let Resolution::Merged(merged) = FieldMerge::new(object_union).resolve(&local, &remote)
        else {
            panic!("expected a merge");
        };

        assert_eq!(merged.local_id, "l-1");
        assert_eq!(merged.version, 2);
        assert_eq!(
            merged.payload,
            json!({"title": "A", "done": true, "tags": ["x", "y"]})
        );
    }

    #[test]
    fn custom_merge_function() {
        let max = FieldMerge::new(|l: &serde_json::Value, r: &serde_json::Value| {
            let l = l["count"].as_u64().unwrap_or(0);
            let r = r["count"].as_u64().unwrap_or(0);
            json!({ "count": l.max(r) })
        });
        let mut local = Entity::remote("l-1", "r-1", "counters", 1, json!({"count": 1}), 0);
        local.apply_local_update(json!({"count": 7}), 10);
        let remote = Entity::remote("l-1", "r-1", "counters", 2, json!({"count": 4}), 5);

        let Resolution::Merged(merged) = max.resolve(&local, &remote) else {
            panic!("expected a merge");
        };
        assert_eq!(merged.payload, json!({"count": 7}));
    }

    #[test]
    fn object_union_nested() {
        let local = json!({"meta": {"a": 1}, "name": "local"});
        let remote = json!({"meta": {"b": 2}, "name": "remote"});
        assert_eq!(
            object_union(&local, &remote),
            json!({"meta": {"a": 1, "b": 2}, "name": "local"})
        );
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!(
            "lww".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::LastWriteWins
        );
        assert_eq!(
            "user-prompt".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::UserPrompt
        );
        assert!("coin-flip".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::RemoteWins.resolver().name(), "remote-wins");
    }

    #[test]
    fn record_serialization() {
        let (local, _) = pair(1, 2);
        let record = ConflictRecord::new(local, None, ResolutionKind::RequiresUserInput, 99);
        assert!(record.remote_deleted());

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"decision\":\"requiresUserInput\""));
        let parsed: ConflictRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
