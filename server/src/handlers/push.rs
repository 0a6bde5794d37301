//! Push handler - decides incoming operations against the stored copy.

use crate::db::{self, StoredEntity};
use crate::error::Result;
use sqlx::PgPool;
use tether_engine::{Entity, Operation, OperationKind, PushRequest, PushResult};

/// What to do with one pushed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Store a new entity under `remote_id`
    Insert { remote_id: String, entity: Entity },
    /// Overwrite the stored row, tombstoning it when `deleted`
    Write {
        remote_id: String,
        entity: Entity,
        deleted: bool,
    },
    /// Answer without touching storage
    Respond(PushResult),
}

impl Decision {
    /// The answer the client gets once the decision is carried out.
    pub fn result(&self) -> PushResult {
        match self {
            Decision::Insert { remote_id, entity } | Decision::Write { remote_id, entity, .. } => {
                PushResult::accepted(Some(remote_id.clone()), entity.version)
            }
            Decision::Respond(result) => result.clone(),
        }
    }
}

/// Decide an operation against `existing`, the stored row for its remote id
/// (tombstones included).
///
/// - creates always succeed at version 1 under a fresh remote id
/// - updates and deletes must name the version they were based on
/// - deleting something already gone succeeds without a write
/// - updating something gone is rejected as `Gone`
pub fn decide(
    op: &Operation,
    existing: Option<&StoredEntity>,
    fresh_remote_id: impl FnOnce() -> String,
) -> Decision {
    if op.kind == OperationKind::Create {
        let Some(payload) = op.payload_snapshot.clone() else {
            return Decision::Respond(PushResult::failed(false, "create carries no payload"));
        };
        let remote_id = fresh_remote_id();
        let entity = Entity::remote(
            op.entity_local_id.clone(),
            remote_id.clone(),
            op.collection.clone(),
            1,
            payload,
            op.created_at,
        );
        return Decision::Insert { remote_id, entity };
    }

    let Some(remote_id) = op.remote_id.clone() else {
        return Decision::Respond(PushResult::failed(false, "operation has no remote id"));
    };
    let stored = match existing {
        Some(stored) if !stored.deleted => stored,
        _ if op.kind == OperationKind::Delete => {
            return Decision::Respond(PushResult::accepted(Some(remote_id), op.base_version));
        }
        _ => return Decision::Respond(PushResult::gone()),
    };

    let mut entity = stored.to_entity();
    if entity.version != op.base_version {
        return Decision::Respond(PushResult::conflict(entity));
    }

    entity.version += 1;
    let deleted = op.kind == OperationKind::Delete;
    if !deleted {
        entity.payload = op.payload_snapshot.clone().unwrap_or_default();
        entity.updated_at_local = op.created_at;
        entity.updated_at_remote = Some(op.created_at);
    }
    Decision::Write {
        remote_id,
        entity,
        deleted,
    }
}

/// Process a push request from a client.
///
/// A retried operation gets the answer it got the first time.
pub async fn handle_push(pool: &PgPool, request: PushRequest) -> Result<PushResult> {
    let op = &request.operation;
    let mut tx = pool.begin().await?;
    db::lock_change_stream(&mut tx).await?;

    if let Some(previous) = db::find_applied(&mut tx, &op.operation_id).await? {
        tx.commit().await?;
        tracing::debug!(operation_id = %op.operation_id, "replaying applied operation");
        return Ok(previous);
    }

    let existing = match (op.kind, op.remote_id.as_deref()) {
        (OperationKind::Create, _) | (_, None) => None,
        (_, Some(remote_id)) => db::get_entity_for_update(&mut tx, remote_id).await?,
    };

    let decision = decide(op, existing.as_ref(), || uuid::Uuid::new_v4().to_string());
    match &decision {
        Decision::Insert { remote_id, entity } => {
            db::insert_entity(&mut tx, remote_id, entity).await?;
        }
        Decision::Write {
            remote_id,
            entity,
            deleted,
        } => {
            db::update_entity(&mut tx, remote_id, entity, *deleted).await?;
        }
        Decision::Respond(_) => {}
    }

    let result = decision.result();
    if let PushResult::Accepted {
        remote_id: Some(remote_id),
        ..
    } = &result
    {
        db::record_applied(&mut tx, &op.operation_id, remote_id, &result).await?;
    }
    tx.commit().await?;

    tracing::debug!(
        operation_id = %op.operation_id,
        kind = op.kind.as_str(),
        result = ?result,
        "push decided"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_engine::Rejection;

    fn stored(version: i64, deleted: bool) -> StoredEntity {
        StoredEntity {
            remote_id: "r-1".into(),
            local_id: "l-1".into(),
            collection: "todos".into(),
            version,
            payload: json!({"title": "server"}),
            deleted,
            change_seq: 4,
            updated_at: 1000,
        }
    }

    fn synced(version: u64) -> Entity {
        Entity::remote("l-1", "r-1", "todos", version, json!({"title": "client"}), 2000)
    }

    #[test]
    fn create_gets_fresh_id_at_version_one() {
        let local = Entity::new_local("todos", json!({"title": "A"}), 1000);
        let op = Operation::create(&local, 1000);

        let decision = decide(&op, None, || "r-new".to_string());

        match &decision {
            Decision::Insert { remote_id, entity } => {
                assert_eq!(remote_id, "r-new");
                assert_eq!(entity.local_id, local.local_id);
                assert_eq!(entity.version, 1);
                assert_eq!(entity.payload, json!({"title": "A"}));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decision.result(), PushResult::accepted(Some("r-new".into()), 1));
    }

    #[test]
    fn update_on_current_version_bumps_it() {
        let op = Operation::update(&synced(2), 2, 3000);

        let decision = decide(&op, Some(&stored(2, false)), || unreachable!());

        match decision {
            Decision::Write {
                entity, deleted, ..
            } => {
                assert!(!deleted);
                assert_eq!(entity.version, 3);
                assert_eq!(entity.payload, json!({"title": "client"}));
                assert_eq!(entity.updated_at_remote, Some(3000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stale_update_returns_server_copy() {
        let op = Operation::update(&synced(2), 1, 3000);

        let result = decide(&op, Some(&stored(2, false)), || unreachable!()).result();

        match result {
            PushResult::Rejected {
                rejection: Rejection::VersionConflict { remote },
            } => {
                assert_eq!(remote.version, 2);
                assert_eq!(remote.payload, json!({"title": "server"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn delete_tombstones_row() {
        let op = Operation::delete(&synced(2), 2, 3000);

        match decide(&op, Some(&stored(2, false)), || unreachable!()) {
            Decision::Write {
                entity, deleted, ..
            } => {
                assert!(deleted);
                assert_eq!(entity.version, 3);
                assert_eq!(entity.payload, json!({"title": "server"}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gone_entities() {
        let update = Operation::update(&synced(2), 2, 3000);
        let delete = Operation::delete(&synced(2), 2, 3000);

        for existing in [None, Some(stored(3, true))] {
            assert_eq!(
                decide(&update, existing.as_ref(), || unreachable!()).result(),
                PushResult::gone()
            );
            assert_eq!(
                decide(&delete, existing.as_ref(), || unreachable!()),
                Decision::Respond(PushResult::accepted(Some("r-1".into()), 2))
            );
        }
    }

    #[test]
    fn malformed_operations_fail_permanently() {
        let local = Entity::new_local("todos", json!({}), 1000);
        let update = Operation::update(&local, 1, 1000);
        assert!(matches!(
            decide(&update, None, || unreachable!()).result(),
            PushResult::Failed { retryable: false, .. }
        ));

        let mut create = Operation::create(&local, 1000);
        create.payload_snapshot = None;
        assert!(matches!(
            decide(&create, None, || unreachable!()).result(),
            PushResult::Failed { retryable: false, .. }
        ));
    }
}
