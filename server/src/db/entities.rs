//! Queries against the `remote_entities` table and the change sequence.
//!
//! Writers hold the change-stream lock from the moment they draw a sequence
//! value until commit, so sequence values become visible in order and
//! `MAX(change_seq)` is a safe checkpoint for readers.

use sqlx::{PgPool, Postgres, Row, Transaction};
use tether_engine::{Checkpoint, Entity};

/// Advisory lock key serialising writers on the change stream.
const CHANGE_STREAM_LOCK: i64 = 0x7465_7468_6572;

/// A row of `remote_entities`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub remote_id: String,
    pub local_id: String,
    pub collection: String,
    pub version: i64,
    pub payload: serde_json::Value,
    pub deleted: bool,
    pub change_seq: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEntity {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            remote_id: row.try_get("remote_id")?,
            local_id: row.try_get("local_id")?,
            collection: row.try_get("collection")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            deleted: row.try_get("deleted")?,
            change_seq: row.try_get("change_seq")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredEntity {
    /// The entity as clients see it.
    pub fn to_entity(&self) -> Entity {
        Entity::remote(
            self.local_id.clone(),
            self.remote_id.clone(),
            self.collection.clone(),
            u64::try_from(self.version).unwrap_or_default(),
            self.payload.clone(),
            u64::try_from(self.updated_at).unwrap_or_default(),
        )
    }
}

const COLUMNS: &str =
    "remote_id, local_id, collection, version, payload, deleted, change_seq, updated_at";

/// Take the change-stream lock for the rest of the transaction.
pub async fn lock_change_stream(tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CHANGE_STREAM_LOCK)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Fetch a row, tombstones included, locking it until commit.
pub async fn get_entity_for_update(
    tx: &mut Transaction<'_, Postgres>,
    remote_id: &str,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        "SELECT {COLUMNS} FROM remote_entities WHERE remote_id = $1 FOR UPDATE"
    ))
    .bind(remote_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Insert a newly created entity. Returns its change sequence value.
pub async fn insert_entity(
    tx: &mut Transaction<'_, Postgres>,
    remote_id: &str,
    entity: &Entity,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO remote_entities (
            remote_id, local_id, collection, version, payload, deleted, change_seq, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, FALSE, nextval('change_seq'), $6)
        RETURNING change_seq
        "#,
    )
    .bind(remote_id)
    .bind(&entity.local_id)
    .bind(&entity.collection)
    .bind(to_i64(entity.version))
    .bind(&entity.payload)
    .bind(to_i64(entity.updated_at_local))
    .fetch_one(&mut **tx)
    .await
}

/// Overwrite an existing row and move it to the head of the change stream.
pub async fn update_entity(
    tx: &mut Transaction<'_, Postgres>,
    remote_id: &str,
    entity: &Entity,
    deleted: bool,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE remote_entities SET
            version = $2,
            payload = $3,
            deleted = $4,
            updated_at = $5,
            change_seq = nextval('change_seq')
        WHERE remote_id = $1
        RETURNING change_seq
        "#,
    )
    .bind(remote_id)
    .bind(to_i64(entity.version))
    .bind(&entity.payload)
    .bind(deleted)
    .bind(to_i64(entity.updated_at_local))
    .fetch_one(&mut **tx)
    .await
}

/// Highest committed change sequence value.
pub async fn head(pool: &PgPool) -> Result<Checkpoint, sqlx::Error> {
    let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(change_seq), 0) FROM remote_entities")
        .fetch_one(pool)
        .await?;
    Ok(Checkpoint(u64::try_from(head).unwrap_or_default()))
}

/// Live rows with `since < change_seq <= head`, oldest change first.
pub async fn changed_since(
    pool: &PgPool,
    since: i64,
    head: i64,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {COLUMNS} FROM remote_entities
        WHERE deleted = FALSE AND change_seq > $1 AND change_seq <= $2
        ORDER BY change_seq
        "#
    ))
    .bind(since)
    .bind(head)
    .fetch_all(pool)
    .await
}

/// Remote ids of tombstones with `since < change_seq <= head`.
pub async fn deleted_since(pool: &PgPool, since: i64, head: i64) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT remote_id FROM remote_entities
        WHERE deleted = TRUE AND change_seq > $1 AND change_seq <= $2
        ORDER BY change_seq
        "#,
    )
    .bind(since)
    .bind(head)
    .fetch_all(pool)
    .await
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
