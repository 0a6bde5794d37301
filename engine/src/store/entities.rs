//! The `entities` table.

use super::{to_i64, to_u64};
use crate::{error::Result, Entity, EntityFilter, SyncStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};

const COLUMNS: &str = "local_id, remote_id, collection, version, updated_at_local, \
                       updated_at_remote, sync_status, payload";

fn from_row(row: &SqliteRow) -> Result<Entity> {
    let status: String = row.try_get("sync_status")?;
    let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
    let updated_at_remote: Option<i64> = row.try_get("updated_at_remote")?;

    Ok(Entity {
        local_id: row.try_get("local_id")?,
        remote_id: row.try_get("remote_id")?,
        collection: row.try_get("collection")?,
        version: to_u64(row.try_get("version")?),
        updated_at_local: to_u64(row.try_get("updated_at_local")?),
        updated_at_remote: updated_at_remote.map(to_u64),
        sync_status: status.parse()?,
        payload,
    })
}

pub async fn get(conn: &mut SqliteConnection, local_id: &str) -> Result<Option<Entity>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM entities WHERE local_id = ?1"))
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_remote_id(
    conn: &mut SqliteConnection,
    remote_id: &str,
) -> Result<Option<Entity>> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM entities WHERE remote_id = ?1"))
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Entities matching `filter`, oldest local write first.
pub async fn get_all(conn: &mut SqliteConnection, filter: &EntityFilter) -> Result<Vec<Entity>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM entities \
         WHERE (?1 IS NULL OR collection = ?1) \
         ORDER BY updated_at_local, local_id"
    ))
    .bind(filter.collection.as_deref())
    .fetch_all(&mut *conn)
    .await?;

    let mut entities = Vec::with_capacity(rows.len());
    for row in &rows {
        let entity = from_row(row)?;
        if filter.matches(&entity) {
            entities.push(entity);
        }
    }
    Ok(entities)
}

pub async fn get_by_status(
    conn: &mut SqliteConnection,
    statuses: &[SyncStatus],
) -> Result<Vec<Entity>> {
    let filter = EntityFilter::all()
        .include_deleted()
        .statuses(statuses.iter().copied());
    get_all(conn, &filter).await
}

/// Insert or overwrite by `local_id`.
pub async fn upsert(conn: &mut SqliteConnection, entity: &Entity) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entities (
            local_id, remote_id, collection, version, updated_at_local,
            updated_at_remote, sync_status, payload
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (local_id) DO UPDATE SET
            remote_id = excluded.remote_id,
            collection = excluded.collection,
            version = excluded.version,
            updated_at_local = excluded.updated_at_local,
            updated_at_remote = excluded.updated_at_remote,
            sync_status = excluded.sync_status,
            payload = excluded.payload
        "#,
    )
    .bind(&entity.local_id)
    .bind(&entity.remote_id)
    .bind(&entity.collection)
    .bind(to_i64(entity.version))
    .bind(to_i64(entity.updated_at_local))
    .bind(entity.updated_at_remote.map(to_i64))
    .bind(entity.sync_status.as_str())
    .bind(Json(&entity.payload))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    local_id: &str,
    status: SyncStatus,
) -> Result<()> {
    sqlx::query("UPDATE entities SET sync_status = ?1 WHERE local_id = ?2")
        .bind(status.as_str())
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Hard delete. Returns whether a row existed.
pub async fn delete(conn: &mut SqliteConnection, local_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM entities WHERE local_id = ?1")
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
