//! The `operations` table. `seq` is the log order.

use super::{to_i64, to_u64};
use crate::{error::Result, Operation, Timestamp, Version};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};

const COLUMNS: &str = "seq, operation_id, entity_local_id, collection, remote_id, kind, \
                       payload_snapshot, base_version, created_at, attempt_count, \
                       last_attempt_at, last_error, state";

fn from_row(row: &SqliteRow) -> Result<Operation> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let payload: Option<Json<serde_json::Value>> = row.try_get("payload_snapshot")?;
    let last_attempt_at: Option<i64> = row.try_get("last_attempt_at")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;

    Ok(Operation {
        operation_id: row.try_get("operation_id")?,
        entity_local_id: row.try_get("entity_local_id")?,
        collection: row.try_get("collection")?,
        remote_id: row.try_get("remote_id")?,
        kind: kind.parse()?,
        payload_snapshot: payload.map(|Json(value)| value),
        base_version: to_u64(row.try_get("base_version")?),
        created_at: to_u64(row.try_get("created_at")?),
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        last_attempt_at: last_attempt_at.map(to_u64),
        last_error: row.try_get("last_error")?,
        state: state.parse()?,
        sequence: to_u64(row.try_get("seq")?),
    })
}

/// Append to the log. Ignored if the operation id is already present.
pub async fn insert(conn: &mut SqliteConnection, op: &Operation) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO operations (
            operation_id, entity_local_id, collection, remote_id, kind,
            payload_snapshot, base_version, created_at, attempt_count,
            last_attempt_at, last_error, state
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&op.operation_id)
    .bind(&op.entity_local_id)
    .bind(&op.collection)
    .bind(&op.remote_id)
    .bind(op.kind.as_str())
    .bind(op.payload_snapshot.as_ref().map(Json))
    .bind(to_i64(op.base_version))
    .bind(to_i64(op.created_at))
    .bind(i64::from(op.attempt_count))
    .bind(op.last_attempt_at.map(to_i64))
    .bind(&op.last_error)
    .bind(op.state.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get(conn: &mut SqliteConnection, operation_id: &str) -> Result<Option<Operation>> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM operations WHERE operation_id = ?1"
    ))
    .bind(operation_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn all(conn: &mut SqliteConnection) -> Result<Vec<Operation>> {
    let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM operations ORDER BY seq"))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

pub async fn for_entity(conn: &mut SqliteConnection, local_id: &str) -> Result<Vec<Operation>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM operations WHERE entity_local_id = ?1 ORDER BY seq"
    ))
    .bind(local_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn failed(conn: &mut SqliteConnection) -> Result<Vec<Operation>> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM operations WHERE state = 'failed' ORDER BY seq"
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Whether a create has been attempted without being acknowledged. The
/// authority may have applied it.
pub async fn has_unconfirmed_create(conn: &mut SqliteConnection) -> Result<bool> {
    let found: i64 = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM operations
            WHERE kind = 'create' AND state = 'pending' AND attempt_count > 0
        )
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(found != 0)
}

pub async fn pending_count(conn: &mut SqliteConnection) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE state = 'pending'")
        .fetch_one(&mut *conn)
        .await?;
    Ok(usize::try_from(count).unwrap_or_default())
}

pub async fn delete(conn: &mut SqliteConnection, operation_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM operations WHERE operation_id = ?1")
        .bind(operation_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_for_entity(conn: &mut SqliteConnection, local_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM operations WHERE entity_local_id = ?1")
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn set_payload(
    conn: &mut SqliteConnection,
    operation_id: &str,
    payload: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query("UPDATE operations SET payload_snapshot = ?1 WHERE operation_id = ?2")
        .bind(payload.map(Json))
        .bind(operation_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Point every queued operation of an entity at a new base version, filling
/// in the remote id when it becomes known.
pub async fn rebase(
    conn: &mut SqliteConnection,
    local_id: &str,
    remote_id: Option<&str>,
    base_version: Version,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE operations
        SET base_version = ?1, remote_id = COALESCE(?2, remote_id)
        WHERE entity_local_id = ?3
        "#,
    )
    .bind(to_i64(base_version))
    .bind(remote_id)
    .bind(local_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn record_failure(
    conn: &mut SqliteConnection,
    operation_id: &str,
    error: &str,
    at: Timestamp,
    terminal: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE operations
        SET attempt_count = attempt_count + 1,
            last_error = ?1,
            last_attempt_at = ?2,
            state = CASE WHEN ?3 THEN 'failed' ELSE state END
        WHERE operation_id = ?4
        "#,
    )
    .bind(error)
    .bind(to_i64(at))
    .bind(terminal)
    .bind(operation_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Return an entity's failed operations to the queue. Returns how many.
pub async fn reset_failed(conn: &mut SqliteConnection, local_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET state = 'pending', attempt_count = 0
        WHERE entity_local_id = ?1 AND state = 'failed'
        "#,
    )
    .bind(local_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
