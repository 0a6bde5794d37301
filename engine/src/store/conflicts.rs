//! The `conflicts` table: records parked until the host decides.

use super::{to_i64, to_u64};
use crate::{error::Result, ConflictRecord, Entity, ResolutionKind};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};

fn from_row(row: &SqliteRow) -> Result<ConflictRecord> {
    let Json(local): Json<Entity> = row.try_get("local_entity")?;
    let remote: Option<Json<Entity>> = row.try_get("remote_entity")?;
    Ok(ConflictRecord {
        local,
        remote: remote.map(|Json(entity)| entity),
        decision: ResolutionKind::RequiresUserInput,
        detected_at: to_u64(row.try_get("detected_at")?),
    })
}

/// Store or replace the record for its entity.
pub async fn save(conn: &mut SqliteConnection, record: &ConflictRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conflicts (local_id, local_entity, remote_entity, detected_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (local_id) DO UPDATE SET
            local_entity = excluded.local_entity,
            remote_entity = excluded.remote_entity,
            detected_at = excluded.detected_at
        "#,
    )
    .bind(&record.local.local_id)
    .bind(Json(&record.local))
    .bind(record.remote.as_ref().map(Json))
    .bind(to_i64(record.detected_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, local_id: &str) -> Result<Option<ConflictRecord>> {
    let row = sqlx::query(
        "SELECT local_entity, remote_entity, detected_at FROM conflicts WHERE local_id = ?1",
    )
    .bind(local_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn all(conn: &mut SqliteConnection) -> Result<Vec<ConflictRecord>> {
    let rows = sqlx::query(
        "SELECT local_entity, remote_entity, detected_at FROM conflicts ORDER BY detected_at",
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn delete(conn: &mut SqliteConnection, local_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM conflicts WHERE local_id = ?1")
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
