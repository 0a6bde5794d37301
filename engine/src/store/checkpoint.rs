//! The single-row `checkpoint` table.

use super::{to_i64, to_u64};
use crate::error::Result;
use crate::gateway::Checkpoint;
use sqlx::SqliteConnection;

pub async fn get(conn: &mut SqliteConnection) -> Result<Checkpoint> {
    let value: i64 = sqlx::query_scalar("SELECT value FROM checkpoint WHERE id = 1")
        .fetch_one(&mut *conn)
        .await?;
    Ok(Checkpoint(to_u64(value)))
}

/// Move the checkpoint forward. A smaller value leaves it where it is.
pub async fn advance(conn: &mut SqliteConnection, next: Checkpoint) -> Result<Checkpoint> {
    sqlx::query("UPDATE checkpoint SET value = MAX(value, ?1) WHERE id = 1")
        .bind(to_i64(next.0))
        .execute(&mut *conn)
        .await?;
    get(conn).await
}

/// Rewind to zero. Only used for a full resync.
pub async fn reset(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("UPDATE checkpoint SET value = 0 WHERE id = 1")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
