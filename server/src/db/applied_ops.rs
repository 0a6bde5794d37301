//! Push deduplication by operation id.

use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tether_engine::PushResult;

/// Result previously returned for `operation_id`, if it was accepted.
pub async fn find_applied(
    tx: &mut Transaction<'_, Postgres>,
    operation_id: &str,
) -> Result<Option<PushResult>, sqlx::Error> {
    let row: Option<Json<PushResult>> =
        sqlx::query_scalar("SELECT result FROM applied_operations WHERE operation_id = $1")
            .bind(operation_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.map(|Json(result)| result))
}

/// Remember the result of an accepted operation.
pub async fn record_applied(
    tx: &mut Transaction<'_, Postgres>,
    operation_id: &str,
    remote_id: &str,
    result: &PushResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO applied_operations (operation_id, remote_id, result)
        VALUES ($1, $2, $3)
        ON CONFLICT (operation_id) DO NOTHING
        "#,
    )
    .bind(operation_id)
    .bind(remote_id)
    .bind(Json(result))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
