//! Pull handlers - serve changes and tombstones since a checkpoint.

use crate::db;
use crate::error::{AppError, Result};
use serde::Deserialize;
use sqlx::PgPool;
use tether_engine::{ChangeSet, Checkpoint, DeletionSet};

/// Query parameters for both pull routes.
#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    /// Checkpoint from the previous pull; omitted on first sync
    #[serde(default)]
    pub since: u64,
}

impl SinceQuery {
    fn since(&self) -> Result<i64> {
        i64::try_from(self.since)
            .map_err(|_| AppError::BadRequest(format!("since out of range: {}", self.since)))
    }
}

/// Live entities changed after `since`.
///
/// The head is read first, so a write racing the query shows up in the next
/// pull instead of being skipped.
pub async fn handle_changes(pool: &PgPool, query: SinceQuery) -> Result<ChangeSet> {
    let since = query.since()?;
    let head = db::head(pool).await?;
    let rows = db::changed_since(pool, since, head_seq(head)?).await?;

    tracing::debug!(since, head = %head, count = rows.len(), "serving changes");
    Ok(ChangeSet {
        entities: rows.iter().map(|row| row.to_entity()).collect(),
        next_checkpoint: head,
    })
}

/// Remote ids deleted after `since`.
pub async fn handle_deletions(pool: &PgPool, query: SinceQuery) -> Result<DeletionSet> {
    let since = query.since()?;
    let head = db::head(pool).await?;
    let remote_ids = db::deleted_since(pool, since, head_seq(head)?).await?;

    tracing::debug!(since, head = %head, count = remote_ids.len(), "serving deletions");
    Ok(DeletionSet {
        remote_ids,
        next_checkpoint: head,
    })
}

fn head_seq(head: Checkpoint) -> Result<i64> {
    i64::try_from(head.value())
        .map_err(|_| AppError::Internal(format!("change sequence head {head} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_must_fit_the_sequence() {
        assert_eq!(SinceQuery { since: 42 }.since().unwrap(), 42);
        assert!(matches!(
            SinceQuery { since: u64::MAX }.since(),
            Err(AppError::BadRequest(_))
        ));
    }
}
