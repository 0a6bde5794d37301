//! Durable local storage: entities, the operation log, the pull checkpoint and
//! parked conflicts, all in one SQLite database.
//!
//! The pool holds a single connection, so every transaction is serialised.
//! Functions in the submodules take a `&mut SqliteConnection` and can be
//! composed inside one transaction; [`LocalStore`] wraps the common ones.
//! Never call a `LocalStore` method while holding one of its transactions.

pub mod checkpoint;
pub mod conflicts;
pub mod entities;
pub mod operations;

use crate::gateway::Checkpoint;
use crate::operation::compact;
use crate::{
    error::Result, ConflictRecord, Entity, EntityFilter, LocalId, Operation, OperationId,
    OperationKind, SyncStatus,
};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// Retry ceiling used when none is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Handle to the local database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    max_attempts: u32,
}

impl LocalStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    ///
    /// `sqlite::memory:` gives a private in-memory database.
    pub async fn open(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(url, "local store opened");

        Ok(Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Open a database file.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().display());
        Self::open(&url).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    /// Set the retry ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Entity store

    pub async fn get(&self, local_id: &str) -> Result<Option<Entity>> {
        let mut conn = self.acquire().await?;
        entities::get(&mut conn, local_id).await
    }

    /// Snapshot of every entity matching `filter`.
    pub async fn get_all(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let mut conn = self.acquire().await?;
        entities::get_all(&mut conn, filter).await
    }

    pub async fn upsert(&self, entity: &Entity) -> Result<()> {
        let mut conn = self.acquire().await?;
        entities::upsert(&mut conn, entity).await
    }

    pub async fn delete(&self, local_id: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        entities::delete(&mut conn, local_id).await
    }

    pub async fn get_pending(&self, statuses: &[SyncStatus]) -> Result<Vec<Entity>> {
        let mut conn = self.acquire().await?;
        entities::get_by_status(&mut conn, statuses).await
    }

    // Operation log

    /// Append an operation. A duplicate `operation_id` is a no-op.
    pub async fn enqueue(&self, operation: &Operation) -> Result<OperationId> {
        let mut conn = self.acquire().await?;
        operations::insert(&mut conn, operation).await?;
        Ok(operation.operation_id.clone())
    }

    /// Every queued operation (pending and failed) in log order.
    pub async fn operations(&self) -> Result<Vec<Operation>> {
        let mut conn = self.acquire().await?;
        operations::all(&mut conn).await
    }

    pub async fn operations_for(&self, local_id: &str) -> Result<Vec<Operation>> {
        let mut conn = self.acquire().await?;
        operations::for_entity(&mut conn, local_id).await
    }

    /// Number of operations still eligible for pushing.
    pub async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.acquire().await?;
        operations::pending_count(&mut conn).await
    }

    /// Whether a create may have reached the authority unacknowledged.
    pub async fn has_unconfirmed_create(&self) -> Result<bool> {
        let mut conn = self.acquire().await?;
        operations::has_unconfirmed_create(&mut conn).await
    }

    /// The terminal failed set.
    pub async fn failed_operations(&self) -> Result<Vec<Operation>> {
        let mut conn = self.acquire().await?;
        operations::failed(&mut conn).await
    }

    /// Compact the log, then return up to `max_n` operations to push.
    ///
    /// Only the head operation of each entity is returned, so an entity's
    /// operations can never be pushed out of order. Entities with a terminally
    /// failed head, a parked conflict, or listed in `exclude` are held back.
    pub async fn dequeue_batch(
        &self,
        max_n: usize,
        exclude: &HashSet<LocalId>,
    ) -> Result<Vec<Operation>> {
        let mut tx = self.begin().await?;

        let queue = operations::all(&mut tx).await?;
        let compaction = compact(&queue);
        if !compaction.is_empty() {
            for op in &compaction.rewritten {
                operations::set_payload(&mut tx, &op.operation_id, op.payload_snapshot.as_ref())
                    .await?;
            }
            for operation_id in &compaction.removed {
                operations::delete(&mut tx, operation_id).await?;
            }
            for local_id in &compaction.cancelled_entities {
                entities::delete(&mut tx, local_id).await?;
                conflicts::delete(&mut tx, local_id).await?;
                tracing::debug!(local_id = %local_id, "create cancelled by delete before push");
            }
            tracing::debug!(
                coalesced = compaction.rewritten.len(),
                removed = compaction.removed.len(),
                "operation log compacted"
            );
        }

        let queue = operations::all(&mut tx).await?;
        let conflicted: HashSet<LocalId> =
            entities::get_by_status(&mut tx, &[SyncStatus::Conflicted])
                .await?
                .into_iter()
                .map(|entity| entity.local_id)
                .collect();

        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for op in queue {
            if batch.len() >= max_n {
                break;
            }
            if !seen.insert(op.entity_local_id.clone()) {
                continue;
            }
            if op.is_terminal()
                || exclude.contains(&op.entity_local_id)
                || conflicted.contains(&op.entity_local_id)
            {
                continue;
            }
            batch.push(op);
        }

        tx.commit().await?;
        Ok(batch)
    }

    /// Remove an operation from the log.
    pub async fn ack(&self, operation_id: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        operations::delete(&mut conn, operation_id).await?;
        Ok(())
    }

    /// Record an accepted push: drop the operation, rebase the entity's later
    /// operations onto the new version and update the entity, in one
    /// transaction. Returns the entity as stored afterwards.
    pub async fn complete(
        &self,
        operation: &Operation,
        remote_id: Option<&str>,
        new_version: u64,
    ) -> Result<Option<Entity>> {
        let mut tx = self.begin().await?;
        operations::delete(&mut tx, &operation.operation_id).await?;
        let local_id = operation.entity_local_id.as_str();

        if operation.kind == OperationKind::Delete {
            operations::delete_for_entity(&mut tx, local_id).await?;
            entities::delete(&mut tx, local_id).await?;
            conflicts::delete(&mut tx, local_id).await?;
            tx.commit().await?;
            return Ok(None);
        }

        let Some(mut entity) = entities::get(&mut tx, local_id).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let remote_id = remote_id
            .map(str::to_string)
            .or_else(|| entity.remote_id.clone());
        operations::rebase(&mut tx, local_id, remote_id.as_deref(), new_version).await?;
        entity.remote_id = remote_id;

        let remaining = operations::for_entity(&mut tx, local_id).await?;
        match remaining.first() {
            Some(next) => {
                entity.version = entity.version.max(new_version);
                if entity.sync_status != SyncStatus::Conflicted {
                    entity.sync_status = status_for(next.kind);
                }
            }
            None => {
                entity.version = new_version;
                // The authority stamps every accepted write with the
                // operation's creation time.
                entity.updated_at_remote = Some(operation.created_at);
                entity.sync_status = SyncStatus::Synced;
            }
        }
        entities::upsert(&mut tx, &entity).await?;

        tx.commit().await?;
        Ok(Some(entity))
    }

    /// Record a retryable push failure. Returns true if the operation just
    /// became terminal because it reached the retry ceiling.
    pub async fn mark_failed(&self, operation_id: &str, error: &str) -> Result<bool> {
        self.record_failure(operation_id, error, true).await
    }

    /// Move an operation straight to the terminal failed set.
    pub async fn fail_permanently(&self, operation_id: &str, error: &str) -> Result<bool> {
        self.record_failure(operation_id, error, false).await
    }

    async fn record_failure(&self, operation_id: &str, error: &str, retryable: bool) -> Result<bool> {
        let mut tx = self.begin().await?;
        let Some(op) = operations::get(&mut tx, operation_id).await? else {
            tx.commit().await?;
            return Ok(false);
        };

        let attempts = op.attempt_count + 1;
        let terminal = !retryable || attempts >= self.max_attempts;
        operations::record_failure(&mut tx, operation_id, error, crate::now_millis(), terminal)
            .await?;
        if terminal {
            entities::set_status(&mut tx, &op.entity_local_id, SyncStatus::Failed).await?;
        }

        tx.commit().await?;
        Ok(terminal)
    }

    /// Re-queue an entity's terminally failed operations with a fresh attempt
    /// budget. Returns false if nothing was failed.
    pub async fn retry_failed(&self, local_id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        let reset = operations::reset_failed(&mut tx, local_id).await?;
        if reset == 0 {
            tx.commit().await?;
            return Ok(false);
        }
        if let Some(head) = operations::for_entity(&mut tx, local_id).await?.first() {
            entities::set_status(&mut tx, local_id, status_for(head.kind)).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Drop every queued operation of an entity that has a terminally failed
    /// head. A never-pushed entity is removed; otherwise it falls back to the
    /// last acknowledged version. Returns the entity as stored afterwards.
    pub async fn discard_failed(&self, local_id: &str) -> Result<Option<Entity>> {
        let mut tx = self.begin().await?;
        let ops = operations::for_entity(&mut tx, local_id).await?;
        let Some(head) = ops.first().filter(|op| op.is_terminal()) else {
            tx.commit().await?;
            return Ok(None);
        };
        let base_version = head.base_version;

        operations::delete_for_entity(&mut tx, local_id).await?;
        let entity = match entities::get(&mut tx, local_id).await? {
            Some(entity) if entity.remote_id.is_none() => {
                entities::delete(&mut tx, local_id).await?;
                None
            }
            Some(mut entity) => {
                entity.version = base_version;
                entity.sync_status = SyncStatus::Synced;
                entities::upsert(&mut tx, &entity).await?;
                Some(entity)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(entity)
    }

    // Checkpoint

    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let mut conn = self.acquire().await?;
        checkpoint::get(&mut conn).await
    }

    /// Rewind the checkpoint to zero so the next pull fetches everything.
    pub async fn reset_checkpoint(&self) -> Result<()> {
        let mut conn = self.acquire().await?;
        checkpoint::reset(&mut conn).await
    }

    // Conflicts

    /// Conflicts parked for an external decision.
    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut conn = self.acquire().await?;
        conflicts::all(&mut conn).await
    }

    pub async fn conflict(&self, local_id: &str) -> Result<Option<ConflictRecord>> {
        let mut conn = self.acquire().await?;
        conflicts::get(&mut conn, local_id).await
    }

    /// Park an entity as `Conflicted` with its conflict record.
    pub async fn park_conflict(&self, record: &ConflictRecord) -> Result<()> {
        let mut tx = self.begin().await?;
        park(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Entity status implied by the operation at the head of its queue.
pub(crate) fn status_for(kind: OperationKind) -> SyncStatus {
    match kind {
        OperationKind::Create => SyncStatus::PendingCreate,
        OperationKind::Update => SyncStatus::PendingUpdate,
        OperationKind::Delete => SyncStatus::PendingDelete,
    }
}

/// Mark the entity `Conflicted` and persist the record.
pub(crate) async fn park(conn: &mut sqlx::SqliteConnection, record: &ConflictRecord) -> Result<()> {
    entities::set_status(conn, &record.local.local_id, SyncStatus::Conflicted).await?;
    conflicts::save(conn, record).await
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
