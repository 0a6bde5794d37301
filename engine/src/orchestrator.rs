//! The sync cycle.
//!
//! One cycle walks `Idle -> PullingDeletes -> PullingChanges -> ApplyingRemote
//! -> DrainingQueue -> Idle`:
//!
//! 1. Fetch remote tombstones and changes since the checkpoint.
//! 2. Apply both and advance the checkpoint in a single transaction.
//! 3. Push every queued operation once, resolving conflicts as they come back.
//!
//! While a create has been attempted but not acknowledged the checkpoint is
//! held, since remote rows for it cannot be matched yet. Once the drain
//! confirms such creates the cycle pulls and drains one more time.
//!
//! Network failures stop the cycle early and are reported through the status
//! stream; the next trigger picks up where this one left off. Only local
//! storage errors end a cycle with an error.

use crate::conflict::{ConflictRecord, ConflictResolver, Resolution, ResolutionKind};
use crate::gateway::{Checkpoint, NetworkError, PushResult, Rejection, RemoteGateway};
use crate::status::{EngineStatus, StatusHub};
use crate::store::{self, checkpoint, entities, operations, LocalStore};
use crate::{
    error::Result, Entity, EngineConfig, LocalId, Operation, OperationId, OperationKind,
    SyncStatus,
};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CyclePhase {
    #[default]
    Idle,
    PullingDeletes,
    PullingChanges,
    ApplyingRemote,
    DrainingQueue,
    /// A local storage error ended the last cycle
    Failed,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Local entities removed because of remote tombstones
    pub deletions_applied: usize,
    /// Remote entities received
    pub entities_pulled: usize,
    /// Operations acknowledged by the authority
    pub operations_pushed: usize,
    /// Conflicts detected, with the decision taken
    pub conflicts: Vec<ConflictRecord>,
    /// Entities whose pending local change lost to the remote copy
    pub overwritten: Vec<LocalId>,
    /// Operations that became terminally failed
    pub failed: Vec<OperationId>,
    /// A retryable failure left work for a later cycle
    pub retry_pending: bool,
    /// The network error that stopped the cycle early
    pub network_error: Option<String>,
    pub cancelled: bool,
    /// Checkpoint after the cycle
    pub checkpoint: Checkpoint,
    #[serde(skip)]
    pub duration: Duration,
}

impl SyncReport {
    /// True when the cycle neither stopped early nor left retries behind.
    pub fn is_clean(&self) -> bool {
        !self.retry_pending && self.network_error.is_none() && !self.cancelled
    }
}

/// Runs sync cycles against one store and one gateway.
///
/// Does not guard against concurrent cycles itself; the
/// [`crate::TriggerCoordinator`] owns single-flight.
pub struct SyncOrchestrator {
    store: LocalStore,
    gateway: Arc<dyn RemoteGateway>,
    resolver: Arc<dyn ConflictResolver>,
    status: StatusHub,
    batch_size: usize,
    request_timeout: Duration,
    phase: RwLock<CyclePhase>,
    cancel: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        gateway: Arc<dyn RemoteGateway>,
        resolver: Arc<dyn ConflictResolver>,
        status: StatusHub,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            resolver,
            status,
            batch_size: config.push_batch_size.max(1),
            request_timeout: config.request_timeout,
            phase: RwLock::new(CyclePhase::Idle),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    /// Ask the running cycle to stop after the operation in flight.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
        tracing::debug!(?phase, "sync phase");
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let span = tracing::info_span!("sync_cycle");
        async {
            self.cancel.store(false, Ordering::SeqCst);
            let started = Instant::now();
            self.status.emit(EngineStatus::Syncing);

            let mut report = SyncReport::default();
            let outcome = self.cycle(&mut report).await;
            report.duration = started.elapsed();

            match outcome {
                Ok(()) => {
                    self.set_phase(CyclePhase::Idle);
                    if let Ok(count) = self.store.pending_count().await {
                        self.status.emit(EngineStatus::PendingCount { count });
                    }
                    match &report.network_error {
                        Some(message) => self.status.emit(EngineStatus::Error {
                            message: message.clone(),
                        }),
                        None => self.status.emit(EngineStatus::Idle),
                    }
                    tracing::info!(
                        pushed = report.operations_pushed,
                        pulled = report.entities_pulled,
                        deleted = report.deletions_applied,
                        conflicts = report.conflicts.len(),
                        failed = report.failed.len(),
                        retry_pending = report.retry_pending,
                        cancelled = report.cancelled,
                        elapsed_ms = report.duration.as_millis() as u64,
                        "sync cycle finished"
                    );
                    Ok(report)
                }
                Err(err) => {
                    self.set_phase(CyclePhase::Failed);
                    tracing::error!(error = %err, "sync cycle failed");
                    self.status.emit(EngineStatus::Error {
                        message: err.to_string(),
                    });
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn cycle(&self, report: &mut SyncReport) -> Result<()> {
        // Shared by both passes so a failed entity is not pushed twice.
        let mut blocked: HashSet<LocalId> = HashSet::new();
        let mut retried: HashSet<LocalId> = HashSet::new();

        for pass in 0..2 {
            if pass > 0 {
                tracing::debug!("creates confirmed, pulling again");
            }
            let Some(held) = self.pull_and_apply(report).await? else {
                return Ok(());
            };

            self.set_phase(CyclePhase::DrainingQueue);
            self.drain(report, &mut blocked, &mut retried).await?;
            if !held || report.cancelled || self.store.has_unconfirmed_create().await? {
                break;
            }
        }
        Ok(())
    }

    /// Pull and apply remote state. Returns `None` when the cycle should stop,
    /// otherwise whether the checkpoint was held back.
    async fn pull_and_apply(&self, report: &mut SyncReport) -> Result<Option<bool>> {
        let since = self.store.checkpoint().await?;
        report.checkpoint = since;

        self.set_phase(CyclePhase::PullingDeletes);
        let deletions = match self.call(self.gateway.pull_deletions(since)).await {
            Ok(deletions) => deletions,
            Err(err) => {
                self.pause(report, err);
                return Ok(None);
            }
        };
        if self.cancelled() {
            report.cancelled = true;
            return Ok(None);
        }

        self.set_phase(CyclePhase::PullingChanges);
        let changes = match self.call(self.gateway.pull_changes(since)).await {
            Ok(changes) => changes,
            Err(err) => {
                self.pause(report, err);
                return Ok(None);
            }
        };
        if self.cancelled() {
            report.cancelled = true;
            return Ok(None);
        }

        self.set_phase(CyclePhase::ApplyingRemote);
        // Anything changed between the two pulls is fetched again next time.
        let next = deletions.next_checkpoint.min(changes.next_checkpoint);
        let held = self
            .apply_remote(&deletions.remote_ids, changes.entities, next, report)
            .await?;
        if self.cancelled() {
            report.cancelled = true;
            return Ok(None);
        }
        Ok(Some(held))
    }

    fn pause(&self, report: &mut SyncReport, err: NetworkError) {
        tracing::warn!(error = %err, "sync paused");
        report.network_error = Some(err.to_string());
        report.retry_pending = err.retryable;
    }

    async fn call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, NetworkError>>,
    ) -> std::result::Result<T, NetworkError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::timeout(self.request_timeout)),
        }
    }

    async fn apply_remote(
        &self,
        deleted: &[String],
        changed: Vec<Entity>,
        next: Checkpoint,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let now = crate::now_millis();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;

        for remote_id in deleted {
            let Some(local) = entities::get_by_remote_id(&mut tx, remote_id).await? else {
                continue;
            };
            match local.sync_status {
                SyncStatus::Synced | SyncStatus::PendingDelete => {
                    operations::delete_for_entity(&mut tx, &local.local_id).await?;
                    entities::delete(&mut tx, &local.local_id).await?;
                    store::conflicts::delete(&mut tx, &local.local_id).await?;
                    report.deletions_applied += 1;
                }
                SyncStatus::Conflicted => {}
                _ => {
                    tracing::info!(local_id = %local.local_id, "remote delete of locally edited entity");
                    let local_id = local.local_id.clone();
                    let record =
                        ConflictRecord::new(local, None, ResolutionKind::RequiresUserInput, now);
                    store::park(&mut tx, &record).await?;
                    report.conflicts.push(record);
                    events.push(EngineStatus::EntityConflicted { local_id });
                }
            }
        }

        for remote in changed {
            report.entities_pulled += 1;
            let Some(remote_id) = remote.remote_id.clone() else {
                tracing::warn!(local_id = %remote.local_id, "pulled entity without remote id");
                continue;
            };

            let local = match entities::get_by_remote_id(&mut tx, &remote_id).await? {
                Some(local) => Some(local),
                None => entities::get(&mut tx, &remote.local_id).await?,
            };

            let Some(local) = local else {
                let mut fresh = remote.clone();
                fresh.sync_status = SyncStatus::Synced;
                entities::upsert(&mut tx, &fresh).await?;
                continue;
            };

            match local.sync_status {
                SyncStatus::Conflicted => continue,
                SyncStatus::Synced => {
                    if remote.version >= local.version {
                        let mut updated = local;
                        updated.accept_remote(&remote);
                        entities::upsert(&mut tx, &updated).await?;
                    }
                    continue;
                }
                _ => {}
            }

            let queued = operations::for_entity(&mut tx, &local.local_id).await?;
            let Some(head) = queued.first() else {
                let mut updated = local;
                updated.accept_remote(&remote);
                entities::upsert(&mut tx, &updated).await?;
                continue;
            };
            // Our own create already landed; the retried push is deduplicated
            // and the checkpoint stays put until it is.
            if head.kind == OperationKind::Create && local.remote_id.is_none() {
                continue;
            }
            if head.base_version >= remote.version {
                continue;
            }

            let has_delete = queued.iter().any(|op| op.kind == OperationKind::Delete);
            self.settle(&mut tx, local, &remote, has_delete, now, report, &mut events)
                .await?;
        }

        // A create whose acknowledgement was lost has no remote id yet, so
        // later changes and tombstones for it cannot be matched. Keep pulling
        // from here until it is confirmed.
        let held = operations::has_unconfirmed_create(&mut tx).await?;
        report.checkpoint = if held {
            tracing::debug!(next = %next, "checkpoint held for unconfirmed creates");
            checkpoint::get(&mut tx).await?
        } else {
            checkpoint::advance(&mut tx, next).await?
        };
        tx.commit().await?;

        for event in events {
            self.status.emit(event);
        }
        Ok(held)
    }

    /// Apply the resolver's decision for one conflicting entity.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        conn: &mut SqliteConnection,
        local: Entity,
        remote: &Entity,
        has_delete: bool,
        now: u64,
        report: &mut SyncReport,
        events: &mut Vec<EngineStatus>,
    ) -> Result<()> {
        let resolution = match self.resolver.resolve(&local, remote) {
            Resolution::Merged(_) if has_delete => Resolution::UseLocal,
            resolution => resolution,
        };
        tracing::info!(
            local_id = %local.local_id,
            local_version = local.version,
            remote_version = remote.version,
            resolver = self.resolver.name(),
            decision = ?resolution.kind(),
            "conflict resolved"
        );
        let record =
            ConflictRecord::new(local.clone(), Some(remote.clone()), resolution.kind(), now);
        let local_id = local.local_id.clone();
        let remote_id = remote.remote_id.clone().or_else(|| local.remote_id.clone());

        match resolution {
            Resolution::UseLocal => {
                let mut kept = local;
                kept.remote_id = remote_id.clone();
                kept.version = remote.version + 1;
                kept.updated_at_remote = remote.updated_at_remote;
                operations::rebase(conn, &local_id, remote_id.as_deref(), remote.version).await?;
                entities::upsert(conn, &kept).await?;
            }
            Resolution::UseRemote => {
                let mut replaced = local;
                replaced.accept_remote(remote);
                operations::delete_for_entity(conn, &local_id).await?;
                store::conflicts::delete(conn, &local_id).await?;
                entities::upsert(conn, &replaced).await?;
                report.overwritten.push(local_id.clone());
                events.push(EngineStatus::LocalChangeOverwritten {
                    local_id: local_id.clone(),
                });
            }
            Resolution::Merged(merged) => {
                let mut kept = local;
                kept.payload = merged.payload;
                kept.remote_id = remote_id;
                kept.version = remote.version + 1;
                kept.updated_at_local = now;
                kept.updated_at_remote = remote.updated_at_remote;
                kept.sync_status = SyncStatus::PendingUpdate;
                operations::delete_for_entity(conn, &local_id).await?;
                operations::insert(conn, &Operation::update(&kept, remote.version, now)).await?;
                entities::upsert(conn, &kept).await?;
            }
            Resolution::RequiresUserInput => {
                store::park(conn, &record).await?;
                events.push(EngineStatus::EntityConflicted {
                    local_id: local_id.clone(),
                });
            }
        }

        report.conflicts.push(record);
        Ok(())
    }

    async fn drain(
        &self,
        report: &mut SyncReport,
        blocked: &mut HashSet<LocalId>,
        retried: &mut HashSet<LocalId>,
    ) -> Result<()> {
        loop {
            if self.cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let batch = self.store.dequeue_batch(self.batch_size, blocked).await?;
            if batch.is_empty() {
                return Ok(());
            }

            for op in batch {
                if self.cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                let result = match tokio::time::timeout(self.request_timeout, self.gateway.push(&op))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => PushResult::from(NetworkError::timeout(self.request_timeout)),
                };
                self.handle_push(&op, result, blocked, retried, report)
                    .await?;
            }
        }
    }

    async fn handle_push(
        &self,
        op: &Operation,
        result: PushResult,
        blocked: &mut HashSet<LocalId>,
        retried: &mut HashSet<LocalId>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local_id = &op.entity_local_id;

        match result {
            PushResult::Accepted {
                remote_id,
                new_version,
            } => {
                tracing::debug!(
                    operation_id = %op.operation_id,
                    kind = op.kind.as_str(),
                    new_version,
                    "push accepted"
                );
                self.store
                    .complete(op, remote_id.as_deref(), new_version)
                    .await?;
                report.operations_pushed += 1;
            }
            PushResult::Rejected {
                rejection: Rejection::VersionConflict { remote },
            } => {
                if !retried.insert(local_id.clone()) {
                    tracing::warn!(local_id = %local_id, "conflicted again in the same cycle");
                    blocked.insert(local_id.clone());
                    report.retry_pending = true;
                    return Ok(());
                }
                let mut events = Vec::new();
                let mut tx = self.store.begin().await?;
                match entities::get(&mut tx, local_id).await? {
                    Some(local) => {
                        let queued = operations::for_entity(&mut tx, local_id).await?;
                        let has_delete = queued.iter().any(|q| q.kind == OperationKind::Delete);
                        let now = crate::now_millis();
                        self.settle(&mut tx, local, &remote, has_delete, now, report, &mut events)
                            .await?;
                    }
                    None => {
                        operations::delete_for_entity(&mut tx, local_id).await?;
                    }
                }
                tx.commit().await?;
                for event in events {
                    self.status.emit(event);
                }
            }
            PushResult::Rejected {
                rejection: Rejection::Gone,
            } => {
                if op.kind == OperationKind::Delete {
                    self.store.complete(op, None, op.base_version).await?;
                    report.operations_pushed += 1;
                    return Ok(());
                }
                let Some(local) = self.store.get(local_id).await? else {
                    return Ok(());
                };
                tracing::info!(local_id = %local_id, "pushed entity was deleted remotely");
                let record = ConflictRecord::new(
                    local,
                    None,
                    ResolutionKind::RequiresUserInput,
                    crate::now_millis(),
                );
                self.store.park_conflict(&record).await?;
                report.conflicts.push(record);
                self.status.emit(EngineStatus::EntityConflicted {
                    local_id: local_id.clone(),
                });
            }
            PushResult::Failed { retryable, message } => {
                blocked.insert(local_id.clone());
                let terminal = if retryable {
                    self.store.mark_failed(&op.operation_id, &message).await?
                } else {
                    self.store.fail_permanently(&op.operation_id, &message).await?
                };
                if terminal {
                    tracing::warn!(
                        operation_id = %op.operation_id,
                        error = %message,
                        "operation failed permanently"
                    );
                    report.failed.push(op.operation_id.clone());
                    self.status.emit(EngineStatus::EntityFailed {
                        local_id: local_id.clone(),
                        operation_id: op.operation_id.clone(),
                        error: message,
                    });
                } else {
                    tracing::debug!(operation_id = %op.operation_id, error = %message, "push failed, will retry");
                    report.retry_pending = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{LastWriteWins, UserPrompt};
    use crate::gateway::memory::MemoryGateway;
    use serde_json::json;

    struct Harness {
        store: LocalStore,
        gateway: Arc<MemoryGateway>,
        orchestrator: SyncOrchestrator,
    }

    async fn harness(resolver: Arc<dyn ConflictResolver>) -> Harness {
        let store = LocalStore::in_memory().await.unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            gateway.clone(),
            resolver,
            StatusHub::new(),
            &EngineConfig::default(),
        );
        Harness {
            store,
            gateway,
            orchestrator,
        }
    }

    async fn local_create(store: &LocalStore, payload: serde_json::Value) -> Entity {
        let entity = Entity::new_local("todos", payload, crate::now_millis());
        store.upsert(&entity).await.unwrap();
        store
            .enqueue(&Operation::create(&entity, entity.updated_at_local))
            .await
            .unwrap();
        entity
    }

    #[tokio::test]
    async fn cycle_pushes_and_pulls() {
        let h = harness(Arc::new(LastWriteWins)).await;
        let mine = local_create(&h.store, json!({"title": "mine"})).await;
        let theirs = h.gateway.remote_create("todos", json!({"title": "theirs"}), 1000);

        let report = h.orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.operations_pushed, 1);
        assert_eq!(report.entities_pulled, 1);
        assert!(report.is_clean());
        assert_eq!(h.orchestrator.phase(), CyclePhase::Idle);

        let mine = h.store.get(&mine.local_id).await.unwrap().unwrap();
        assert_eq!(mine.sync_status, SyncStatus::Synced);
        assert!(mine.remote_id.is_some());

        let theirs = h.store.get(&theirs.local_id).await.unwrap().unwrap();
        assert_eq!(theirs.payload, json!({"title": "theirs"}));
    }

    #[tokio::test]
    async fn offline_cycle_pauses() {
        let h = harness(Arc::new(LastWriteWins)).await;
        local_create(&h.store, json!({"title": "A"})).await;
        h.gateway.set_online(false);

        let report = h.orchestrator.run_cycle().await.unwrap();

        assert!(report.network_error.is_some());
        assert!(report.retry_pending);
        assert_eq!(report.operations_pushed, 0);
        let ops = h.store.operations().await.unwrap();
        assert_eq!(ops[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn timeouts_count_as_retryable_failures() {
        let store = LocalStore::in_memory().await.unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            gateway.clone(),
            Arc::new(LastWriteWins),
            StatusHub::new(),
            &EngineConfig::default().with_request_timeout(Duration::from_millis(20)),
        );
        local_create(&store, json!({"title": "A"})).await;
        gateway.set_latency(Some(Duration::from_millis(200)));

        let report = orchestrator.run_cycle().await.unwrap();

        assert!(report.network_error.unwrap().contains("timed out"));
        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::ZERO);
    }

    #[tokio::test]
    async fn user_prompt_parks_pulled_conflict() {
        let h = harness(Arc::new(UserPrompt)).await;
        let remote = h.gateway.remote_create("todos", json!({"title": "A"}), 1000);
        h.orchestrator.run_cycle().await.unwrap();

        let mut local = h.store.get(&remote.local_id).await.unwrap().unwrap();
        local.apply_local_update(json!({"title": "local"}), 3000);
        h.store.upsert(&local).await.unwrap();
        h.store
            .enqueue(&Operation::update(&local, 1, 3000))
            .await
            .unwrap();
        h.gateway
            .remote_edit(remote.remote_id.as_deref().unwrap(), json!({"title": "remote"}), 2000);

        let report = h.orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.operations_pushed, 0);
        let stored = h.store.get(&remote.local_id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflicted);
        assert_eq!(h.store.conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_after_operation_in_flight() {
        let h = harness(Arc::new(LastWriteWins)).await;
        for n in 0..3 {
            local_create(&h.store, json!({ "n": n })).await;
        }
        h.gateway.set_latency(Some(Duration::from_millis(60)));

        let (report, _) = tokio::join!(h.orchestrator.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            h.orchestrator.cancel();
        });
        let report = report.unwrap();

        assert!(report.cancelled);
        assert!(report.operations_pushed >= 1 && report.operations_pushed < 3);
        let remaining = h.store.operations().await.unwrap().len();
        assert_eq!(remaining + report.operations_pushed, 3);
        assert_eq!(h.gateway.entities().len(), report.operations_pushed);
    }
}
