//! Deciding when to sync.
//!
//! Triggers arrive over a channel from [`TriggerHandle`]s and
//! [`TriggerSource`]s. A single worker task runs one cycle at a time; triggers
//! that arrive while a cycle runs collapse into one re-run right after it.
//! Retryable failures arm a [`Trigger::Retry`] after an exponential backoff.

use crate::config::BackoffConfig;
use crate::orchestrator::{SyncOrchestrator, SyncReport};
use crate::{error::Result, Error};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TRIGGER_BUFFER: usize = 64;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The host regained network access
    ConnectivityRestored,
    /// Timer tick
    Periodic,
    /// The host asked for a sync now
    Explicit,
    /// Backoff elapsed after a retryable failure
    Retry,
}

/// Whether a cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Running,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub cycles_completed: u64,
    /// Error text of the last cycle, if it ended badly
    pub last_error: Option<String>,
}

/// Cloneable sender of triggers.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    sender: mpsc::Sender<Trigger>,
}

impl TriggerHandle {
    /// Request a cycle. A full buffer means a cycle is already due, so the
    /// trigger is dropped.
    pub fn fire(&self, trigger: Trigger) -> Result<()> {
        match self.sender.try_send(trigger) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::CoordinatorStopped),
        }
    }

    pub fn sync_now(&self) -> Result<()> {
        self.fire(Trigger::Explicit)
    }

    pub fn connectivity_restored(&self) -> Result<()> {
        self.fire(Trigger::ConnectivityRestored)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Something that fires triggers on its own schedule.
///
/// `run` should return once `handle` reports the coordinator stopped.
#[async_trait]
pub trait TriggerSource: Send + Sync + 'static {
    async fn run(&self, handle: TriggerHandle);
}

/// Fires [`Trigger::Periodic`] every `interval`. The first tick comes after
/// one full interval.
#[derive(Debug, Clone)]
pub struct PeriodicTrigger {
    interval: Duration,
}

impl PeriodicTrigger {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl TriggerSource for PeriodicTrigger {
    async fn run(&self, handle: TriggerHandle) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if handle.fire(Trigger::Periodic).is_err() {
                return;
            }
        }
    }
}

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

struct Inner {
    orchestrator: Arc<SyncOrchestrator>,
    single_flight: Mutex<()>,
    status: watch::Sender<CoordinatorStatus>,
}

impl Inner {
    async fn run_cycle(&self) -> Result<SyncReport> {
        self.run_cycle_after(|| ()).await
    }

    /// Like [`Inner::run_cycle`], calling `on_start` once the cycle holds the
    /// single-flight lock and before it pulls anything.
    async fn run_cycle_after(&self, on_start: impl FnOnce()) -> Result<SyncReport> {
        let _flight = self.single_flight.lock().await;
        on_start();
        self.status
            .send_modify(|status| status.state = CoordinatorState::Running);

        let result = self.orchestrator.run_cycle().await;

        let last_error = match &result {
            Ok(report) => report.network_error.clone(),
            Err(err) => Some(err.to_string()),
        };
        self.status.send_modify(|status| {
            status.state = CoordinatorState::Idle;
            status.cycles_completed += 1;
            status.last_error = last_error;
        });
        result
    }
}

/// Owns the sync worker and enforces one cycle at a time.
pub struct TriggerCoordinator {
    inner: Arc<Inner>,
    handle: TriggerHandle,
    shutdown: watch::Sender<bool>,
    worker: SyncMutex<Option<JoinHandle<()>>>,
    sources: SyncMutex<Vec<JoinHandle<()>>>,
}

impl TriggerCoordinator {
    /// Spawn the worker and the given sources. Needs a Tokio runtime.
    pub fn start(
        orchestrator: Arc<SyncOrchestrator>,
        backoff: BackoffConfig,
        sources: Vec<Box<dyn TriggerSource>>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(TRIGGER_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status, _) = watch::channel(CoordinatorStatus::default());
        let inner = Arc::new(Inner {
            orchestrator,
            single_flight: Mutex::new(()),
            status,
        });
        let handle = TriggerHandle { sender };

        let worker = tokio::spawn(worker_loop(
            inner.clone(),
            receiver,
            shutdown_rx,
            Backoff::new(backoff),
        ));
        let sources = sources
            .into_iter()
            .map(|source| {
                let handle = handle.clone();
                tokio::spawn(async move { source.run(handle).await })
            })
            .collect();

        Self {
            inner,
            handle,
            shutdown,
            worker: SyncMutex::new(Some(worker)),
            sources: SyncMutex::new(sources),
        }
    }

    pub fn handle(&self) -> TriggerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.inner.status.subscribe()
    }

    /// Run a cycle now and wait for its report. Waits for a running cycle to
    /// finish first.
    pub async fn run_now(&self) -> Result<SyncReport> {
        if *self.shutdown.borrow() {
            return Err(Error::CoordinatorStopped);
        }
        self.inner.run_cycle().await
    }

    /// Ask the running cycle to stop after its current operation.
    pub fn cancel_cycle(&self) {
        self.inner.orchestrator.cancel();
    }

    /// Wait until at least `count` cycles have completed.
    pub async fn wait_for_cycles(&self, count: u64) -> Result<CoordinatorStatus> {
        let mut rx = self.subscribe();
        let status = rx
            .wait_for(|status| status.cycles_completed >= count)
            .await
            .map_err(|_| Error::CoordinatorStopped)?;
        Ok(status.clone())
    }

    /// Stop the worker and every source. A running cycle is cancelled
    /// cooperatively and allowed to finish its current operation.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.inner.orchestrator.cancel();
        for source in self.sources.lock().drain(..) {
            source.abort();
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        tracing::debug!("trigger coordinator stopped");
    }
}

impl Drop for TriggerCoordinator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for source in self.sources.get_mut().drain(..) {
            source.abort();
        }
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    mut triggers: mpsc::Receiver<Trigger>,
    mut shutdown: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    let mut retry_at: Option<Instant> = None;

    loop {
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                Trigger::Retry
            }
        };
        tracing::debug!(?trigger, "sync triggered");

        loop {
            retry_at = None;
            // Triggers queued while another cycle held the lock are served by
            // this one.
            let cycle = inner.run_cycle_after(|| {
                let mut absorbed = 0usize;
                while triggers.try_recv().is_ok() {
                    absorbed += 1;
                }
                if absorbed > 0 {
                    tracing::debug!(absorbed, "queued triggers absorbed at cycle start");
                }
            });
            match cycle.await {
                Ok(report) => {
                    if report.operations_pushed > 0 || report.is_clean() {
                        backoff.reset();
                    }
                    if report.retry_pending && !report.cancelled {
                        let delay = backoff.next_delay();
                        tracing::debug!(delay_ms = delay.as_millis() as u64, "retry armed");
                        retry_at = Some(Instant::now() + delay);
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "sync cycle errored, retry armed");
                    retry_at = Some(Instant::now() + delay);
                }
            }

            if *shutdown.borrow() {
                return;
            }
            let mut coalesced = 0usize;
            while triggers.try_recv().is_ok() {
                coalesced += 1;
            }
            if coalesced == 0 {
                break;
            }
            tracing::debug!(coalesced, "triggers coalesced into one re-run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::LastWriteWins;
    use crate::gateway::memory::MemoryGateway;
    use crate::status::StatusHub;
    use crate::{EngineConfig, Entity, LocalStore, Operation, SyncStatus};
    use serde_json::json;

    async fn setup(
        latency: Option<Duration>,
    ) -> (LocalStore, Arc<MemoryGateway>, Arc<SyncOrchestrator>) {
        let store = LocalStore::in_memory().await.unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_latency(latency);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            gateway.clone(),
            Arc::new(LastWriteWins),
            StatusHub::new(),
            &EngineConfig::default(),
        ));
        (store, gateway, orchestrator)
    }

    fn quick_backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn triggers_during_a_cycle_coalesce_into_one_rerun() {
        let (_, _, orchestrator) = setup(Some(Duration::from_millis(50))).await;
        let coordinator = TriggerCoordinator::start(orchestrator, quick_backoff(), Vec::new());
        let handle = coordinator.handle();
        let mut status = coordinator.subscribe();

        handle.sync_now().unwrap();
        status
            .wait_for(|s| s.state == CoordinatorState::Running)
            .await
            .unwrap();
        for _ in 0..5 {
            handle.sync_now().unwrap();
        }

        coordinator.wait_for_cycles(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(coordinator.status().cycles_completed, 2);

        coordinator.shutdown().await;
        assert!(handle.sync_now().is_err());
    }

    #[tokio::test]
    async fn triggers_during_run_now_coalesce_into_one_rerun() {
        let (_, _, orchestrator) = setup(Some(Duration::from_millis(50))).await;
        let coordinator = TriggerCoordinator::start(orchestrator, quick_backoff(), Vec::new());
        let handle = coordinator.handle();

        let (report, _) = tokio::join!(coordinator.run_now(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for _ in 0..5 {
                handle.sync_now().unwrap();
            }
        });
        report.unwrap();

        coordinator.wait_for_cycles(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(coordinator.status().cycles_completed, 2);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn run_now_returns_report() {
        let (store, _, orchestrator) = setup(None).await;
        let entity = Entity::new_local("todos", json!({"title": "A"}), 1000);
        store.upsert(&entity).await.unwrap();
        store.enqueue(&Operation::create(&entity, 1000)).await.unwrap();

        let coordinator = TriggerCoordinator::start(orchestrator, quick_backoff(), Vec::new());
        let report = coordinator.run_now().await.unwrap();

        assert_eq!(report.operations_pushed, 1);
        assert_eq!(coordinator.status().cycles_completed, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_failure_arms_retry() {
        let (store, gateway, orchestrator) = setup(None).await;
        let entity = Entity::new_local("todos", json!({"title": "A"}), 1000);
        store.upsert(&entity).await.unwrap();
        store.enqueue(&Operation::create(&entity, 1000)).await.unwrap();
        gateway.fail_next_pushes(1, true);

        let coordinator = TriggerCoordinator::start(orchestrator, quick_backoff(), Vec::new());
        coordinator.handle().sync_now().unwrap();
        coordinator.wait_for_cycles(2).await.unwrap();

        let stored = store.get(&entity.local_id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_source_fires() {
        let (_, _, orchestrator) = setup(None).await;
        let coordinator = TriggerCoordinator::start(
            orchestrator,
            quick_backoff(),
            vec![Box::new(PeriodicTrigger::new(Duration::from_millis(20)))],
        );

        let status = tokio::time::timeout(Duration::from_secs(5), coordinator.wait_for_cycles(3))
            .await
            .unwrap()
            .unwrap();
        assert!(status.cycles_completed >= 3);
        coordinator.shutdown().await;
    }
}
