//! Sync status stream.
//!
//! Hosts subscribe with [`crate::Repository::observe_sync_status`] and render
//! what they receive. Network problems during a sync are only ever reported
//! here, never returned from reads or writes.

use crate::{LocalId, OperationId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// One status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineStatus {
    /// No cycle running
    Idle,
    /// A sync cycle started
    Syncing,
    /// The last cycle stopped early
    Error { message: String },
    /// Operations still waiting to be pushed
    PendingCount { count: usize },

    // Per-entity detail
    #[serde(rename_all = "camelCase")]
    EntityFailed {
        local_id: LocalId,
        operation_id: OperationId,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    EntityConflicted { local_id: LocalId },
    /// A remote version replaced a pending local change
    #[serde(rename_all = "camelCase")]
    LocalChangeOverwritten { local_id: LocalId },
}

/// Fan-out point for status events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatusHub {
    sender: broadcast::Sender<EngineStatus>,
    last: Arc<Mutex<EngineStatus>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            last: Arc::new(Mutex::new(EngineStatus::Idle)),
        }
    }

    pub fn emit(&self, status: EngineStatus) {
        tracing::trace!(?status, "status");
        if matches!(
            status,
            EngineStatus::Idle | EngineStatus::Syncing | EngineStatus::Error { .. }
        ) {
            *self.last.lock() = status.clone();
        }
        // No subscribers is fine.
        let _ = self.sender.send(status);
    }

    /// Last phase-level status (`Idle`, `Syncing` or `Error`).
    pub fn current(&self) -> EngineStatus {
        self.last.lock().clone()
    }

    pub fn subscribe(&self) -> StatusStream {
        StatusStream {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A subscription to [`EngineStatus`] events.
#[derive(Debug)]
pub struct StatusStream {
    receiver: broadcast::Receiver<EngineStatus>,
}

impl StatusStream {
    /// Next event. Events missed by a slow subscriber are skipped.
    /// Returns `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<EngineStatus> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EngineStatus> {
        loop {
            match self.receiver.try_recv() {
                Ok(status) => return Some(status),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<EngineStatus> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
