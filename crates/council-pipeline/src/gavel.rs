//! Gavel board: human-in-the-loop review points.
//!
//! A `user_gavel` action or a reviewed phase registers a pending gavel and
//! suspends until an external caller resolves it by key, the optional timeout
//! elapses, or the run is aborted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use council_types::{CouncilError, Result};

/// What a gavel is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum GavelKey {
    Action(String),
    Phase(String),
}

impl fmt::Display for GavelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GavelKey::Action(id) => write!(f, "action:{id}"),
            GavelKey::Phase(id) => write!(f, "phase:{id}"),
        }
    }
}

/// A gavel waiting for a decision, as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingGavel {
    pub key: GavelKey,
    pub prompt: String,
    /// The value under review.
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GavelOutcome {
    Resolved(Value),
    TimedOut,
}

struct Slot {
    info: PendingGavel,
    sender: oneshot::Sender<Value>,
}

#[derive(Default)]
pub struct GavelBoard {
    pending: Mutex<HashMap<GavelKey, Slot>>,
}

impl fmt::Debug for GavelBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GavelBoard")
            .field("pending", &self.pending().len())
            .finish()
    }
}

impl GavelBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<GavelKey, Slot>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending gavel. A second request for the same key replaces
    /// the first, whose waiter then sees its channel close.
    fn request(&self, key: GavelKey, prompt: String, value: Value) -> oneshot::Receiver<Value> {
        let (sender, receiver) = oneshot::channel();
        let info = PendingGavel {
            key: key.clone(),
            prompt,
            value,
        };
        self.slots().insert(key, Slot { info, sender });
        receiver
    }

    /// Resolve a pending gavel with the reviewer's value.
    pub fn resolve(&self, key: &GavelKey, value: Value) -> Result<()> {
        let slot = self
            .slots()
            .remove(key)
            .ok_or_else(|| CouncilError::GavelNotPending(key.to_string()))?;
        slot.sender
            .send(value)
            .map_err(|_| CouncilError::GavelNotPending(key.to_string()))
    }

    pub fn pending(&self) -> Vec<PendingGavel> {
        let mut list: Vec<PendingGavel> = self.slots().values().map(|s| s.info.clone()).collect();
        list.sort_by_key(|p| p.key.to_string());
        list
    }

    pub fn is_pending(&self, key: &GavelKey) -> bool {
        self.slots().contains_key(key)
    }

    /// Drop every pending gavel; their waiters observe a closed channel.
    pub fn clear(&self) {
        self.slots().clear();
    }

    /// Suspend until the gavel is resolved, the timeout elapses, or `cancel` fires.
    pub async fn wait(
        &self,
        key: GavelKey,
        prompt: String,
        value: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<GavelOutcome> {
        let receiver = self.request(key.clone(), prompt, value);
        tracing::info!(gavel = %key, "Awaiting gavel");

        let decision = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, receiver).await.ok(),
                None => Some(receiver.await),
            }
        };

        let outcome = tokio::select! {
            d = decision => d,
            _ = cancel.cancelled() => {
                self.slots().remove(&key);
                return Err(CouncilError::Aborted);
            }
        };

        match outcome {
            Some(Ok(value)) => Ok(GavelOutcome::Resolved(value)),
            Some(Err(_)) => Err(CouncilError::Other(format!(
                "gavel '{key}' was withdrawn before it was resolved"
            ))),
            None => {
                self.slots().remove(&key);
                Ok(GavelOutcome::TimedOut)
            }
        }
    }
}
