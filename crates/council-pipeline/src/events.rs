//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, UI, tests) can subscribe to run progress
//! without coupling to the engine internals. Synchronous [`EventListener`]s
//! may also be registered; each listener call is guarded so a failing or
//! panicking listener is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use council_types::{ActionLifecycle, PhaseLifecycle};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline_id: String,
        phase_count: usize,
    },
    RunCompleted {
        run_id: String,
        pipeline_id: String,
        duration_ms: u64,
    },
    RunFailed {
        run_id: String,
        pipeline_id: String,
        error: String,
    },
    AbortRequested {
        run_id: String,
    },
    RunPaused {
        run_id: String,
    },
    RunResumed {
        run_id: String,
    },
    PhaseLifecycle {
        run_id: String,
        phase_id: String,
        lifecycle: PhaseLifecycle,
    },
    PhaseFailed {
        run_id: String,
        phase_id: String,
        error: String,
    },
    PhaseConsolidated {
        run_id: String,
        phase_id: String,
        policy: String,
    },
    ActionLifecycle {
        run_id: String,
        phase_id: String,
        action_id: String,
        lifecycle: ActionLifecycle,
        attempt: u32,
    },
    ActionRetrying {
        run_id: String,
        phase_id: String,
        action_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ActionFailed {
        run_id: String,
        phase_id: String,
        action_id: String,
        attempts: u32,
        error: String,
    },
    ParticipantResponded {
        run_id: String,
        action_id: String,
        position_id: String,
        round: u32,
        success: bool,
    },
    OutputRouted {
        run_id: String,
        phase_id: String,
        action_id: String,
        target: String,
    },
    GavelRequested {
        run_id: String,
        key: String,
        prompt: String,
        value: Value,
    },
    GavelResolved {
        run_id: String,
        key: String,
        skipped: bool,
    },
}

impl PipelineEvent {
    /// The snake_case name of the event, as it appears in the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::RunStarted { .. } => "run_started",
            PipelineEvent::RunCompleted { .. } => "run_completed",
            PipelineEvent::RunFailed { .. } => "run_failed",
            PipelineEvent::AbortRequested { .. } => "abort_requested",
            PipelineEvent::RunPaused { .. } => "run_paused",
            PipelineEvent::RunResumed { .. } => "run_resumed",
            PipelineEvent::PhaseLifecycle { .. } => "phase_lifecycle",
            PipelineEvent::PhaseFailed { .. } => "phase_failed",
            PipelineEvent::PhaseConsolidated { .. } => "phase_consolidated",
            PipelineEvent::ActionLifecycle { .. } => "action_lifecycle",
            PipelineEvent::ActionRetrying { .. } => "action_retrying",
            PipelineEvent::ActionFailed { .. } => "action_failed",
            PipelineEvent::ParticipantResponded { .. } => "participant_responded",
            PipelineEvent::OutputRouted { .. } => "output_routed",
            PipelineEvent::GavelRequested { .. } => "gavel_requested",
            PipelineEvent::GavelResolved { .. } => "gavel_resolved",
        }
    }
}

/// A synchronous observer. Returning `Err` is logged and otherwise ignored.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent) -> Result<(), String>;
}

impl<F> EventListener for F
where
    F: Fn(&PipelineEvent) -> Result<(), String> + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) -> Result<(), String> {
        self(event)
    }
}

/// Event bus wrapping a broadcast sender plus a list of listeners.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Emit an event to every listener and subscriber.
    ///
    /// If there are no active receivers the broadcast copy is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = event.name(), error = %e, "Event listener failed");
                }
                Err(_) => {
                    tracing::warn!(event = event.name(), "Event listener panicked");
                }
            }
        }
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
