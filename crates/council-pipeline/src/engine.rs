//! Pipeline execution engine: the run driver.
//!
//! A [`PipelineEngine`] owns the pipeline registry, the single active-run slot,
//! a bounded history of finished runs, the gavel board and the event bus.
//! [`PipelineEngine::start_run`] drives the phases of a pipeline in order.
//! Each phase drives its actions through `called -> start -> in_progress ->
//! complete`, wrapping every attempt in the retry loop and the execution
//! timeout race.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use council_llm::GenerateOptions;
use council_template::{stringify, MacroDefinition, ResolverConfig, TemplateContext, TemplateResolver};
use council_types::{
    ActionLifecycle, ActionState, CouncilError, ParticipantResponse, PhaseLifecycle, PhaseState,
    Result, Run, RunStatus,
};

use crate::collaborators::{Collaborators, ThreadMessage};
use crate::context::{read_stores, ContextAssembler};
use crate::definition::{
    normalize_pipeline, Action, ActionType, Consolidation, ExecutionMode, InputSource,
    OutputTarget, Phase, Pipeline, DEFAULT_ACTION_TIMEOUT_MS,
};
use crate::events::{EventBus, EventListener, PipelineEvent};
use crate::gavel::{GavelBoard, GavelKey, GavelOutcome, PendingGavel};
use crate::handlers::{handler_for, ActionContext, ActionOutcome};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::routing::{apply_local, consolidate, deliver_external, get_path, Destination};
use crate::validation::{validate_or_raise, Diagnostic, Severity};

const DEFAULT_SYNTHESIS_PROMPT: &str =
    "Synthesize the following outputs into one coherent result. Keep every important point.";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine settings. Every field has a default, so a partial JSON document loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Finished runs kept by [`PipelineEngine::history`].
    pub history_size: usize,
    pub pause_poll_ms: u64,
    pub trigger_poll_ms: u64,
    /// Retry `k` waits `retryBaseDelayMs * k`.
    pub retry_base_delay_ms: u64,
    pub default_action_timeout_ms: u64,
    pub event_capacity: usize,
    pub resolver: ResolverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_size: 10,
            pause_poll_ms: 100,
            trigger_poll_ms: 50,
            retry_base_delay_ms: 1000,
            default_action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            event_capacity: 256,
            resolver: ResolverConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Inputs to one run beyond the pipeline id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub input: Value,
    /// Host application context, exposed to templates as `st.*`.
    pub host_context: Map<String, Value>,
    /// Overrides merged over the pipeline globals; `custom` merges key by key.
    pub globals: Map<String, Value>,
}

impl RunOptions {
    pub fn new(input: impl Into<Value>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_host_context(mut self, host_context: Map<String, Value>) -> Self {
        self.host_context = host_context;
        self
    }

    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }
}

fn merge_globals(base: &mut Map<String, Value>, overrides: Map<String, Value>) {
    for (key, value) in overrides {
        if key == "custom" {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (base.get_mut("custom"), &value)
            {
                existing.extend(incoming.clone());
                continue;
            }
        }
        base.insert(key, value);
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct ActiveRun {
    run: Run,
    cancel: CancellationToken,
}

struct EngineInner {
    config: EngineConfig,
    collaborators: Collaborators,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    resolver: RwLock<Arc<TemplateResolver>>,
    active: Mutex<Option<ActiveRun>>,
    history: Mutex<VecDeque<Run>>,
    gavels: GavelBoard,
    events: EventBus,
}

impl EngineInner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<Run>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The engine handle. Clones share one engine, so a clone can abort, pause or
/// resolve gavels while another task awaits [`start_run`](Self::start_run).
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("pipelines", &self.pipeline_ids())
            .field("active_run", &self.active_run().map(|r| r.id))
            .field("collaborators", &self.inner.collaborators)
            .finish()
    }
}

/// The borrowed surroundings of one phase, shared by its actions.
#[derive(Clone, Copy)]
struct PhaseScope<'a> {
    run_id: &'a str,
    pipeline: &'a Pipeline,
    phase: &'a Phase,
    host: &'a Map<String, Value>,
    stores: &'a Map<String, Value>,
    resolver: &'a TemplateResolver,
    cancel: &'a CancellationToken,
}

impl PipelineEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let resolver = TemplateResolver::new(config.resolver.clone());
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(EngineInner {
                config,
                collaborators,
                pipelines: RwLock::new(HashMap::new()),
                resolver: RwLock::new(Arc::new(resolver)),
                active: Mutex::new(None),
                history: Mutex::new(VecDeque::new()),
                gavels: GavelBoard::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    // -- registry -----------------------------------------------------------

    /// Validate, normalize and store a pipeline, replacing any pipeline with
    /// the same id. Returns the non-error diagnostics.
    pub fn register_pipeline(&self, pipeline: Pipeline) -> Result<Vec<Diagnostic>> {
        let diagnostics = validate_or_raise(&pipeline)?;
        for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            tracing::warn!(pipeline = %pipeline.id, "{d}");
        }
        let pipeline = normalize_pipeline(pipeline, self.inner.config.default_action_timeout_ms);
        tracing::info!(
            pipeline = %pipeline.id,
            phases = pipeline.phases.len(),
            actions = pipeline.action_count(),
            "Pipeline registered"
        );
        self.inner
            .pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pipeline.id.clone(), Arc::new(pipeline));
        Ok(diagnostics)
    }

    pub fn register_pipeline_json(&self, text: &str) -> Result<Vec<Diagnostic>> {
        self.register_pipeline(Pipeline::from_json_str(text)?)
    }

    pub fn get_pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.inner
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Registered pipelines, sorted by id.
    pub fn list_pipelines(&self) -> Vec<Arc<Pipeline>> {
        let mut list: Vec<Arc<Pipeline>> = self
            .inner
            .pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn pipeline_ids(&self) -> Vec<String> {
        self.list_pipelines().iter().map(|p| p.id.clone()).collect()
    }

    /// Remove a pipeline. Refused while a run of that pipeline is active.
    pub fn unregister_pipeline(&self, id: &str) -> Result<Arc<Pipeline>> {
        if let Some(active) = self.inner.active().as_ref() {
            if active.run.pipeline_id == id {
                return Err(CouncilError::RunAlreadyActive {
                    run_id: active.run.id.clone(),
                });
            }
        }
        self.inner
            .pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .ok_or_else(|| CouncilError::PipelineNotFound(id.to_string()))
    }

    /// Add a macro to the resolver. Runs already in flight keep the library
    /// they started with.
    pub fn register_macro(&self, definition: MacroDefinition) -> Result<()> {
        let mut guard = self.inner.resolver.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        next.register_macro(definition)?;
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn register_transform(
        &self,
        name: impl Into<String>,
        f: impl Fn(&Value, &[String]) -> Value + Send + Sync + 'static,
    ) {
        let mut guard = self.inner.resolver.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        next.register_transform(name, f);
        *guard = Arc::new(next);
    }

    pub fn resolver(&self) -> Arc<TemplateResolver> {
        self.inner
            .resolver
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -- events -------------------------------------------------------------

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    fn emit(&self, event: PipelineEvent) {
        self.inner.events.emit(event);
    }

    // -- run control & inspection ------------------------------------------

    /// Run a pipeline on `input` to completion.
    pub async fn start_run(&self, pipeline_id: &str, input: impl Into<Value>) -> Result<Run> {
        self.start_run_with(pipeline_id, RunOptions::new(input)).await
    }

    /// Run a pipeline to completion and return the finished run.
    ///
    /// Fails immediately with [`CouncilError::RunAlreadyActive`] if another
    /// run holds the slot. A failed run is still recorded in the history with
    /// status `error`.
    pub async fn start_run_with(&self, pipeline_id: &str, options: RunOptions) -> Result<Run> {
        let pipeline = self
            .get_pipeline(pipeline_id)
            .ok_or_else(|| CouncilError::PipelineNotFound(pipeline_id.to_string()))?;
        let resolver = self.resolver();
        let cancel = CancellationToken::new();

        let run_id = {
            let mut slot = self.inner.active();
            if let Some(active) = slot.as_ref() {
                return Err(CouncilError::RunAlreadyActive {
                    run_id: active.run.id.clone(),
                });
            }
            let mut globals = pipeline.globals.to_map();
            merge_globals(&mut globals, options.globals.clone());
            let run = Run::new(pipeline.id.clone(), options.input.clone(), globals);
            let id = run.id.clone();
            *slot = Some(ActiveRun {
                run,
                cancel: cancel.clone(),
            });
            id
        };
        self.inner.gavels.clear();

        tracing::info!(run = %run_id, pipeline = %pipeline.id, "Run started");
        self.emit(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            pipeline_id: pipeline.id.clone(),
            phase_count: pipeline.phases.len(),
        });

        let result = self
            .drive(&run_id, &pipeline, &options, &resolver, &cancel)
            .await;
        let finished = self.finish(&result);

        match result {
            Ok(_) => {
                let run = finished?;
                tracing::info!(
                    run = %run.id,
                    pipeline = %run.pipeline_id,
                    duration_ms = run.duration_ms(),
                    "Run completed"
                );
                self.emit(PipelineEvent::RunCompleted {
                    run_id: run.id.clone(),
                    pipeline_id: run.pipeline_id.clone(),
                    duration_ms: run.duration_ms(),
                });
                Ok(run)
            }
            Err(e) => {
                tracing::error!(run = %run_id, pipeline = %pipeline.id, error = %e, "Run failed");
                self.emit(PipelineEvent::RunFailed {
                    run_id,
                    pipeline_id: pipeline.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Signal the active run to stop. Aborting twice is a no-op.
    pub fn abort(&self) -> Result<()> {
        let run_id = {
            let slot = self.inner.active();
            let active = slot.as_ref().ok_or(CouncilError::NoActiveRun)?;
            if active.cancel.is_cancelled() {
                return Ok(());
            }
            active.cancel.cancel();
            active.run.id.clone()
        };
        tracing::info!(run = %run_id, "Abort requested");
        self.emit(PipelineEvent::AbortRequested { run_id });
        Ok(())
    }

    /// Pause the active run at the next action boundary.
    pub fn pause(&self) -> Result<()> {
        let run_id = {
            let mut slot = self.inner.active();
            let active = slot.as_mut().ok_or(CouncilError::NoActiveRun)?;
            if active.run.status != RunStatus::Running {
                return Ok(());
            }
            active.run.status = RunStatus::Paused;
            active.run.id.clone()
        };
        tracing::info!(run = %run_id, "Run paused");
        self.emit(PipelineEvent::RunPaused { run_id });
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let run_id = {
            let mut slot = self.inner.active();
            let active = slot.as_mut().ok_or(CouncilError::NoActiveRun)?;
            if active.run.status != RunStatus::Paused {
                return Ok(());
            }
            active.run.status = RunStatus::Running;
            active.run.id.clone()
        };
        tracing::info!(run = %run_id, "Run resumed");
        self.emit(PipelineEvent::RunResumed { run_id });
        Ok(())
    }

    /// Snapshot of the active run.
    pub fn active_run(&self) -> Option<Run> {
        self.inner.active().as_ref().map(|a| a.run.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner.active().is_some()
    }

    /// Finished runs, oldest first.
    pub fn history(&self) -> Vec<Run> {
        self.inner.history().iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<Run> {
        self.inner.history().back().cloned()
    }

    // -- gavels -------------------------------------------------------------

    pub fn resolve_action_gavel(&self, action_id: &str, value: Value) -> Result<()> {
        self.inner
            .gavels
            .resolve(&GavelKey::Action(action_id.to_string()), value)
    }

    pub fn resolve_phase_gavel(&self, phase_id: &str, value: Value) -> Result<()> {
        self.inner
            .gavels
            .resolve(&GavelKey::Phase(phase_id.to_string()), value)
    }

    pub fn pending_gavels(&self) -> Vec<PendingGavel> {
        self.inner.gavels.pending()
    }

    // -----------------------------------------------------------------------
    // Run state helpers
    // -----------------------------------------------------------------------

    fn with_run<R>(&self, f: impl FnOnce(&mut Run) -> R) -> Result<R> {
        let mut slot = self.inner.active();
        let active = slot.as_mut().ok_or(CouncilError::NoActiveRun)?;
        Ok(f(&mut active.run))
    }

    fn snapshot(&self) -> Result<Run> {
        self.with_run(|run| run.clone())
    }

    /// Take the run out of the slot, close it and file it in the history.
    fn finish(&self, outcome: &Result<Value>) -> Result<Run> {
        let ActiveRun { mut run, .. } = self.inner.active().take().ok_or(CouncilError::NoActiveRun)?;
        run.ended_at = Some(Utc::now());
        match outcome {
            Ok(output) => {
                run.status = RunStatus::Completed;
                run.final_output = output.clone();
            }
            Err(e) => {
                run.status = RunStatus::Error;
                run.error = Some(e.to_string());
            }
        }
        self.inner.gavels.clear();

        let mut history = self.inner.history();
        history.push_back(run.clone());
        while history.len() > self.inner.config.history_size {
            history.pop_front();
        }
        Ok(run)
    }

    fn phase_lifecycle(&self, run_id: &str, phase_id: &str, lifecycle: PhaseLifecycle) {
        let _ = self.with_run(|run| {
            if let Some(state) = run.phase_mut(phase_id) {
                state.lifecycle = lifecycle;
            }
        });
        tracing::info!(run = %run_id, phase = %phase_id, lifecycle = %lifecycle, "Phase lifecycle");
        self.emit(PipelineEvent::PhaseLifecycle {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            lifecycle,
        });
    }

    fn action_lifecycle(
        &self,
        scope: PhaseScope<'_>,
        action: &Action,
        lifecycle: ActionLifecycle,
        attempt: u32,
    ) {
        let _ = self.with_run(|run| {
            if let Some(state) = run.action_mut(&scope.phase.id, &action.id) {
                state.lifecycle = lifecycle;
            }
        });
        tracing::debug!(
            phase = %scope.phase.id,
            action = %action.id,
            lifecycle = %lifecycle,
            attempt,
            "Action lifecycle"
        );
        self.emit(PipelineEvent::ActionLifecycle {
            run_id: scope.run_id.to_string(),
            phase_id: scope.phase.id.clone(),
            action_id: action.id.clone(),
            lifecycle,
            attempt,
        });
    }

    fn phase_context(&self, scope: PhaseScope<'_>) -> Result<TemplateContext> {
        let run = self.snapshot()?;
        Ok(ContextAssembler::new(scope.pipeline, scope.phase, &run, scope.host)
            .with_stores(scope.stores.clone())
            .build(None, None))
    }

    // -----------------------------------------------------------------------
    // Run driver
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: &str,
        pipeline: &Pipeline,
        options: &RunOptions,
        resolver: &TemplateResolver,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut carried = options.input.clone();
        for (index, phase) in pipeline.phases.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CouncilError::Aborted);
            }
            self.with_run(|run| {
                run.current_phase_id = Some(phase.id.clone());
                run.current_phase_index = Some(index);
                run.current_action_id = None;
                run.current_action_index = None;
                run.phases.insert(
                    phase.id.clone(),
                    PhaseState::new(carried.clone(), phase.variables.clone()),
                );
            })?;
            self.phase_lifecycle(run_id, &phase.id, PhaseLifecycle::Start);

            let stores = read_stores(phase, &self.inner.collaborators).await;
            let scope = PhaseScope {
                run_id,
                pipeline,
                phase,
                host: &options.host_context,
                stores: &stores,
                resolver,
                cancel,
            };
            match self.run_phase(scope).await {
                Ok(output) => {
                    if !output.is_null() {
                        carried = output;
                    }
                }
                Err(e) => {
                    let _ = self.with_run(|run| {
                        if let Some(state) = run.phase_mut(&phase.id) {
                            state.error = Some(e.to_string());
                            state.ended_at = Some(Utc::now());
                        }
                    });
                    tracing::warn!(run = %run_id, phase = %phase.id, error = %e, "Phase failed");
                    self.emit(PipelineEvent::PhaseFailed {
                        run_id: run_id.to_string(),
                        phase_id: phase.id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
        Ok(carried)
    }

    async fn run_phase(&self, scope: PhaseScope<'_>) -> Result<Value> {
        let phase = scope.phase;
        self.open_phase_thread(scope).await?;
        self.phase_lifecycle(scope.run_id, &phase.id, PhaseLifecycle::BeforeActions);
        self.phase_lifecycle(scope.run_id, &phase.id, PhaseLifecycle::InProgress);

        for (index, action) in phase.actions.iter().enumerate() {
            self.checkpoint(scope.cancel).await?;
            self.run_action(scope, index, action).await?;
            if scope.cancel.is_cancelled() {
                return Err(CouncilError::Aborted);
            }
        }

        self.phase_lifecycle(scope.run_id, &phase.id, PhaseLifecycle::AfterActions);
        let mut output = self.consolidate_phase(scope).await?;
        if phase.needs_review() {
            self.phase_lifecycle(scope.run_id, &phase.id, PhaseLifecycle::Respond);
            output = self.review_phase(scope, output).await?;
        }
        self.with_run(|run| {
            if let Some(state) = run.phase_mut(&phase.id) {
                state.output = output.clone();
                state.ended_at = Some(Utc::now());
            }
        })?;
        self.phase_lifecycle(scope.run_id, &phase.id, PhaseLifecycle::End);
        Ok(output)
    }

    async fn open_phase_thread(&self, scope: PhaseScope<'_>) -> Result<()> {
        let phase = scope.phase;
        if !phase.thread.enabled {
            return Ok(());
        }
        let Some(threads) = self.inner.collaborators.threads.as_ref() else {
            tracing::warn!(phase = %phase.id, "Phase thread enabled but no thread log is configured");
            return Ok(());
        };
        let name = if phase.thread.name.trim().is_empty() {
            phase.name.clone()
        } else {
            scope.resolver.resolve(&phase.thread.name, &self.phase_context(scope)?)
        };
        let thread_id = threads.create_thread(&name, &phase.thread.kind).await?;
        tracing::debug!(phase = %phase.id, thread = %thread_id, "Phase thread created");
        self.with_run(|run| {
            if let Some(state) = run.phase_mut(&phase.id) {
                state.thread_id = Some(thread_id);
            }
        })
    }

    /// Abort check plus the cooperative pause wait between actions.
    async fn checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        let poll = Duration::from_millis(self.inner.config.pause_poll_ms.max(1));
        loop {
            if cancel.is_cancelled() {
                return Err(CouncilError::Aborted);
            }
            if self.with_run(|run| run.status != RunStatus::Paused)? {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => return Err(CouncilError::Aborted),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    async fn run_action(&self, scope: PhaseScope<'_>, index: usize, action: &Action) -> Result<()> {
        let phase_id = &scope.phase.id;
        self.with_run(|run| {
            run.current_action_id = Some(action.id.clone());
            run.current_action_index = Some(index);
            if let Some(state) = run.phase_mut(phase_id) {
                state.actions.insert(
                    action.id.clone(),
                    ActionState {
                        started_at: Some(Utc::now()),
                        ..ActionState::default()
                    },
                );
            }
        })?;
        self.action_lifecycle(scope, action, ActionLifecycle::Called, 0);

        let result = match self.wait_for_trigger(scope, action).await {
            Ok(()) => {
                let policy =
                    BackoffPolicy::linear(Duration::from_millis(self.inner.config.retry_base_delay_ms));
                execute_with_retry(
                    move |attempt| self.run_attempt(scope, action, attempt as u32 + 1),
                    action.execution.retry_count as usize,
                    &policy,
                    &action.id,
                    scope.cancel,
                    |attempt, delay, error| {
                        self.emit(PipelineEvent::ActionRetrying {
                            run_id: scope.run_id.to_string(),
                            phase_id: phase_id.clone(),
                            action_id: action.id.clone(),
                            attempt: attempt as u32 + 1,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        });
                    },
                )
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let attempts = self
                .with_run(|run| {
                    run.action_mut(phase_id, &action.id)
                        .map(|state| {
                            state.error = Some(e.to_string());
                            state.ended_at = Some(Utc::now());
                            state.attempts
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            tracing::error!(phase = %phase_id, action = %action.id, attempts, error = %e, "Action failed");
            self.emit(PipelineEvent::ActionFailed {
                run_id: scope.run_id.to_string(),
                phase_id: phase_id.clone(),
                action_id: action.id.clone(),
                attempts,
                error: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    /// Delay an async-mode action until its trigger target reaches the wanted
    /// lifecycle, bounded by the action's own timeout.
    async fn wait_for_trigger(&self, scope: PhaseScope<'_>, action: &Action) -> Result<()> {
        let execution = &action.execution;
        if execution.mode != ExecutionMode::Async || !execution.trigger.kind.waits() {
            return Ok(());
        }
        let Some(target) = execution.trigger.target_action_id.as_deref() else {
            return Ok(());
        };
        let wanted = execution.trigger.target_state;
        let limit = Duration::from_millis(execution.timeout_ms);
        let poll = Duration::from_millis(self.inner.config.trigger_poll_ms.max(1));
        let started = tokio::time::Instant::now();
        tracing::debug!(action = %action.id, target = %target, state = %wanted, "Waiting on trigger");

        loop {
            let reached = self.with_run(|run| {
                run.action(&scope.phase.id, target)
                    .is_some_and(|state| state.lifecycle >= wanted)
            })?;
            if reached {
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(CouncilError::TriggerTimeout {
                    action: action.name.clone(),
                    target: target.to_string(),
                    state: wanted.to_string(),
                    timeout_ms: execution.timeout_ms,
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = scope.cancel.cancelled() => return Err(CouncilError::Aborted),
            }
        }
    }

    /// One attempt: re-enter at `start`, resolve input, execute, route output.
    async fn run_attempt(&self, scope: PhaseScope<'_>, action: &Action, attempt: u32) -> Result<()> {
        let phase = scope.phase;
        self.with_run(|run| {
            if let Some(state) = run.action_mut(&phase.id, &action.id) {
                state.attempts = attempt;
                state.error = None;
            }
        })?;
        self.action_lifecycle(scope, action, ActionLifecycle::Start, attempt);

        let input = self.resolve_input(scope, action).await?;
        self.with_run(|run| {
            if let Some(state) = run.action_mut(&phase.id, &action.id) {
                state.input = input.clone();
            }
        })?;
        self.action_lifecycle(scope, action, ActionLifecycle::InProgress, attempt);

        let run = self.snapshot()?;
        let template = ContextAssembler::new(scope.pipeline, phase, &run, scope.host)
            .with_stores(scope.stores.clone())
            .build(Some(action), Some(&input));
        let phase_thread = run.phase(&phase.id).and_then(|s| s.thread_id.clone());
        let on_respond = || self.action_lifecycle(scope, action, ActionLifecycle::Respond, attempt);
        let ctx = ActionContext {
            run_id: scope.run_id,
            pipeline: scope.pipeline,
            phase,
            action,
            input,
            template,
            resolver: scope.resolver,
            collaborators: &self.inner.collaborators,
            gavels: &self.inner.gavels,
            events: &self.inner.events,
            cancel: scope.cancel,
            phase_thread: phase_thread.as_deref(),
            timeout_ms: action.execution.timeout_ms,
            on_respond: &on_respond,
        };
        let ActionOutcome { output, responses } = self.execute(&ctx).await?;

        self.with_run(|run| {
            if let Some(state) = run.action_mut(&phase.id, &action.id) {
                state.output = output.clone();
                state.responses = responses.clone();
                state.ended_at = Some(Utc::now());
            }
            if let Some(state) = run.phase_mut(&phase.id) {
                state.next_action_input = None;
            }
        })?;
        self.action_lifecycle(scope, action, ActionLifecycle::Complete, attempt);
        tracing::info!(
            phase = %phase.id,
            action = %action.id,
            action_type = %action.action_type,
            attempt,
            responses = responses.len(),
            "Action complete"
        );

        self.record_responses(phase_thread.as_deref(), &responses).await;
        self.route_output(scope, action, phase_thread.as_deref(), output).await
    }

    /// Dispatch to the handler, raced against the execution timeout and abort.
    /// `user_gavel` waits are governed by their own gavel timeout.
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let action = ctx.action;
        let work = handler_for(action.action_type).execute(ctx);
        let timed = async {
            if action.action_type == ActionType::UserGavel {
                return work.await;
            }
            let limit = Duration::from_millis(action.execution.timeout_ms);
            match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(CouncilError::ActionTimeout {
                    action: action.name.clone(),
                    timeout_ms: action.execution.timeout_ms,
                }),
            }
        };
        tokio::select! {
            result = timed => result,
            _ = ctx.cancel.cancelled() => Err(CouncilError::Aborted),
        }
    }

    async fn resolve_input(&self, scope: PhaseScope<'_>, action: &Action) -> Result<Value> {
        let phase = scope.phase;
        let run = self.snapshot()?;
        let state = run
            .phase(&phase.id)
            .ok_or_else(|| CouncilError::Other(format!("phase '{}' has no state", phase.id)))?;
        let config = &action.input;
        let key = config.key.trim();
        let context = || {
            ContextAssembler::new(scope.pipeline, phase, &run, scope.host)
                .with_stores(scope.stores.clone())
                .build(Some(action), Some(&state.input))
        };

        let mut value = match config.source {
            InputSource::PhaseInput => state.input.clone(),
            InputSource::PreviousAction => {
                let source_id = if key.is_empty() {
                    let index = phase.actions.iter().position(|a| a.id == action.id);
                    index
                        .and_then(|i| i.checked_sub(1))
                        .and_then(|i| phase.actions.get(i))
                        .map(|a| a.id.as_str())
                } else {
                    Some(key)
                };
                source_id
                    .and_then(|id| state.actions.get(id))
                    .map(|s| s.output.clone())
                    .unwrap_or_else(|| state.input.clone())
            }
            InputSource::Global => {
                let globals = Value::Object(run.globals.clone());
                if key.is_empty() {
                    globals
                } else {
                    get_path(&globals, key).cloned().unwrap_or(Value::Null)
                }
            }
            InputSource::Store => {
                let (store_id, entry_id) = match key.split_once('.') {
                    Some((store, entry)) => (store, Some(entry)),
                    None => (key, None),
                };
                if store_id.is_empty() {
                    return Err(CouncilError::Configuration(format!(
                        "action '{}' reads its input from a store but names none",
                        action.id
                    )));
                }
                self.inner
                    .collaborators
                    .curation()?
                    .read(store_id, entry_id)
                    .await?
            }
            InputSource::Custom => scope.resolver.resolve_value(&config.value, &context()),
        };

        if let Some(routed) = &state.next_action_input {
            value = routed.clone();
        }
        if !config.transform.trim().is_empty() {
            let mut ctx = context();
            ctx.set_input(value.clone());
            value = scope
                .resolver
                .resolve_value(&Value::String(config.transform.clone()), &ctx);
        }
        Ok(value)
    }

    async fn record_responses(&self, thread_id: Option<&str>, responses: &[ParticipantResponse]) {
        let (Some(thread_id), Some(threads)) = (thread_id, self.inner.collaborators.threads.as_ref())
        else {
            return;
        };
        for response in responses.iter().filter(|r| r.is_success()) {
            let message = ThreadMessage {
                role: "assistant".into(),
                content: response.content.clone(),
                name: Some(response.role.clone()),
            };
            if let Err(e) = threads.add_message(thread_id, message).await {
                tracing::warn!(thread = %thread_id, error = %e, "Could not record response");
            }
        }
    }

    async fn route_output(
        &self,
        scope: PhaseScope<'_>,
        action: &Action,
        phase_thread: Option<&str>,
        output: Value,
    ) -> Result<()> {
        let dest = Destination::from_config(&action.output, scope.phase, phase_thread)?;
        if dest.is_local() {
            self.with_run(|run| apply_local(run, &scope.phase.id, &dest, output))??;
        } else {
            deliver_external(&dest, &output, &self.inner.collaborators, &action.name).await?;
        }
        tracing::debug!(action = %action.id, target = %dest.label(), "Output routed");
        self.emit(PipelineEvent::OutputRouted {
            run_id: scope.run_id.to_string(),
            phase_id: scope.phase.id.clone(),
            action_id: action.id.clone(),
            target: dest.label(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase output
    // -----------------------------------------------------------------------

    async fn consolidate_phase(&self, scope: PhaseScope<'_>) -> Result<Value> {
        let phase = scope.phase;
        let run = self.snapshot()?;
        let state = run
            .phase(&phase.id)
            .ok_or_else(|| CouncilError::Other(format!("phase '{}' has no state", phase.id)))?;
        let candidates: Vec<(String, Value)> = phase
            .actions
            .iter()
            .filter(|a| a.output.target == OutputTarget::PhaseOutput)
            .filter_map(|a| state.actions.get(&a.id).map(|s| (a.id.clone(), s.output.clone())))
            .collect();
        let designated = phase
            .output
            .action_id
            .as_deref()
            .and_then(|id| state.actions.get(id))
            .map(|s| &s.output);

        let policy = phase.output.consolidation;
        let synthesized = if policy == Consolidation::Synthesize {
            self.synthesize(scope, &run, &candidates).await?
        } else {
            None
        };
        let value = synthesized
            .unwrap_or_else(|| consolidate(policy, &candidates, &state.output, designated));

        self.with_run(|run| {
            if let Some(state) = run.phase_mut(&phase.id) {
                state.output = value.clone();
            }
        })?;
        self.emit(PipelineEvent::PhaseConsolidated {
            run_id: scope.run_id.to_string(),
            phase_id: phase.id.clone(),
            policy: policy.as_str().to_string(),
        });
        Ok(value)
    }

    /// The LLM summarization step of `synthesize`. `None` when no client is
    /// configured or there is nothing to summarize.
    async fn synthesize(
        &self,
        scope: PhaseScope<'_>,
        run: &Run,
        candidates: &[(String, Value)],
    ) -> Result<Option<Value>> {
        let Some(llm) = self.inner.collaborators.llm.as_ref() else {
            return Ok(None);
        };
        let present: Vec<&(String, Value)> = candidates.iter().filter(|(_, v)| !v.is_null()).collect();
        if present.is_empty() {
            return Ok(None);
        }
        let phase = scope.phase;
        let instruction = if phase.output.synthesis_prompt.trim().is_empty() {
            DEFAULT_SYNTHESIS_PROMPT.to_string()
        } else {
            let ctx = ContextAssembler::new(scope.pipeline, phase, run, scope.host)
                .with_stores(scope.stores.clone())
                .build(None, None);
            scope.resolver.resolve(&phase.output.synthesis_prompt, &ctx)
        };
        let body = present
            .iter()
            .map(|(id, value)| format!("### {id}\n{}", stringify(value)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = llm
            .generate(&format!("{instruction}\n\n{body}"), &GenerateOptions::default())
            .await?;
        Ok(Some(Value::String(text)))
    }

    async fn review_phase(&self, scope: PhaseScope<'_>, output: Value) -> Result<Value> {
        let phase = scope.phase;
        let gavel = &phase.gavel;
        let key = GavelKey::Phase(phase.id.clone());
        let prompt = if gavel.prompt.trim().is_empty() {
            format!("Review the output of phase '{}'", phase.name)
        } else {
            scope.resolver.resolve(&gavel.prompt, &self.phase_context(scope)?)
        };
        self.emit(PipelineEvent::GavelRequested {
            run_id: scope.run_id.to_string(),
            key: key.to_string(),
            prompt: prompt.clone(),
            value: output.clone(),
        });

        let outcome = self
            .inner
            .gavels
            .wait(
                key.clone(),
                prompt,
                output.clone(),
                gavel.timeout_ms.map(Duration::from_millis),
                scope.cancel,
            )
            .await?;
        let (value, skipped) = match outcome {
            GavelOutcome::Resolved(value) => (value, false),
            GavelOutcome::TimedOut if gavel.can_skip => {
                tracing::info!(gavel = %key, "Phase review timed out, keeping the consolidated output");
                let kept = if phase.output.consolidation == Consolidation::UserGavel {
                    output.get("merged").cloned().unwrap_or(output)
                } else {
                    output
                };
                (kept, true)
            }
            GavelOutcome::TimedOut => {
                return Err(CouncilError::GavelTimeout {
                    key: key.to_string(),
                    timeout_ms: gavel.timeout_ms.unwrap_or_default(),
                })
            }
        };
        self.emit(PipelineEvent::GavelResolved {
            run_id: scope.run_id.to_string(),
            key: key.to_string(),
            skipped,
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults_and_partial_documents() {
        let config = EngineConfig::from_json_str(r#"{"historySize": 3, "resolver": {"maxDepth": 4}}"#).unwrap();
        assert_eq!(config.history_size, 3);
        assert_eq!(config.pause_poll_ms, 100);
        assert_eq!(config.trigger_poll_ms, 50);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.default_action_timeout_ms, 300_000);
        assert_eq!(config.resolver.max_depth, 4);
    }

    #[test]
    fn custom_globals_merge_key_by_key() {
        let mut base = Map::new();
        base.insert("instructions".into(), json!("old"));
        base.insert("custom".into(), json!({"a": 1, "b": 2}));
        let mut overrides = Map::new();
        overrides.insert("instructions".into(), json!("new"));
        overrides.insert("custom".into(), json!({"b": 3}));
        merge_globals(&mut base, overrides);
        assert_eq!(base["instructions"], json!("new"));
        assert_eq!(base["custom"], json!({"a": 1, "b": 3}));
    }

    #[test]
    fn controls_need_an_active_run() {
        let engine = PipelineEngine::new(EngineConfig::default(), Collaborators::new());
        assert!(matches!(engine.abort(), Err(CouncilError::NoActiveRun)));
        assert!(matches!(engine.pause(), Err(CouncilError::NoActiveRun)));
        assert!(engine.active_run().is_none());
        assert!(engine.last_run().is_none());
    }

    #[test]
    fn registration_normalizes_and_rejects_invalid_documents() {
        let engine = PipelineEngine::new(EngineConfig::default(), Collaborators::new());
        engine
            .register_pipeline_json(r#"{"id": "p", "phases": [{"id": "a", "actions": [{"id": "x", "actionType": "system"}]}]}"#)
            .unwrap();
        let stored = engine.get_pipeline("p").unwrap();
        assert_eq!(stored.version, "1.0.0");
        assert_eq!(stored.phases[0].actions[0].execution.timeout_ms, 300_000);

        let err = engine
            .register_pipeline_json(r#"{"id": "bad id", "phases": []}"#)
            .unwrap_err();
        assert!(matches!(err, CouncilError::ValidationError(_)));
        assert!(engine.get_pipeline("bad id").is_none());

        assert_eq!(engine.list_pipelines().len(), 1);
        engine.unregister_pipeline("p").unwrap();
        assert!(matches!(
            engine.unregister_pipeline("p"),
            Err(CouncilError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn macros_registered_on_the_engine_reach_the_resolver() {
        let engine = PipelineEngine::new(EngineConfig::default(), Collaborators::new());
        engine
            .register_macro(MacroDefinition::new("greet", "Hello {{name}}").with_parameter("name", Some("you")))
            .unwrap();
        let out = engine
            .resolver()
            .resolve("{{macro:greet}}", &TemplateContext::new());
        assert_eq!(out, "Hello you");
    }
}
