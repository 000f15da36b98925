//! End-to-end tests for the Council pipeline engine.
//!
//! Each test registers a pipeline document, runs it through
//! [`PipelineEngine`] against in-memory collaborators and a scripted LLM, and
//! checks the finished run, the history and the emitted events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};

use council_llm::{Reply, ScriptedClient};
use council_pipeline::{
    Agent, Collaborators, EngineConfig, EventListener, InMemoryAgentDirectory,
    InMemoryCurationStore, InMemoryThreadLog, Pipeline, PipelineEngine, PipelineEvent, Position,
    RunOptions, StoreData,
};
use council_types::{ActionLifecycle, CouncilError, PhaseLifecycle, RunStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine(collaborators: Collaborators) -> PipelineEngine {
    PipelineEngine::new(EngineConfig::default(), collaborators)
}

fn register(engine: &PipelineEngine, doc: Value) {
    let pipeline = Pipeline::from_json(doc).expect("pipeline document parses");
    engine.register_pipeline(pipeline).expect("pipeline validates");
}

/// A one-phase pipeline around the given actions.
fn single_phase(id: &str, actions: Value) -> Value {
    json!({
        "id": id,
        "name": "Council",
        "phases": [{ "id": "main", "actions": actions }]
    })
}

fn echo_pipeline(id: &str) -> Value {
    single_phase(
        id,
        json!([{ "id": "echo", "actionType": "system", "promptTemplate": "ECHO: {{input}}" }]),
    )
}

fn positions(names: &[&str]) -> Arc<InMemoryAgentDirectory> {
    let dir = InMemoryAgentDirectory::new();
    for name in names {
        dir.add_position(Position {
            id: name.to_lowercase(),
            name: name.to_string(),
            system_prompt: format!("You are the {name}."),
            ..Position::default()
        });
    }
    Arc::new(dir)
}

/// Record every event a listener sees.
fn recorder(engine: &PipelineEngine) -> Arc<Mutex<Vec<PipelineEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Arc<dyn EventListener> = Arc::new(move |e: &PipelineEvent| -> Result<(), String> {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    });
    engine.add_listener(listener);
    seen
}

fn count(events: &Arc<Mutex<Vec<PipelineEvent>>>, name: &str) -> usize {
    events.lock().unwrap().iter().filter(|e| e.name() == name).count()
}

async fn until(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Basic runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn system_echo_pipeline_completes() {
    let engine = engine(Collaborators::new());
    register(&engine, echo_pipeline("echo"));
    let events = recorder(&engine);

    let run = engine.start_run("echo", json!("hi")).await.expect("run succeeds");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.final_output, json!("ECHO: hi"));
    assert_eq!(run.user_input, json!("hi"));
    assert!(run.ended_at.is_some());
    let phase = run.phase("main").unwrap();
    assert_eq!(phase.lifecycle, PhaseLifecycle::End);
    assert_eq!(phase.output, json!("ECHO: hi"));
    let action = run.action("main", "echo").unwrap();
    assert_eq!(action.lifecycle, ActionLifecycle::Complete);
    assert_eq!(action.attempts, 1);
    assert_eq!(action.input, json!("hi"));

    assert!(!engine.is_running());
    assert_eq!(engine.last_run().unwrap().id, run.id);
    let names: Vec<&str> = events.lock().unwrap().iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"run_started"));
    assert_eq!(names.last(), Some(&"run_completed"));
}

#[tokio::test]
async fn unknown_pipeline_is_rejected() {
    let engine = engine(Collaborators::new());
    let err = engine.start_run("missing", json!("x")).await.unwrap_err();
    assert!(matches!(err, CouncilError::PipelineNotFound(id) if id == "missing"));
    assert!(engine.history().is_empty());
}

#[tokio::test]
async fn phase_outputs_carry_into_the_next_phase() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        json!({
            "id": "chain",
            "phases": [
                { "id": "one", "actions": [
                    { "id": "a", "actionType": "system", "promptTemplate": "A({{input}})" }
                ]},
                { "id": "empty", "actions": [] },
                { "id": "two", "actions": [
                    { "id": "b", "actionType": "system", "promptTemplate": "B({{input}})" }
                ]}
            ]
        }),
    );
    let run = engine.start_run("chain", json!("x")).await.unwrap();
    assert_eq!(run.phase("empty").unwrap().input, json!("A(x)"));
    assert_eq!(run.phase("empty").unwrap().output, Value::Null);
    assert_eq!(run.final_output, json!("B(A(x))"));
}

#[tokio::test]
async fn merge_consolidation_joins_phase_outputs() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        json!({
            "id": "merge",
            "phases": [{
                "id": "main",
                "output": { "consolidation": "merge" },
                "actions": [
                    { "id": "a", "actionType": "system", "promptTemplate": "A: {{input}}" },
                    { "id": "b", "actionType": "system", "promptTemplate": "B: {{input}}" },
                    { "id": "side", "actionType": "system", "promptTemplate": "side",
                      "output": { "target": "global", "targetKey": "custom.note" } }
                ]
            }]
        }),
    );
    let run = engine.start_run("merge", json!("x")).await.unwrap();
    assert_eq!(run.final_output, json!("A: x\n\n---\n\nB: x"));
    assert_eq!(run.globals["custom"]["note"], json!("side"));
}

#[tokio::test]
async fn next_action_routing_overrides_the_following_input() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        single_phase(
            "relay",
            json!([
                { "id": "first", "actionType": "system", "promptTemplate": "routed",
                  "output": { "target": "nextAction" } },
                { "id": "second", "actionType": "system", "promptTemplate": "{{input}}!",
                  "input": { "transform": "<{{input}}>" } }
            ]),
        ),
    );
    let run = engine.start_run("relay", json!("ignored")).await.unwrap();
    assert_eq!(run.action("main", "second").unwrap().input, json!("<routed>"));
    assert_eq!(run.final_output, json!("<routed>!"));
    assert!(run.phase("main").unwrap().next_action_input.is_none());
}

#[tokio::test]
async fn input_sources_read_previous_actions_and_globals() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        json!({
            "id": "sources",
            "globals": { "custom": { "tone": "dry" } },
            "phases": [{ "id": "main", "actions": [
                { "id": "a", "actionType": "system", "promptTemplate": "draft" },
                { "id": "b", "actionType": "system", "input": { "source": "global", "key": "custom.tone" } },
                { "id": "c", "actionType": "system", "promptTemplate": "{{input}}+",
                  "input": { "source": "previousAction", "key": "a" } }
            ]}]
        }),
    );
    let mut globals = Map::new();
    globals.insert("custom".into(), json!({ "extra": true }));
    let run = engine
        .start_run_with("sources", RunOptions::new("x").with_globals(globals))
        .await
        .unwrap();
    assert_eq!(run.action("main", "b").unwrap().output, json!("dry"));
    assert_eq!(run.final_output, json!("draft+"));
    assert_eq!(run.globals["custom"], json!({ "tone": "dry", "extra": true }));
}

#[tokio::test]
async fn store_outputs_are_written_through_the_curation_store() {
    let store = Arc::new(InMemoryCurationStore::new());
    store.add_store("notes", StoreData::default());
    let engine = engine(Collaborators::new().with_curation(store.clone()));
    register(
        &engine,
        single_phase(
            "notes",
            json!([
                { "id": "keep", "actionType": "system", "promptTemplate": "remember {{input}}",
                  "output": { "target": "store", "targetKey": "notes" } }
            ]),
        ),
    );
    let run = engine.start_run("notes", json!("this")).await.unwrap();
    let entries = store.entries("notes");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["value"], json!("remember this"));
    // nothing was routed to the phase output
    assert_eq!(run.final_output, json!("this"));
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_participants_record_responses_and_thread() {
    let llm = ScriptedClient::with_replies(["draft", "critique"]);
    let threads = Arc::new(InMemoryThreadLog::new());
    let engine = engine(
        Collaborators::new()
            .with_agents(positions(&["Writer", "Critic"]))
            .with_threads(threads.clone())
            .with_llm(Arc::new(llm.clone())),
    );
    register(
        &engine,
        json!({
            "id": "council",
            "name": "Council",
            "phases": [{
                "id": "main",
                "thread": { "enabled": true, "name": "{{pipeline.name}} room" },
                "actions": [{
                    "id": "debate",
                    "actionType": "standard",
                    "promptTemplate": "Discuss {{input}}",
                    "participants": { "positionIds": ["writer", "critic"], "orchestration": "sequential" }
                }]
            }]
        }),
    );
    let run = engine.start_run("council", json!("taxes")).await.unwrap();

    assert_eq!(run.final_output, json!("critique"));
    let action = run.action("main", "debate").unwrap();
    assert_eq!(action.responses.len(), 2);
    assert_eq!(action.responses[0].role, "Writer");
    assert_eq!(llm.requests()[0].system_prompt(), Some("You are the Writer."));

    let logged = threads.threads();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].name, "Council room");
    assert_eq!(run.phase("main").unwrap().thread_id.as_deref(), Some(logged[0].id.as_str()));
    let messages = threads.messages(&logged[0].id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "critique");
    assert_eq!(messages[1].name.as_deref(), Some("Critic"));
}

#[tokio::test]
async fn parallel_mode_tolerates_partial_failure() {
    let llm = ScriptedClient::with_responder(|request| {
        if request.system_prompt() == Some("You are the Writer.") {
            Err(CouncilError::ProviderError {
                provider: "scripted".into(),
                status: 503,
                message: "busy".into(),
                retryable: true,
            })
        } else {
            Ok("fine".into())
        }
    });
    let engine = engine(
        Collaborators::new()
            .with_agents(positions(&["Writer", "Critic"]))
            .with_llm(Arc::new(llm)),
    );
    register(
        &engine,
        single_phase(
            "fanout",
            json!([{
                "id": "ask",
                "actionType": "standard",
                "participants": { "positionIds": ["writer", "critic"], "orchestration": "parallel" }
            }]),
        ),
    );
    let run = engine.start_run("fanout", json!("q")).await.unwrap();
    assert_eq!(run.final_output, json!("fine"));
    let responses = &run.action("main", "ask").unwrap().responses;
    assert_eq!(responses.len(), 2);
    assert!(!responses[0].is_success());
    assert!(responses[1].is_success());
}

#[tokio::test]
async fn dynamic_experts_are_matched_by_keyword() {
    let dir = InMemoryAgentDirectory::new();
    for (id, keywords) in [("vet", vec!["dragon", "wing"]), ("baker", vec!["bread"])] {
        dir.add_position(Position {
            id: id.into(),
            name: id.into(),
            is_sme: true,
            sme_keywords: keywords.into_iter().map(String::from).collect(),
            ..Position::default()
        });
    }
    dir.assign_agent(
        "vet",
        Agent {
            id: "agent-vet".into(),
            name: "Dr. Scale".into(),
            system_prompt: "You treat dragons.".into(),
            ..Agent::default()
        },
    );
    let llm = ScriptedClient::new();
    let engine = engine(
        Collaborators::new()
            .with_agents(Arc::new(dir))
            .with_llm(Arc::new(llm.clone())),
    );
    register(
        &engine,
        single_phase(
            "experts",
            json!([{
                "id": "consult",
                "actionType": "standard",
                "participants": { "dynamicExperts": { "enabled": true, "maxSmes": 1 } }
            }]),
        ),
    );
    let run = engine.start_run("experts", json!("my dragon hurt a wing")).await.unwrap();
    let responses = &run.action("main", "consult").unwrap().responses;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].position_id, "vet");
    assert_eq!(llm.requests()[0].system_prompt(), Some("You treat dragons."));
}

// ---------------------------------------------------------------------------
// Supervision: retries, timeouts, triggers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retryable_failures_use_linear_backoff() {
    let llm = ScriptedClient::with_responder(|_| {
        Err(CouncilError::ProviderError {
            provider: "scripted".into(),
            status: 500,
            message: "down".into(),
            retryable: true,
        })
    });
    let engine = engine(Collaborators::new().with_llm(Arc::new(llm.clone())));
    register(
        &engine,
        single_phase(
            "flaky",
            json!([{ "id": "call", "actionType": "standard", "execution": { "retryCount": 2 } }]),
        ),
    );
    let events = recorder(&engine);

    let started = tokio::time::Instant::now();
    let err = engine.start_run("flaky", json!("x")).await.unwrap_err();

    assert!(matches!(err, CouncilError::ProviderError { status: 500, .. }));
    assert_eq!(llm.call_count(), 3);
    // 1000ms after the first failure, 2000ms after the second
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert_eq!(count(&events, "action_retrying"), 2);
    assert_eq!(count(&events, "action_failed"), 1);
    assert_eq!(count(&events, "run_failed"), 1);

    let run = engine.last_run().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.action("main", "call").unwrap().attempts, 3);
    assert!(run.phase("main").unwrap().error.is_some());
}

#[tokio::test(start_paused = true)]
async fn slow_actions_time_out() {
    let llm = ScriptedClient::with_replies(["late"]).with_delay(Duration::from_secs(5));
    let engine = engine(Collaborators::new().with_llm(Arc::new(llm)));
    register(
        &engine,
        single_phase(
            "slow",
            json!([{ "id": "wait", "name": "Slow call", "actionType": "standard",
                     "execution": { "timeoutMs": 1000 } }]),
        ),
    );
    let err = engine.start_run("slow", json!("x")).await.unwrap_err();
    match err {
        CouncilError::ActionTimeout { action, timeout_ms } => {
            assert_eq!(action, "Slow call");
            assert_eq!(timeout_ms, 1000);
        }
        other => panic!("expected an action timeout, got {other:?}"),
    }
    assert_eq!(engine.last_run().unwrap().status, RunStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn unreached_trigger_target_times_out() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        single_phase(
            "trigger",
            json!([
                { "id": "waiter", "actionType": "system",
                  "execution": { "mode": "async", "timeoutMs": 500,
                                 "trigger": { "type": "await", "targetActionId": "later" } } },
                { "id": "later", "actionType": "system" }
            ]),
        ),
    );
    let err = engine.start_run("trigger", json!("x")).await.unwrap_err();
    assert!(matches!(
        err,
        CouncilError::TriggerTimeout { ref target, timeout_ms: 500, .. } if target == "later"
    ));
    // the later action never started
    assert!(engine.last_run().unwrap().action("main", "later").is_none());
}

#[tokio::test(start_paused = true)]
async fn satisfied_trigger_runs_immediately() {
    let engine = engine(Collaborators::new());
    register(
        &engine,
        single_phase(
            "trigger-ok",
            json!([
                { "id": "first", "actionType": "system", "promptTemplate": "one" },
                { "id": "second", "actionType": "system", "promptTemplate": "two",
                  "execution": { "mode": "async",
                                 "trigger": { "type": "on", "targetActionId": "first", "targetState": "in_progress" } } }
            ]),
        ),
    );
    let run = engine.start_run("trigger-ok", json!("x")).await.unwrap();
    assert_eq!(run.final_output, json!("two"));
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

fn gavel_pipeline(id: &str) -> Value {
    single_phase(
        id,
        json!([
            { "id": "review", "actionType": "user_gavel", "gavelConfig": { "prompt": "Approve {{input}}?" } },
            { "id": "after", "actionType": "system", "promptTemplate": "{{input}}!",
              "input": { "source": "previousAction" } }
        ]),
    )
}

#[tokio::test]
async fn only_one_run_may_be_active() {
    let engine = engine(Collaborators::new());
    register(&engine, gavel_pipeline("gated"));
    register(&engine, echo_pipeline("echo"));

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start_run("gated", json!("plan")).await });
    until(|| !engine.pending_gavels().is_empty()).await;

    let first = engine.active_run().unwrap();
    let err = engine.start_run("echo", json!("x")).await.unwrap_err();
    assert!(matches!(err, CouncilError::RunAlreadyActive { ref run_id } if *run_id == first.id));
    assert!(matches!(
        engine.unregister_pipeline("gated"),
        Err(CouncilError::RunAlreadyActive { .. })
    ));
    assert_eq!(engine.active_run().unwrap().id, first.id);
    assert!(engine.history().is_empty());

    let pending = engine.pending_gavels();
    assert_eq!(pending[0].prompt, "Approve plan?");
    assert_eq!(
        engine.active_run().unwrap().action("main", "review").unwrap().lifecycle,
        ActionLifecycle::Respond
    );
    engine.resolve_action_gavel("review", json!("approved")).unwrap();

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.final_output, json!("approved!"));
    assert_eq!(engine.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn abort_stops_the_run_once() {
    let llm = ScriptedClient::with_replies(["never"]).with_delay(Duration::from_secs(60));
    let engine = engine(Collaborators::new().with_llm(Arc::new(llm)));
    register(
        &engine,
        single_phase("long", json!([{ "id": "think", "actionType": "standard", "execution": { "retryCount": 3 } }])),
    );
    let events = recorder(&engine);

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start_run("long", json!("x")).await });
    until(|| {
        engine
            .active_run()
            .and_then(|r| r.action("main", "think").map(|a| a.lifecycle))
            == Some(ActionLifecycle::InProgress)
    })
    .await;

    engine.abort().unwrap();
    engine.abort().unwrap();
    let err = handle.await.unwrap().unwrap_err();

    assert!(err.is_abort());
    assert_eq!(count(&events, "abort_requested"), 1);
    assert_eq!(count(&events, "action_retrying"), 0);
    let run = engine.last_run().unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error.as_deref(), Some("Pipeline execution aborted"));
    assert!(matches!(engine.abort(), Err(CouncilError::NoActiveRun)));
}

#[tokio::test(start_paused = true)]
async fn pause_holds_the_next_action_until_resume() {
    let engine = engine(Collaborators::new());
    register(&engine, gavel_pipeline("pausable"));
    let events = recorder(&engine);

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start_run("pausable", json!("plan")).await });
    until(|| !engine.pending_gavels().is_empty()).await;

    engine.pause().unwrap();
    engine.resolve_action_gavel("review", json!("ok")).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let paused = engine.active_run().unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.action("main", "after").is_none());

    engine.resume().unwrap();
    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.final_output, json!("ok!"));
    assert_eq!(count(&events, "run_paused"), 1);
    assert_eq!(count(&events, "run_resumed"), 1);
}

#[tokio::test(start_paused = true)]
async fn phase_review_resolves_or_skips() {
    let doc = |id: &str, timeout: Option<u64>| {
        json!({
            "id": id,
            "phases": [{
                "id": "draft",
                "gavel": { "enabled": true, "timeoutMs": timeout, "canSkip": true },
                "actions": [{ "id": "a", "actionType": "system", "promptTemplate": "v1 of {{input}}" }]
            }]
        })
    };
    let engine = engine(Collaborators::new());
    register(&engine, doc("skipped", Some(1_000)));
    register(&engine, doc("reviewed", None));

    let run = engine.start_run("skipped", json!("x")).await.unwrap();
    assert_eq!(run.final_output, json!("v1 of x"));
    assert!(engine.pending_gavels().is_empty());

    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.start_run("reviewed", json!("x")).await });
    until(|| !engine.pending_gavels().is_empty()).await;
    let pending = engine.pending_gavels();
    assert_eq!(pending[0].prompt, "Review the output of phase 'draft'");
    assert_eq!(pending[0].value, json!("v1 of x"));
    assert_eq!(
        engine.active_run().unwrap().phase("draft").unwrap().lifecycle,
        PhaseLifecycle::Respond
    );
    engine.resolve_phase_gavel("draft", json!("v2")).unwrap();
    assert_eq!(handle.await.unwrap().unwrap().final_output, json!("v2"));
}

// ---------------------------------------------------------------------------
// Events & history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_listeners_do_not_disturb_the_run() {
    let engine = engine(Collaborators::new());
    register(&engine, echo_pipeline("echo"));
    let failing: Arc<dyn EventListener> =
        Arc::new(|_: &PipelineEvent| -> Result<(), String> { Err("listener broke".into()) });
    let panicking: Arc<dyn EventListener> =
        Arc::new(|_: &PipelineEvent| -> Result<(), String> { panic!("listener panicked") });
    engine.add_listener(failing);
    engine.add_listener(panicking);
    let events = recorder(&engine);

    let run = engine.start_run("echo", json!("hi")).await.unwrap();
    assert_eq!(run.final_output, json!("ECHO: hi"));
    assert_eq!(count(&events, "run_completed"), 1);
}

#[tokio::test]
async fn broadcast_subscribers_see_lifecycle_order() {
    let engine = engine(Collaborators::new());
    register(&engine, echo_pipeline("echo"));
    let mut rx = engine.subscribe();
    engine.start_run("echo", json!("hi")).await.unwrap();

    let mut lifecycle = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::ActionLifecycle { lifecycle: lc, .. } = event {
            lifecycle.push(lc);
        }
    }
    assert_eq!(
        lifecycle,
        vec![
            ActionLifecycle::Called,
            ActionLifecycle::Start,
            ActionLifecycle::InProgress,
            ActionLifecycle::Complete
        ]
    );
}

#[tokio::test]
async fn history_keeps_the_most_recent_runs() {
    let config = EngineConfig {
        history_size: 2,
        ..EngineConfig::default()
    };
    let engine = PipelineEngine::new(config, Collaborators::new());
    register(&engine, echo_pipeline("echo"));
    for input in ["one", "two", "three"] {
        engine.start_run("echo", json!(input)).await.unwrap();
    }
    let history = engine.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].final_output, json!("ECHO: two"));
    assert_eq!(history[1].final_output, json!("ECHO: three"));
}

#[tokio::test]
async fn failed_runs_allow_the_next_start() {
    let llm = ScriptedClient::new();
    llm.push(Reply::Fail("boom".into()));
    let engine = engine(Collaborators::new().with_llm(Arc::new(llm)));
    register(
        &engine,
        single_phase("once", json!([{ "id": "call", "actionType": "standard" }])),
    );
    assert!(engine.start_run("once", json!("x")).await.is_err());
    assert!(!engine.is_running());
    let run = engine.start_run("once", json!("again")).await.unwrap();
    assert_eq!(run.final_output, json!("again"));
    assert_eq!(engine.history().len(), 2);
}
