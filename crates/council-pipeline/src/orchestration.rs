//! Orchestration modes: how a resolved participant list is driven through
//! LLM calls for one standard action.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use council_llm::{ChatRequest, LlmClient, Message};
use council_types::{CouncilError, ParticipantResponse, Result};

use crate::definition::Orchestration;
use crate::participants::ResolvedParticipant;

/// Two responses "agree" when their lengths differ by less than this share
/// of the longer one.
pub const CONSENSUS_TOLERANCE: f64 = 0.10;

/// Naive agreement check used by `consensus`: compares lengths only.
pub fn lengths_agree(a: &str, b: &str) -> bool {
    let (la, lb) = (a.chars().count(), b.chars().count());
    let longer = la.max(lb);
    if longer == 0 {
        return true;
    }
    (la.abs_diff(lb) as f64) < CONSENSUS_TOLERANCE * longer as f64
}

/// The value an orchestration produces: the last successful response.
pub fn final_output(responses: &[ParticipantResponse]) -> Value {
    responses
        .iter()
        .rev()
        .find(|r| r.is_success())
        .map(|r| Value::String(r.content.clone()))
        .unwrap_or(Value::Null)
}

/// Wrap the task in the agent's prompt modifiers and append earlier
/// responses from this invocation.
pub fn compose_prompt(participant: &ResolvedParticipant, task: &str, prior: &[ParticipantResponse]) -> String {
    let mut body = task.trim().to_string();
    let earlier: Vec<&ParticipantResponse> = prior.iter().filter(|r| r.is_success()).collect();
    if !earlier.is_empty() {
        body.push_str("\n\n## Previous responses\n");
        for r in earlier {
            body.push_str(&format!("\n**{}** (round {}):\n{}\n", r.role, r.round, r.content.trim()));
        }
    }

    [participant.agent.prompt_prefix.trim(), body.as_str(), participant.agent.prompt_suffix.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub type ResponseObserver<'a> = dyn Fn(&ParticipantResponse) + Send + Sync + 'a;

/// Drives participants through one orchestration mode.
pub struct Orchestrator<'a> {
    llm: &'a Arc<dyn LlmClient>,
    action_id: &'a str,
    cancel: &'a CancellationToken,
    timeout_ms: Option<u64>,
    prompts: Option<&'a HashMap<String, String>>,
    observer: Option<&'a ResponseObserver<'a>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(llm: &'a Arc<dyn LlmClient>, action_id: &'a str, cancel: &'a CancellationToken) -> Self {
        Self {
            llm,
            action_id,
            cancel,
            timeout_ms: None,
            prompts: None,
            observer: None,
        }
    }

    /// Per-call timeout handed to the LLM client.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Per-participant task text keyed by position id; participants not in
    /// the map get the shared task.
    pub fn with_prompts(mut self, prompts: &'a HashMap<String, String>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Called once for every response, successful or not.
    pub fn with_observer(mut self, observer: &'a ResponseObserver<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run(
        &self,
        mode: Orchestration,
        participants: &[ResolvedParticipant],
        task: &str,
        max_rounds: u32,
    ) -> Result<Vec<ParticipantResponse>> {
        tracing::debug!(
            action = %self.action_id,
            mode = mode.as_str(),
            participants = participants.len(),
            "Orchestrating participants"
        );
        match mode {
            Orchestration::Sequential => self.rounds(participants, task, 1, false).await,
            Orchestration::Parallel => self.parallel(participants, task).await,
            Orchestration::RoundRobin => self.rounds(participants, task, max_rounds.max(1), false).await,
            Orchestration::Consensus => self.rounds(participants, task, max_rounds.max(1), true).await,
        }
    }

    async fn rounds(
        &self,
        participants: &[ResolvedParticipant],
        task: &str,
        max_rounds: u32,
        stop_on_agreement: bool,
    ) -> Result<Vec<ParticipantResponse>> {
        let mut responses: Vec<ParticipantResponse> = Vec::new();
        for round in 1..=max_rounds {
            for participant in participants {
                if self.cancel.is_cancelled() {
                    return Err(CouncilError::Aborted);
                }
                let response = self.ask(participant, task, &responses, round).await;
                if let Some(error) = &response.error {
                    return Err(CouncilError::action(
                        self.action_id,
                        format!("participant '{}' failed: {error}", participant.position_id),
                    ));
                }
                responses.push(response);
            }

            if stop_on_agreement && round < max_rounds {
                let this_round: Vec<&ParticipantResponse> =
                    responses.iter().filter(|r| r.round == round).collect();
                if let [.., a, b] = this_round.as_slice() {
                    if lengths_agree(&a.content, &b.content) {
                        tracing::info!(action = %self.action_id, round, "Consensus reached");
                        break;
                    }
                }
            }
        }
        Ok(responses)
    }

    async fn parallel(&self, participants: &[ResolvedParticipant], task: &str) -> Result<Vec<ParticipantResponse>> {
        if self.cancel.is_cancelled() {
            return Err(CouncilError::Aborted);
        }
        let calls = participants.iter().map(|p| self.ask(p, task, &[], 1));
        let responses = join_all(calls).await;

        if !responses.is_empty() && responses.iter().all(|r| !r.is_success()) {
            let errors = responses
                .iter()
                .filter_map(|r| r.error.as_deref().map(|e| format!("{}: {e}", r.position_id)))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CouncilError::action(
                self.action_id,
                format!("every participant failed ({errors})"),
            ));
        }
        Ok(responses)
    }

    async fn ask(
        &self,
        participant: &ResolvedParticipant,
        task: &str,
        prior: &[ParticipantResponse],
        round: u32,
    ) -> ParticipantResponse {
        let task = self
            .prompts
            .and_then(|m| m.get(&participant.position_id))
            .map(String::as_str)
            .unwrap_or(task);
        let prompt = compose_prompt(participant, task, prior);
        let mut messages = Vec::with_capacity(2);
        if !participant.agent.system_prompt.trim().is_empty() {
            messages.push(Message::system(participant.agent.system_prompt.clone()));
        }
        messages.push(Message::user(prompt));
        let mut request = ChatRequest::new(messages).with_config(participant.agent.api_config.clone());
        if let Some(ms) = self.timeout_ms {
            request = request.with_timeout_ms(ms);
        }

        let (content, error) = match self.llm.chat(&request).await {
            Ok(reply) => (reply.content, None),
            Err(e) => {
                tracing::warn!(
                    action = %self.action_id,
                    position = %participant.position_id,
                    error = %e,
                    "Participant call failed"
                );
                (String::new(), Some(e.to_string()))
            }
        };
        let response = ParticipantResponse {
            position_id: participant.position_id.clone(),
            agent_id: Some(participant.agent.id.clone()).filter(|id| !id.is_empty()),
            name: participant.agent.name.clone(),
            role: participant.role.clone(),
            round,
            content,
            error,
        };
        if let Some(observer) = self.observer {
            observer(&response);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Agent;
    use crate::participants::ParticipantSource;
    use council_llm::{Reply, ScriptedClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seat(id: &str) -> ResolvedParticipant {
        ResolvedParticipant {
            position_id: id.into(),
            role: id.to_uppercase(),
            agent: Agent {
                id: format!("agent-{id}"),
                name: id.into(),
                system_prompt: format!("You are {id}"),
                ..Agent::default()
            },
            position: None,
            source: ParticipantSource::Explicit,
        }
    }

    fn client(llm: &ScriptedClient) -> Arc<dyn LlmClient> {
        Arc::new(llm.clone())
    }

    #[test]
    fn length_heuristic() {
        assert!(lengths_agree("abcdefghij", "abcdefghij"));
        assert!(!lengths_agree("abcdefghij", "abcdefghi")); // 10% exactly is not under
        assert!(lengths_agree(&"x".repeat(100), &"y".repeat(95)));
        assert!(lengths_agree("", ""));
    }

    #[test]
    fn final_output_skips_failures() {
        let ok = ParticipantResponse {
            position_id: "a".into(),
            agent_id: None,
            name: "a".into(),
            role: "A".into(),
            round: 1,
            content: "first".into(),
            error: None,
        };
        let failed = ParticipantResponse {
            error: Some("boom".into()),
            content: String::new(),
            ..ok.clone()
        };
        assert_eq!(final_output(&[ok.clone(), failed.clone()]), Value::String("first".into()));
        assert_eq!(final_output(&[failed]), Value::Null);
    }

    #[test]
    fn prompt_wraps_modifiers_and_prior_responses() {
        let mut p = seat("critic");
        p.agent.prompt_prefix = "[critic]".into();
        p.agent.prompt_suffix = "Be brief.".into();
        let prior = ParticipantResponse {
            position_id: "writer".into(),
            agent_id: None,
            name: "writer".into(),
            role: "Writer".into(),
            round: 1,
            content: "A draft.".into(),
            error: None,
        };
        let prompt = compose_prompt(&p, "Review the draft.", &[prior]);
        assert!(prompt.starts_with("[critic]\n\nReview the draft."));
        assert!(prompt.contains("**Writer** (round 1):\nA draft."));
        assert!(prompt.ends_with("Be brief."));
    }

    #[tokio::test]
    async fn sequential_calls_see_prior_responses() {
        let llm = ScriptedClient::with_replies(["one", "two", "three"]);
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let seats = vec![seat("a"), seat("b"), seat("c")];
        let responses = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Sequential, &seats, "Task", 3)
            .await
            .unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(final_output(&responses), Value::String("three".into()));
        let requests = llm.requests();
        assert!(!requests[0].last_user_message().unwrap().contains("Previous responses"));
        assert!(requests[2].last_user_message().unwrap().contains("one"));
        assert!(requests[2].last_user_message().unwrap().contains("two"));
        assert_eq!(requests[1].system_prompt(), Some("You are b"));
    }

    #[tokio::test]
    async fn sequential_failure_fails_the_action() {
        let llm = ScriptedClient::new();
        llm.push(Reply::Text("ok".into()));
        llm.push(Reply::Fail("down".into()));
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let err = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Sequential, &[seat("a"), seat("b")], "Task", 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("participant 'b' failed"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn parallel_keeps_positions_and_tolerates_partial_failure() {
        let llm = ScriptedClient::with_responder(|req| {
            let system = req.system_prompt().unwrap_or_default().to_string();
            if system.ends_with('b') {
                Err(CouncilError::Other("nope".into()))
            } else {
                Ok(format!("reply from {system}"))
            }
        });
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let responses = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Parallel, &[seat("a"), seat("b"), seat("c")], "Task", 1)
            .await
            .unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].position_id, "a");
        assert!(!responses[1].is_success());
        assert_eq!(responses[2].content, "reply from You are c");
        assert_eq!(final_output(&responses), Value::String("reply from You are c".into()));
    }

    #[tokio::test]
    async fn parallel_fails_when_everyone_fails() {
        let llm = ScriptedClient::with_responder(|_| Err(CouncilError::Other("down".into())));
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let err = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Parallel, &[seat("a"), seat("b")], "Task", 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("every participant failed"));
    }

    #[tokio::test]
    async fn round_robin_runs_every_round() {
        let llm = ScriptedClient::new();
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let responses = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::RoundRobin, &[seat("a"), seat("b")], "Task", 3)
            .await
            .unwrap();
        assert_eq!(responses.len(), 6);
        assert_eq!(responses.last().unwrap().round, 3);
    }

    #[tokio::test]
    async fn consensus_stops_when_lengths_agree() {
        let llm = ScriptedClient::with_replies(["short", "a much longer answer", "same size", "same size"]);
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let responses = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Consensus, &[seat("a"), seat("b")], "Task", 5)
            .await
            .unwrap();
        assert_eq!(responses.len(), 4);
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn per_participant_prompts_override_the_task() {
        let llm = ScriptedClient::new();
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let mut prompts = HashMap::new();
        prompts.insert("b".to_string(), "Task for B".to_string());
        Orchestrator::new(&arc, "act", &cancel)
            .with_prompts(&prompts)
            .run(Orchestration::Parallel, &[seat("a"), seat("b")], "Shared task", 1)
            .await
            .unwrap();
        let mut sent: Vec<String> = llm
            .requests()
            .iter()
            .filter_map(|r| r.last_user_message().map(str::to_string))
            .collect();
        sent.sort();
        assert_eq!(sent, vec!["Shared task", "Task for B"]);
    }

    #[tokio::test]
    async fn observer_sees_every_response() {
        let llm = ScriptedClient::new();
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        let seen = AtomicUsize::new(0);
        let observer = |_: &ParticipantResponse| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        Orchestrator::new(&arc, "act", &cancel)
            .with_observer(&observer)
            .run(Orchestration::RoundRobin, &[seat("a"), seat("b")], "Task", 2)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_calls() {
        let llm = ScriptedClient::new();
        let arc = client(&llm);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Orchestrator::new(&arc, "act", &cancel)
            .run(Orchestration::Sequential, &[seat("a")], "Task", 1)
            .await
            .unwrap_err();
        assert!(err.is_abort());
        assert_eq!(llm.call_count(), 0);
    }
}
