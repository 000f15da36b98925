//! Offline clients: [`EchoClient`] for dry runs and [`ScriptedClient`] for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use council_types::{CouncilError, Result};

use crate::{ChatRequest, ChatResponse, LlmClient};

// ---------------------------------------------------------------------------
// EchoClient
// ---------------------------------------------------------------------------

/// Replies with the last user message, optionally prefixed.
#[derive(Debug, Clone, Default)]
pub struct EchoClient {
    prefix: String,
}

impl EchoClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl LlmClient for EchoClient {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let last = request.last_user_message().unwrap_or_default();
        Ok(ChatResponse {
            content: format!("{}{}", self.prefix, last),
            model: "echo".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedClient
// ---------------------------------------------------------------------------

/// One queued reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// Fails the call with a retryable provider error carrying this message.
    Fail(String),
}

type Responder = Arc<dyn Fn(&ChatRequest) -> Result<String> + Send + Sync>;

/// A client that replays queued replies and records every request.
///
/// When the queue is empty the responder closure answers; without one the
/// client echoes the last user message.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    responder: Option<Responder>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    delay: Option<Duration>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("queued", &self.pending())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue plain-text replies in order.
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for r in replies {
            client.push(Reply::Text(r.into()));
        }
        client
    }

    /// Answer every call with a closure.
    pub fn with_responder(
        f: impl Fn(&ChatRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Arc::new(f)),
            ..Self::default()
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Reply) {
        lock(&self.replies).push_back(reply);
    }

    pub fn pending(&self) -> usize {
        lock(&self.replies).len()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Snapshot of every request seen so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        lock(&self.requests).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = lock(&self.replies).pop_front();
        let content = match queued {
            Some(Reply::Text(text)) => text,
            Some(Reply::Fail(message)) => {
                return Err(CouncilError::ProviderError {
                    provider: "scripted".into(),
                    status: 500,
                    message,
                    retryable: true,
                })
            }
            None => match &self.responder {
                Some(f) => f(request)?,
                None => request.last_user_message().unwrap_or_default().to_string(),
            },
        };
        Ok(ChatResponse {
            content,
            model: "scripted".into(),
        })
    }
}
