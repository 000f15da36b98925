use async_trait::async_trait;

use council_types::Result;

use crate::{ChatRequest, ChatResponse, GenerateOptions, Message};

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// The LLM call collaborator the pipeline engine talks to.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Single-prompt convenience call; by default a one-turn [`chat`](Self::chat).
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        let request = ChatRequest {
            messages,
            config: options.config.clone(),
            timeout_ms: options.timeout_ms,
        };
        Ok(self.chat(&request).await?.content)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmClient for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(ChatResponse {
                content: format!("{} messages", request.messages.len()),
                model: "mock".into(),
            })
        }
    }

    #[tokio::test]
    async fn generate_wraps_prompt_in_chat() {
        let client = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let options = GenerateOptions {
            system: Some("be brief".into()),
            timeout_ms: Some(500),
            ..GenerateOptions::default()
        };
        let out = client.generate("hello", &options).await.unwrap();
        assert_eq!(out, "2 messages");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].system_prompt(), Some("be brief"));
        assert_eq!(seen[0].last_user_message(), Some("hello"));
        assert_eq!(seen[0].timeout_ms, Some(500));
    }

    #[tokio::test]
    async fn generate_skips_empty_system_prompt() {
        let client = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let options = GenerateOptions {
            system: Some(String::new()),
            ..GenerateOptions::default()
        };
        assert_eq!(client.generate("x", &options).await.unwrap(), "1 messages");
    }
}
