//! LLM call collaborator for Council pipelines.
//!
//! Provides the `LlmClient` trait (`chat` and `generate`), the message and
//! request types, an OpenAI-compatible HTTP client, and offline clients for
//! dry runs and tests.

mod openai;
mod provider;
mod scripted;
mod types;

pub use openai::OpenAiClient;
pub use provider::*;
pub use scripted::{EchoClient, Reply, ScriptedClient};
pub use types::*;
