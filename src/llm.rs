//! Language model access.
//!
//! The agent needs two things from a model: a non-streaming completion that
//! may return tool calls, and a token stream for the final answer.

use crate::error::{QuillError, Result};
use async_openai::config::OpenAIConfig;
use async_openai::types::CreateChatCompletionRequest;
use async_openai::Client;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, instrument};

/// A tool call as returned by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub arguments: String,
}

/// Stream of text deltas from the model.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send a completion request with tools attached and return the tool calls, if any.
    async fn complete_with_tools(&self, request: CreateChatCompletionRequest) -> Result<Vec<LlmToolCall>>;

    /// Send a streaming completion request.
    async fn stream(&self, request: CreateChatCompletionRequest) -> Result<TokenStream>;
}

/// OpenAI-compatible chat completions.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
}

impl OpenAiModel {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete_with_tools(&self, request: CreateChatCompletionRequest) -> Result<Vec<LlmToolCall>> {
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| QuillError::OpenAI(format!("Tool selection request failed: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| QuillError::Llm("No response from model".to_string()))?;

        let calls: Vec<LlmToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| LlmToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        debug!("Model requested {} tool calls", calls.len());
        Ok(calls)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream(&self, mut request: CreateChatCompletionRequest) -> Result<TokenStream> {
        request.stream = Some(true);

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| QuillError::OpenAI(format!("Failed to start answer stream: {}", e)))?;

        let tokens = stream.filter_map(|item| async move {
            match item {
                Ok(response) => {
                    let delta: String = response
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .collect();
                    (!delta.is_empty()).then_some(Ok(delta))
                }
                Err(e) => Some(Err(QuillError::OpenAI(format!("Answer stream failed: {}", e)))),
            }
        });

        Ok(tokens.boxed())
    }
}
