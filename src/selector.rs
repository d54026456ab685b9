//! Tool selection through function calling.

use crate::config::SelectionPrompts;
use crate::conversation::{ContextWithMetadata, Conversation};
use crate::error::{QuillError, Result};
use crate::llm::{LanguageModel, LlmToolCall};
use crate::prompt::{history_messages, system_message, user_message};
use crate::tools::{Tool, ToolInvocation};
use async_openai::types::{
    ChatCompletionTool, ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, FunctionObject,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Tools the model chose for the next step.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Empty when the model wants to answer directly.
    pub tools: Vec<ToolInvocation>,
    pub error: Option<String>,
}

/// Asks the model which tools to call next.
pub struct ToolSelector {
    model: Arc<dyn LanguageModel>,
    prompts: SelectionPrompts,
    temperature: f32,
}

impl ToolSelector {
    pub fn new(model: Arc<dyn LanguageModel>, prompts: SelectionPrompts) -> Self {
        Self {
            model,
            prompts,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Select tools given the conversation so far. Errors are reported in the
    /// returned [`Selection`], never raised.
    #[instrument(skip_all, fields(conversation = %conversation.id, tools = available.len()))]
    pub async fn select(
        &self,
        conversation: &Conversation,
        available: &[Tool],
        image_description: Option<&str>,
    ) -> Selection {
        let request = match self.build_request(conversation, available, image_description) {
            Ok(request) => request,
            Err(e) => {
                return Selection {
                    tools: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        match self.model.complete_with_tools(request).await {
            Ok(calls) => {
                let tools = map_tool_calls(calls, available);
                debug!("Selected {} tools", tools.len());
                Selection { tools, error: None }
            }
            Err(e) => {
                warn!("Tool selection failed: {}", e);
                Selection {
                    tools: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Build the function-calling request.
    pub fn build_request(
        &self,
        conversation: &Conversation,
        available: &[Tool],
        image_description: Option<&str>,
    ) -> Result<CreateChatCompletionRequest> {
        let last = conversation
            .last_user_message()
            .ok_or_else(|| QuillError::InvalidInput("Conversation has no user message".to_string()))?;

        let mut last_text = last.text();
        if !last.contexts.is_empty() {
            last_text.push_str("\n\n");
            last_text.push_str(&inline_contexts(&last.contexts));
        }
        if let Some(description) = image_description.filter(|d| !d.trim().is_empty()) {
            last_text.push_str("\n\nImage description: ");
            last_text.push_str(description);
        }

        let mut messages = vec![system_message(self.prompts.system.clone())?];
        messages.extend(history_messages(conversation)?);
        messages.push(user_message(last_text)?);

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&conversation.model.id)
            .messages(messages)
            .temperature(self.temperature);

        if !available.is_empty() {
            builder
                .tools(available.iter().map(function_definition).collect::<Vec<_>>())
                .tool_choice(ChatCompletionToolChoiceOption::Auto);
        }

        builder.build().map_err(|e| QuillError::Llm(e.to_string()))
    }
}

fn function_definition(tool: &Tool) -> ChatCompletionTool {
    ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObject {
            name: tool.name.clone(),
            description: Some(tool.description.clone()),
            parameters: Some(tool.parameters_schema()),
            strict: None,
        },
    }
}

/// Retrieved passages as plain text appended to the user's message.
fn inline_contexts(contexts: &[ContextWithMetadata]) -> String {
    let passages = contexts
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}\n{}", i + 1, c.readable_filename, c.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Retrieved passages so far:\n{}", passages)
}

/// Match model tool calls to catalog entries, dropping unknown names.
fn map_tool_calls(calls: Vec<LlmToolCall>, available: &[Tool]) -> Vec<ToolInvocation> {
    calls
        .into_iter()
        .filter_map(|call| {
            let Some(tool) = available.iter().find(|t| t.name == call.name) else {
                warn!("Model requested unknown tool '{}', ignoring", call.name);
                return None;
            };

            let arguments = match parse_arguments(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    warn!("Invalid arguments for tool '{}': {}", call.name, e);
                    return None;
                }
            };

            let id = if call.id.is_empty() { ToolInvocation::new_id() } else { call.id };
            Some(tool.invoke(id, arguments))
        })
        .collect()
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(QuillError::Llm(format!("Tool arguments are not an object: {}", other))),
    }
}
