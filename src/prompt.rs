//! Chat request construction.

use crate::config::Prompts;
use crate::conversation::{ContextWithMetadata, Conversation, CourseContext, Role};
use crate::error::{QuillError, Result};
use crate::tools::{ToolInvocation, ToolResult};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use std::collections::HashMap;

/// Older messages beyond this many are left out of prompts.
const MAX_HISTORY_MESSAGES: usize = 20;

pub(crate) fn system_message(content: String) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content)
        .build()
        .map_err(|e| QuillError::Llm(e.to_string()))?
        .into())
}

pub(crate) fn user_message(content: String) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestUserMessageArgs::default()
        .content(content)
        .build()
        .map_err(|e| QuillError::Llm(e.to_string()))?
        .into())
}

pub(crate) fn assistant_message(content: String) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestAssistantMessageArgs::default()
        .content(content)
        .build()
        .map_err(|e| QuillError::Llm(e.to_string()))?
        .into())
}

/// Prior turns (everything before the last user message) as chat messages.
pub(crate) fn history_messages(conversation: &Conversation) -> Result<Vec<ChatCompletionRequestMessage>> {
    let last_user = conversation.messages.iter().rposition(|m| m.role == Role::User);
    let history = match last_user {
        Some(idx) => &conversation.messages[..idx],
        None => &conversation.messages[..],
    };
    let start = history.len().saturating_sub(MAX_HISTORY_MESSAGES);

    history[start..]
        .iter()
        .map(|m| match m.role {
            Role::User => user_message(m.text()),
            Role::Assistant => assistant_message(m.text()),
        })
        .collect()
}

/// Numbered passage list; numbers are the citation indices.
pub fn format_contexts(contexts: &[ContextWithMetadata]) -> String {
    if contexts.is_empty() {
        return "None".to_string();
    }

    contexts
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let page = c.pagenumber.map(|p| format!(", p. {}", p)).unwrap_or_default();
            format!("---\n[{}] {}{}\n{}\n---", i + 1, c.readable_filename, page, c.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Tool results in invocation order.
pub fn format_tool_outputs(tools: &[ToolInvocation]) -> String {
    let lines: Vec<String> = tools
        .iter()
        .filter_map(|t| match &t.result {
            Some(ToolResult::Output(output)) => {
                Some(format!("{}:\n{}", t.readable_name, output.to_prompt_text()))
            }
            Some(ToolResult::Error(e)) => Some(format!("{} failed: {}", t.readable_name, e)),
            None => None,
        })
        .collect();

    if lines.is_empty() {
        "None".to_string()
    } else {
        lines.join("\n\n")
    }
}

/// Build the streaming request for the final answer.
pub fn build_answer_request(
    conversation: &Conversation,
    course: &CourseContext,
    contexts: &[ContextWithMetadata],
    tools: &[ToolInvocation],
    prompts: &Prompts,
) -> Result<CreateChatCompletionRequest> {
    let question = conversation
        .last_user_message()
        .map(|m| m.text())
        .ok_or_else(|| QuillError::InvalidInput("Conversation has no user message".to_string()))?;

    let mut vars = HashMap::new();
    vars.insert("course_name".to_string(), course.course_name.clone());
    vars.insert("contexts".to_string(), format_contexts(contexts));
    vars.insert("tool_outputs".to_string(), format_tool_outputs(tools));
    vars.insert("question".to_string(), question);

    let mut system = prompts.render_with_custom(&prompts.answer.system, &vars);
    if !conversation.prompt.trim().is_empty() {
        system.push_str("\n\n");
        system.push_str(&conversation.prompt);
    }

    let mut messages = vec![system_message(system)?];
    messages.extend(history_messages(conversation)?);
    messages.push(user_message(prompts.render_with_custom(&prompts.answer.user, &vars))?);

    CreateChatCompletionRequestArgs::default()
        .model(&conversation.model.id)
        .messages(messages)
        .temperature(conversation.temperature)
        .stream(true)
        .build()
        .map_err(|e| QuillError::Llm(e.to_string()))
}
