//! Conversation data model.
//!
//! A [`Conversation`] outlives any single agent run. A run takes it by value,
//! works on its own copy, and hands the updated value back in its outcome.

use crate::events::AgentEvent;
use crate::tools::ToolInvocation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// The model a conversation talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    /// Provider model id (e.g. "gpt-4o-mini").
    pub id: String,
    /// Context window in tokens.
    pub token_limit: u32,
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            id: "gpt-4o-mini".to_string(),
            token_limit: 128_000,
        }
    }
}

/// A single part of structured message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// Message content: plain text or a list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain-text view of the content. Image parts are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// URLs of any image parts.
    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { url } => Some(url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

/// Where a context entered the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextOrigin {
    /// Attached by the caller before the run (file upload).
    #[default]
    FileUpload,
    /// Retrieved by the agent during the given step.
    Retrieved { step: u32 },
}

/// A retrieved document passage with source metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextWithMetadata {
    /// Passage text.
    pub text: String,
    /// Human-readable source filename.
    pub readable_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagenumber: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Storage key of the source document, if it lives in object storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_path: Option<String>,
    #[serde(default)]
    pub origin: ContextOrigin,
}

impl ContextWithMetadata {
    /// Create a context with only text and filename.
    pub fn new(text: impl Into<String>, readable_filename: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            readable_filename: readable_filename.into(),
            pagenumber: None,
            url: None,
            base_url: None,
            s3_path: None,
            origin: ContextOrigin::FileUpload,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.pagenumber = Some(page);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_s3_path(mut self, path: impl Into<String>) -> Self {
        self.s3_path = Some(path.into());
        self
    }

    pub fn with_origin(mut self, origin: ContextOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Rough token estimate (4 characters per token).
    pub fn estimated_tokens(&self) -> usize {
        self.text.len().div_ceil(4)
    }
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    /// File-upload contexts followed by contexts retrieved during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextWithMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_events: Vec<AgentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_step: Option<u32>,
    /// Text description of attached images, produced upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
}

impl Message {
    /// Create a user message with a fresh id.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create an assistant message with a fresh id.
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            contexts: Vec::new(),
            tools: Vec::new(),
            agent_events: Vec::new(),
            agent_step: None,
            image_description: None,
        }
    }

    pub fn with_contexts(mut self, contexts: Vec<ContextWithMetadata>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A conversation between one user and the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub messages: Vec<Message>,
    pub model: ModelDescriptor,
    pub prompt: String,
    pub temperature: f32,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new(model: ModelDescriptor, prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "New conversation".to_string(),
            messages: Vec::new(),
            model,
            prompt: prompt.into(),
            temperature,
        }
    }

    /// Replace the message with the same id, or append it.
    pub fn upsert_message(&mut self, message: Message) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    /// The most recent user message.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

/// Per-request course scope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CourseContext {
    pub course_name: String,
    /// Document groups the retriever is restricted to. Empty means all.
    #[serde(default)]
    pub doc_groups: Vec<String>,
    /// Project API key for workflow tools. Resolved from the credential store when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_api_key: Option<String>,
    #[serde(default)]
    pub user_identifier: String,
}

impl CourseContext {
    pub fn new(course_name: impl Into<String>) -> Self {
        Self {
            course_name: course_name.into(),
            ..Default::default()
        }
    }
}
