//! Progress events emitted during an agent run.
//!
//! [`AgentEvent`]s form the run's audit log and are stored on the user
//! message. [`StreamEvent`]s are what the caller observes live through an
//! [`EventSink`].

use crate::conversation::ContextWithMetadata;
use crate::tools::ToolInvocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What an agent event reports on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    Initializing,
    ActionSelection,
    Retrieval,
    Tool,
    FinalResponse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventStatus {
    Running,
    Done,
    Error,
}

/// One entry of the run's audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub id: String,
    pub step: u32,
    pub kind: AgentEventKind,
    pub status: AgentEventStatus,
    pub title: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only log of agent events with in-place status updates by id.
#[derive(Debug, Clone, Default)]
pub struct AgentEventLog {
    events: Vec<AgentEvent>,
}

impl AgentEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `running` event and return its id.
    pub fn start(&mut self, step: u32, kind: AgentEventKind, title: impl Into<String>) -> String {
        self.push(step, kind, AgentEventStatus::Running, title, Map::new())
    }

    /// Append an event with an explicit status and metadata.
    pub fn push(
        &mut self,
        step: u32,
        kind: AgentEventKind,
        status: AgentEventStatus,
        title: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> String {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.events.push(AgentEvent {
            id: id.clone(),
            step,
            kind,
            status,
            title: title.into(),
            metadata,
            created_at: now,
            updated_at: now,
        });
        id
    }

    /// Update status and merge metadata into the event with the given id.
    ///
    /// Returns false if no such event exists.
    pub fn update(&mut self, id: &str, status: AgentEventStatus, metadata: Map<String, Value>) -> bool {
        match self.events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.status = status;
                event.metadata.extend(metadata);
                event.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }
}

/// A tool the selector picked, as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedToolSummary {
    pub invocation_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Per-context metadata for rendering a sources list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextMetadata {
    /// 1-based citation index.
    pub index: usize,
    pub readable_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagenumber: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ContextMetadata {
    pub fn from_contexts(contexts: &[ContextWithMetadata]) -> Vec<Self> {
        contexts
            .iter()
            .enumerate()
            .map(|(i, c)| Self {
                index: i + 1,
                readable_filename: c.readable_filename.clone(),
                pagenumber: c.pagenumber,
                url: c.url.clone(),
            })
            .collect()
    }
}

/// Outcome of one executed tool in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSummary {
    pub name: String,
    pub readable_name: String,
    pub success: bool,
}

/// Summary sent with the terminal `done` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunSummary {
    pub steps: u32,
    pub contexts_retrieved: usize,
    pub tools: Vec<ToolSummary>,
}

/// Everything the caller can observe during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AgentEventsUpdate {
        events: Vec<AgentEvent>,
    },
    Selection {
        step: u32,
        tools: Vec<SelectedToolSummary>,
    },
    Retrieval {
        step: u32,
        query: String,
        contexts_count: usize,
    },
    Tool {
        step: u32,
        invocation: ToolInvocation,
    },
    ToolsUpdate {
        tools: Vec<ToolInvocation>,
    },
    ContextsMetadata {
        contexts: Vec<ContextMetadata>,
    },
    FinalTokens {
        delta: String,
        done: bool,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Done {
        conversation_id: String,
        final_message_id: String,
        summary: RunSummary,
    },
}

impl StreamEvent {
    /// Name used for SSE `event:` lines.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::AgentEventsUpdate { .. } => "agent_events_update",
            StreamEvent::Selection { .. } => "selection",
            StreamEvent::Retrieval { .. } => "retrieval",
            StreamEvent::Tool { .. } => "tool",
            StreamEvent::ToolsUpdate { .. } => "tools_update",
            StreamEvent::ContextsMetadata { .. } => "contexts_metadata",
            StreamEvent::FinalTokens { .. } => "final_tokens",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }
}

/// Destination for stream events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

impl EventSink for mpsc::UnboundedSender<StreamEvent> {
    fn emit(&self, event: StreamEvent) {
        // A closed receiver means the caller went away; the run keeps going.
        let _ = self.send(event);
    }
}

/// Sink that records every event, for callers that inspect the run afterwards.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: StreamEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
