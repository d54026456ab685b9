//! Per-run working state.

use crate::conversation::{ContextOrigin, ContextWithMetadata, Conversation, Message};
use crate::events::{AgentEventLog, RunSummary, ToolSummary};
use crate::tools::ToolInvocation;
use std::collections::HashSet;

/// Everything one agent run mutates. Created fresh per run and consumed at
/// the end, so nothing leaks between runs.
#[derive(Debug)]
pub struct RunState {
    /// Working copy of the conversation, handed back when the run ends.
    pub conversation: Conversation,
    /// The user message being enriched with contexts, tools and events.
    pub message: Message,
    pub log: AgentEventLog,
    pub tools: Vec<ToolInvocation>,
    /// Steps started so far.
    pub steps: u32,
    signatures: HashSet<String>,
    file_contexts: Vec<ContextWithMetadata>,
    accumulated: Vec<ContextWithMetadata>,
}

impl RunState {
    /// Merge the user message into the conversation and start tracking it.
    pub fn new(mut conversation: Conversation, mut message: Message) -> Self {
        let file_contexts: Vec<_> = message
            .contexts
            .drain(..)
            .map(|c| c.with_origin(ContextOrigin::FileUpload))
            .collect();
        message.contexts = file_contexts.clone();
        conversation.upsert_message(message.clone());

        Self {
            conversation,
            message,
            log: AgentEventLog::new(),
            tools: Vec::new(),
            steps: 0,
            signatures: HashSet::new(),
            file_contexts,
            accumulated: Vec::new(),
        }
    }

    /// Record the batch's signatures unless every one was seen before.
    ///
    /// Returns false for a fully repeated batch. A batch with at least one new
    /// signature proceeds in full, repeats included.
    pub fn record_signatures(&mut self, batch: &[ToolInvocation]) -> bool {
        let signatures: Vec<String> = batch.iter().map(ToolInvocation::signature).collect();
        if signatures.iter().all(|s| self.signatures.contains(s)) {
            return false;
        }
        self.signatures.extend(signatures);
        true
    }

    /// Append contexts retrieved during `step`.
    pub fn add_contexts(&mut self, step: u32, contexts: Vec<ContextWithMetadata>) {
        self.accumulated.extend(
            contexts
                .into_iter()
                .map(|c| c.with_origin(ContextOrigin::Retrieved { step })),
        );
    }

    pub fn accumulated(&self) -> &[ContextWithMetadata] {
        &self.accumulated
    }

    /// File-upload contexts followed by retrieved ones. Citation indices refer to this order.
    pub fn contexts(&self) -> Vec<ContextWithMetadata> {
        self.file_contexts
            .iter()
            .chain(self.accumulated.iter())
            .cloned()
            .collect()
    }

    /// Copy the run's progress onto the message and the message into the conversation.
    pub fn sync_message(&mut self) {
        self.message.contexts = self.contexts();
        self.message.tools = self.tools.clone();
        self.message.agent_events = self.log.events().to_vec();
        self.message.agent_step = Some(self.steps);
        self.conversation.upsert_message(self.message.clone());
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            steps: self.steps,
            contexts_retrieved: self.accumulated.len(),
            tools: self
                .tools
                .iter()
                .map(|t| ToolSummary {
                    name: t.name.clone(),
                    readable_name: t.readable_name.clone(),
                    success: t.succeeded(),
                })
                .collect(),
        }
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }
}
