//! Agent loop: select tools, run them, repeat, then stream a cited answer.

use super::state::RunState;
use crate::citations::{CitationProcessor, CitationState, LinkSigner};
use crate::config::Prompts;
use crate::conversation::{ContextWithMetadata, Conversation, CourseContext, Message};
use crate::error::{QuillError, Result};
use crate::events::{
    AgentEventKind, AgentEventStatus, ContextMetadata, EventSink, SelectedToolSummary, StreamEvent,
};
use crate::llm::LanguageModel;
use crate::persistence::ConversationStore;
use crate::prompt::build_answer_request;
use crate::retrieval::{ContextRetriever, RetrievalOutcome, RetrievalQuery};
use crate::selector::ToolSelector;
use crate::tools::{
    search_documents_tool, Tool, ToolCatalog, ToolExecutor, ToolInvocation, ToolOutput, ToolResult,
    SEARCH_TOOL_NAME,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound on selection steps per run.
pub const MAX_STEPS: u32 = 20;

const DEFAULT_TOKEN_BUDGET: usize = 4000;

/// Result of one agent run.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    /// The conversation as of the last consistent state.
    pub conversation: Conversation,
    pub error: Option<String>,
}

/// Drives one user message through tool selection, execution and answering.
pub struct AgentRunner {
    model: Arc<dyn LanguageModel>,
    selector: ToolSelector,
    catalog: Arc<dyn ToolCatalog>,
    retriever: Arc<dyn ContextRetriever>,
    executor: ToolExecutor,
    store: Arc<dyn ConversationStore>,
    signer: Option<Arc<dyn LinkSigner>>,
    prompts: Prompts,
    token_budget: usize,
}

impl AgentRunner {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        catalog: Arc<dyn ToolCatalog>,
        retriever: Arc<dyn ContextRetriever>,
        executor: ToolExecutor,
        store: Arc<dyn ConversationStore>,
        prompts: Prompts,
    ) -> Self {
        Self {
            selector: ToolSelector::new(model.clone(), prompts.selection.clone()),
            model,
            catalog,
            retriever,
            executor,
            store,
            signer: None,
            prompts,
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }

    /// Sign storage paths of cited documents with this signer.
    pub fn with_signer(mut self, signer: Arc<dyn LinkSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_selection_temperature(mut self, temperature: f32) -> Self {
        self.selector = self.selector.with_temperature(temperature);
        self
    }

    /// Per-query retrieval budget, further capped at half the model's context window.
    pub fn with_token_budget(mut self, tokens: usize) -> Self {
        self.token_budget = tokens;
        self
    }

    /// Run the agent for `user_message`.
    ///
    /// Progress is reported through `sink`. The run ends with either a `done`
    /// event or a non-recoverable `error` event.
    #[instrument(skip_all, fields(conversation = %conversation.id, course = %course.course_name))]
    pub async fn run(
        &self,
        conversation: Conversation,
        user_message: Message,
        course: &CourseContext,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let mut run = RunState::new(conversation, user_message);

        match self.drive(&mut run, course, sink, &cancel).await {
            Ok(()) => RunOutcome {
                success: true,
                conversation: run.into_conversation(),
                error: None,
            },
            Err(e) => {
                error!("Agent run failed: {}", e);
                sink.emit(StreamEvent::Error {
                    message: e.to_string(),
                    recoverable: false,
                });
                RunOutcome {
                    success: false,
                    conversation: run.into_conversation(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn drive(
        &self,
        run: &mut RunState,
        course: &CourseContext,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tools = self.load_tools(run, course, sink).await;
        let image_description = run.message.image_description.clone();
        let budget = self
            .token_budget
            .min(run.conversation.model.token_limit as usize / 2);

        let mut hit_limit = true;
        for step in 1..=MAX_STEPS {
            if cancel.is_cancelled() {
                info!("Run cancelled before step {}", step);
                return Err(QuillError::Cancelled);
            }
            run.steps = step;
            debug!("Agent step {}", step);

            let selection_id = run.log.start(step, AgentEventKind::ActionSelection, "Choosing next actions");
            self.publish(run, sink);

            let selection = self
                .selector
                .select(&run.conversation, &tools, image_description.as_deref())
                .await;

            if let Some(message) = &selection.error {
                run.log.update(&selection_id, AgentEventStatus::Error, meta(json!({ "error": message })));
                sink.emit(StreamEvent::Error {
                    message: format!("Tool selection failed: {}", message),
                    recoverable: true,
                });
            }

            if selection.tools.is_empty() {
                if selection.error.is_none() {
                    run.log.update(&selection_id, AgentEventStatus::Done, meta(json!({ "tools": [] })));
                }
                self.publish(run, sink);
                hit_limit = false;
                break;
            }

            sink.emit(StreamEvent::Selection {
                step,
                tools: selection
                    .tools
                    .iter()
                    .map(|t| SelectedToolSummary {
                        invocation_id: t.invocation_id.clone(),
                        name: t.name.clone(),
                        arguments: t.arguments.clone(),
                    })
                    .collect(),
            });

            if !run.record_signatures(&selection.tools) {
                info!("Step {} repeats earlier requests, finishing", step);
                run.log.update(
                    &selection_id,
                    AgentEventStatus::Done,
                    meta(json!({ "repeated": true, "note": "Requested actions were already performed" })),
                );
                self.publish(run, sink);
                hit_limit = false;
                break;
            }

            let names: Vec<&str> = selection.tools.iter().map(|t| t.name.as_str()).collect();
            run.log.update(&selection_id, AgentEventStatus::Done, meta(json!({ "tools": names })));

            let results = self.execute_step(run, step, selection.tools, course, budget, sink).await;

            if cancel.is_cancelled() {
                info!("Run cancelled during step {}, discarding its results", step);
                results.discard(run);
                run.sync_message();
                self.publish(run, sink);
                return Err(QuillError::Cancelled);
            }

            self.integrate_step(run, step, results, sink);
            run.sync_message();
            self.publish(run, sink);
            self.persist(run, &run.message, course).await;
        }

        if hit_limit {
            warn!("Reached the step limit of {}", MAX_STEPS);
        }

        run.sync_message();
        self.persist(run, &run.message, course).await;

        let contexts = run.contexts();
        sink.emit(StreamEvent::ContextsMetadata {
            contexts: ContextMetadata::from_contexts(&contexts),
        });

        let final_id = run.log.start(run.steps, AgentEventKind::FinalResponse, "Writing answer");
        self.publish(run, sink);

        let answer = match self.stream_answer(run, contexts, course, sink, cancel).await {
            Ok(answer) => answer,
            Err(e) => {
                run.log.update(&final_id, AgentEventStatus::Error, meta(json!({ "error": e.to_string() })));
                run.sync_message();
                self.publish(run, sink);
                self.persist(run, &run.message, course).await;
                return Err(e);
            }
        };

        run.log.update(&final_id, AgentEventStatus::Done, Map::new());
        run.sync_message();
        self.publish(run, sink);
        self.persist(run, &run.message, course).await;

        let mut reply = Message::assistant(answer);
        reply.agent_step = Some(run.steps);
        run.conversation.upsert_message(reply.clone());
        self.persist(run, &reply, course).await;

        info!(
            "Run finished after {} steps with {} retrieved contexts",
            run.steps,
            run.accumulated().len()
        );
        sink.emit(StreamEvent::Done {
            conversation_id: run.conversation.id.clone(),
            final_message_id: reply.id,
            summary: run.summary(),
        });

        Ok(())
    }

    /// Fetch the course catalog and prepend the search tool. A catalog failure
    /// leaves only the search tool.
    async fn load_tools(&self, run: &mut RunState, course: &CourseContext, sink: &dyn EventSink) -> Vec<Tool> {
        let init_id = run.log.start(0, AgentEventKind::Initializing, "Loading tools");
        self.publish(run, sink);

        let mut tools = vec![search_documents_tool(&self.prompts.selection.search_tool_description)];
        match self.catalog.fetch_tools(course).await {
            Ok(fetched) => {
                debug!("Fetched {} tools for {}", fetched.len(), course.course_name);
                tools.extend(fetched.into_iter().filter(|t| t.enabled && !t.is_search()));
                run.log.update(&init_id, AgentEventStatus::Done, meta(json!({ "tools": tools.len() })));
            }
            Err(e) => {
                warn!("Failed to fetch tools: {}", e);
                run.log.update(&init_id, AgentEventStatus::Error, meta(json!({ "error": e.to_string() })));
                sink.emit(StreamEvent::Error {
                    message: format!("Could not load course tools: {}", e),
                    recoverable: true,
                });
            }
        }

        self.publish(run, sink);
        tools
    }

    /// Run one step's retrieval and tool batches concurrently.
    async fn execute_step(
        &self,
        run: &mut RunState,
        step: u32,
        selected: Vec<ToolInvocation>,
        course: &CourseContext,
        budget: usize,
        sink: &dyn EventSink,
    ) -> StepResults {
        let (searches, external): (Vec<_>, Vec<_>) =
            selected.into_iter().partition(|t| t.name == SEARCH_TOOL_NAME);
        let question = run.message.text();

        let mut event_ids = HashMap::new();
        for search in &searches {
            let query = search.str_arg("query").unwrap_or(&question);
            let id = run.log.start(step, AgentEventKind::Retrieval, format!("Searching: {}", query));
            event_ids.insert(search.invocation_id.clone(), id);
        }
        for tool in &external {
            let id = run.log.start(step, AgentEventKind::Tool, format!("Running {}", tool.readable_name));
            event_ids.insert(tool.invocation_id.clone(), id);
            sink.emit(StreamEvent::Tool {
                step,
                invocation: tool.clone(),
            });
        }
        self.publish(run, sink);

        let (retrieved, executed) = tokio::join!(
            self.retrieve_all(searches, course, &question, budget),
            self.executor.execute_many(external, course)
        );

        StepResults {
            event_ids,
            retrieved,
            executed,
        }
    }

    /// Fold a finished step into `run`. Only the control task calls this, between steps.
    fn integrate_step(&self, run: &mut RunState, step: u32, results: StepResults, sink: &dyn EventSink) {
        let StepResults {
            event_ids,
            retrieved,
            executed,
        } = results;

        for (mut invocation, query, outcome) in retrieved {
            let count = outcome.contexts.len();
            let event_id = event_ids.get(&invocation.invocation_id).cloned().unwrap_or_default();

            match outcome.error {
                Some(message) => {
                    run.log.update(&event_id, AgentEventStatus::Error, meta(json!({ "query": query, "error": message })));
                    sink.emit(StreamEvent::Error {
                        message: format!("Search for '{}' failed: {}", query, message),
                        recoverable: true,
                    });
                    invocation.result = Some(ToolResult::Error(message));
                }
                None => {
                    run.log.update(
                        &event_id,
                        AgentEventStatus::Done,
                        meta(json!({ "query": query, "contexts_count": count })),
                    );
                    invocation.result = Some(ToolResult::Output(ToolOutput::Text(format!(
                        "Found {} passages",
                        count
                    ))));
                }
            }

            sink.emit(StreamEvent::Retrieval {
                step,
                query,
                contexts_count: count,
            });
            run.add_contexts(step, outcome.contexts);
            run.tools.push(invocation);
        }

        for invocation in executed {
            let event_id = event_ids.get(&invocation.invocation_id).cloned().unwrap_or_default();
            match invocation.error() {
                Some(message) => {
                    run.log.update(&event_id, AgentEventStatus::Error, meta(json!({ "error": message })));
                    sink.emit(StreamEvent::Error {
                        message: format!("{} failed: {}", invocation.readable_name, message),
                        recoverable: true,
                    });
                }
                None => {
                    run.log.update(&event_id, AgentEventStatus::Done, Map::new());
                }
            }
            sink.emit(StreamEvent::Tool {
                step,
                invocation: invocation.clone(),
            });
            run.tools.push(invocation);
        }

        sink.emit(StreamEvent::ToolsUpdate {
            tools: run.tools.clone(),
        });
    }

    /// Run searches concurrently. Results come back in completion order.
    async fn retrieve_all(
        &self,
        searches: Vec<ToolInvocation>,
        course: &CourseContext,
        fallback_query: &str,
        budget: usize,
    ) -> Vec<(ToolInvocation, String, RetrievalOutcome)> {
        searches
            .into_iter()
            .map(|invocation| {
                let query = RetrievalQuery {
                    course_name: course.course_name.clone(),
                    query: invocation.str_arg("query").unwrap_or(fallback_query).to_string(),
                    token_budget: budget,
                    doc_groups: course.doc_groups.clone(),
                };
                async move {
                    let outcome = self.retriever.retrieve(&query).await;
                    (invocation, query.query, outcome)
                }
            })
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await
    }

    /// Stream the final answer through the citation processor.
    async fn stream_answer(
        &self,
        run: &RunState,
        contexts: Vec<ContextWithMetadata>,
        course: &CourseContext,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = build_answer_request(&run.conversation, course, &contexts, &run.tools, &self.prompts)?;
        let mut stream = self.model.stream(request).await?;

        let mut citations = CitationProcessor::new(contexts, self.signer.clone());
        let mut state = CitationState::new();
        let mut answer = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QuillError::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let delta = citations.process_chunk(&chunk, &mut state).await;
                    if !delta.is_empty() {
                        answer.push_str(&delta);
                        sink.emit(StreamEvent::FinalTokens { delta, done: false });
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        let tail = citations.finish(&mut state).await;
        answer.push_str(&tail);
        sink.emit(StreamEvent::FinalTokens {
            delta: tail,
            done: true,
        });

        Ok(answer)
    }

    fn publish(&self, run: &RunState, sink: &dyn EventSink) {
        sink.emit(StreamEvent::AgentEventsUpdate {
            events: run.log.events().to_vec(),
        });
    }

    async fn persist(&self, run: &RunState, message: &Message, course: &CourseContext) {
        if let Err(e) = self
            .store
            .persist(&run.conversation, message, course, &course.user_identifier)
            .await
        {
            warn!("Failed to persist message {}: {}", message.id, e);
        }
    }
}

/// What a step's batches returned, before it is folded into the run.
struct StepResults {
    /// Agent event id per invocation id.
    event_ids: HashMap<String, String>,
    retrieved: Vec<(ToolInvocation, String, RetrievalOutcome)>,
    executed: Vec<ToolInvocation>,
}

impl StepResults {
    /// Drop the results, closing the step's running events as cancelled.
    fn discard(self, run: &mut RunState) {
        for id in self.event_ids.values() {
            run.log.update(id, AgentEventStatus::Error, meta(json!({ "error": "cancelled" })));
        }
    }
}

fn meta(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ContextOrigin, ModelDescriptor};
    use crate::events::{AgentEvent, CollectingSink};
    use crate::llm::{LlmToolCall, TokenStream};
    use crate::persistence::MemoryConversationStore;
    use crate::tools::{StaticCredentials, StaticToolCatalog, WorkflowClient};
    use async_openai::types::CreateChatCompletionRequest;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Chunks = Vec<Result<String>>;

    #[derive(Default)]
    struct ScriptedModel {
        selections: Mutex<VecDeque<Result<Vec<LlmToolCall>>>>,
        /// Keep asking for new searches instead of running out.
        endless: bool,
        calls: AtomicUsize,
        requests: Mutex<Vec<CreateChatCompletionRequest>>,
        answer: Mutex<Option<Result<Chunks>>>,
        cancel_on_first_call: Option<CancellationToken>,
        /// Cancelled once the first answer chunk has been handed out.
        cancel_mid_answer: Option<CancellationToken>,
    }

    impl ScriptedModel {
        fn new(selections: Vec<Vec<LlmToolCall>>) -> Self {
            Self::scripted(selections.into_iter().map(Ok).collect())
        }

        fn scripted(selections: Vec<Result<Vec<LlmToolCall>>>) -> Self {
            Self {
                selections: Mutex::new(selections.into()),
                ..Default::default()
            }
        }

        fn answering(self, chunks: &[&str]) -> Self {
            *self.answer.lock().unwrap() = Some(Ok(chunks.iter().map(|c| Ok(c.to_string())).collect()));
            self
        }

        fn answer_result(self, answer: Result<Chunks>) -> Self {
            *self.answer.lock().unwrap() = Some(answer);
            self
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete_with_tools(&self, request: CreateChatCompletionRequest) -> Result<Vec<LlmToolCall>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if let (0, Some(token)) = (n, &self.cancel_on_first_call) {
                token.cancel();
            }

            if let Some(next) = self.selections.lock().unwrap().pop_front() {
                return next;
            }
            if self.endless {
                return Ok(vec![search_call(&format!("q{}", n))]);
            }
            Ok(Vec::new())
        }

        async fn stream(&self, _request: CreateChatCompletionRequest) -> Result<TokenStream> {
            let answer = self
                .answer
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(vec![Ok("Done.".to_string())]));
            let cancel = self.cancel_mid_answer.clone();
            let chunks = answer?.into_iter().enumerate().map(move |(i, chunk)| {
                if let (0, Some(token)) = (i, &cancel) {
                    token.cancel();
                }
                chunk
            });
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    #[derive(Default)]
    struct FakeRetriever {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContextRetriever for FakeRetriever {
        async fn retrieve(&self, query: &RetrievalQuery) -> RetrievalOutcome {
            self.queries.lock().unwrap().push(query.query.clone());
            if query.query == "fail" {
                return RetrievalOutcome::failed("index offline");
            }
            RetrievalOutcome::found(vec![ContextWithMetadata::new(
                format!("Passage about {}", query.query),
                format!("{}.pdf", query.query),
            )])
        }
    }

    struct FakeWorkflows;

    #[async_trait]
    impl WorkflowClient for FakeWorkflows {
        async fn run_workflow(&self, invocation: &ToolInvocation, _api_key: &str) -> Result<Value> {
            if invocation.name == "broken" {
                return Err(QuillError::Workflow("boom".to_string()));
            }
            Ok(json!({ "text": format!("{} ok", invocation.name) }))
        }
    }

    struct FailingCatalog;

    #[async_trait]
    impl ToolCatalog for FailingCatalog {
        async fn fetch_tools(&self, _course: &CourseContext) -> Result<Vec<Tool>> {
            Err(QuillError::ToolCatalog("catalog unreachable".to_string()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ConversationStore for FailingStore {
        async fn persist(&self, _: &Conversation, _: &Message, _: &CourseContext, _: &str) -> Result<()> {
            Err(QuillError::Persistence("disk full".to_string()))
        }

        async fn load(&self, _conversation_id: &str) -> Result<Option<Conversation>> {
            Ok(None)
        }
    }

    fn search_call(query: &str) -> LlmToolCall {
        LlmToolCall {
            id: ToolInvocation::new_id(),
            name: SEARCH_TOOL_NAME.to_string(),
            arguments: json!({ "query": query }).to_string(),
        }
    }

    fn tool_call(name: &str) -> LlmToolCall {
        LlmToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments: "{}".to_string(),
        }
    }

    fn workflow_tool(name: &str) -> Tool {
        Tool {
            id: format!("wf-{}", name),
            name: name.to_string(),
            readable_name: name.to_uppercase(),
            description: format!("The {} workflow", name),
            input_parameters: Vec::new(),
            enabled: true,
        }
    }

    struct Harness {
        runner: AgentRunner,
        model: Arc<ScriptedModel>,
        retriever: Arc<FakeRetriever>,
        store: Arc<MemoryConversationStore>,
    }

    fn harness_with(model: ScriptedModel, catalog: Arc<dyn ToolCatalog>, store: Option<Arc<dyn ConversationStore>>) -> Harness {
        let model = Arc::new(model);
        let retriever = Arc::new(FakeRetriever::default());
        let memory = Arc::new(MemoryConversationStore::new());
        let store: Arc<dyn ConversationStore> = store.unwrap_or_else(|| memory.clone());
        let executor = ToolExecutor::new(Arc::new(FakeWorkflows), Arc::new(StaticCredentials::new(HashMap::new())));

        let runner = AgentRunner::new(
            model.clone(),
            catalog,
            retriever.clone(),
            executor,
            store,
            Prompts::default(),
        );

        Harness {
            runner,
            model,
            retriever,
            store: memory,
        }
    }

    fn harness(model: ScriptedModel) -> Harness {
        let catalog = StaticToolCatalog::new(vec![
            workflow_tool("grades"),
            workflow_tool("broken"),
            workflow_tool("calendar"),
        ]);
        harness_with(model, Arc::new(catalog), None)
    }

    fn course() -> CourseContext {
        let mut course = CourseContext::new("CS 101");
        course.project_api_key = Some("project-key".to_string());
        course.user_identifier = "student@example.com".to_string();
        course
    }

    async fn run_with(h: &Harness, message: Message, cancel: CancellationToken) -> (RunOutcome, Vec<StreamEvent>) {
        let sink = CollectingSink::new();
        let conversation = Conversation::new(ModelDescriptor::default(), "", 0.2);
        let outcome = h.runner.run(conversation, message, &course(), &sink, cancel).await;
        (outcome, sink.events())
    }

    async fn run(h: &Harness, question: &str) -> (RunOutcome, Vec<StreamEvent>) {
        run_with(h, Message::user(question), CancellationToken::new()).await
    }

    fn user_events(outcome: &RunOutcome) -> &[AgentEvent] {
        &outcome.conversation.messages[0].agent_events
    }

    fn count(events: &[AgentEvent], kind: AgentEventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    fn final_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::FinalTokens { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    fn summary(events: &[StreamEvent]) -> Option<crate::events::RunSummary> {
        events.iter().find_map(|e| match e {
            StreamEvent::Done { summary, .. } => Some(summary.clone()),
            _ => None,
        })
    }

    fn fatal_error(events: &[StreamEvent]) -> Option<&str> {
        events.iter().find_map(|e| match e {
            StreamEvent::Error { message, recoverable: false } => Some(message.as_str()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_two_rounds_of_retrieval() {
        let model = ScriptedModel::new(vec![vec![search_call("loops")], vec![search_call("recursion")]])
            .answering(&["Loops <cite>1</cite>", " and recursion <cite>2</cite>."]);
        let h = harness(model);

        let (outcome, events) = run(&h, "Explain loops vs recursion").await;

        assert!(outcome.success);
        let agent_events = user_events(&outcome);
        assert_eq!(count(agent_events, AgentEventKind::ActionSelection), 3);
        assert_eq!(count(agent_events, AgentEventKind::Retrieval), 2);

        let user = &outcome.conversation.messages[0];
        let names: Vec<_> = user.contexts.iter().map(|c| c.readable_filename.as_str()).collect();
        assert_eq!(names, vec!["loops.pdf", "recursion.pdf"]);
        assert_eq!(user.contexts[1].origin, ContextOrigin::Retrieved { step: 2 });

        // The second selection saw what the first one retrieved.
        let second = serde_json::to_value(&h.model.requests.lock().unwrap()[1]).unwrap();
        let last = second["messages"].as_array().unwrap().last().unwrap()["content"].clone();
        assert!(last.as_str().unwrap().contains("loops.pdf"));

        let reply = outcome.conversation.messages.last().unwrap();
        assert_eq!(reply.text(), "Loops [loops.pdf] and recursion [recursion.pdf].");
        assert_eq!(final_text(&events), reply.text());

        let summary = summary(&events).unwrap();
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.contexts_retrieved, 2);
        assert!(summary.tools.iter().all(|t| t.success));

        let stored = h.store.load(&outcome.conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].contexts.len(), 2);
    }

    #[tokio::test]
    async fn test_no_tools_goes_straight_to_answer() {
        let h = harness(ScriptedModel::new(Vec::new()).answering(&["Hi there."]));

        let (outcome, events) = run(&h, "Hello").await;

        assert!(outcome.success);
        assert_eq!(count(user_events(&outcome), AgentEventKind::ActionSelection), 1);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
        assert!(h.retriever.queries.lock().unwrap().is_empty());
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Retrieval { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        assert_eq!(summary(&events).unwrap().steps, 1);
    }

    #[tokio::test]
    async fn test_repeated_request_stops_the_loop() {
        let model = ScriptedModel::new(vec![
            vec![search_call("loops")],
            vec![search_call("loops")],
            vec![search_call("never reached")],
        ]);
        let h = harness(model);

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert_eq!(*h.retriever.queries.lock().unwrap(), vec!["loops".to_string()]);
        assert_eq!(count(user_events(&outcome), AgentEventKind::ActionSelection), 2);
        assert_eq!(summary(&events).unwrap().steps, 2);
    }

    #[tokio::test]
    async fn test_batch_with_a_new_call_runs_in_full() {
        let model = ScriptedModel::new(vec![
            vec![search_call("loops")],
            vec![search_call("loops"), search_call("recursion")],
        ]);
        let h = harness(model);

        let (outcome, _) = run(&h, "Loops?").await;

        assert!(outcome.success);
        let mut queries = h.retriever.queries.lock().unwrap().clone();
        queries.sort();
        assert_eq!(queries, vec!["loops", "loops", "recursion"]);
        assert_eq!(count(user_events(&outcome), AgentEventKind::ActionSelection), 3);
    }

    #[tokio::test]
    async fn test_step_limit_is_enforced() {
        let model = ScriptedModel {
            endless: true,
            ..Default::default()
        };
        let h = harness(model);

        let (outcome, events) = run(&h, "Research everything").await;

        assert!(outcome.success);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), MAX_STEPS as usize);
        assert_eq!(count(user_events(&outcome), AgentEventKind::ActionSelection), MAX_STEPS as usize);
        assert!(user_events(&outcome).iter().all(|e| e.step <= MAX_STEPS));
        assert_eq!(summary(&events).unwrap().steps, MAX_STEPS);
    }

    #[tokio::test]
    async fn test_one_failing_tool_does_not_sink_the_batch() {
        let model = ScriptedModel::new(vec![vec![tool_call("grades"), tool_call("broken"), tool_call("calendar")]]);
        let h = harness(model);

        let (outcome, events) = run(&h, "What's my grade and when is the exam?").await;

        assert!(outcome.success);
        let tools = &outcome.conversation.messages[0].tools;
        assert_eq!(tools.len(), 3);
        assert_eq!(tools.iter().filter(|t| t.succeeded()).count(), 2);
        let broken = tools.iter().find(|t| t.name == "broken").unwrap();
        assert!(broken.error().unwrap().contains("boom"));
        assert!(broken.output().is_none());

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { recoverable: true, message } if message.contains("boom"))));
        let tool_events: Vec<_> = user_events(&outcome)
            .iter()
            .filter(|e| e.kind == AgentEventKind::Tool)
            .collect();
        assert_eq!(tool_events.len(), 3);
        assert_eq!(
            tool_events.iter().filter(|e| e.status == AgentEventStatus::Error).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_search_is_recoverable() {
        let model = ScriptedModel::new(vec![vec![search_call("fail"), search_call("loops")]]);
        let h = harness(model);

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert_eq!(outcome.conversation.messages[0].contexts.len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { recoverable: true, message } if message.contains("index offline"))));
    }

    #[tokio::test]
    async fn test_cancellation_before_second_step() {
        let token = CancellationToken::new();
        let model = ScriptedModel {
            cancel_on_first_call: Some(token.clone()),
            ..ScriptedModel::new(vec![vec![search_call("loops")], vec![search_call("more")]])
        };
        let h = harness(model);

        let (outcome, events) = run_with(&h, Message::user("Loops?"), token).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Run cancelled"));
        assert!(user_events(&outcome).iter().all(|e| e.step <= 1));
        assert_eq!(count(user_events(&outcome), AgentEventKind::ActionSelection), 1);

        // The search was already in flight; it finishes but its results are dropped.
        assert_eq!(*h.retriever.queries.lock().unwrap(), vec!["loops".to_string()]);
        let user = &outcome.conversation.messages[0];
        assert!(user.contexts.is_empty());
        assert!(user.tools.is_empty());
        let search = user_events(&outcome)
            .iter()
            .find(|e| e.kind == AgentEventKind::Retrieval)
            .unwrap();
        assert_eq!(search.status, AgentEventStatus::Error);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Retrieval { .. })));
        if let Some(stored) = h.store.load(&outcome.conversation.id).await.unwrap() {
            assert!(stored.messages[0].contexts.is_empty());
            assert!(stored.messages[0].tools.is_empty());
        }
        assert_eq!(count(user_events(&outcome), AgentEventKind::FinalResponse), 0);
        assert_eq!(outcome.conversation.messages.len(), 1);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { recoverable: false, .. })
        ));
        assert!(summary(&events).is_none());
    }

    #[tokio::test]
    async fn test_selector_failure_midway_still_answers() {
        let model = ScriptedModel::scripted(vec![
            Ok(vec![search_call("loops")]),
            Err(QuillError::OpenAI("rate limited".to_string())),
        ])
        .answering(&["Loops <cite>1</cite>."]);
        let h = harness(model);

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { recoverable: true, message } if message.contains("rate limited"))));
        assert!(fatal_error(&events).is_none());
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

        let user = &outcome.conversation.messages[0];
        assert_eq!(user.contexts.len(), 1);
        assert_eq!(user.contexts[0].readable_filename, "loops.pdf");
        let selections: Vec<_> = user_events(&outcome)
            .iter()
            .filter(|e| e.kind == AgentEventKind::ActionSelection)
            .collect();
        assert_eq!(selections.len(), 2);
        assert_eq!(selections[1].status, AgentEventStatus::Error);
        assert_eq!(final_text(&events), "Loops [loops.pdf].");
    }

    #[tokio::test]
    async fn test_cancellation_during_answer_stream() {
        let token = CancellationToken::new();
        let model = ScriptedModel {
            cancel_mid_answer: Some(token.clone()),
            ..ScriptedModel::new(Vec::new()).answering(&["The answer is ", "never finished."])
        };
        let h = harness(model);

        let (outcome, events) = run_with(&h, Message::user("Hello"), token).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Run cancelled"));
        assert_eq!(final_text(&events), "The answer is ");
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::FinalTokens { done: true, .. })));
        assert_eq!(fatal_error(&events), Some("Run cancelled"));
        assert!(summary(&events).is_none());
        assert_eq!(outcome.conversation.messages.len(), 1);

        let final_event = user_events(&outcome)
            .iter()
            .find(|e| e.kind == AgentEventKind::FinalResponse)
            .unwrap();
        assert_eq!(final_event.status, AgentEventStatus::Error);
    }

    #[tokio::test]
    async fn test_malformed_citation_stays_literal() {
        let model = ScriptedModel::new(vec![vec![search_call("loops")]])
            .answering(&["Loops repeat <cite>1</cite> and ", "<cite>999</cite>."]);
        let h = harness(model);

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert_eq!(final_text(&events), "Loops repeat [loops.pdf] and <cite>999</cite>.");
    }

    #[tokio::test]
    async fn test_uploaded_files_are_cited_first() {
        let model = ScriptedModel::new(vec![vec![search_call("loops")]])
            .answering(&["See <cite>1</cite> and <cite>2</cite>."]);
        let h = harness(model);
        let message = Message::user("Compare my notes with the course")
            .with_contexts(vec![ContextWithMetadata::new("My notes", "upload.pdf")]);

        let (outcome, events) = run_with(&h, message, CancellationToken::new()).await;

        assert!(outcome.success);
        assert_eq!(final_text(&events), "See [upload.pdf] and [loops.pdf].");
        let metadata = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ContextsMetadata { contexts } => Some(contexts.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].readable_filename, "upload.pdf");
        assert_eq!(summary(&events).unwrap().contexts_retrieved, 1);
    }

    #[tokio::test]
    async fn test_unavailable_answer_stream_is_fatal() {
        let model = ScriptedModel::new(Vec::new()).answer_result(Err(QuillError::Llm("stream refused".to_string())));
        let h = harness(model);

        let (outcome, events) = run(&h, "Hello").await;

        assert!(!outcome.success);
        assert!(fatal_error(&events).unwrap().contains("stream refused"));
        assert!(summary(&events).is_none());
        let final_event = user_events(&outcome)
            .iter()
            .find(|e| e.kind == AgentEventKind::FinalResponse)
            .unwrap();
        assert_eq!(final_event.status, AgentEventStatus::Error);
    }

    #[tokio::test]
    async fn test_stream_error_midway_is_reported() {
        let model = ScriptedModel::new(Vec::new()).answer_result(Ok(vec![
            Ok("Partial".to_string()),
            Err(QuillError::Llm("connection reset".to_string())),
        ]));
        let h = harness(model);

        let (outcome, events) = run(&h, "Hello").await;

        assert!(!outcome.success);
        assert_eq!(final_text(&events), "Partial");
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::FinalTokens { done: true, .. })));
        assert!(fatal_error(&events).unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_catalog_failure_keeps_search_available() {
        let model = ScriptedModel::new(vec![vec![search_call("loops")]]);
        let h = harness_with(model, Arc::new(FailingCatalog), None);

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert_eq!(h.retriever.queries.lock().unwrap().len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { recoverable: true, message } if message.contains("catalog unreachable"))));
        let init = &user_events(&outcome)[0];
        assert_eq!(init.kind, AgentEventKind::Initializing);
        assert_eq!(init.status, AgentEventStatus::Error);
    }

    #[tokio::test]
    async fn test_persistence_failures_are_swallowed() {
        let model = ScriptedModel::new(vec![vec![search_call("loops")]]);
        let h = harness_with(
            model,
            Arc::new(StaticToolCatalog::new(Vec::new())),
            Some(Arc::new(FailingStore)),
        );

        let (outcome, events) = run(&h, "Loops?").await;

        assert!(outcome.success);
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }
}
