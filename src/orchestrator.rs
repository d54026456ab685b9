//! Component wiring for Quill.
//!
//! Builds every collaborator of the agent loop from [`Settings`].

use crate::agent::{AgentRunner, RunOutcome};
use crate::citations::BaseUrlSigner;
use crate::config::{PersistenceProvider, Prompts, Settings};
use crate::conversation::{Conversation, CourseContext, Message, ModelDescriptor};
use crate::error::Result;
use crate::events::EventSink;
use crate::llm::OpenAiModel;
use crate::openai::create_client_with_timeout;
use crate::persistence::{ConversationStore, MemoryConversationStore, SqliteConversationStore};
use crate::retrieval::HttpContextRetriever;
use crate::tools::{
    HttpToolCatalog, HttpWorkflowClient, StaticCredentials, StaticToolCatalog, ToolCatalog, ToolExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Owns a configured [`AgentRunner`] and the conversation store it writes to.
pub struct Orchestrator {
    settings: Settings,
    runner: Arc<AgentRunner>,
    store: Arc<dyn ConversationStore>,
}

impl Orchestrator {
    /// Create an orchestrator from settings.
    #[instrument(skip_all)]
    pub fn new(settings: Settings) -> Result<Self> {
        let prompts = Prompts::load(
            settings.prompts.custom_dir.as_deref(),
            Some(&settings.prompts.variables),
        )?;

        let client = create_client_with_timeout(Duration::from_secs(settings.llm.timeout_secs))?;
        let model = Arc::new(OpenAiModel::new(client));

        let retriever = Arc::new(HttpContextRetriever::new(
            &settings.retrieval.endpoint,
            Duration::from_secs(settings.retrieval.timeout_secs),
        )?);

        let workflow_timeout = Duration::from_secs(settings.workflows.timeout_secs);
        let catalog: Arc<dyn ToolCatalog> = match &settings.workflows.catalog_file {
            Some(path) => {
                info!("Using tool catalog file {}", path);
                Arc::new(StaticToolCatalog::load(&Settings::expand_path(path))?)
            }
            None if !settings.workflows.endpoint.is_empty() => {
                Arc::new(HttpToolCatalog::new(&settings.workflows.endpoint, workflow_timeout)?)
            }
            None => {
                info!("No workflow endpoint configured, only document search is available");
                Arc::new(StaticToolCatalog::default())
            }
        };

        let executor = ToolExecutor::new(
            Arc::new(HttpWorkflowClient::new(&settings.workflows.endpoint, workflow_timeout)?),
            Arc::new(StaticCredentials::new(settings.workflows.api_keys.clone())),
        );

        let store: Arc<dyn ConversationStore> = match settings.persistence.provider {
            PersistenceProvider::Sqlite => Arc::new(SqliteConversationStore::new(&settings.sqlite_path())?),
            PersistenceProvider::Memory => Arc::new(MemoryConversationStore::new()),
        };

        let mut runner = AgentRunner::new(model, catalog, retriever, executor, store.clone(), prompts)
            .with_selection_temperature(settings.llm.selection_temperature)
            .with_token_budget(settings.retrieval.token_budget);

        if let Some(base_url) = &settings.citations.file_base_url {
            runner = runner.with_signer(Arc::new(BaseUrlSigner::new(base_url)?));
        }

        Ok(Self::with_components(settings, runner, store))
    }

    /// Create an orchestrator around an already configured runner.
    pub fn with_components(settings: Settings, runner: AgentRunner, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            settings,
            runner: Arc::new(runner),
            store,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> Arc<AgentRunner> {
        self.runner.clone()
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    /// Empty conversation using the configured model.
    pub fn new_conversation(&self) -> Conversation {
        let model = ModelDescriptor {
            id: self.settings.llm.model.clone(),
            token_limit: self.settings.llm.token_limit,
        };
        Conversation::new(model, "", self.settings.llm.temperature)
    }

    /// Stored conversation by id, or a fresh one when unknown.
    pub async fn resume_or_new(&self, conversation_id: Option<&str>) -> Result<Conversation> {
        if let Some(id) = conversation_id {
            if let Some(conversation) = self.store.load(id).await? {
                return Ok(conversation);
            }
            info!("Conversation {} not found, starting a new one", id);
        }
        Ok(self.new_conversation())
    }

    /// Run the agent for one user message.
    pub async fn run(
        &self,
        conversation: Conversation,
        message: Message,
        course: &CourseContext,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> RunOutcome {
        self.runner.run(conversation, message, course, sink, cancel).await
    }
}
