//! Context retrieval from a course's document index.
//!
//! Retrieval never fails loudly: transport and decoding problems come back as
//! an empty [`RetrievalOutcome`] carrying the error message.

use crate::conversation::ContextWithMetadata;
use crate::error::{QuillError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A single retrieval request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievalQuery {
    pub course_name: String,
    pub query: String,
    /// Maximum tokens of passage text to return.
    pub token_budget: usize,
    /// Restrict to these document groups. Empty means all.
    pub doc_groups: Vec<String>,
}

/// Passages found for a query, or the reason none were.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalOutcome {
    pub contexts: Vec<ContextWithMetadata>,
    pub error: Option<String>,
}

impl RetrievalOutcome {
    pub fn found(contexts: Vec<ContextWithMetadata>) -> Self {
        Self { contexts, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            contexts: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Returns ranked passages for a natural-language query.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: &RetrievalQuery) -> RetrievalOutcome;
}

/// Keep passages in rank order until the token budget is spent.
pub fn trim_to_budget(contexts: Vec<ContextWithMetadata>, token_budget: usize) -> Vec<ContextWithMetadata> {
    let mut used = 0;
    contexts
        .into_iter()
        .take_while(|c| {
            used += c.estimated_tokens();
            used <= token_budget
        })
        .collect()
}

/// Retriever backed by the document index service.
pub struct HttpContextRetriever {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    course_name: &'a str,
    search_query: &'a str,
    token_limit: usize,
    doc_groups: &'a [String],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { contexts: Vec<ContextWithMetadata> },
    Bare(Vec<ContextWithMetadata>),
}

impl HttpContextRetriever {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuillError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<ContextWithMetadata>> {
        let response = self
            .client
            .post(format!("{}/getTopContexts", self.endpoint))
            .json(&SearchRequest {
                course_name: &query.course_name,
                search_query: &query.query,
                token_limit: query.token_budget,
                doc_groups: &query.doc_groups,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuillError::Retrieval(format!("{}: {}", status, body)));
        }

        let contexts = match response.json::<SearchResponse>().await? {
            SearchResponse::Wrapped { contexts } | SearchResponse::Bare(contexts) => contexts,
        };
        Ok(contexts)
    }
}

#[async_trait]
impl ContextRetriever for HttpContextRetriever {
    #[instrument(skip(self, query), fields(query = %query.query))]
    async fn retrieve(&self, query: &RetrievalQuery) -> RetrievalOutcome {
        match self.search(query).await {
            Ok(contexts) => {
                let contexts = trim_to_budget(contexts, query.token_budget);
                debug!("Retrieved {} contexts", contexts.len());
                RetrievalOutcome::found(contexts)
            }
            Err(e) => {
                warn!("Retrieval failed: {}", e);
                RetrievalOutcome::failed(e.to_string())
            }
        }
    }
}
