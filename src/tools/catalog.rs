//! Tool catalog sources.

use super::Tool;
use crate::conversation::CourseContext;
use crate::error::{QuillError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

/// Source of the tools available to a course.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Fetch the enabled tools for a course.
    async fn fetch_tools(&self, course: &CourseContext) -> Result<Vec<Tool>>;
}

/// Catalog with a fixed list of tools, shared by every course.
#[derive(Debug, Clone, Default)]
pub struct StaticToolCatalog {
    tools: Vec<Tool>,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tools: Vec<Tool>,
}

impl StaticToolCatalog {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }

    /// Load `[[tools]]` tables from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        Ok(Self::new(file.tools))
    }
}

#[async_trait]
impl ToolCatalog for StaticToolCatalog {
    async fn fetch_tools(&self, _course: &CourseContext) -> Result<Vec<Tool>> {
        Ok(self.tools.iter().filter(|t| t.enabled).cloned().collect())
    }
}

/// Catalog served by the workflow platform's HTTP API.
pub struct HttpToolCatalog {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpToolCatalog {
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
}

#[async_trait]
impl ToolCatalog for HttpToolCatalog {
    #[instrument(skip(self, course), fields(course = %course.course_name))]
    async fn fetch_tools(&self, course: &CourseContext) -> Result<Vec<Tool>> {
        let mut request = self
            .client
            .get(format!("{}/tools", self.endpoint))
            .query(&[("course_name", course.course_name.as_str())]);

        if let Some(key) = &course.project_api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuillError::ToolCatalog(format!("{}: {}", status, body)));
        }

        let tools: Vec<Tool> = response.json().await?;
        let enabled: Vec<Tool> = tools.into_iter().filter(|t| t.enabled).collect();
        debug!("Fetched {} enabled tools", enabled.len());
        Ok(enabled)
    }
}
