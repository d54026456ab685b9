//! Workflow tool execution and response normalization.

use super::{ToolInvocation, ToolOutput, ToolResult};
use crate::conversation::CourseContext;
use crate::error::{QuillError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Runs one workflow on the external platform and returns its raw response body.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn run_workflow(&self, invocation: &ToolInvocation, api_key: &str) -> Result<Value>;
}

/// Resolves the project API key of a course.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn api_key(&self, course_name: &str) -> Result<Option<String>>;
}

/// Credentials from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn api_key(&self, course_name: &str) -> Result<Option<String>> {
        Ok(self.keys.get(course_name).cloned())
    }
}

/// Workflow client speaking JSON over HTTP.
pub struct HttpWorkflowClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWorkflowClient {
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
impl WorkflowClient for HttpWorkflowClient {
    #[instrument(skip(self, invocation, api_key), fields(tool = %invocation.name))]
    async fn run_workflow(&self, invocation: &ToolInvocation, api_key: &str) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/run", self.endpoint))
            .json(&json!({
                "api_key": api_key,
                "tool_id": invocation.tool_id,
                "name": invocation.readable_name,
                "data": invocation.arguments,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QuillError::Workflow(format!("{}: {}", status, body)));
        }

        Ok(response.json().await?)
    }
}

/// Executes workflow tools, capturing every failure into the invocation.
pub struct ToolExecutor {
    client: Arc<dyn WorkflowClient>,
    credentials: Arc<dyn CredentialStore>,
}

impl ToolExecutor {
    pub fn new(client: Arc<dyn WorkflowClient>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { client, credentials }
    }

    /// Execute one tool. The returned invocation carries either an output or an error.
    pub async fn execute(&self, mut invocation: ToolInvocation, course: &CourseContext) -> ToolInvocation {
        info!("Calling tool {} with args: {:?}", invocation.name, invocation.arguments);

        let result = match self.resolve_api_key(course).await {
            Ok(api_key) => match self.client.run_workflow(&invocation, &api_key).await {
                Ok(body) => normalize_response(body),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        invocation.result = Some(match result {
            Ok(output) => ToolResult::Output(output),
            Err(message) => {
                warn!("Tool {} failed: {}", invocation.name, message);
                ToolResult::Error(message)
            }
        });
        invocation
    }

    /// Execute a batch concurrently. Results keep the input order.
    pub async fn execute_many(&self, invocations: Vec<ToolInvocation>, course: &CourseContext) -> Vec<ToolInvocation> {
        debug!("Executing {} tools in parallel", invocations.len());
        join_all(invocations.into_iter().map(|inv| self.execute(inv, course))).await
    }

    async fn resolve_api_key(&self, course: &CourseContext) -> Result<String> {
        if let Some(key) = &course.project_api_key {
            return Ok(key.clone());
        }
        self.credentials
            .api_key(&course.course_name)
            .await?
            .ok_or_else(|| QuillError::MissingCredentials(course.course_name.clone()))
    }
}

/// Turn a raw workflow response into a [`ToolOutput`], or an error message.
///
/// Accepts a bare string or `{text|output}`, an object with image URLs and
/// optional data, and a workflow-run envelope whose last executed node holds
/// the actual output. An `error` field is reported as a failure even when the
/// HTTP call itself succeeded.
pub fn normalize_response(body: Value) -> std::result::Result<ToolOutput, String> {
    normalize_value(body, 0)
}

const MAX_ENVELOPE_DEPTH: usize = 4;

fn normalize_value(body: Value, depth: usize) -> std::result::Result<ToolOutput, String> {
    if let Some(message) = embedded_error(&body) {
        return Err(message);
    }

    match body {
        Value::Null => Err("Workflow returned an empty response".to_string()),
        Value::String(text) => Ok(ToolOutput::Text(text)),
        Value::Array(mut items) if items.len() == 1 => normalize_value(items.remove(0), depth),
        Value::Array(items) => Ok(ToolOutput::Data(Value::Array(items))),
        Value::Object(map) => normalize_object(map, depth),
        other => Ok(ToolOutput::Text(other.to_string())),
    }
}

fn normalize_object(mut map: Map<String, Value>, depth: usize) -> std::result::Result<ToolOutput, String> {
    if let Some(result_data) = map.get("data").and_then(|d| d.get("resultData")) {
        if depth >= MAX_ENVELOPE_DEPTH {
            return Err("Workflow response is nested too deeply".to_string());
        }
        let last_output = last_node_output(result_data)?;
        return normalize_value(last_output, depth + 1);
    }

    let image_urls = map
        .remove("image_urls")
        .or_else(|| map.remove("imageUrls"))
        .map(string_list)
        .filter(|urls| !urls.is_empty());

    let text = ["text", "output"]
        .iter()
        .find_map(|key| map.get(*key).and_then(|v| v.as_str()).map(str::to_string));

    match (map.remove("data"), image_urls) {
        (Some(data), Some(image_urls)) => Ok(ToolOutput::DataWithImages { data, image_urls }),
        (None, Some(image_urls)) => match text {
            Some(text) => Ok(ToolOutput::DataWithImages {
                data: Value::String(text),
                image_urls,
            }),
            None => Ok(ToolOutput::ImageUrls(image_urls)),
        },
        (Some(Value::String(text)), None) => Ok(ToolOutput::Text(text)),
        (Some(data), None) => Ok(ToolOutput::Data(data)),
        (None, None) => match text {
            Some(text) => Ok(ToolOutput::Text(text)),
            None => Ok(ToolOutput::Data(Value::Object(map))),
        },
    }
}

/// Output json of the last executed node in a workflow-run envelope.
fn last_node_output(result_data: &Value) -> std::result::Result<Value, String> {
    if let Some(message) = error_message(result_data.get("error")) {
        return Err(message);
    }

    let run_data = result_data
        .get("runData")
        .and_then(|r| r.as_object())
        .ok_or_else(|| "Workflow response has no run data".to_string())?;

    let node_runs = match result_data.get("lastNodeExecuted").and_then(|n| n.as_str()) {
        Some(node) => run_data.get(node),
        None if run_data.len() == 1 => run_data.values().next(),
        None => None,
    }
    .and_then(|runs| runs.as_array())
    .and_then(|runs| runs.last())
    .ok_or_else(|| "Workflow response does not identify its last node".to_string())?;

    if let Some(message) = error_message(node_runs.get("error")) {
        return Err(message);
    }

    node_runs
        .pointer("/data/main/0/0/json")
        .cloned()
        .ok_or_else(|| "Workflow's last node produced no output".to_string())
}

fn embedded_error(body: &Value) -> Option<String> {
    error_message(body.as_object()?.get("error"))
}

fn error_message(error: Option<&Value>) -> Option<String> {
    match error? {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(message) => Some(message.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

fn string_list(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(single) => vec![single],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_normalize_plain_text() {
        assert_eq!(
            normalize_response(json!("The answer is 42")).unwrap(),
            ToolOutput::Text("The answer is 42".to_string())
        );
        assert_eq!(
            normalize_response(json!({"output": "done"})).unwrap(),
            ToolOutput::Text("done".to_string())
        );
    }

    #[test]
    fn test_normalize_data_and_images() {
        assert_eq!(
            normalize_response(json!({"data": {"rows": 3}})).unwrap(),
            ToolOutput::Data(json!({"rows": 3}))
        );
        assert_eq!(
            normalize_response(json!({"imageUrls": ["https://a/1.png"]})).unwrap(),
            ToolOutput::ImageUrls(vec!["https://a/1.png".to_string()])
        );
        assert_eq!(
            normalize_response(json!([{"data": [1, 2], "image_urls": ["https://a/2.png"]}])).unwrap(),
            ToolOutput::DataWithImages {
                data: json!([1, 2]),
                image_urls: vec!["https://a/2.png".to_string()],
            }
        );
    }

    #[test]
    fn test_normalize_run_envelope() {
        let body = json!({
            "data": {
                "resultData": {
                    "lastNodeExecuted": "Respond",
                    "runData": {
                        "Trigger": [{"data": {"main": [[{"json": {"ignored": true}}]]}}],
                        "Respond": [{"data": {"main": [[{"json": {"text": "Grades posted"}}]]}}]
                    }
                }
            }
        });
        assert_eq!(
            normalize_response(body).unwrap(),
            ToolOutput::Text("Grades posted".to_string())
        );
    }

    #[test]
    fn test_normalize_embedded_errors() {
        let envelope = json!({
            "data": {"resultData": {"error": {"message": "Node 'HTTP' failed"}, "runData": {}}}
        });
        assert_eq!(normalize_response(envelope).unwrap_err(), "Node 'HTTP' failed");
        assert_eq!(normalize_response(json!({"error": "quota exceeded"})).unwrap_err(), "quota exceeded");
        assert!(normalize_response(Value::Null).is_err());
        assert!(normalize_response(json!({"error": null, "text": "ok"})).is_ok());
    }

    struct FakeWorkflows {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowClient for FakeWorkflows {
        async fn run_workflow(&self, invocation: &ToolInvocation, api_key: &str) -> Result<Value> {
            self.calls.lock().unwrap().push(format!("{}:{}", invocation.name, api_key));
            match invocation.name.as_str() {
                // Finishes last so completion order differs from input order.
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(json!("slow done"))
                }
                "broken" => Err(QuillError::Workflow("500: boom".to_string())),
                _ => Ok(json!({"text": "fast done"})),
            }
        }
    }

    fn tool(name: &str) -> Tool {
        Tool {
            id: name.to_string(),
            name: name.to_string(),
            readable_name: name.to_string(),
            description: String::new(),
            input_parameters: Vec::new(),
            enabled: true,
        }
    }

    fn executor(keys: &[(&str, &str)]) -> (ToolExecutor, Arc<FakeWorkflows>) {
        let workflows = Arc::new(FakeWorkflows { calls: Mutex::new(Vec::new()) });
        let keys = keys.iter().map(|(c, k)| (c.to_string(), k.to_string())).collect();
        let executor = ToolExecutor::new(workflows.clone(), Arc::new(StaticCredentials::new(keys)));
        (executor, workflows)
    }

    #[tokio::test]
    async fn test_execute_many_keeps_input_order_and_isolates_errors() {
        let (executor, workflows) = executor(&[("cs101", "key-1")]);
        let batch = vec![
            tool("slow").invoke("a", Map::new()),
            tool("broken").invoke("b", Map::new()),
            tool("fast").invoke("c", Map::new()),
        ];

        let results = executor.execute_many(batch, &CourseContext::new("cs101")).await;

        let ids: Vec<_> = results.iter().map(|r| r.invocation_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(results[0].output(), Some(&ToolOutput::Text("slow done".to_string())));
        assert!(results[1].error().unwrap().contains("boom"));
        assert!(results[2].succeeded());
        assert!(workflows.calls.lock().unwrap().iter().all(|c| c.ends_with(":key-1")));
    }

    #[tokio::test]
    async fn test_missing_credentials_become_tool_error() {
        let (executor, workflows) = executor(&[]);
        let result = executor
            .execute(tool("fast").invoke("a", Map::new()), &CourseContext::new("unknown"))
            .await;

        assert!(result.error().unwrap().contains("unknown"));
        assert!(workflows.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_supplied_key_wins_over_store() {
        let (executor, workflows) = executor(&[("cs101", "stored")]);
        let mut course = CourseContext::new("cs101");
        course.project_api_key = Some("supplied".to_string());

        executor.execute(tool("fast").invoke("a", Map::new()), &course).await;
        assert_eq!(workflows.calls.lock().unwrap().as_slice(), ["fast:supplied"]);
    }
}
