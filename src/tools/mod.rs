//! Workflow tools the agent can call.
//!
//! Tools are defined outside this crate (per course) and fetched through a
//! [`ToolCatalog`]. The agent adds one synthetic tool of its own,
//! [`SEARCH_TOOL_NAME`], which is served by the context retriever rather than
//! by a workflow.

mod catalog;
mod executor;

pub use catalog::{HttpToolCatalog, StaticToolCatalog, ToolCatalog};
pub use executor::{
    normalize_response, CredentialStore, HttpWorkflowClient, StaticCredentials, ToolExecutor,
    WorkflowClient,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Name of the synthetic document search tool.
pub const SEARCH_TOOL_NAME: &str = "search_documents";

/// One input parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    /// JSON type: string, number, integer, boolean.
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

fn default_param_type() -> String {
    "string".to_string()
}

fn default_required() -> bool {
    true
}

/// A tool definition from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub id: String,
    /// Function name exposed to the model.
    pub name: String,
    /// Name shown to users.
    pub readable_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_parameters: Vec<ToolParameter>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Tool {
    /// JSON schema of the tool's arguments for function calling.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.input_parameters {
            let mut property = json!({
                "type": param.param_type,
                "description": param.description,
            });
            if !param.enum_values.is_empty() {
                property["enum"] = json!(param.enum_values);
            }
            properties.insert(param.name.clone(), property);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Create an invocation of this tool with model-generated arguments.
    pub fn invoke(&self, invocation_id: impl Into<String>, arguments: Map<String, Value>) -> ToolInvocation {
        ToolInvocation {
            invocation_id: invocation_id.into(),
            tool_id: self.id.clone(),
            name: self.name.clone(),
            readable_name: self.readable_name.clone(),
            arguments,
            result: None,
        }
    }

    pub fn is_search(&self) -> bool {
        self.name == SEARCH_TOOL_NAME
    }
}

/// The synthetic retrieval tool prepended to every catalog.
pub fn search_documents_tool(description: &str) -> Tool {
    Tool {
        id: SEARCH_TOOL_NAME.to_string(),
        name: SEARCH_TOOL_NAME.to_string(),
        readable_name: "Search course documents".to_string(),
        description: description.to_string(),
        input_parameters: vec![ToolParameter {
            name: "query".to_string(),
            param_type: "string".to_string(),
            description: "A focused search query. Use different phrasings or sub-questions on repeated calls."
                .to_string(),
            required: true,
            enum_values: Vec::new(),
        }],
        enabled: true,
    }
}

/// Normalized output of a successful tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutput {
    Text(String),
    Data(Value),
    ImageUrls(Vec<String>),
    DataWithImages { data: Value, image_urls: Vec<String> },
}

impl ToolOutput {
    /// Render the output for inclusion in a prompt.
    pub fn to_prompt_text(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Data(data) => pretty(data),
            ToolOutput::ImageUrls(urls) => format!("Images:\n{}", urls.join("\n")),
            ToolOutput::DataWithImages { data, image_urls } => {
                format!("{}\n\nImages:\n{}", pretty(data), image_urls.join("\n"))
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Either the output or the error of an executed tool, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolResult {
    Output(ToolOutput),
    Error(String),
}

/// One call of a tool within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub tool_id: String,
    pub name: String,
    pub readable_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// `None` until the call has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolInvocation {
    /// Fresh invocation id for a tool call the model did not label.
    pub fn new_id() -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }

    /// Loop-guard key: tool name plus canonical JSON of the arguments.
    pub fn signature(&self) -> String {
        // serde_json maps are ordered by key, so equal arguments serialize equally.
        let args = serde_json::to_string(&self.arguments).unwrap_or_default();
        format!("{}:{}", self.name, args)
    }

    pub fn output(&self) -> Option<&ToolOutput> {
        match &self.result {
            Some(ToolResult::Output(output)) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            Some(ToolResult::Error(e)) => Some(e),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.output().is_some()
    }

    /// String argument by name.
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(|v| v.as_str())
    }
}
