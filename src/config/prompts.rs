//! Prompt templates for Quill.
//!
//! Prompts can be customized by placing TOML files in the custom prompts directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Prompts {
    pub selection: SelectionPrompts,
    pub answer: AnswerPrompts,
    /// Custom variables from config, available in all prompts.
    #[serde(skip)]
    pub variables: std::collections::HashMap<String, String>,
}

/// Prompts for choosing tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPrompts {
    pub system: String,
    /// Description of the document search tool shown to the model.
    pub search_tool_description: String,
}

impl Default for SelectionPrompts {
    fn default() -> Self {
        Self {
            system: r#"You are the planning step of a course assistant. Decide which tools, if any, to call next so the assistant can answer the user's latest message.

Guidelines:
- Don't make assumptions about what values to plug into functions. Ask the user for clarification if a request is ambiguous
- Use 'search_documents' to find course material. You may call it several times with different queries to cover different angles of a question
- Passages already retrieved are attached to the user's message. Only search again if they are insufficient
- Call no tools when you have enough information to answer"#
                .to_string(),

            search_tool_description: "Search the course documents for passages relevant to a query. \
Call this multiple times with different, focused queries to research a question from several angles."
                .to_string(),
        }
    }
}

/// Prompts for the final cited answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerPrompts {
    pub system: String,
    pub user: String,
}

impl Default for AnswerPrompts {
    fn default() -> Self {
        Self {
            system: r#"You are a helpful teaching assistant for the course {{course_name}}.

Guidelines:
- Answer using the numbered course passages and tool results provided
- Cite a passage right after the sentence it supports, written as <cite>N</cite> where N is the passage number
- To point at a specific page, write <cite>N, p. PAGE</cite>
- Only cite passage numbers that exist
- If the material doesn't answer the question, say so clearly"#
                .to_string(),

            user: r#"Course passages:
{{contexts}}

Tool results:
{{tool_outputs}}

Question: {{question}}"#
                .to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts from the default location, with optional custom directory and variables.
    pub fn load(
        custom_dir: Option<&str>,
        custom_variables: Option<&std::collections::HashMap<String, String>>,
    ) -> crate::error::Result<Self> {
        let mut prompts = Prompts::default();

        // Store custom variables
        if let Some(vars) = custom_variables {
            prompts.variables = vars.clone();
        }

        if let Some(dir) = custom_dir {
            let custom_path = PathBuf::from(shellexpand::tilde(dir).to_string());

            let selection_path = custom_path.join("selection.toml");
            if selection_path.exists() {
                let content = std::fs::read_to_string(&selection_path)?;
                prompts.selection = toml::from_str(&content)?;
            }

            let answer_path = custom_path.join("answer.toml");
            if answer_path.exists() {
                let content = std::fs::read_to_string(&answer_path)?;
                prompts.answer = toml::from_str(&content)?;
            }
        }

        Ok(prompts)
    }

    /// Render a prompt template with the given variables.
    pub fn render(template: &str, vars: &std::collections::HashMap<String, String>) -> String {
        let mut result = template.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }

    /// Render a prompt template with both provided variables and custom config variables.
    /// Provided variables take precedence over custom config variables.
    pub fn render_with_custom(
        &self,
        template: &str,
        vars: &std::collections::HashMap<String, String>,
    ) -> String {
        let mut merged = self.variables.clone();
        for (key, value) in vars {
            merged.insert(key.clone(), value.clone());
        }
        Self::render(template, &merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_prompts() {
        let prompts = Prompts::default();
        assert!(prompts.selection.system.contains("Don't make assumptions"));
        assert!(prompts.answer.system.contains("<cite>N</cite>"));
        assert!(prompts.answer.user.contains("{{question}}"));
    }

    #[test]
    fn test_render_template() {
        let template = "Hello {{name}}, you have {{count}} messages.";
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Alice".to_string());
        vars.insert("count".to_string(), "5".to_string());

        let result = Prompts::render(template, &vars);
        assert_eq!(result, "Hello Alice, you have 5 messages.");
    }

    #[test]
    fn test_provided_vars_override_custom() {
        let mut custom = HashMap::new();
        custom.insert("course_name".to_string(), "Default".to_string());
        custom.insert("tone".to_string(), "friendly".to_string());
        let prompts = Prompts::load(None, Some(&custom)).unwrap();

        let mut vars = HashMap::new();
        vars.insert("course_name".to_string(), "CS 101".to_string());
        let rendered = prompts.render_with_custom("{{course_name}} ({{tone}})", &vars);
        assert_eq!(rendered, "CS 101 (friendly)");
    }

    #[test]
    fn test_custom_dir_overrides_answer_prompts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("answer.toml"),
            "system = \"Be brief.\"\n",
        )
        .unwrap();

        let prompts = Prompts::load(dir.path().to_str(), None).unwrap();
        assert_eq!(prompts.answer.system, "Be brief.");
        // Missing keys fall back to defaults.
        assert!(prompts.answer.user.contains("{{contexts}}"));
    }
}
