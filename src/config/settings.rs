//! Configuration settings for Quill.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub llm: LlmSettings,
    pub retrieval: RetrievalSettings,
    pub workflows: WorkflowSettings,
    pub persistence: PersistenceSettings,
    pub citations: CitationSettings,
    pub prompts: PromptSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.quill".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Model for tool selection and answers.
    pub model: String,
    /// Context window of the model in tokens.
    pub token_limit: u32,
    /// Temperature for the final answer.
    pub temperature: f32,
    /// Temperature for tool selection.
    pub selection_temperature: f32,
    /// Request timeout in seconds (applies to the whole answer stream).
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            token_limit: 128_000,
            temperature: 0.3,
            selection_temperature: 0.0,
            timeout_secs: 300,
        }
    }
}

/// Document retrieval service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Base URL of the retrieval service.
    pub endpoint: String,
    /// Maximum tokens of context per search call.
    pub token_budget: usize,
    pub timeout_secs: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            token_budget: 4000,
            timeout_secs: 30,
        }
    }
}

/// Workflow tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Base URL of the workflow platform. Tools are disabled when empty
    /// and no catalog file is configured.
    pub endpoint: String,
    /// Static TOML tool catalog, used instead of the platform catalog when set.
    pub catalog_file: Option<String>,
    pub timeout_secs: u64,
    /// Project API keys by course name.
    pub api_keys: HashMap<String, String>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            catalog_file: None,
            timeout_secs: 60,
            api_keys: HashMap::new(),
        }
    }
}

/// Where conversations are stored.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceProvider {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for PersistenceProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(PersistenceProvider::Sqlite),
            "memory" | "none" => Ok(PersistenceProvider::Memory),
            _ => Err(format!("Unknown persistence provider: {}", s)),
        }
    }
}

impl std::fmt::Display for PersistenceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceProvider::Sqlite => write!(f, "sqlite"),
            PersistenceProvider::Memory => write!(f, "memory"),
        }
    }
}

/// Conversation persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub provider: PersistenceProvider,
    /// Path to the SQLite database (for sqlite provider).
    pub sqlite_path: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            provider: PersistenceProvider::Sqlite,
            sqlite_path: "~/.quill/conversations.db".to_string(),
        }
    }
}

/// Citation link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct CitationSettings {
    /// Base URL that serves stored documents; storage paths are appended to it.
    pub file_base_url: Option<String>,
}

/// Prompt customization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PromptSettings {
    /// Directory for custom prompts (overrides defaults).
    pub custom_dir: Option<String>,
    /// Custom variables available in all prompts as {{variable_name}}.
    pub variables: HashMap<String, String>,
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::QuillError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.persistence.sqlite_path)
    }

    /// Set a value by dotted key (e.g. "llm.model").
    pub fn set_value(&mut self, key: &str, value: &str) -> crate::error::Result<()> {
        let invalid = |e: String| crate::error::QuillError::Config(format!("{}: {}", key, e));
        let parse_num = |v: &str| v.parse::<u64>().map_err(|e| invalid(e.to_string()));

        match key {
            "general.data_dir" => self.general.data_dir = value.to_string(),
            "general.log_level" => self.general.log_level = value.to_string(),
            "llm.model" => self.llm.model = value.to_string(),
            "llm.token_limit" => self.llm.token_limit = parse_num(value)? as u32,
            "llm.temperature" => {
                self.llm.temperature = value.parse().map_err(|e: std::num::ParseFloatError| invalid(e.to_string()))?
            }
            "llm.selection_temperature" => {
                self.llm.selection_temperature =
                    value.parse().map_err(|e: std::num::ParseFloatError| invalid(e.to_string()))?
            }
            "llm.timeout_secs" => self.llm.timeout_secs = parse_num(value)?,
            "retrieval.endpoint" => self.retrieval.endpoint = value.to_string(),
            "retrieval.token_budget" => self.retrieval.token_budget = parse_num(value)? as usize,
            "retrieval.timeout_secs" => self.retrieval.timeout_secs = parse_num(value)?,
            "workflows.endpoint" => self.workflows.endpoint = value.to_string(),
            "workflows.catalog_file" => self.workflows.catalog_file = Some(value.to_string()),
            "workflows.timeout_secs" => self.workflows.timeout_secs = parse_num(value)?,
            "persistence.provider" => self.persistence.provider = value.parse().map_err(invalid)?,
            "persistence.sqlite_path" => self.persistence.sqlite_path = value.to_string(),
            "citations.file_base_url" => self.citations.file_base_url = Some(value.to_string()),
            "prompts.custom_dir" => self.prompts.custom_dir = Some(value.to_string()),
            _ => return Err(crate::error::QuillError::Config(format!("Unknown configuration key: {}", key))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [llm]
            model = "gpt-4.1"

            [workflows.api_keys]
            cs101 = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(settings.llm.model, "gpt-4.1");
        assert_eq!(settings.llm.token_limit, 128_000);
        assert_eq!(settings.retrieval.token_budget, 4000);
        assert_eq!(settings.workflows.api_keys["cs101"], "secret");
        assert_eq!(settings.persistence.provider, PersistenceProvider::Sqlite);
    }

    #[test]
    fn test_set_value() {
        let mut settings = Settings::default();
        settings.set_value("llm.model", "gpt-4o").unwrap();
        settings.set_value("persistence.provider", "memory").unwrap();
        settings.set_value("retrieval.token_budget", "2500").unwrap();

        assert_eq!(settings.llm.model, "gpt-4o");
        assert_eq!(settings.persistence.provider, PersistenceProvider::Memory);
        assert_eq!(settings.retrieval.token_budget, 2500);
        assert!(settings.set_value("llm.token_limit", "many").is_err());
        assert!(settings.set_value("nope.key", "1").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.llm.model = "gpt-4.1-mini".to_string();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.llm.model, "gpt-4.1-mini");
    }
}
