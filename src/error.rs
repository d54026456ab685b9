//! Error types for Quill.

use thiserror::Error;

/// Library-level error type for Quill operations.
#[derive(Error, Debug)]
pub enum QuillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Tool catalog error: {0}")]
    ToolCatalog(String),

    #[error("Workflow call failed: {0}")]
    Workflow(String),

    #[error("Missing credentials for course: {0}")]
    MissingCredentials(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Citation link error: {0}")]
    Citation(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for Quill operations.
pub type Result<T> = std::result::Result<T, QuillError>;
