//! Configuration module for Quill.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{AnswerPrompts, Prompts, SelectionPrompts};
pub use settings::{
    CitationSettings, GeneralSettings, LlmSettings, PersistenceProvider, PersistenceSettings,
    PromptSettings, RetrievalSettings, Settings, WorkflowSettings,
};
