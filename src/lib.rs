//! Quill - course assistant agent
//!
//! An agentic question-answering loop over course material. For each user
//! message the agent lets a language model pick tools (document search or
//! course workflows), runs them in parallel, repeats for a bounded number of
//! steps, and finally streams an answer whose inline citation markers are
//! rewritten into links to the retrieved passages.
//!
//! # Architecture
//!
//! - `agent` - The bounded agent loop and its per-run state
//! - `selector` - Tool selection through function calling
//! - `retrieval` - Document passage retrieval
//! - `tools` - Tool catalog, workflow execution and response normalization
//! - `citations` - Streaming citation rewriting
//! - `prompt` - Final answer prompt construction
//! - `events` - Progress events and the sink they are delivered through
//! - `persistence` - Conversation storage
//! - `orchestrator` - Wiring from configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use quill::config::Settings;
//! use quill::conversation::{CourseContext, Message};
//! use quill::events::CollectingSink;
//! use quill::orchestrator::Orchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(Settings::load()?)?;
//!     let sink = CollectingSink::new();
//!
//!     let outcome = orchestrator
//!         .run(
//!             orchestrator.new_conversation(),
//!             Message::user("When is the midterm?"),
//!             &CourseContext::new("CS 101"),
//!             &sink,
//!             CancellationToken::new(),
//!         )
//!         .await;
//!
//!     if let Some(answer) = outcome.conversation.messages.last() {
//!         println!("{}", answer.text());
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod citations;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod llm;
pub mod openai;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod retrieval;
pub mod selector;
pub mod tools;

pub use error::{QuillError, Result};
