//! CLI module for Quill.

pub mod commands;
mod output;
pub mod preflight;

pub use output::Output;

use clap::{Parser, Subcommand};

/// Quill - course assistant agent
///
/// Answers questions about a course by searching its documents and calling
/// course tools, then streams an answer with citations.
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question about a course
    Ask {
        /// The question to ask
        question: String,

        /// Course whose documents and tools to use
        #[arg(long, env = "QUILL_COURSE")]
        course: String,

        /// Restrict search to a document group (repeatable)
        #[arg(long = "doc-group")]
        doc_groups: Vec<String>,

        /// JSON file holding the conversation; read if present and written back after the answer
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Start the HTTP server streaming agent runs as Server-Sent Events
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "llm.model")
        key: String,
        /// Configuration value
        value: String,
    },

    /// Show configuration file path
    Path,
}
