//! Ask command implementation.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::conversation::{Conversation, CourseContext, Message};
use crate::events::{ContextMetadata, StreamEvent};
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Run the ask command.
pub async fn run_ask(
    question: &str,
    course: &str,
    doc_groups: Vec<String>,
    conversation_file: Option<&str>,
    settings: Settings,
) -> Result<()> {
    if let Err(e) = preflight::check(Operation::Ask, &settings) {
        Output::error(&format!("{}", e));
        return Err(e.into());
    }

    let orchestrator = Orchestrator::new(settings)?;

    let conversation = match conversation_file.map(Path::new) {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Conversation>(&content)?
        }
        _ => orchestrator.new_conversation(),
    };

    let mut course_context = CourseContext::new(course);
    course_context.doc_groups = doc_groups;
    course_context.user_identifier = std::env::var("USER").unwrap_or_default();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = orchestrator.runner();
    let message = Message::user(question);
    let run = tokio::spawn(async move {
        runner.run(conversation, message, &course_context, &tx, cancel).await
    });

    let spinner = Output::spinner("Thinking...");
    let mut answering = false;
    let mut sources: Vec<ContextMetadata> = Vec::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Selection { tools, .. } => {
                let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
                spinner.set_message(format!("Calling {}", names.join(", ")));
            }
            StreamEvent::Retrieval { query, contexts_count, .. } => {
                spinner.set_message(format!("Found {} passages for \"{}\"", contexts_count, query));
            }
            StreamEvent::Tool { invocation, .. } if invocation.result.is_none() => {
                spinner.set_message(format!("Running {}", invocation.readable_name));
            }
            StreamEvent::ContextsMetadata { contexts } => sources = contexts,
            StreamEvent::FinalTokens { delta, done } => {
                if !answering {
                    spinner.finish_and_clear();
                    answering = true;
                    println!();
                }
                print!("{}", delta);
                std::io::stdout().flush()?;
                if done {
                    println!();
                }
            }
            StreamEvent::Error { message, recoverable: true } => {
                spinner.suspend(|| Output::warning(&message));
            }
            StreamEvent::Error { message, recoverable: false } => {
                spinner.finish_and_clear();
                Output::error(&message);
            }
            _ => {}
        }
    }
    spinner.finish_and_clear();

    let outcome = run.await?;

    if outcome.success && !sources.is_empty() {
        Output::header("Sources");
        for source in &sources {
            Output::source(source);
        }
    }

    if let Some(path) = conversation_file {
        std::fs::write(path, serde_json::to_string_pretty(&outcome.conversation)?)?;
    }

    match outcome.error {
        Some(error) if !outcome.success => Err(anyhow::anyhow!("Failed to generate answer: {}", error)),
        _ => Ok(()),
    }
}
