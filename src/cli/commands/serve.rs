//! HTTP API server.
//!
//! `POST /chat` runs the agent for one message and streams every
//! [`StreamEvent`] back as a Server-Sent Event. Closing the connection
//! cancels the run.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::conversation::{ContextWithMetadata, Conversation, CourseContext, Message, MessageContent};
use crate::events::StreamEvent;
use crate::orchestrator::Orchestrator;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

/// Shared application state.
struct AppState {
    orchestrator: Orchestrator,
}

/// Run the HTTP API server.
pub async fn run_serve(host: &str, port: u16, settings: Settings) -> anyhow::Result<()> {
    if let Err(e) = preflight::check(Operation::Serve, &settings) {
        Output::error(&format!("{}", e));
        return Err(e.into());
    }

    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(settings)?,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Quill API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Chat (SSE)", "POST /chat");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, app).await?;

    Ok(())
}

// === Request/Response Types ===

#[derive(Deserialize)]
struct ChatRequest {
    course_name: String,
    message: MessageInput,
    /// Full conversation to continue. Takes precedence over `conversation_id`.
    #[serde(default)]
    conversation: Option<Conversation>,
    /// Stored conversation to continue.
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    doc_groups: Vec<String>,
    #[serde(default)]
    project_api_key: Option<String>,
    #[serde(default)]
    user_identifier: String,
}

#[derive(Deserialize)]
struct MessageInput {
    #[serde(default)]
    id: Option<String>,
    content: MessageContent,
    /// File-upload contexts attached to the message.
    #[serde(default)]
    contexts: Vec<ContextWithMetadata>,
    #[serde(default)]
    image_description: Option<String>,
}

impl MessageInput {
    fn into_message(self) -> Message {
        let mut message = Message::user(self.content).with_contexts(self.contexts);
        if let Some(id) = self.id {
            message.id = id;
        }
        message.image_description = self.image_description;
        message
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: error.into() }))
}

/// One SSE frame per stream event, named after the event type.
fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    if req.course_name.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "course_name is required"));
    }

    let conversation = match req.conversation {
        Some(conversation) => conversation,
        None => state
            .orchestrator
            .resume_or_new(req.conversation_id.as_deref())
            .await
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
    };

    let course = CourseContext {
        course_name: req.course_name,
        doc_groups: req.doc_groups,
        project_api_key: req.project_api_key,
        user_identifier: req.user_identifier,
    };
    let message = req.message.into_message();

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    // Dropped with the response stream when the client disconnects.
    let guard = cancel.clone().drop_guard();

    let runner = state.orchestrator.runner();
    tokio::spawn(async move {
        let outcome = runner.run(conversation, message, &course, &tx, cancel).await;
        if !outcome.success {
            warn!("Chat run ended without an answer: {:?}", outcome.error);
        } else {
            debug!("Chat run for {} finished", outcome.conversation.id);
        }
    });

    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(&event)), (rx, guard)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
