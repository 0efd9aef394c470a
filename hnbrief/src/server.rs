use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::{get, post, routes, State};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{Config, ServerConfig};

use crate::chat::Chat;
use crate::conversations::{list_messages, Message};
use crate::error::{ChatError, FetchError, PersistenceError, SummarizeError};
use crate::llm::reply::ReplyOutcome;
use crate::llm::ChatMessage;
use crate::llm::summarizer::{StreamOutcome, SummaryResult, SummaryStream, Summarizer};
use crate::scheduler::DailyJob;

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub summarizer: Arc<Summarizer>,
    pub chat: Arc<Chat>,
    pub job: Arc<DailyJob>,
}

/// Conversation id for a request: the `X-Request-Id` header, or a fresh uuid.
pub struct RequestId(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestId {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let id = req
            .headers()
            .get_one("X-Request-Id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Outcome::Success(RequestId(id))
    }
}

type ApiError = (Status, Json<Value>);

fn api_error(status: Status, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn summarize_error(err: &SummarizeError) -> ApiError {
    let status = match err {
        SummarizeError::Fetch(FetchError::InvalidUrl { .. }) => Status::BadRequest,
        SummarizeError::Fetch(_) | SummarizeError::Llm(_) => Status::BadGateway,
        SummarizeError::Conversion(_) => Status::UnprocessableEntity,
    };
    api_error(status, err)
}

fn chat_error(err: &ChatError) -> ApiError {
    let status = match err {
        ChatError::Invalid(_) => Status::BadRequest,
        ChatError::Llm(_) => Status::BadGateway,
    };
    api_error(status, err)
}

fn persistence_error(err: &PersistenceError) -> ApiError {
    let status = match err {
        PersistenceError::NotFound(_) => Status::NotFound,
        _ => Status::InternalServerError,
    };
    api_error(status, err)
}

fn busy() -> ApiError {
    api_error(Status::Conflict, "a crawl or digest run is already in progress")
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    users_count: usize,
    scheduler_times: Vec<String>,
    job_running: bool,
}

#[derive(Deserialize)]
struct SummarizeRequest {
    #[serde(alias = "Url")]
    url: String,
}

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default)]
    conversation_id: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct CrawlRequest {
    #[serde(alias = "Count")]
    count: usize,
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

/// Status endpoint returning simple JSON with uptime and basic config info.
#[get("/api/v1/status")]
async fn status(state: &State<AppState>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        status: "ok",
        uptime_seconds: uptime,
        users_count: state.config.users.len(),
        scheduler_times: state.config.scheduler.times.clone(),
        job_running: state.job.is_running(),
    })
}

/// Stream what `work` sends on `rx`, then an event named `done`, or `error` with
/// the message if `work` failed.
fn relay(mut rx: mpsc::Receiver<String>, work: BoxFuture<'static, Result<(), String>>) -> EventStream![] {
    let (done_tx, done_rx) = oneshot::channel::<Result<(), String>>();
    tokio::spawn(async move {
        let _ = done_tx.send(work.await);
    });

    EventStream! {
        while let Some(delta) = rx.recv().await {
            yield Event::data(delta);
        }
        match done_rx.await {
            Ok(Err(message)) => {
                yield Event::data(message).event("error");
            }
            _ => {
                yield Event::data("").event("done");
            }
        }
    }
}

/// Streamed summary: one `data:` event per delta, then an event named `done`.
///
/// Failures that happen before the first delta are answered with a plain HTTP
/// error. A backend failure mid-stream ends the stream with an `error` event.
#[post("/api/v1/summarize", format = "json", data = "<body>")]
async fn summarize(
    state: &State<AppState>,
    request_id: RequestId,
    body: Json<SummarizeRequest>,
) -> Result<EventStream![], ApiError> {
    let conversation_id = request_id.0;
    info!(%conversation_id, url = %body.url, "summarize (stream) requested");

    let opened = state
        .summarizer
        .start_stream(&conversation_id, &body.url)
        .await
        .map_err(|e| {
            warn!(%conversation_id, %e, "failed to start summary stream");
            summarize_error(&e)
        })?;

    let (tx, rx) = mpsc::channel::<String>(32);
    let work = match opened {
        SummaryStream::Fallback(result) => async move {
            let _ = tx.send(result.summary).await;
            Ok::<(), String>(())
        }
        .boxed(),
        SummaryStream::Live(live) => async move {
            match live.forward(tx).await {
                Ok(StreamOutcome::Completed(_)) => Ok(()),
                Ok(StreamOutcome::Cancelled { partial }) => {
                    info!(%conversation_id, delivered = partial.len(), "client went away mid-summary");
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        }
        .boxed(),
    };

    Ok(relay(rx, work))
}

/// Streamed chat reply over the client-supplied history, framed like `summarize`.
///
/// The conversation id comes from the body, falling back to `X-Request-Id`.
#[post("/api/v1/chat", format = "json", data = "<body>")]
async fn chat(
    state: &State<AppState>,
    request_id: RequestId,
    body: Json<ChatBody>,
) -> Result<EventStream![], ApiError> {
    let ChatBody {
        conversation_id,
        messages,
    } = body.into_inner();
    let conversation_id = conversation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(request_id.0);

    let live = state
        .chat
        .start(&conversation_id, messages)
        .await
        .map_err(|e| {
            warn!(%conversation_id, %e, "failed to start chat stream");
            chat_error(&e)
        })?;

    let (tx, rx) = mpsc::channel::<String>(32);
    let work = async move {
        match live.forward(tx).await {
            Ok(ReplyOutcome::Completed(_)) => Ok(()),
            Ok(ReplyOutcome::Cancelled { partial }) => {
                info!(%conversation_id, delivered = partial.len(), "client went away mid-reply");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }
    .boxed();

    Ok(relay(rx, work))
}

#[post("/api/v1/summarize/batch", format = "json", data = "<body>")]
async fn summarize_batch(
    state: &State<AppState>,
    request_id: RequestId,
    body: Json<SummarizeRequest>,
) -> Result<Json<SummaryResult>, ApiError> {
    let conversation_id = request_id.0;
    info!(%conversation_id, url = %body.url, "summarize (batch) requested");

    state
        .summarizer
        .summarize(&conversation_id, &body.url)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(%conversation_id, %e, "summarize failed");
            summarize_error(&e)
        })
}

#[post("/api/v1/crawl", format = "json", data = "<body>")]
async fn crawl(state: &State<AppState>, body: Json<CrawlRequest>) -> Result<Json<Value>, ApiError> {
    let Some(_guard) = state.job.try_begin() else {
        return Err(busy());
    };

    let results = state.job.crawler().crawl(body.count).await.map_err(|e| {
        error!(%e, "crawl failed");
        api_error(Status::BadGateway, e)
    })?;
    Ok(Json(json!({ "Result": results })))
}

#[post("/api/v1/publish-digest")]
async fn publish_digest(state: &State<AppState>) -> Result<Json<Value>, ApiError> {
    let Some(_guard) = state.job.try_begin() else {
        return Err(busy());
    };

    let report = state.job.publisher().publish().await.map_err(|e| {
        error!(%e, "digest publish failed");
        persistence_error(&e)
    })?;
    Ok(Json(json!({
        "Status": "Success",
        "sent": report.sent,
        "failed": report.failed,
    })))
}

#[get("/api/v1/conversations/<conversation_id>/messages")]
async fn conversation_messages(
    state: &State<AppState>,
    conversation_id: &str,
) -> Result<Json<Vec<Message>>, ApiError> {
    list_messages(&state.db, conversation_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!(conversation_id, %e, "failed to list messages");
            persistence_error(&e)
        })
}

// ============================================================================
// Database Schema Management
// ============================================================================

/// Ensure the required schema exists. Idempotent and safe to call at startup.
///
/// `stories.story_id` is indexed but not unique: a story created by two
/// overlapping crawls is stored twice and reads pick the oldest row.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    info!("server: ensuring DB schema (CREATE TABLE IF NOT EXISTS ...)");

    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            display_name TEXT,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS stories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            score INTEGER NOT NULL DEFAULT 0,
            time INTEGER NOT NULL DEFAULT 0,
            story_type TEXT NOT NULL DEFAULT '',
            descendants INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL DEFAULT '',
            is_published BOOLEAN NOT NULL DEFAULT 0,
            created_at TIMESTAMP
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_stories_story_id ON stories(story_id);",
        "CREATE INDEX IF NOT EXISTS idx_stories_time_score ON stories(time, score);",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);",
    ];

    for stmt in stmts {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("failed to apply schema statement: {}", stmt.trim()))?;
    }

    info!("server: DB schema ensured");
    Ok(())
}

pub fn build_rocket(state: AppState, server: &ServerConfig) -> rocket::Rocket<rocket::Build> {
    let mut fig = rocket::Config::figment();
    if let Some(bind) = &server.bind {
        fig = fig.merge(("address", bind.clone()));
    }
    if let Some(port) = server.port {
        fig = fig.merge(("port", port));
    }

    rocket::custom(fig).manage(state).mount(
        "/",
        routes![
            health,
            status,
            summarize,
            summarize_batch,
            chat,
            crawl,
            publish_digest,
            conversation_messages,
        ],
    )
}

/// Build and launch the Rocket server; returns once Rocket shuts down.
pub async fn launch_rocket(state: AppState) -> Result<()> {
    let server = state.config.server.clone();
    info!(bind = ?server.bind, port = ?server.port, "Starting Rocket HTTP server");
    build_rocket(state, &server)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    info!("Rocket HTTP server has shut down");
    Ok(())
}
