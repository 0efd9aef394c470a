//! Conversation messages and the background recorder that persists them.
//!
//! Writes go through a bounded queue drained by a single worker task, so the
//! summarization path never waits on the database. Every submission hands back a
//! [`RecordHandle`] that resolves once the row is written (or failed); dropping it
//! is fine, failures are logged by the worker either way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::llm::Role;

/// One stored turn of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = PersistenceError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = Role::parse(&row.role).ok_or_else(|| {
            PersistenceError::Database(sqlx::Error::Decode(
                format!("unknown message role '{}'", row.role).into(),
            ))
        })?;
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

/// Store a single message
pub async fn store_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: Role,
    content: &str,
) -> Result<Message, PersistenceError> {
    let created_at = Utc::now();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO messages (conversation_id, role, content, created_at)
        VALUES (?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(created_at)
    .fetch_one(pool)
    .await?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        created_at,
    })
}

/// Get all messages for a conversation, in insertion order
pub async fn list_messages(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Vec<Message>, PersistenceError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT id, conversation_id, role, content, created_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Message::try_from).collect()
}

struct RecordJob {
    conversation_id: String,
    role: Role,
    content: String,
    done: oneshot::Sender<Result<Message, PersistenceError>>,
}

/// Completion of one background write.
pub struct RecordHandle(oneshot::Receiver<Result<Message, PersistenceError>>);

impl RecordHandle {
    /// Wait for the write to finish.
    pub async fn wait(self) -> Result<Message, PersistenceError> {
        self.0.await.unwrap_or(Err(PersistenceError::RecorderClosed))
    }
}

/// Submits message writes to the background worker.
#[derive(Clone)]
pub struct ConversationRecorder {
    tx: mpsc::Sender<RecordJob>,
}

impl ConversationRecorder {
    /// Start the worker. It stops once every recorder clone has been dropped.
    pub fn spawn(pool: SqlitePool, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(pool, rx));
        (Self { tx }, worker)
    }

    /// Queue a message for persistence without waiting for the write.
    ///
    /// Only waits when the queue is full. Submissions from one caller are written in
    /// the order they were queued.
    pub async fn record(&self, conversation_id: &str, role: Role, content: impl Into<String>) -> RecordHandle {
        let (done, handle) = oneshot::channel();
        let job = RecordJob {
            conversation_id: conversation_id.to_string(),
            role,
            content: content.into(),
            done,
        };

        if let Err(mpsc::error::SendError(job)) = self.tx.send(job).await {
            warn!(conversation_id = %job.conversation_id, "conversation recorder is closed, message dropped");
            let _ = job.done.send(Err(PersistenceError::RecorderClosed));
        }

        RecordHandle(handle)
    }
}

async fn run_worker(pool: SqlitePool, mut rx: mpsc::Receiver<RecordJob>) {
    while let Some(job) = rx.recv().await {
        let result = store_message(&pool, &job.conversation_id, job.role, &job.content).await;
        match &result {
            Ok(message) => debug!(
                conversation_id = %message.conversation_id,
                role = %message.role,
                id = message.id,
                "message recorded"
            ),
            Err(e) => warn!(
                conversation_id = %job.conversation_id,
                role = %job.role,
                %e,
                "failed to record message"
            ),
        }
        let _ = job.done.send(result);
    }
    debug!("conversation recorder stopped");
}
