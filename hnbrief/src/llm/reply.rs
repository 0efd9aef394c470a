use futures_util::StreamExt;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{DeltaStream, Role, StreamEvent};
use crate::conversations::ConversationRecorder;
use crate::error::LlmError;

/// How a forwarded reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Completed(String),
    /// The sink closed before the backend finished; `partial` is what was delivered.
    Cancelled { partial: String },
}

/// An open backend stream whose reply belongs to a conversation.
pub struct LiveReply {
    conversation_id: String,
    deltas: DeltaStream,
    recorder: ConversationRecorder,
}

impl LiveReply {
    pub fn new(conversation_id: impl Into<String>, deltas: DeltaStream, recorder: ConversationRecorder) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            deltas,
            recorder,
        }
    }

    /// Pump deltas into `sink` until the backend finishes or the sink closes.
    ///
    /// The sink is watched while waiting on the backend, so a client leaving during
    /// a stall is noticed at once. A closed sink drops the backend stream, which
    /// aborts the upstream request; the partial reply is not recorded. A completed
    /// reply is recorded as the assistant turn.
    pub async fn forward(mut self, sink: mpsc::Sender<String>) -> Result<ReplyOutcome, LlmError> {
        let mut accumulated = String::new();

        loop {
            let next = select! {
                _ = sink.closed() => None,
                event = self.deltas.next() => Some(event),
            };
            let Some(event) = next else {
                return Ok(self.abandon(accumulated));
            };
            match event {
                Some(Ok(StreamEvent::Delta(text))) => {
                    if sink.send(text.clone()).await.is_err() {
                        return Ok(self.abandon(accumulated));
                    }
                    accumulated.push_str(&text);
                }
                Some(Ok(StreamEvent::Finished)) | None => break,
                Some(Err(e)) => {
                    warn!(conversation_id = %self.conversation_id, %e, "LLM stream failed");
                    return Err(e);
                }
            }
        }

        info!(
            conversation_id = %self.conversation_id,
            chars = accumulated.len(),
            "finished streaming reply"
        );
        self.recorder
            .record(&self.conversation_id, Role::Assistant, accumulated.clone())
            .await;

        Ok(ReplyOutcome::Completed(accumulated))
    }

    fn abandon(self, partial: String) -> ReplyOutcome {
        info!(
            conversation_id = %self.conversation_id,
            delivered = partial.len(),
            "output closed, abandoning LLM stream"
        );
        ReplyOutcome::Cancelled { partial }
    }
}
