//! Free-form streaming chat on the summarizer's LLM backend.
//!
//! The client sends the whole history each time. Only the newest user turn and the
//! assistant reply are recorded, so a conversation's stored messages grow by two
//! per exchange.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::conversations::ConversationRecorder;
use crate::error::ChatError;
use crate::llm::reply::{LiveReply, ReplyOutcome};
use crate::llm::summarizer::SummarizerSettings;
use crate::llm::{ChatMessage, LlmProvider, LlmRequest, Role};

pub struct Chat {
    llm: Arc<dyn LlmProvider>,
    recorder: ConversationRecorder,
    settings: SummarizerSettings,
}

/// History must be non-empty and end with a non-blank user turn.
pub fn validate(messages: &[ChatMessage]) -> Result<&ChatMessage, ChatError> {
    let last = messages.last().ok_or(ChatError::Invalid("messages must not be empty"))?;
    if last.role != Role::User {
        return Err(ChatError::Invalid("the last message must come from the user"));
    }
    if last.content.trim().is_empty() {
        return Err(ChatError::Invalid("the last message must not be blank"));
    }
    Ok(last)
}

impl Chat {
    pub fn new(llm: Arc<dyn LlmProvider>, recorder: ConversationRecorder, settings: SummarizerSettings) -> Self {
        Self {
            llm,
            recorder,
            settings,
        }
    }

    /// Validate the history, record the user turn and open the backend stream.
    pub async fn start(&self, conversation_id: &str, messages: Vec<ChatMessage>) -> Result<LiveReply, ChatError> {
        let user = validate(&messages)?;
        self.recorder
            .record(conversation_id, Role::User, user.content.clone())
            .await;

        info!(conversation_id, turns = messages.len(), "chat stream requested");
        let deltas = self
            .llm
            .generate_stream(LlmRequest {
                messages,
                max_tokens: self.settings.max_tokens,
                temperature: Some(self.settings.temperature),
                timeout_seconds: self.settings.timeout_seconds,
            })
            .await?;

        Ok(LiveReply::new(conversation_id, deltas, self.recorder.clone()))
    }

    /// Stream the reply to `sink` as it arrives.
    pub async fn reply(
        &self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        sink: mpsc::Sender<String>,
    ) -> Result<ReplyOutcome, ChatError> {
        let live = self.start(conversation_id, messages).await?;
        Ok(live.forward(sink).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn history_must_end_with_user_turn() {
        assert!(validate(&[]).is_err());
        assert!(validate(&[msg(Role::User, "hi"), msg(Role::Assistant, "hello")]).is_err());
        assert!(validate(&[msg(Role::User, "  ")]).is_err());

        let history = [
            msg(Role::System, "be brief"),
            msg(Role::User, "hi"),
            msg(Role::Assistant, "hello"),
            msg(Role::User, "what is rust?"),
        ];
        assert_eq!(validate(&history).unwrap().content, "what is rust?");
    }
}
