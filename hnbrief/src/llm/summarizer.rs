// Summarizer module
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use super::reply::{LiveReply, ReplyOutcome};
use super::{ChatMessage, LlmProvider, LlmRequest, Role};
use crate::conversations::ConversationRecorder;
use crate::error::{LlmError, SummarizeError};
use crate::scraping::{normalize, sniff, ContentFetcher, ContentKind};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Prepended to the article text in the user message.
pub const SUMMARY_INSTRUCTION: &str = "Read the following markdown article carefully, then summarize it in no more than 100 words.\n\n";

pub const UNSUPPORTED_FORMAT_MESSAGE: &str =
    "This link does not point to an HTML page, so no summary was generated.";

pub const NO_CONTENT_MESSAGE: &str =
    "No readable text was found on this page, so no summary was generated.";

/// Summary text paired with the page it describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    pub url: String,
}

/// Why a page was answered without calling the LLM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    UnsupportedFormat,
    EmptyContent,
}

impl FallbackReason {
    pub fn message(&self) -> &'static str {
        match self {
            FallbackReason::UnsupportedFormat => UNSUPPORTED_FORMAT_MESSAGE,
            FallbackReason::EmptyContent => NO_CONTENT_MESSAGE,
        }
    }

    fn result(&self, url: &str) -> SummaryResult {
        SummaryResult {
            summary: self.message().to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerSettings {
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            temperature: 1.3,
            max_tokens: None,
            timeout_seconds: None,
        }
    }
}

/// Builds the two-message summary prompt for normalized article text.
pub fn build_prompt(article_text: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!("{}{}", SUMMARY_INSTRUCTION, article_text)),
    ]
}

enum Prepared {
    Fallback(SummaryResult),
    Prompt(Vec<ChatMessage>),
}

/// Result of opening a streaming summary.
pub enum SummaryStream {
    /// Answered without the LLM; nothing to stream
    Fallback(SummaryResult),
    Live(LiveSummary),
}

/// How a forwarded stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed(SummaryResult),
    /// The sink closed before the backend finished; `partial` is what was delivered.
    Cancelled { partial: String },
}

pub struct Summarizer {
    fetcher: Arc<dyn ContentFetcher>,
    llm: Arc<dyn LlmProvider>,
    recorder: ConversationRecorder,
    settings: SummarizerSettings,
}

impl Summarizer {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        llm: Arc<dyn LlmProvider>,
        recorder: ConversationRecorder,
        settings: SummarizerSettings,
    ) -> Self {
        Self {
            fetcher,
            llm,
            recorder,
            settings,
        }
    }

    async fn prepare(&self, url: &str) -> Result<Prepared, SummarizeError> {
        let raw = self.fetcher.fetch(url).await?;

        if sniff(&raw) != ContentKind::Html {
            info!(url, bytes = raw.len(), "payload is not HTML, skipping summary");
            return Ok(Prepared::Fallback(FallbackReason::UnsupportedFormat.result(url)));
        }

        let text = normalize(&raw)?;
        if text.trim().is_empty() {
            info!(url, "page has no extractable text, skipping summary");
            return Ok(Prepared::Fallback(FallbackReason::EmptyContent.result(url)));
        }

        Ok(Prepared::Prompt(build_prompt(&text)))
    }

    fn request(&self, messages: Vec<ChatMessage>) -> LlmRequest {
        LlmRequest {
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: Some(self.settings.temperature),
            timeout_seconds: self.settings.timeout_seconds,
        }
    }

    async fn record_prompt(&self, conversation_id: &str, messages: &[ChatMessage]) {
        if let Some(user) = messages.iter().rev().find(|m| m.role == Role::User) {
            self.recorder
                .record(conversation_id, Role::User, user.content.clone())
                .await;
        }
    }

    /// Batch mode: one blocking completion.
    pub async fn summarize(&self, conversation_id: &str, url: &str) -> Result<SummaryResult, SummarizeError> {
        let messages = match self.prepare(url).await? {
            Prepared::Fallback(result) => return Ok(result),
            Prepared::Prompt(messages) => messages,
        };

        self.record_prompt(conversation_id, &messages).await;
        let response = self.llm.generate(self.request(messages)).await?;
        info!(
            conversation_id,
            url,
            total_tokens = response.usage.total_tokens,
            "summary generated"
        );
        self.recorder
            .record(conversation_id, Role::Assistant, response.content.clone())
            .await;

        Ok(SummaryResult {
            summary: response.content,
            url: url.to_string(),
        })
    }

    /// Opens the backend stream. Fetch, conversion and LLM connection failures are
    /// reported here, before any output is produced.
    pub async fn start_stream(&self, conversation_id: &str, url: &str) -> Result<SummaryStream, SummarizeError> {
        let messages = match self.prepare(url).await? {
            Prepared::Fallback(result) => return Ok(SummaryStream::Fallback(result)),
            Prepared::Prompt(messages) => messages,
        };

        self.record_prompt(conversation_id, &messages).await;
        let deltas = self.llm.generate_stream(self.request(messages)).await?;

        Ok(SummaryStream::Live(LiveSummary {
            url: url.to_string(),
            reply: LiveReply::new(conversation_id, deltas, self.recorder.clone()),
        }))
    }

    /// Streaming mode: forwards each delta to `sink` as it arrives.
    pub async fn summarize_streaming(
        &self,
        conversation_id: &str,
        url: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<StreamOutcome, SummarizeError> {
        match self.start_stream(conversation_id, url).await? {
            SummaryStream::Fallback(result) => {
                let _ = sink.send(result.summary.clone()).await;
                Ok(StreamOutcome::Completed(result))
            }
            SummaryStream::Live(live) => Ok(live.forward(sink).await?),
        }
    }
}

/// An open backend stream waiting to be forwarded to a client.
pub struct LiveSummary {
    url: String,
    reply: LiveReply,
}

impl LiveSummary {
    /// Forward the summary to `sink`; see [`LiveReply::forward`] for cancellation.
    pub async fn forward(self, sink: mpsc::Sender<String>) -> Result<StreamOutcome, LlmError> {
        match self.reply.forward(sink).await? {
            ReplyOutcome::Completed(summary) => {
                info!(url = %self.url, chars = summary.len(), "finished streaming summary");
                Ok(StreamOutcome::Completed(SummaryResult { summary, url: self.url }))
            }
            ReplyOutcome::Cancelled { partial } => Ok(StreamOutcome::Cancelled { partial }),
        }
    }
}
