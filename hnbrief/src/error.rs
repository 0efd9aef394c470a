//! Error taxonomy for the summarization pipeline.

use thiserror::Error;

/// Retrieving a page or feed document failed.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// The HTML payload could not be converted to text.
#[derive(Error, Debug)]
#[error("failed to convert markup: {0}")]
pub struct ConversionError(pub String);

/// The LLM backend failed or returned an unusable response.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM response has no choices")]
    EmptyChoices,
    #[error("failed to parse LLM response: {0}")]
    Decode(String),
    #[error("LLM stream interrupted: {0}")]
    Stream(String),
}

/// A store or recorder write/read failed.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("story {0} not found")]
    NotFound(i64),
    #[error("no stories were updated")]
    NothingUpdated,
    #[error("conversation recorder is not running")]
    RecorderClosed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Sending the digest to one recipient failed.
#[derive(Error, Debug)]
#[error("failed to send digest to {recipient}: {reason}")]
pub struct DistributionError {
    pub recipient: String,
    pub reason: String,
}

/// Failures surfaced by an interactive summarize call.
#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Failures surfaced by a chat request.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid chat request: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Llm(#[from] LlmError),
}
