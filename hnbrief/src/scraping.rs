use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::{ConversionError, FetchError};

const USER_AGENT: &str = "hnbrief/0.1.0";

/// Wrap width used when rendering HTML to text.
const TEXT_WIDTH: usize = 100;

/// How many leading bytes the content sniffer looks at.
const SNIFF_LEN: usize = 1024;

/// Retrieves the raw bytes behind a URL.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// `reqwest` backed fetcher. One GET per call, no retries.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Builds a fetcher; `timeout_secs` of `None` keeps the transport default.
    pub fn new(timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(secs) = timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        debug!(url, bytes = bytes.len(), "fetched page");
        Ok(bytes.to_vec())
    }
}

/// Coarse classification of a fetched payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Other,
}

// Tag openers that identify an HTML document when they start the payload.
const HTML_SIGNATURES: &[&[u8]] = &[
    b"<!doctype html",
    b"<html",
    b"<head",
    b"<script",
    b"<iframe",
    b"<h1",
    b"<div",
    b"<font",
    b"<table",
    b"<a",
    b"<style",
    b"<title",
    b"<b",
    b"<body",
    b"<br",
    b"<p",
    b"<!--",
    b"<meta",
    b"<link",
    b"<article",
    b"<section",
    b"<main",
    b"<header",
    b"<nav",
];

/// Classifies a payload by its bytes, ignoring any Content-Type header.
pub fn sniff(bytes: &[u8]) -> ContentKind {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0C))
        .unwrap_or(bytes.len());
    let head = &bytes[start..bytes.len().min(start + SNIFF_LEN)];
    let lower = head.to_ascii_lowercase();

    // XHTML documents open with an XML prolog.
    if lower.starts_with(b"<?xml") {
        return if contains(&lower, b"<html") {
            ContentKind::Html
        } else {
            ContentKind::Other
        };
    }

    for signature in HTML_SIGNATURES {
        if !lower.starts_with(signature) {
            continue;
        }
        if *signature == b"<!--" {
            return ContentKind::Html;
        }
        match lower.get(signature.len()) {
            Some(b' ' | b'>' | b'\t' | b'\n' | b'\r' | b'/') => return ContentKind::Html,
            _ => continue,
        }
    }

    ContentKind::Other
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Converts HTML to the plain text/markdown used in prompts.
///
/// Deterministic for identical input: lines are right-trimmed and runs of blank
/// lines collapse to one.
pub fn normalize(raw: &[u8]) -> Result<String, ConversionError> {
    let text = html2text::from_read(raw, TEXT_WIDTH).map_err(|e| ConversionError(e.to_string()))?;

    let mut out = String::with_capacity(text.len());
    let mut blank_run = false;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if !blank_run && !out.is_empty() {
                out.push('\n');
            }
            blank_run = true;
            continue;
        }
        blank_run = false;
        out.push_str(line);
        out.push('\n');
    }

    Ok(out.trim_end().to_string())
}
