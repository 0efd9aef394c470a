#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use hnbrief::error::{DistributionError, FetchError, LlmError};
use hnbrief::ingestion::{FeedItem, FeedSource};
use hnbrief::llm::{DeltaStream, LlmProvider, LlmRequest, LlmResponse, StreamEvent, UsageMetadata};
use hnbrief::mailer::{Mailer, OutgoingMail};
use hnbrief::scraping::ContentFetcher;
use hnbrief::server;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ARTICLE_HTML: &str = "<!DOCTYPE html><html><head><title>Post</title></head>\
    <body><h1>Rust 2024</h1><p>The edition ships today.</p></body></html>";

/// In-memory database with the full schema; one connection so every query sees it.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    server::ensure_schema(&pool).await.expect("ensure schema");
    pool
}

/// Serves canned page bodies by URL.
#[derive(Default)]
pub struct FakeFetcher {
    pages: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
}

impl FakeFetcher {
    pub fn with_page(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.pages.lock().unwrap().insert(url.to_string(), body.into());
        self
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// What a scripted stream does after its last delta.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Finish,
    /// Breaks off with a stream error
    Fail,
    /// Never yields again
    Hang,
}

/// Sets its flag when the stream owning it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Replays a fixed list of deltas, then ends as `end` says; `generate` returns them joined.
pub struct ScriptedLlm {
    deltas: Vec<String>,
    fail: bool,
    end: StreamEnd,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<LlmRequest>>,
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedLlm {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail: false,
            end: StreamEnd::Finish,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    pub fn ending(deltas: &[&str], end: StreamEnd) -> Self {
        Self {
            end,
            ..Self::new(deltas)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    fn begin(&self, request: LlmRequest) -> Result<(), LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request);
        if self.fail {
            return Err(LlmError::Api {
                status: 500,
                body: "backend down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.begin(request)?;
        Ok(LlmResponse {
            content: self.deltas.concat(),
            usage: UsageMetadata::default(),
            model: "scripted".into(),
        })
    }

    async fn generate_stream(&self, request: LlmRequest) -> Result<DeltaStream, LlmError> {
        self.begin(request)?;
        let mut events: Vec<Result<StreamEvent, LlmError>> =
            self.deltas.iter().cloned().map(|d| Ok(StreamEvent::Delta(d))).collect();
        match self.end {
            StreamEnd::Finish => events.push(Ok(StreamEvent::Finished)),
            StreamEnd::Fail => events.push(Err(LlmError::Stream("connection reset".into()))),
            StreamEnd::Hang => {}
        }
        let script = stream::iter(events);
        let script: DeltaStream = if self.end == StreamEnd::Hang {
            Box::pin(script.chain(stream::pending()))
        } else {
            Box::pin(script)
        };
        let flag = DropFlag(self.stream_dropped.clone());
        Ok(Box::pin(script.map(move |event| {
            let _ = &flag;
            event
        })))
    }
}

/// Static ranked feed.
#[derive(Default)]
pub struct FakeFeed {
    ranking: Vec<i64>,
    down: bool,
    items: Mutex<HashMap<i64, FeedItem>>,
    pub item_fetches: Mutex<Vec<i64>>,
}

impl FakeFeed {
    pub fn new(ranking: &[i64]) -> Self {
        Self {
            ranking: ranking.to_vec(),
            ..Self::default()
        }
    }

    /// A feed whose ranking endpoint always fails.
    pub fn unreachable() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub fn with_item(self, item: FeedItem) -> Self {
        self.items.lock().unwrap().insert(item.id, item);
        self
    }

    pub fn set_score(&self, id: i64, score: i64) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.score = score;
        }
    }

    pub fn fetched(&self) -> Vec<i64> {
        self.item_fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for FakeFeed {
    async fn top_stories(&self) -> Result<Vec<i64>, FetchError> {
        if self.down {
            return Err(FetchError::Status {
                url: "topstories".into(),
                status: 503,
            });
        }
        Ok(self.ranking.clone())
    }

    async fn item(&self, id: i64) -> Result<FeedItem, FetchError> {
        self.item_fetches.lock().unwrap().push(id);
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| FetchError::Decode {
                url: format!("item/{}", id),
                reason: "missing".into(),
            })
    }
}

pub fn feed_item(id: i64, score: i64) -> FeedItem {
    FeedItem {
        id,
        title: format!("Story {}", id),
        by: "dang".into(),
        url: format!("https://example.com/{}", id),
        score,
        time: chrono::Utc::now().timestamp(),
        item_type: "story".into(),
        kids: Vec::new(),
        descendants: 3,
    }
}

/// Records every mail; fails for addresses in `reject`.
#[derive(Default)]
pub struct FakeMailer {
    reject: HashSet<String>,
    pub sent: Mutex<Vec<OutgoingMail>>,
}

impl FakeMailer {
    pub fn rejecting(addresses: &[&str]) -> Self {
        Self {
            reject: addresses.iter().map(|a| a.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DistributionError> {
        if self.reject.contains(&mail.to) {
            return Err(DistributionError {
                recipient: mail.to.clone(),
                reason: "mailbox unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}
