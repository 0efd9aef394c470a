use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::FetchError;
use crate::ingestion::{FeedItem, FeedSource};
use crate::llm::summarizer::{SummaryResult, Summarizer};
use crate::storage::{Story, StoryStore};

/// Summary stored when a story could not be summarized.
pub const CRAWL_APOLOGY_MESSAGE: &str =
    "Sorry, this article could not be parsed, so no summary is available.";

/// Walks the ranked feed and materializes one summarized story per item.
pub struct Crawler {
    feed: Arc<dyn FeedSource>,
    store: StoryStore,
    summarizer: Arc<Summarizer>,
}

impl Crawler {
    pub fn new(feed: Arc<dyn FeedSource>, store: StoryStore, summarizer: Arc<Summarizer>) -> Self {
        Self {
            feed,
            store,
            summarizer,
        }
    }

    pub fn store(&self) -> &StoryStore {
        &self.store
    }

    /// Crawl the first `max_count` ranked stories, one at a time.
    ///
    /// Only a failure to load the ranking is an error; per-story problems are logged
    /// and the crawl moves on.
    pub async fn crawl(&self, max_count: usize) -> Result<Vec<SummaryResult>, FetchError> {
        let run_id = Uuid::new_v4();
        let ids = self.feed.top_stories().await.map_err(|e| {
            error!(%run_id, %e, "failed to fetch top stories");
            e
        })?;

        info!(%run_id, available = ids.len(), max_count, "crawl started");
        let mut results = Vec::new();

        for story_id in ids.into_iter().take(max_count) {
            let item = match self.feed.item(story_id).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(%run_id, story_id, %e, "failed to fetch story details");
                    continue;
                }
            };

            match self.refresh_existing(&item).await {
                Known::New => {}
                Known::Cached(cached) => {
                    results.push(cached);
                    continue;
                }
                Known::Unavailable => continue,
            }

            let conversation_id = format!("crawl-{}-{}", run_id, item.id);
            let summary = match self.summarizer.summarize(&conversation_id, &item.url).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(%run_id, story_id, url = %item.url, %e, "failed to summarize story");
                    SummaryResult {
                        summary: CRAWL_APOLOGY_MESSAGE.to_string(),
                        url: item.url.clone(),
                    }
                }
            };

            let story = story_from_item(&item, &summary.summary);
            results.push(summary);
            if let Err(e) = self.store.create(&story).await {
                warn!(%run_id, story_id, %e, "failed to store story");
            }
        }

        info!(%run_id, results = results.len(), "crawl finished");
        Ok(results)
    }

    /// For a story already on file: refresh its score and return the stored summary.
    async fn refresh_existing(&self, item: &FeedItem) -> Known {
        match self.store.exists(item.id).await {
            Ok(true) => {}
            Ok(false) => return Known::New,
            Err(e) => {
                // Summarizing anyway could duplicate the row; leave it for the next crawl.
                warn!(story_id = item.id, %e, "story existence check failed, skipping");
                return Known::Unavailable;
            }
        }

        if let Err(e) = self.store.update_score(item.id, item.score).await {
            warn!(story_id = item.id, %e, "failed to update story score");
        }

        match self.store.get(item.id).await {
            Ok(story) => {
                info!(story_id = item.id, "story already stored, reusing summary");
                Known::Cached(SummaryResult {
                    summary: story.summary,
                    url: story.url,
                })
            }
            Err(e) => {
                warn!(story_id = item.id, %e, "failed to load stored story");
                Known::Unavailable
            }
        }
    }
}

enum Known {
    New,
    Cached(SummaryResult),
    Unavailable,
}

fn story_from_item(item: &FeedItem, summary: &str) -> Story {
    Story {
        story_id: item.id,
        title: item.title.clone(),
        by: item.by.clone(),
        url: item.url.clone(),
        score: item.score,
        time: item.time,
        story_type: item.item_type.clone(),
        descendants: item.descendants,
        summary: summary.to_string(),
        is_published: false,
    }
}
