use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;

pub const DEFAULT_FEED_BASE: &str = "https://hacker-news.firebaseio.com/v0";

/// Story metadata as published by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub by: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub kids: Vec<i64>,
    #[serde(default)]
    pub descendants: i64,
}

/// Ranked story provider
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Story ids in the feed's own ranking order
    async fn top_stories(&self) -> Result<Vec<i64>, FetchError>;

    async fn item(&self, id: i64) -> Result<FeedItem, FetchError>;
}

/// Hacker News Firebase API client
pub struct HackerNewsFeed {
    base_url: String,
    client: Client,
}

impl HackerNewsFeed {
    pub fn new(base_url: impl Into<String>, timeout_secs: Option<u64>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().user_agent("hnbrief/0.1.0");
        if let Some(secs) = timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, FetchError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| FetchError::Decode {
            url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl FeedSource for HackerNewsFeed {
    async fn top_stories(&self) -> Result<Vec<i64>, FetchError> {
        let ids: Vec<i64> = self.get_json(format!("{}/topstories.json", self.base_url)).await?;
        debug!(count = ids.len(), "fetched top story ids");
        Ok(ids)
    }

    async fn item(&self, id: i64) -> Result<FeedItem, FetchError> {
        let url = format!("{}/item/{}.json", self.base_url, id);
        // The API answers `null` for unknown ids.
        let item: Option<FeedItem> = self.get_json(url.clone()).await?;
        item.ok_or_else(|| FetchError::Decode {
            url,
            reason: format!("item {} does not exist", id),
        })
    }
}
