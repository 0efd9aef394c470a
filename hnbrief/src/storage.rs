use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::PersistenceError;

/// One feed item with its attached summary and publish state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Story {
    pub story_id: i64,
    pub title: String,
    #[sqlx(rename = "author")]
    pub by: String,
    pub url: String,
    pub score: i64,
    /// Publication time, unix seconds
    pub time: i64,
    #[sqlx(rename = "story_type")]
    #[serde(rename = "type")]
    pub story_type: String,
    pub descendants: i64,
    pub summary: String,
    pub is_published: bool,
}

impl Story {
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.time, 0).single()
    }
}

const STORY_COLUMNS: &str =
    "story_id, title, author, url, score, time, story_type, descendants, summary, is_published";

/// Durable record of discovered feed items
#[derive(Clone)]
pub struct StoryStore {
    pool: SqlitePool,
}

impl StoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn exists(&self, story_id: i64) -> Result<bool, PersistenceError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stories WHERE story_id = ?")
            .bind(story_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn get(&self, story_id: i64) -> Result<Story, PersistenceError> {
        sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE story_id = ? ORDER BY id ASC LIMIT 1"
        ))
        .bind(story_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PersistenceError::NotFound(story_id))
    }

    /// Insert a new story. Callers check [`StoryStore::exists`] first; the pair is
    /// not atomic, so two concurrent crawls of the same id can both insert.
    pub async fn create(&self, story: &Story) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO stories
            (story_id, title, author, url, score, time, story_type, descendants, summary, is_published, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(story.story_id)
        .bind(&story.title)
        .bind(&story.by)
        .bind(&story.url)
        .bind(story.score)
        .bind(story.time)
        .bind(&story.story_type)
        .bind(story.descendants)
        .bind(&story.summary)
        .bind(story.is_published)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!(story_id = story.story_id, "stored story");
        Ok(())
    }

    pub async fn update_score(&self, story_id: i64, score: i64) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE stories SET score = ? WHERE story_id = ?")
            .bind(score)
            .bind(story_id)
            .execute(&self.pool)
            .await?;
        debug!(story_id, score, "updated story score");
        Ok(())
    }

    /// Highest scored stories published within the last `window_days`.
    pub async fn list_by_score(&self, top_n: i64, window_days: i64) -> Result<Vec<Story>, PersistenceError> {
        self.list_by_score_at(Utc::now(), top_n, window_days).await
    }

    pub async fn list_by_score_at(
        &self,
        now: DateTime<Utc>,
        top_n: i64,
        window_days: i64,
    ) -> Result<Vec<Story>, PersistenceError> {
        let since = now - Duration::days(window_days);
        let stories = sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE time >= ? AND time <= ? ORDER BY score DESC, id ASC LIMIT ?"
        ))
        .bind(since.timestamp())
        .bind(now.timestamp())
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?;
        Ok(stories)
    }

    /// Stories not yet sent in a digest, in discovery order.
    pub async fn list_unpublished(&self) -> Result<Vec<Story>, PersistenceError> {
        let stories = sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE is_published = 0 ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(stories)
    }

    /// Set the publish flag on every listed story.
    ///
    /// An empty id list is a no-op; ids that match no row at all are reported as
    /// [`PersistenceError::NothingUpdated`].
    pub async fn mark_published(&self, story_ids: &[i64], published: bool) -> Result<(), PersistenceError> {
        if story_ids.is_empty() {
            return Ok(());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE stories SET is_published = ");
        query.push_bind(published);
        query.push(" WHERE story_id IN (");
        let mut ids = query.separated(", ");
        for id in story_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NothingUpdated);
        }

        info!(count = result.rows_affected(), published, "updated story publish state");
        Ok(())
    }
}
