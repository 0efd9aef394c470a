/*!
common/src/lib.rs

Shared configuration types and DB helper functions for hnbrief.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override config file
- Helpers to initialize an SQLite pool and sync configured users
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/hnbrief.db")
    pub path: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Scheduler (daily run times) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// List of UTC wall-clock times in "HH:MM" 24h format when the daily job should run
    pub times: Vec<String>,
    /// Number of top stories crawled per run
    pub crawl_count: Option<usize>,
}

/// Remote LLM config (used if `llm.adapter = "remote"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// LLM top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    pub remote: Option<RemoteLlmConfig>,
}

/// Story feed (Hacker News API) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Article page fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// Per-page request timeout; pages load without one when unset
    pub timeout_seconds: Option<u64>,
}

/// Digest assembly configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Size of the "top stories" section
    pub top_stories: Option<i64>,
    /// Trailing window (days) the top stories are picked from
    pub window_days: Option<i64>,
    /// Mail subject, prefixed with the send date
    pub subject: Option<String>,
}

/// Outbound mail API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key_env: Option<String>,
    pub from: String,
}

/// Digest recipient defined in the global config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub scraping: ScrapingConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    pub mail: Option<MailConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Read `default_path` then `override_path` and deep-merge them, the override
    /// winning key by key. Paths that are `None` or missing on disk are skipped.
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut merged = toml::Value::Table(Default::default());

        for (path, label) in [(default_path, "default"), (override_path, "override")] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {} config: {}", label, path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse {} configuration", label))?;
            merge_toml(&mut merged, val);
        }

        merged
            .try_into()
            .context("merged configuration does not match the expected layout")
    }

    /// Whether the schema should be ensured at startup (defaults to true).
    pub fn auto_migrate(&self) -> bool {
        self.admin
            .as_ref()
            .and_then(|a| a.auto_migrate)
            .unwrap_or(true)
    }
}

fn merge_toml(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Open the SQLite database at `path` (WAL mode, at most 5 connections),
/// creating the parent directory and the file first.
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Creating the file up front surfaces permission/path problems with a clearer error
    // than the SQLite connection attempt would.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Upsert every `[[users]]` entry into the `users` table, keyed by username.
/// The schema must already exist.
pub async fn sync_users(config: &Config, pool: &SqlitePool) -> Result<()> {
    for u in &config.users {
        sqlx::query("INSERT OR IGNORE INTO users (username, email, display_name) VALUES (?, ?, ?)")
            .bind(&u.username)
            .bind(&u.email)
            .bind(u.display_name.clone())
            .execute(pool)
            .await
            .with_context(|| format!("failed to insert or ignore user {}", u.username))?;

        sqlx::query(
            "UPDATE users SET email = ?, display_name = COALESCE(?, display_name) WHERE username = ?",
        )
        .bind(&u.email)
        .bind(u.display_name.clone())
        .bind(&u.username)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update user {}", u.username))?;
    }

    tracing::info!(count = config.users.len(), "configured users synchronized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [database]
        path = "data/test.db"

        [scheduler]
        times = ["05:00", "11:00"]
        crawl_count = 30

        [scraping]
        timeout_seconds = 15

        [digest]
        top_stories = 10
        window_days = 3

        [[users]]
        username = "alice"
        email = "alice@example.com"
    "#;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        let cfg: Config = toml::from_str(BASE).expect("parse config");
        assert_eq!(cfg.scheduler.times.len(), 2);
        assert_eq!(cfg.scheduler.crawl_count, Some(30));
        assert_eq!(cfg.users.len(), 1);
        assert_eq!(cfg.users[0].email, "alice@example.com");
        assert!(cfg.mail.is_none());
        assert_eq!(cfg.scraping.timeout_seconds, Some(15));
        assert_eq!(cfg.feed.timeout_seconds, None);
        assert!(cfg.auto_migrate());

        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("hnbrief.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn override_file_takes_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(&default_path, BASE).expect("write default");
        std::fs::write(
            &override_path,
            r#"
            [scheduler]
            times = ["07:30"]

            [digest]
            window_days = 7
            "#,
        )
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");

        assert_eq!(cfg.scheduler.times, vec!["07:30".to_string()]);
        // Nested tables merge key by key.
        assert_eq!(cfg.scheduler.crawl_count, Some(30));
        assert_eq!(cfg.digest.window_days, Some(7));
        assert_eq!(cfg.digest.top_stories, Some(10));
        assert_eq!(cfg.database.path, "data/test.db");
    }

    #[tokio::test]
    async fn missing_override_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        std::fs::write(&default_path, BASE).expect("write default");
        let absent = dir.path().join("absent.toml");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&absent))
            .await
            .expect("load config");
        assert_eq!(cfg.scheduler.times.len(), 2);
    }
}
