use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulldown_cmark::{html, Event, Options, Parser};
use reqwest::Client;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{DistributionError, PersistenceError};

pub const DEFAULT_SUBJECT: &str = "Hacker News digest";

/// A fully rendered digest mail for one recipient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Outbound mail transport
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DistributionError>;
}

/// Mail delivery through a JSON HTTP API (`POST {endpoint}` with bearer auth)
pub struct HttpMailer {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpMailer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent("hnbrief/0.1.0")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DistributionError> {
        let failed = |reason: String| DistributionError {
            recipient: mail.to.clone(),
            reason,
        };

        let mut request = self.client.post(&self.endpoint).json(mail);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("mail API returned {}: {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

/// Render digest markdown to an HTML fragment.
///
/// Raw HTML in the source is emitted as escaped text, never as markup.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) => Event::Text(raw),
        other => other,
    });
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

pub fn subject_for(date: DateTime<Utc>, subject: &str) -> String {
    format!("{} {}", date.format("%Y-%m-%d"), subject)
}

/// Email addresses of every configured user, in insertion order.
pub async fn load_recipients(pool: &SqlitePool) -> Result<Vec<String>, PersistenceError> {
    let emails = sqlx::query_scalar::<_, String>(
        "SELECT email FROM users WHERE email IS NOT NULL AND email != '' ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(emails)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributionReport {
    pub sent: usize,
    pub failed: usize,
}

/// Fans a digest out to every recipient.
pub struct Distributor {
    pool: SqlitePool,
    mailer: Arc<dyn Mailer>,
    from: String,
    subject: String,
}

impl Distributor {
    pub fn new(pool: SqlitePool, mailer: Arc<dyn Mailer>, from: impl Into<String>, subject: Option<String>) -> Self {
        Self {
            pool,
            mailer,
            from: from.into(),
            subject: subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        }
    }

    /// Send `markdown` to every recipient.
    ///
    /// One recipient failing does not stop the others; only a failure to load the
    /// recipient list is an error.
    pub async fn distribute(&self, markdown: &str) -> Result<DistributionReport, PersistenceError> {
        let recipients = load_recipients(&self.pool).await?;
        let html = markdown_to_html(markdown);
        let subject = subject_for(Utc::now(), &self.subject);
        let mut report = DistributionReport::default();

        for to in recipients {
            let mail = OutgoingMail {
                from: self.from.clone(),
                to,
                subject: subject.clone(),
                html: html.clone(),
                text: markdown.to_string(),
            };
            match self.mailer.send(&mail).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(recipient = %mail.to, %e, "digest delivery failed");
                    report.failed += 1;
                }
            }
        }

        info!(sent = report.sent, failed = report.failed, "digest distributed");
        Ok(report)
    }
}
