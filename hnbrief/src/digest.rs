//! Digest assembly: the two-section markdown mail built from stored stories.
//!
//! Building a digest is also the point where stories change state: every story
//! that made it into the text is flagged as published in a single update.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::mailer::{DistributionReport, Distributor};
use crate::storage::{Story, StoryStore};

pub const TOP_STORIES_HEADING: &str = "## Top stories";
pub const OVERVIEW_HEADING: &str = "## Overview";

#[derive(Debug, Clone, Copy)]
pub struct DigestSettings {
    pub top_stories: i64,
    pub window_days: i64,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            top_stories: 10,
            window_days: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub markdown: String,
    /// Every story rendered, in order of appearance
    pub story_ids: Vec<i64>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.story_ids.is_empty()
    }
}

/// Backslash-escape characters that would end or restyle the link text.
fn escape_link_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '[' | ']' | '<' | '*' | '_' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Percent-encode characters that would end the link destination.
fn escape_link_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '(' => out.push_str("%28"),
            ')' => out.push_str("%29"),
            '<' => out.push_str("%3C"),
            '>' => out.push_str("%3E"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_story(out: &mut String, story: &Story) {
    let _ = write!(
        out,
        "[**{}**]({}) [**Score: {}**]\n{}\n\n---\n\n",
        escape_link_text(&story.title),
        escape_link_url(&story.url),
        story.score,
        story.summary
    );
}

/// Lay out both sections; a story already listed under top stories is left out of
/// the overview.
pub fn render_digest(top: &[Story], unpublished: &[Story]) -> Digest {
    let mut digest = Digest::default();
    let mut seen = HashSet::new();

    digest.markdown.push_str(TOP_STORIES_HEADING);
    digest.markdown.push_str("\n\n");
    for story in top {
        if seen.insert(story.story_id) {
            render_story(&mut digest.markdown, story);
            digest.story_ids.push(story.story_id);
        }
    }

    digest.markdown.push_str(OVERVIEW_HEADING);
    digest.markdown.push_str("\n\n");
    for story in unpublished {
        if seen.insert(story.story_id) {
            render_story(&mut digest.markdown, story);
            digest.story_ids.push(story.story_id);
        }
    }

    digest
}

/// Assemble the digest from the store and flag its stories as published.
pub async fn build_digest(store: &StoryStore, settings: DigestSettings) -> Result<Digest, PersistenceError> {
    let top = store.list_by_score(settings.top_stories, settings.window_days).await?;
    let unpublished = store.list_unpublished().await?;
    let digest = render_digest(&top, &unpublished);

    store.mark_published(&digest.story_ids, true).await?;
    info!(
        top = top.len(),
        stories = digest.story_ids.len(),
        "digest assembled"
    );
    Ok(digest)
}

/// Builds the digest and hands it to the distributor.
pub struct DigestPublisher {
    store: StoryStore,
    distributor: Option<Arc<Distributor>>,
    settings: DigestSettings,
}

impl DigestPublisher {
    /// `distributor` is `None` when no mail API is configured; the digest is still
    /// built (and its stories published) but nothing is sent.
    pub fn new(store: StoryStore, distributor: Option<Arc<Distributor>>, settings: DigestSettings) -> Self {
        Self {
            store,
            distributor,
            settings,
        }
    }

    pub async fn publish(&self) -> Result<DistributionReport, PersistenceError> {
        let digest = build_digest(&self.store, self.settings).await?;
        if digest.is_empty() {
            info!("digest is empty, nothing to send");
            return Ok(DistributionReport::default());
        }

        match &self.distributor {
            Some(distributor) => distributor.distribute(&digest.markdown).await,
            None => {
                warn!(stories = digest.story_ids.len(), "no mail transport configured, digest not sent");
                Ok(DistributionReport::default())
            }
        }
    }
}
