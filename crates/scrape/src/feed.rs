//! RSS/Atom feed parsing. Entries become [`ArticleDraft`] records in
//! feed order: summaries are stripped of HTML and truncated on a word
//! boundary, the first embedded image is carried, categories become
//! keywords.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use nieuws_core::sanitize::{collapse_whitespace, strip_html, truncate_words};
use nieuws_core::{ArticleDraft, Error};

use crate::http::FetchClient;

/// Summaries are capped at this many characters.
const MAX_SUMMARY_CHARS: usize = 2000;

pub struct FeedParser {
    fetch: Arc<FetchClient>,
}

impl FeedParser {
    pub fn new(fetch: Arc<FetchClient>) -> Self {
        Self { fetch }
    }

    /// Fetch and parse one feed. The fetch is rate-limiter gated; the
    /// parse tolerates both RSS and Atom.
    pub async fn fetch_feed(&self, feed_url: &str, source: &str) -> Result<Vec<ArticleDraft>, Error> {
        let body = self.fetch.fetch_text(feed_url).await?;
        let drafts = parse_feed(&body, source)?;
        debug!(source, feed_url, entries = drafts.len(), "Feed parsed");
        Ok(drafts)
    }
}

/// Parse feed XML into drafts, preserving feed order.
pub fn parse_feed(body: &str, source: &str) -> Result<Vec<ArticleDraft>, Error> {
    let feed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|e| Error::Terminal(format!("feed parse ({source}): {e}")))?;

    let mut drafts = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let Some(url) = entry.links.first().map(|l| l.href.clone()) else {
            continue;
        };
        let title = entry
            .title
            .as_ref()
            .map(|t| collapse_whitespace(&strip_html(&t.content)))
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let raw_summary = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .unwrap_or_default();
        let summary =
            truncate_words(&collapse_whitespace(&strip_html(&raw_summary)), MAX_SUMMARY_CHARS);

        let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

        let keywords: Vec<String> = entry
            .categories
            .iter()
            .map(|c| c.term.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let category = keywords.first().cloned();

        let image_url = first_image(&entry.media);

        let author = entry
            .authors
            .first()
            .map(|p| p.name.trim().to_string())
            .filter(|n| !n.is_empty());

        drafts.push(ArticleDraft {
            title,
            summary,
            url,
            published_at: published,
            source: source.to_string(),
            keywords,
            image_url,
            author,
            category,
        });
    }
    Ok(drafts)
}

fn first_image(media: &[feed_rs::model::MediaObject]) -> Option<String> {
    for object in media {
        for content in &object.content {
            if let Some(url) = &content.url {
                let is_image = content
                    .content_type
                    .as_ref()
                    .map(|m| m.ty() == "image")
                    .unwrap_or(true);
                if is_image {
                    return Some(url.to_string());
                }
            }
        }
        if let Some(thumbnail) = object.thumbnails.first() {
            return Some(thumbnail.image.uri.clone());
        }
    }
    None
}
