//! Feed entries: identity, classification and selection of new entries
//!
//! Fetching and parsing feeds happens elsewhere; this module starts from
//! entries that have already been parsed into [`Entry`].

use chrono::{DateTime, Utc};
use eyre::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Action, ClassificationConfig, Config, FeedConfig, Handler};
use crate::state::StateManager;

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static regex"));

/// A parsed feed entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Publisher-assigned id (`<guid>` / `<id>`), if any
    pub guid: Option<String>,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub published: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    /// MIME types of enclosures and media:content elements
    pub media_types: Vec<String>,
}

/// An entry that has not been processed yet, with its resolved handling
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub id: String,
    pub feed_url: String,
    pub title: String,
    pub classification: Handler,
    pub action: Action,
    pub entry: Entry,
}

/// Processed ids kept per feed after each successful poll
pub const MAX_PROCESSED_PER_FEED: usize = 1000;

/// Stable id for an entry within a feed
///
/// Hashes `feed_url:guid`, or `feed_url:title:link` when the entry has no guid.
/// The digest is SHA-256 hex; ids written by md5-based installs will not match,
/// so entries they already handled are seen as new once after migrating.
pub fn entry_id(feed_url: &str, entry: &Entry) -> String {
    let material = match entry.guid.as_deref().filter(|g| !g.is_empty()) {
        Some(guid) => format!("{}:{}", feed_url, guid),
        None => format!("{}:{}:{}", feed_url, entry.title, entry.link),
    };
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

/// Strip HTML tags and collapse whitespace
///
/// Tags are removed outright, so `<b>A</b>B` reads `AB`.
pub fn clean_text(text: &str) -> String {
    HTML_TAG
        .replace_all(text, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tells video entries from web pages
#[derive(Debug, Clone)]
pub struct Classifier {
    video_domains: Vec<String>,
    video_keywords: Vec<String>,
}

impl Classifier {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            video_domains: config.video_domains.iter().map(|d| d.to_lowercase()).collect(),
            video_keywords: config.video_keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Classify `entry`, starting from the feed's own handler
    ///
    /// Any video signal wins: a video host, a video keyword in the text, a
    /// YouTube link, or a `video/*` enclosure.
    pub fn classify(&self, entry: &Entry, default: Handler) -> Handler {
        if let Some(host) = link_host(&entry.link)
            && self.video_domains.iter().any(|d| host.contains(d.as_str()))
        {
            debug!(%host, "Classified as video by domain");
            return Handler::Video;
        }

        let text = entry_text(entry);
        if self.video_keywords.iter().any(|k| text.contains(k.as_str())) {
            debug!(title = %entry.title, "Classified as video by keyword");
            return Handler::Video;
        }

        if entry.link.to_lowercase().contains("youtube") || entry.media_types.iter().any(|t| t.starts_with("video/")) {
            debug!(title = %entry.title, "Classified as video by media");
            return Handler::Video;
        }

        default
    }
}

fn link_host(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.host_str().map(|h| h.to_lowercase())
}

fn entry_text(entry: &Entry) -> String {
    let mut parts = vec![entry.title.clone(), clean_text(&entry.summary)];
    parts.extend(entry.tags.iter().cloned());
    parts.join(" ").to_lowercase()
}

/// Picks the entries of a poll that still need handling
pub struct EntryProcessor<'a> {
    state: &'a StateManager,
    classifier: Classifier,
    max_entries: usize,
}

impl<'a> EntryProcessor<'a> {
    pub fn new(state: &'a StateManager, config: &Config) -> Self {
        Self {
            state,
            classifier: Classifier::new(&config.classification),
            max_entries: config.max_entries,
        }
    }

    /// Unprocessed entries of `feed`, newest first, at most `max-entries`
    ///
    /// Entries already recorded as processed are dropped, as are repeats of
    /// the same id within the batch. Undated entries sort last.
    pub fn select_new(&self, feed: &FeedConfig, entries: Vec<Entry>) -> Result<Vec<NewEntry>> {
        let processed: HashSet<String> = self.state.processed_entries(&feed.url)?.into_iter().collect();
        let total = entries.len();
        let mut seen = HashSet::new();

        let mut fresh: Vec<NewEntry> = entries
            .into_iter()
            .filter_map(|entry| {
                let id = entry_id(&feed.url, &entry);
                if processed.contains(&id) || !seen.insert(id.clone()) {
                    return None;
                }

                let classification = self.classifier.classify(&entry, feed.handler());
                let title = match clean_text(&entry.title) {
                    t if t.is_empty() => "Untitled".to_string(),
                    t => t,
                };
                Some(NewEntry {
                    id,
                    feed_url: feed.url.clone(),
                    title,
                    classification,
                    action: feed.resolve_action(Some(classification)),
                    entry,
                })
            })
            .collect();

        fresh.sort_by(|a, b| b.entry.published.cmp(&a.entry.published));
        fresh.truncate(self.max_entries);

        info!(feed = feed.display_name(), total, new = fresh.len(), "Selected new entries");
        Ok(fresh)
    }

    /// Record `entry` as handled so later polls skip it
    pub fn complete(&self, entry: &NewEntry) -> Result<bool> {
        self.state.mark_processed(&entry.feed_url, &entry.id)
    }

    /// Bookkeeping after a successful poll of `feed`
    ///
    /// Stamps the check time, clears the error count when the poll found
    /// something or the feed had been failing, and trims the processed ids to
    /// the newest [`MAX_PROCESSED_PER_FEED`]. Returns how many ids were trimmed.
    pub fn finish_poll(&self, feed: &FeedConfig, new_count: usize) -> Result<usize> {
        debug!(feed = feed.display_name(), new_count, "finish_poll: called");
        self.state.record_check(&feed.url, None)?;

        if new_count > 0 || self.state.error_count(&feed.url)? > 0 {
            debug!(feed = feed.display_name(), "finish_poll: resetting error count");
            self.state.reset_error_count(&feed.url)?;
        }

        let pruned = self.state.prune_processed(&feed.url, MAX_PROCESSED_PER_FEED)?;
        info!(feed = feed.display_name(), new_count, pruned, "Finished poll");
        Ok(pruned)
    }

    /// Bookkeeping after a failed poll of `feed`; returns the new error count
    pub fn fail_poll(&self, feed: &FeedConfig) -> Result<u64> {
        let count = self.state.increment_error_count(&feed.url)?;
        warn!(feed = feed.display_name(), errors = count, "Poll failed");
        Ok(count)
    }
}
