//! Feed bookkeeping on top of the state store
//!
//! ```text
//! last_checks         {feed_url: RFC 3339 timestamp}
//! processed_entries   {feed_url: [entry_id, ...]}   oldest first
//! error_counts        {feed_url: n}
//! ```
//!
//! Each mutation is a single `StateStore::try_update`, so concurrent invocations
//! serialize on the store's lock instead of overwriting each other, and a
//! mutation that fails part way leaves the file as it was.

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statestore::{Document, StateStore};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::paths::ProjectPaths;

const LAST_CHECKS: &str = "last_checks";
const PROCESSED_ENTRIES: &str = "processed_entries";
const ERROR_COUNTS: &str = "error_counts";

/// Totals across all feeds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub total_feeds: usize,
    pub total_processed_entries: usize,
    pub total_errors: u64,
    pub feeds_with_errors: usize,
}

/// One failed action, as appended to `failures.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub feed_url: String,
    pub entry_id: String,
    pub url: String,
    pub action: String,
    pub reason: String,
}

impl FailureRecord {
    /// Build a record stamped now; whitespace in `reason` is collapsed and an
    /// empty `entry_id` falls back to `url`
    pub fn new(feed_url: &str, entry_id: &str, url: &str, action: &str, reason: &str) -> Self {
        let entry_id = if entry_id.is_empty() { url } else { entry_id };
        Self {
            timestamp: Utc::now(),
            feed_url: feed_url.to_string(),
            entry_id: entry_id.to_string(),
            url: url.to_string(),
            action: action.to_string(),
            reason: reason.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Persistent per-feed state
#[derive(Debug, Clone)]
pub struct StateManager {
    store: StateStore,
    failure_log: PathBuf,
}

impl StateManager {
    /// Open the state file at `state_file`
    pub fn open(state_file: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let store = StateStore::open(state_file.as_ref())?.with_lock_timeout(lock_timeout);
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: StateStore) -> Self {
        let failure_log = ProjectPaths::failure_log_for(store.path());
        Self { store, failure_log }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn failure_log(&self) -> &Path {
        &self.failure_log
    }

    /// Write a raw key
    pub fn write_value(&self, key: &str, value: Value) -> Result<()> {
        self.store.write(key, value.clone())?;
        info!(key, %value, "Wrote state");
        Ok(())
    }

    /// Read a raw key; missing keys surface as `StateError::KeyNotFound`
    pub fn read_value(&self, key: &str) -> Result<Value> {
        let value = self.store.read(key)?;
        debug!(key, %value, "Read state");
        Ok(value)
    }

    /// Remove a raw key; returns whether it existed
    pub fn delete_value(&self, key: &str) -> Result<bool> {
        let existed = self.store.delete(key)?;
        if existed {
            info!(key, "Deleted state");
        }
        Ok(existed)
    }

    /// When `feed_url` was last polled
    pub fn last_check(&self, feed_url: &str) -> Result<Option<DateTime<Utc>>> {
        let checks: HashMap<String, String> = self.section(LAST_CHECKS)?;
        let Some(raw) = checks.get(feed_url) else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!(feed_url, raw = %raw, error = %e, "Invalid last-check timestamp");
                Ok(None)
            }
        }
    }

    /// Record a poll of `feed_url` at `at` (now if `None`)
    pub fn record_check(&self, feed_url: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        let at = at.unwrap_or_else(Utc::now);
        self.store.try_update(|doc| -> Result<()> {
            section_mut(doc, LAST_CHECKS)?.insert(feed_url.to_string(), Value::String(at.to_rfc3339()));
            Ok(())
        })?;
        debug!(feed_url, %at, "Updated last check");
        Ok(())
    }

    /// Processed entry ids for `feed_url`, oldest first
    pub fn processed_entries(&self, feed_url: &str) -> Result<Vec<String>> {
        let mut processed: HashMap<String, Vec<String>> = self.section(PROCESSED_ENTRIES)?;
        Ok(processed.remove(feed_url).unwrap_or_default())
    }

    pub fn is_processed(&self, feed_url: &str, entry_id: &str) -> Result<bool> {
        Ok(self.processed_entries(feed_url)?.iter().any(|id| id == entry_id))
    }

    /// Record `entry_id` as processed; false if it already was
    pub fn mark_processed(&self, feed_url: &str, entry_id: &str) -> Result<bool> {
        let added = self.store.try_update(|doc| -> Result<bool> {
            let ids = list_mut(section_mut(doc, PROCESSED_ENTRIES)?, feed_url)?;
            if ids.iter().any(|id| id.as_str() == Some(entry_id)) {
                return Ok(false);
            }
            ids.push(Value::String(entry_id.to_string()));
            Ok(true)
        })?;

        if added {
            debug!(feed_url, entry_id, "Added processed entry");
        } else {
            debug!(feed_url, entry_id, "mark_processed: already processed");
        }
        Ok(added)
    }

    /// Keep only the newest `max_entries` processed ids; returns how many were dropped
    pub fn prune_processed(&self, feed_url: &str, max_entries: usize) -> Result<usize> {
        let dropped = self.store.try_update(|doc| -> Result<usize> {
            let Some(section) = existing_section_mut(doc, PROCESSED_ENTRIES)? else {
                return Ok(0);
            };
            let ids = match section.get_mut(feed_url) {
                None => return Ok(0),
                Some(Value::Array(ids)) => ids,
                Some(other) => return Err(eyre!("Entry list for {} should be an array, found {}", feed_url, other)),
            };
            let excess = ids.len().saturating_sub(max_entries);
            if excess > 0 {
                *ids = ids.split_off(excess);
            }
            Ok(excess)
        })?;

        if dropped > 0 {
            debug!(feed_url, dropped, "Pruned processed entries");
        }
        Ok(dropped)
    }

    pub fn error_count(&self, feed_url: &str) -> Result<u64> {
        let counts: HashMap<String, u64> = self.section(ERROR_COUNTS)?;
        Ok(counts.get(feed_url).copied().unwrap_or(0))
    }

    /// Bump the error count for `feed_url`; returns the new count
    pub fn increment_error_count(&self, feed_url: &str) -> Result<u64> {
        let count = self.store.try_update(|doc| -> Result<u64> {
            let counts = section_mut(doc, ERROR_COUNTS)?;
            let next = match counts.get(feed_url) {
                None => 1,
                Some(current) => current
                    .as_u64()
                    .ok_or_else(|| eyre!("Error count for {} is not a number: {}", feed_url, current))?
                    .saturating_add(1),
            };
            counts.insert(feed_url.to_string(), Value::from(next));
            Ok(next)
        })?;

        debug!(feed_url, count, "Incremented error count");
        Ok(count)
    }

    pub fn reset_error_count(&self, feed_url: &str) -> Result<()> {
        let removed = self.store.try_update(|doc| -> Result<bool> {
            match existing_section_mut(doc, ERROR_COUNTS)? {
                Some(counts) => Ok(counts.remove(feed_url).is_some()),
                None => Ok(false),
            }
        })?;

        if removed {
            debug!(feed_url, "Reset error count");
        }
        Ok(())
    }

    /// Totals over the whole document, read in one pass
    pub fn stats(&self) -> Result<StateStats> {
        let doc = self.store.read_all()?;
        let checks: HashMap<String, Value> = section_from(&doc, LAST_CHECKS)?;
        let processed: HashMap<String, Vec<String>> = section_from(&doc, PROCESSED_ENTRIES)?;
        let errors: HashMap<String, u64> = section_from(&doc, ERROR_COUNTS)?;

        Ok(StateStats {
            total_feeds: checks.len(),
            total_processed_entries: processed.values().map(Vec::len).sum(),
            total_errors: errors.values().sum(),
            feeds_with_errors: errors.len(),
        })
    }

    /// Append a failure to the failure log
    pub fn record_failure(&self, record: &FailureRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize failure record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_log)
            .context(format!("Failed to open failure log: {}", self.failure_log.display()))?;
        file.write_all(line.as_bytes())
            .context(format!("Failed to append to failure log: {}", self.failure_log.display()))?;

        warn!(feed_url = %record.feed_url, entry_id = %record.entry_id, action = %record.action, reason = %record.reason, "Recorded failure");
        Ok(())
    }

    /// All recorded failures, oldest first
    pub fn failures(&self) -> Result<Vec<FailureRecord>> {
        let file = match std::fs::File::open(&self.failure_log) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("Failed to open failure log: {}", self.failure_log.display())),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line).context("Invalid failure log line")?);
        }
        Ok(records)
    }

    fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.store.get_as(key)?.unwrap_or_default())
    }
}

fn section_from<T: DeserializeOwned + Default>(doc: &Document, key: &str) -> Result<T> {
    match doc.get(key) {
        Some(value) => serde_json::from_value(value.clone()).context(format!("State key '{}' has an unexpected shape", key)),
        None => Ok(T::default()),
    }
}

fn section_mut<'a>(doc: &'a mut Document, key: &str) -> Result<&'a mut Map<String, Value>> {
    match doc.entry(key).or_insert_with(|| Value::Object(Map::new())) {
        Value::Object(section) => Ok(section),
        other => Err(eyre!("State key '{}' should be an object, found {}", key, other)),
    }
}

fn existing_section_mut<'a>(doc: &'a mut Document, key: &str) -> Result<Option<&'a mut Map<String, Value>>> {
    match doc.get_mut(key) {
        None => Ok(None),
        Some(Value::Object(section)) => Ok(Some(section)),
        Some(other) => Err(eyre!("State key '{}' should be an object, found {}", key, other)),
    }
}

fn list_mut<'a>(section: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Vec<Value>> {
    match section.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
        Value::Array(list) => Ok(list),
        other => Err(eyre!("Entry list for {} should be an array, found {}", key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use statestore::StateError;
    use tempfile::TempDir;

    fn open_state(temp: &TempDir) -> StateManager {
        StateManager::open(temp.path().join("logs").join("state.json"), Duration::from_secs(1)).unwrap()
    }

    const FEED: &str = "https://blog.example/feed";

    #[test]
    fn test_last_check_round_trip() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();

        assert_eq!(state.last_check(FEED).unwrap(), None);
        state.record_check(FEED, Some(at)).unwrap();
        assert_eq!(state.last_check(FEED).unwrap(), Some(at));
    }

    #[test]
    fn test_invalid_last_check_is_none() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        state.write_value(LAST_CHECKS, json!({FEED: "yesterday"})).unwrap();

        assert_eq!(state.last_check(FEED).unwrap(), None);
    }

    #[test]
    fn test_mark_processed_dedups() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);

        assert!(state.mark_processed(FEED, "a").unwrap());
        assert!(state.mark_processed(FEED, "b").unwrap());
        assert!(!state.mark_processed(FEED, "a").unwrap());

        assert_eq!(state.processed_entries(FEED).unwrap(), vec!["a", "b"]);
        assert!(state.is_processed(FEED, "b").unwrap());
        assert!(!state.is_processed("https://other.example/feed", "b").unwrap());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        for id in ["1", "2", "3", "4", "5"] {
            state.mark_processed(FEED, id).unwrap();
        }

        assert_eq!(state.prune_processed(FEED, 2).unwrap(), 3);
        assert_eq!(state.processed_entries(FEED).unwrap(), vec!["4", "5"]);
        assert_eq!(state.prune_processed(FEED, 2).unwrap(), 0);
        assert_eq!(state.prune_processed("https://unknown.example/feed", 2).unwrap(), 0);
    }

    #[test]
    fn test_error_counts() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);

        assert_eq!(state.error_count(FEED).unwrap(), 0);
        assert_eq!(state.increment_error_count(FEED).unwrap(), 1);
        assert_eq!(state.increment_error_count(FEED).unwrap(), 2);
        assert_eq!(state.error_count(FEED).unwrap(), 2);

        state.reset_error_count(FEED).unwrap();
        assert_eq!(state.error_count(FEED).unwrap(), 0);
        state.reset_error_count(FEED).unwrap();
    }

    #[test]
    fn test_noop_bookkeeping_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);

        state.reset_error_count(FEED).unwrap();
        assert_eq!(state.prune_processed(FEED, 10).unwrap(), 0);

        assert!(!state.store().path().exists());
    }

    #[test]
    fn test_noop_bookkeeping_keeps_document() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        state.write_value("demo", json!("ok")).unwrap();

        state.reset_error_count(FEED).unwrap();
        state.prune_processed(FEED, 10).unwrap();
        state.mark_processed(FEED, "a").unwrap();
        state.prune_processed(FEED, 10).unwrap();

        let doc = state.store().read_all().unwrap();
        assert!(!doc.contains_key(ERROR_COUNTS));
        assert_eq!(doc.len(), 2);
        assert_eq!(doc[PROCESSED_ENTRIES], json!({FEED: ["a"]}));
    }

    #[test]
    fn test_failed_increment_is_not_committed() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        state.write_value(ERROR_COUNTS, json!({FEED: "many"})).unwrap();
        let before = std::fs::read(state.store().path()).unwrap();

        assert!(state.increment_error_count(FEED).is_err());

        assert_eq!(std::fs::read(state.store().path()).unwrap(), before);
    }

    #[test]
    fn test_stats() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        let other = "https://other.example/feed";

        state.record_check(FEED, None).unwrap();
        state.record_check(other, None).unwrap();
        state.mark_processed(FEED, "a").unwrap();
        state.mark_processed(other, "b").unwrap();
        state.mark_processed(other, "c").unwrap();
        state.increment_error_count(other).unwrap();
        state.increment_error_count(other).unwrap();

        assert_eq!(
            state.stats().unwrap(),
            StateStats {
                total_feeds: 2,
                total_processed_entries: 3,
                total_errors: 2,
                feeds_with_errors: 1,
            }
        );
    }

    #[test]
    fn test_bookkeeping_keeps_raw_keys() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);

        state.write_value("demo", json!("ok")).unwrap();
        state.mark_processed(FEED, "a").unwrap();

        assert_eq!(state.read_value("demo").unwrap(), json!("ok"));
        assert!(state.delete_value("demo").unwrap());
        let err = state.read_value("demo").unwrap_err();
        assert!(matches!(err.downcast_ref::<StateError>(), Some(StateError::KeyNotFound { .. })));
    }

    #[test]
    fn test_malformed_section_is_an_error_and_kept() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);
        state.write_value(PROCESSED_ENTRIES, json!("oops")).unwrap();

        assert!(state.mark_processed(FEED, "a").is_err());
        assert!(state.processed_entries(FEED).is_err());
        assert_eq!(state.read_value(PROCESSED_ENTRIES).unwrap(), json!("oops"));
    }

    #[test]
    fn test_failure_log() {
        let temp = TempDir::new().unwrap();
        let state = open_state(&temp);

        assert!(state.failures().unwrap().is_empty());

        state
            .record_failure(&FailureRecord::new(
                FEED,
                "",
                "https://blog.example/a",
                "singlefile",
                "exit code 1:\n  timed   out",
            ))
            .unwrap();
        state
            .record_failure(&FailureRecord::new(FEED, "id-2", "https://blog.example/b", "applescript", "boom"))
            .unwrap();

        let failures = state.failures().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].entry_id, "https://blog.example/a");
        assert_eq!(failures[0].reason, "exit code 1: timed out");
        assert_eq!(failures[1].entry_id, "id-2");
        assert_eq!(state.failure_log(), temp.path().join("logs").join("failures.jsonl"));
    }
}
