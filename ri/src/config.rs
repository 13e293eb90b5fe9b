//! RSS Inbox configuration types and loading

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::ProjectPaths;

const LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL"];

/// Main RSS Inbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Feeds to track
    pub feeds: Vec<FeedConfig>,

    /// Poll interval in seconds
    #[serde(rename = "poll-interval")]
    pub poll_interval: u64,

    /// Maximum entries to take per feed per poll
    #[serde(rename = "max-entries", alias = "max-entries-per-feed")]
    pub max_entries: usize,

    /// Retry attempts for failed operations
    #[serde(rename = "retry-attempts")]
    pub retry_attempts: u32,

    /// Delay between retries in seconds
    #[serde(rename = "retry-delay")]
    pub retry_delay: u64,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Content classification rules
    pub classification: ClassificationConfig,

    /// State storage configuration
    pub storage: StorageConfig,

    /// File this config was loaded from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            poll_interval: 900,
            max_entries: 20,
            retry_attempts: 3,
            retry_delay: 60,
            log_level: "INFO".to_string(),
            classification: ClassificationConfig::default(),
            storage: StorageConfig::default(),
            source: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// An explicit path must load. Otherwise the first existing file among
    /// `<root>/config.yaml`, `<data dir>/config.yaml` and
    /// `~/.config/rss-inbox/config.yaml` is used, falling back to defaults.
    pub fn load(config_path: Option<&PathBuf>, paths: &ProjectPaths) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in paths.config_candidates() {
            if candidate.exists() {
                return Self::load_from_file(&candidate)
                    .context(format!("Failed to load config from {}", candidate.display()));
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        // An empty file is a valid, all-defaults config
        let mut config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).context("Failed to parse config file")?
        };
        config.source = Some(path.as_ref().to_path_buf());

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        let level = self.log_level.to_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(eyre!(
                "Log level must be one of {:?}, got '{}'",
                LOG_LEVELS,
                self.log_level
            ));
        }

        if self.max_entries == 0 {
            return Err(eyre!("max-entries must be greater than zero"));
        }

        for (index, feed) in self.feeds.iter().enumerate() {
            if feed.url.trim().is_empty() {
                return Err(eyre!("Feed #{} has an empty url", index + 1));
            }
        }

        Ok(())
    }

    /// State file location, honoring `storage.state-file`
    pub fn state_file(&self, paths: &ProjectPaths) -> PathBuf {
        self.storage.state_file.clone().unwrap_or_else(|| paths.state_file())
    }

    pub fn enabled_feeds(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    /// A small config showing one feed of each kind
    pub fn example() -> Self {
        Self {
            feeds: vec![
                FeedConfig {
                    name: Some("O'Reilly Radar".to_string()),
                    url: "https://feeds.feedburner.com/oreilly".to_string(),
                    handler: Some(Handler::Webpage),
                    action: Action::Singlefile,
                    enabled: true,
                    custom_params: BTreeMap::new(),
                },
                FeedConfig {
                    name: None,
                    url: "https://www.youtube.com/feeds/videos.xml?channel_id=UCBJycsmduvYEL83R_U4JriQ".to_string(),
                    handler: Some(Handler::Video),
                    action: Action::VideoDownloader,
                    enabled: true,
                    custom_params: BTreeMap::new(),
                },
            ],
            poll_interval: 3600,
            max_entries: 50,
            ..Self::default()
        }
    }
}

/// Kind of content a feed carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Handler {
    Webpage,
    Video,
}

impl TryFrom<String> for Handler {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "webpage" => Ok(Handler::Webpage),
            "video" => Ok(Handler::Video),
            _ => Err(format!("Handler must be one of [\"video\", \"webpage\"], got '{}'", value)),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Webpage => write!(f, "webpage"),
            Handler::Video => write!(f, "video"),
        }
    }
}

/// What to do with a new entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Action {
    /// Pick from the entry's classification
    #[default]
    Auto,
    Singlefile,
    Applescript,
    VideoDownloader,
    None,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Auto => "auto",
            Action::Singlefile => "singlefile",
            Action::Applescript => "applescript",
            Action::VideoDownloader => "video_downloader",
            Action::None => "none",
        }
    }
}

impl TryFrom<String> for Action {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "auto" => Ok(Action::Auto),
            "singlefile" | "singlefile_cli" | "webpage" => Ok(Action::Singlefile),
            "applescript" => Ok(Action::Applescript),
            "video_downloader" | "video" | "downie" | "downloader" => Ok(Action::VideoDownloader),
            "none" => Ok(Action::None),
            _ => Err(format!(
                "Action must be one of [\"applescript\", \"auto\", \"none\", \"singlefile\", \"video_downloader\"], got '{}'",
                value
            )),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for a single feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub url: String,

    /// Content kind; older configs call this category, type or kind
    #[serde(default, alias = "category", alias = "type", alias = "kind")]
    pub handler: Option<Handler>,

    #[serde(default)]
    pub action: Action,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(rename = "custom-params", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_params: BTreeMap<String, serde_yaml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl FeedConfig {
    /// Configured handler, or one implied by a video-ish action
    pub fn handler(&self) -> Handler {
        self.handler.unwrap_or(match self.action {
            Action::Applescript | Action::VideoDownloader => Handler::Video,
            _ => Handler::Webpage,
        })
    }

    /// Action for an entry classified as `classification`
    pub fn resolve_action(&self, classification: Option<Handler>) -> Action {
        if self.action != Action::Auto {
            return self.action;
        }

        match classification.unwrap_or_else(|| self.handler()) {
            Handler::Webpage => Action::Singlefile,
            Handler::Video => Action::VideoDownloader,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// Rules for telling video entries from web pages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Link hosts that mean video
    #[serde(rename = "video-domains")]
    pub video_domains: Vec<String>,

    /// Words in title, summary or tags that mean video
    #[serde(rename = "video-keywords")]
    pub video_keywords: Vec<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            video_domains: ["youtube.com", "youtu.be", "vimeo.com", "twitch.tv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            video_keywords: ["video", "youtube", "vimeo", "twitch"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// State storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Override for the state file path
    #[serde(rename = "state-file", skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// How long a write waits for the state lock
    #[serde(rename = "lock-timeout-ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            lock_timeout_ms: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
