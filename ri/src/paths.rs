//! Project and data directory resolution
//!
//! The project root is `$RSS_INBOX_ROOT`, or the current directory. An optional
//! `.project_config.json` in the root picks where data lives:
//!
//! ```text
//! project_local   <root>/data
//! data_root       <data_root or platform data dir>/<slug>
//! (no file)       <platform local data dir>/rss-inbox
//! ```
//!
//! Logs and state sit under `<data dir>/logs/`.

use eyre::{Context, Result, eyre};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Environment variable overriding the project root
pub const ROOT_ENV: &str = "RSS_INBOX_ROOT";

/// Per-project data scheme file
pub const PROJECT_CONFIG_FILE: &str = ".project_config.json";

pub const APP_NAME: &str = "rss-inbox";

/// launchd label prefix when the project config names none
pub const DEFAULT_LABEL_PREFIX: &str = "com.user.rss-inbox";

const STATE_FILE: &str = "state.json";
const FAILURE_LOG_FILE: &str = "failures.jsonl";
const LOG_FILE: &str = "rss-inbox.log";
const CONFIG_FILE: &str = "config.yaml";

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").expect("static regex"));

/// Where project data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScheme {
    ProjectLocal,
    DataRoot,
    Default,
}

impl fmt::Display for DataScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataScheme::ProjectLocal => "project_local",
            DataScheme::DataRoot => "data_root",
            DataScheme::Default => "default",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Deserialize)]
struct ProjectConfig {
    data_scheme: Option<DataScheme>,
    slug: Option<String>,
    data_root: Option<PathBuf>,
    label_prefix: Option<String>,
}

/// Resolved locations for one project
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
    data_dir: PathBuf,
    scheme: DataScheme,
    label_prefix: String,
}

impl ProjectPaths {
    /// Resolve from `$RSS_INBOX_ROOT` or the current directory
    pub fn discover() -> Result<Self> {
        let root = match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => std::env::current_dir().context("Failed to determine current directory")?,
        };
        Self::from_root(root)
    }

    /// Resolve for an explicit project root
    pub fn from_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config_path = root.join(PROJECT_CONFIG_FILE);

        if !config_path.exists() {
            let paths = Self {
                data_dir: default_data_dir(),
                root,
                scheme: DataScheme::Default,
                label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            };
            debug!(data_dir = %paths.data_dir.display(), "No project config, using default data dir");
            return Ok(paths);
        }

        let content = fs::read_to_string(&config_path)
            .context(format!("Failed to read project configuration: {}", config_path.display()))?;
        let project: ProjectConfig = serde_json::from_str(&content)
            .context(format!("Failed to parse project configuration: {}", config_path.display()))?;

        let scheme = project
            .data_scheme
            .ok_or_else(|| eyre!("Missing 'data_scheme' in project configuration: {}", config_path.display()))?;

        let data_dir = match scheme {
            DataScheme::ProjectLocal => root.join("data"),
            DataScheme::DataRoot => {
                let base = project
                    .data_root
                    .map(expand_home)
                    .or_else(dirs::data_dir)
                    .unwrap_or_else(|| PathBuf::from("."));
                let slug = project.slug.unwrap_or_else(|| slugify(&dir_name(&root)));
                base.join(slug)
            }
            DataScheme::Default => default_data_dir(),
        };

        let label_prefix = project
            .label_prefix
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LABEL_PREFIX.to_string());

        debug!(%scheme, data_dir = %data_dir.display(), %label_prefix, "Resolved project data dir");
        Ok(Self {
            root,
            data_dir,
            scheme,
            label_prefix,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn scheme(&self) -> DataScheme {
        self.scheme
    }

    /// Prefix for the launchd agent label
    pub fn label_prefix(&self) -> &str {
        &self.label_prefix
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(LOG_FILE)
    }

    /// Default location of the state document
    pub fn state_file(&self) -> PathBuf {
        self.log_dir().join(STATE_FILE)
    }

    /// Failure log kept next to a given state file
    pub fn failure_log_for(state_file: &Path) -> PathBuf {
        state_file
            .parent()
            .map(|dir| dir.join(FAILURE_LOG_FILE))
            .unwrap_or_else(|| PathBuf::from(FAILURE_LOG_FILE))
    }

    /// Config files to try, most specific first
    pub fn config_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![self.root.join(CONFIG_FILE), self.data_dir.join(CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join(APP_NAME).join(CONFIG_FILE));
        }
        candidates
    }

    /// Create the data and log directories
    pub fn ensure_dirs(&self) -> Result<()> {
        let log_dir = self.log_dir();
        fs::create_dir_all(&log_dir).context(format!("Failed to create log directory: {}", log_dir.display()))
    }
}

/// Normalize a project name to a directory slug
///
/// Lowercases, turns hyphens into underscores, collapses any other run of
/// non-alphanumeric characters into one underscore, and trims underscores.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase().replace('-', "_");
    NON_SLUG.replace_all(&lowered, "_").trim_matches('_').to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_NAME)
}

fn dir_name(root: &Path) -> String {
    let resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| APP_NAME.to_string())
}

fn expand_home(path: PathBuf) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path,
    }
}
