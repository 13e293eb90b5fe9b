//! RSS Inbox - feed polling state
//!
//! Tracks, per feed, when it was last checked, which entries have already been
//! handed to an action, and how many polls have failed. Everything lives in one
//! JSON document managed by [`statestore::StateStore`].
//!
//! - [`paths`] resolves the project root and data directory
//! - [`config`] loads the YAML configuration
//! - [`state`] keeps per-feed bookkeeping on top of the store
//! - [`feeds`] identifies and classifies entries and picks the new ones
//! - [`autostart`] renders the launchd agent that runs it on a schedule
//! - [`cli`] defines the `rss-inbox` command line

pub mod autostart;
pub mod cli;
pub mod config;
pub mod feeds;
pub mod paths;
pub mod state;

pub use autostart::LaunchAgent;
pub use config::{Action, Config, FeedConfig, Handler};
pub use feeds::{Classifier, Entry, EntryProcessor, NewEntry, entry_id};
pub use paths::{DataScheme, ProjectPaths};
pub use state::{FailureRecord, StateManager, StateStats};
