//! CLI command definitions

use clap::{Parser, Subcommand};
use serde_json::Value;
use statestore::StateError;
use std::path::PathBuf;

/// Exit status for each failure class
pub mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const KEY_NOT_FOUND: u8 = 3;
    pub const STATE_CORRUPTION: u8 = 4;
    pub const LOCK_TIMEOUT: u8 = 5;
    pub const IO_FAILURE: u8 = 6;
}

/// RSS Inbox - feed state manager
#[derive(Debug, Parser)]
#[command(
    name = "rss-inbox",
    about = "Inspect and edit the RSS Inbox state store",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print one key, or the whole state document
    Read {
        /// Key to read
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Store a value under a key
    Write {
        #[arg(short, long)]
        key: String,

        /// JSON value; anything that is not valid JSON is stored as a string
        #[arg(short, long)]
        value: String,
    },

    /// Remove a key
    Delete {
        #[arg(short, long)]
        key: String,
    },

    /// Show paths, configuration and state statistics
    Info,

    /// Print configuration as YAML
    Config {
        /// Show the effective configuration
        #[arg(long, conflicts_with = "example")]
        show: bool,

        /// Show an example configuration
        #[arg(long)]
        example: bool,
    },

    /// Generate the launchd agent that runs rss-inbox on a schedule
    ///
    /// Without `--write` this is a dry run: the plist and the launchctl
    /// commands are printed and nothing is touched.
    Autostart {
        /// Print the plist and commands only (default)
        #[arg(long, conflicts_with = "write")]
        dry_run: bool,

        /// Write the plist file
        #[arg(long)]
        write: bool,

        /// Where to write the plist (default: ~/Library/LaunchAgents/<label>.plist)
        #[arg(short, long, requires = "write")]
        output: Option<PathBuf>,
    },
}

/// Parse a command-line value as JSON, falling back to a plain string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Exit status for a failed command
///
/// Store errors anywhere in the report's chain pick their own status; anything
/// else is a generic failure.
pub fn exit_code(report: &eyre::Report) -> u8 {
    let state_error = report.chain().find_map(|cause| cause.downcast_ref::<StateError>());
    match state_error {
        Some(StateError::KeyNotFound { .. }) => exit::KEY_NOT_FOUND,
        Some(StateError::Corruption { .. }) => exit::STATE_CORRUPTION,
        Some(StateError::LockTimeout { .. }) => exit::LOCK_TIMEOUT,
        Some(StateError::Io { .. }) => exit::IO_FAILURE,
        None => exit::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use eyre::WrapErr;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_write_command() {
        let cli = Cli::try_parse_from(["rss-inbox", "-l", "debug", "write", "--key", "demo", "--value", "ok"]).unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Write { key, value } => {
                assert_eq!(key, "demo");
                assert_eq!(value, "ok");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_config_flags_conflict() {
        assert!(Cli::try_parse_from(["rss-inbox", "config", "--show", "--example"]).is_err());
    }

    #[test]
    fn test_autostart_flags() {
        let cli = Cli::try_parse_from(["rss-inbox", "autostart", "--write", "-o", "agent.plist"]).unwrap();
        match cli.command {
            Command::Autostart { dry_run, write, output } => {
                assert!(!dry_run);
                assert!(write);
                assert_eq!(output, Some(PathBuf::from("agent.plist")));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["rss-inbox", "autostart", "--dry-run", "--write"]).is_err());
        assert!(Cli::try_parse_from(["rss-inbox", "autostart", "--output", "agent.plist"]).is_err());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("null"), Value::Null);
        assert_eq!(parse_value(r#"{"a": [1, "b"]}"#), json!({"a": [1, "b"]}));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("plain text"), json!("plain text"));
        assert_eq!(parse_value("{broken"), json!("{broken"));
    }

    #[test]
    fn test_exit_codes() {
        let not_found = eyre::Report::new(StateError::KeyNotFound { key: "k".to_string() });
        assert_eq!(exit_code(&not_found), exit::KEY_NOT_FOUND);

        let timeout = eyre::Report::new(StateError::LockTimeout {
            path: Path::new("state.json.lock").to_path_buf(),
            timeout: Duration::from_millis(10),
        });
        assert_eq!(exit_code(&timeout), exit::LOCK_TIMEOUT);

        let wrapped: eyre::Result<()> = Err(StateError::Corruption {
            path: Path::new("state.json").to_path_buf(),
            reason: "bad".to_string(),
        })
        .wrap_err("Failed to read state");
        assert_eq!(exit_code(&wrapped.unwrap_err()), exit::STATE_CORRUPTION);

        assert_eq!(exit_code(&eyre::eyre!("something else")), exit::FAILURE);
    }
}
