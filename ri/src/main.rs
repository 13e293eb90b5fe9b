//! RSS Inbox - state store CLI
//!
//! Reads and edits the state document the feed poller keeps between runs.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use rss_inbox::autostart::LaunchAgent;
use rss_inbox::cli::{self, Cli, Command};
use rss_inbox::config::Config;
use rss_inbox::paths::ProjectPaths;
use rss_inbox::state::StateManager;

fn setup_logging(paths: &ProjectPaths, cli_log_level: Option<&str>, config_log_level: &str) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level_str = cli_log_level.unwrap_or(config_log_level);
    let level = match level_str.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" | "CRITICAL" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", level_str);
            tracing::Level::INFO
        }
    };

    let log_path = paths.log_file();
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context(format!("Failed to open log file: {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    debug!(
        cli_level = ?cli_log_level,
        config_level = %config_log_level,
        log_path = %log_path.display(),
        "setup_logging: level resolved"
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::from(cli::exit::OK),
        Err(e) => {
            tracing::error!("Command failed: {:#}", e);
            eprintln!("{} {:#}", "✗".red(), e);
            ExitCode::from(cli::exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = ProjectPaths::discover().context("Failed to resolve project paths")?;
    let config = Config::load(cli.config.as_ref(), &paths).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    paths.ensure_dirs()?;
    setup_logging(&paths, cli.log_level.as_deref(), &config.log_level).context("Failed to setup logging")?;
    debug!(
        root = %paths.root().display(),
        data_dir = %paths.data_dir().display(),
        scheme = %paths.scheme(),
        config = ?config.source,
        "run: paths and config resolved"
    );

    let state = StateManager::open(config.state_file(&paths), config.storage.lock_timeout())
        .context("Failed to open state store")?;

    debug!(command = ?cli.command, "run: dispatching command");
    match cli.command {
        Command::Read { key } => {
            debug!(?key, "run: matched Read command");
            cmd_read(&state, key.as_deref())
        }
        Command::Write { key, value } => {
            debug!(%key, "run: matched Write command");
            cmd_write(&state, &key, &value)
        }
        Command::Delete { key } => {
            debug!(%key, "run: matched Delete command");
            cmd_delete(&state, &key)
        }
        Command::Info => {
            debug!("run: matched Info command");
            cmd_info(&paths, &config, &state)
        }
        Command::Config { show, example } => {
            debug!(show, example, "run: matched Config command");
            cmd_config(&config, show, example)
        }
        Command::Autostart { dry_run, write, output } => {
            debug!(dry_run, write, ?output, "run: matched Autostart command");
            cmd_autostart(&paths, &config, write, output)
        }
    }
}

fn cmd_read(state: &StateManager, key: Option<&str>) -> Result<()> {
    match key {
        Some(key) => {
            debug!(%key, "cmd_read: reading single key");
            let value = state.read_value(key)?;
            println!("{} = {}", key, serde_json::to_string_pretty(&value)?);
        }
        None => {
            debug!("cmd_read: reading whole document");
            let doc = state.store().read_all()?;
            if doc.is_empty() {
                debug!("cmd_read: document is empty");
                println!("No state data found");
            } else {
                debug!(keys = doc.len(), "cmd_read: printing document");
                println!("{}", serde_json::to_string_pretty(&doc)?);
            }
        }
    }
    Ok(())
}

fn cmd_write(state: &StateManager, key: &str, raw: &str) -> Result<()> {
    let value = cli::parse_value(raw);
    debug!(%key, is_string = value.is_string(), "cmd_write: parsed value");
    state.write_value(key, value.clone())?;
    println!("{} Wrote {} = {}", "✓".green(), key.cyan(), value);
    Ok(())
}

fn cmd_delete(state: &StateManager, key: &str) -> Result<()> {
    if state.delete_value(key)? {
        debug!(%key, "cmd_delete: key removed");
        println!("{} Deleted {}", "✓".green(), key.cyan());
    } else {
        debug!(%key, "cmd_delete: key was absent");
        println!("Key '{}' not found, nothing to delete", key);
    }
    Ok(())
}

fn cmd_info(paths: &ProjectPaths, config: &Config, state: &StateManager) -> Result<()> {
    let doc = state.store().read_all()?;
    let stats = state.stats()?;
    let feeds_enabled = config.enabled_feeds().count();
    debug!(keys = doc.len(), ?stats, "cmd_info: gathered state");

    println!("{} {}", "RSS Inbox".bold(), env!("CARGO_PKG_VERSION"));
    println!();
    println!("{}", "Paths".bold());
    println!("  Project root: {}", paths.root().display());
    println!("  Data dir:     {} ({})", paths.data_dir().display(), paths.scheme());
    println!("  State file:   {}", state.store().path().display());
    println!("  Failure log:  {}", state.failure_log().display());
    println!("  Log file:     {}", paths.log_file().display());
    println!();
    println!("{}", "Configuration".bold());
    match &config.source {
        Some(source) => println!("  Config file:   {}", source.display()),
        None => println!("  Config file:   {}", "(defaults)".dimmed()),
    }
    println!("  Log level:     {}", config.log_level);
    println!("  Feeds:         {} ({} enabled)", config.feeds.len(), feeds_enabled);
    println!("  Poll interval: {}s", config.poll_interval);
    println!("  Max entries:   {}", config.max_entries);
    println!();
    println!("{}", "State".bold());
    println!("  Keys:              {}", doc.len());
    println!("  Feeds checked:     {}", stats.total_feeds);
    println!("  Processed entries: {}", stats.total_processed_entries);
    println!("  Errors:            {} across {} feeds", stats.total_errors, stats.feeds_with_errors);

    Ok(())
}

fn cmd_config(config: &Config, show: bool, example: bool) -> Result<()> {
    let yaml = if example {
        debug!("cmd_config: showing example config");
        Config::example().to_yaml()?
    } else {
        if !show {
            debug!("cmd_config: no flag given, showing effective config");
        }
        config.to_yaml()?
    };
    print!("{}", yaml);
    Ok(())
}

fn cmd_autostart(paths: &ProjectPaths, config: &Config, write: bool, output: Option<PathBuf>) -> Result<()> {
    let program = std::env::current_exe().context("Failed to locate the rss-inbox executable")?;
    let agent = LaunchAgent::new(paths, config, &program);
    let plist_path = match output {
        Some(path) => path,
        None => agent.plist_path()?,
    };
    let commands = LaunchAgent::load_commands(&plist_path);

    if !write {
        debug!(label = %agent.label, "cmd_autostart: dry run");
        println!("=== Generated plist content ===");
        println!("{}", agent.render()?);
        println!("=== Plist path: {} ===", plist_path.display());
        println!();
        println!("=== Commands that would be executed ===");
        for command in &commands {
            println!("  {}", command.join(" "));
        }
        return Ok(());
    }

    debug!(label = %agent.label, path = %plist_path.display(), "cmd_autostart: writing plist");
    agent.write_to(&plist_path)?;
    println!("{} Wrote {}", "✓".green(), plist_path.display().to_string().cyan());
    println!("Load it with:");
    for command in &commands {
        println!("  {}", command.join(" "));
    }
    Ok(())
}
