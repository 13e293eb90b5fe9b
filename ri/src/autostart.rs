//! launchd agent descriptor for running rss-inbox on a schedule
//!
//! Only the descriptor is produced here. Loading it into launchd is left to
//! the user, who gets the exact `launchctl` commands to run.

use eyre::{Context, Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::paths::{APP_NAME, ProjectPaths};

const PLIST_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{{label}}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{{program}}</string>
{{#each arguments}}
        <string>{{this}}</string>
{{/each}}
    </array>
    <key>WorkingDirectory</key>
    <string>{{working_directory}}</string>
    <key>StandardOutPath</key>
    <string>{{stdout_path}}</string>
    <key>StandardErrorPath</key>
    <string>{{stderr_path}}</string>
    <key>RunAtLoad</key>
    <true/>
    <key>StartInterval</key>
    <integer>{{start_interval}}</integer>
</dict>
</plist>
"#;

/// A per-user launchd agent that runs rss-inbox periodically
#[derive(Debug, Clone, Serialize)]
pub struct LaunchAgent {
    pub label: String,
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: String,
    pub stdout_path: String,
    pub stderr_path: String,
    /// Seconds between runs
    pub start_interval: u64,
}

impl LaunchAgent {
    /// Agent for this project, running `program` every `poll-interval` seconds
    pub fn new(paths: &ProjectPaths, config: &Config, program: &Path) -> Self {
        let log_dir = paths.log_dir();
        Self {
            label: format!("{}.{}", paths.label_prefix(), APP_NAME),
            program: program.display().to_string(),
            arguments: vec!["info".to_string()],
            working_directory: paths.root().display().to_string(),
            stdout_path: log_dir.join("stdout.log").display().to_string(),
            stderr_path: log_dir.join("stderr.log").display().to_string(),
            start_interval: config.poll_interval,
        }
    }

    /// Render the plist document
    ///
    /// Values are escaped, so paths containing `&` or `<` stay well-formed XML.
    pub fn render(&self) -> Result<String> {
        debug!(label = %self.label, "LaunchAgent::render: called");
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(true);
        hbs.render_template(PLIST_TEMPLATE, self)
            .map_err(|e| eyre!("Failed to render launchd plist for {}: {}", self.label, e))
    }

    /// Where launchd looks for per-user agents
    pub fn plist_path(&self) -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Cannot determine home directory"))?;
        Ok(home
            .join("Library")
            .join("LaunchAgents")
            .join(format!("{}.plist", self.label)))
    }

    /// `launchctl` invocations that (re)load the agent from `plist_path`
    pub fn load_commands(plist_path: &Path) -> Vec<Vec<String>> {
        let plist = plist_path.display().to_string();
        vec![
            vec!["launchctl".to_string(), "unload".to_string(), plist.clone()],
            vec!["launchctl".to_string(), "load".to_string(), plist],
        ]
    }

    /// Render and write the plist to `path`, creating its directory
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = self.render()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context(format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(path, content).context(format!("Failed to write plist: {}", path.display()))?;
        info!(label = %self.label, path = %path.display(), "Wrote launchd plist");
        Ok(())
    }
}
