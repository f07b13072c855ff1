//! Pomodoro Updater CLI Module
//! Command-line interface the application shell uses to drive updates

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::{ConfigError, UpdaterConfig};
use crate::engine::platform;

#[derive(Parser, Debug)]
#[command(name = "pomodoro-updater")]
#[command(author = "Pomodoro Team")]
#[command(version)]
#[command(about = "Checks for and applies Pomodoro Timer updates", long_about = None)]
pub struct Cli {
    /// Directory holding updater.config.json, version.txt and the installation
    #[arg(short, long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Release service URL (overrides the config file)
    #[arg(long, global = true)]
    pub service_url: Option<String>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check whether a newer release is available
    Check,

    /// Download, verify and install the latest release
    Apply {
        /// Relaunch the application after a successful update
        #[arg(long)]
        restart: bool,
    },

    /// Show installed version, latest release and backup slot
    Status,

    /// Write a default updater.config.json
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn get_base_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.base_dir {
            Some(dir) => Ok(dir.clone()),
            None => platform::default_base_dir().ok_or(ConfigError::NoBaseDir),
        }
    }

    /// Load the config for the selected base dir and apply command-line overrides
    pub fn load_config(&self) -> Result<UpdaterConfig, ConfigError> {
        let mut config = UpdaterConfig::load_or_default(&self.get_base_dir()?)?;
        if let Some(url) = &self.service_url {
            config.service_url = url.clone();
        }
        Ok(config)
    }
}
