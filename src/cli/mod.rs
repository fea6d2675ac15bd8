//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for the relay service.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "optrelay")]
#[command(about = "Options market data relay service")]
#[command(
    long_about = "Relays option quotes from an upstream brokerage feed to a downstream event hub, \
                  dynamically tracking the at-the-money strike window"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the market data relay service
    Run {
        /// Override simulation mode from the config file
        #[arg(long)]
        simulation: Option<bool>,
    },

    /// Validate required environment variables and exit
    Check,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Adjust log level based on verbose flag
    pub fn effective_log_level(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }
}
