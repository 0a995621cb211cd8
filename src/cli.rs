//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values. Every option can also be set
//! through its environment variable, so scheduled runs need no flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ProtoQuiz Stats - batch jobs for usage statistics and blog reporting
///
/// Aggregates de-duplicated usage stats from the document store into a
/// JSON snapshot, checks App Store Connect, and reports blog views.
///
/// Examples:
///   protoquiz-stats
///   protoquiz-stats stats --output tmp/firestore-stats.json
///   protoquiz-stats --dump export.json stats
///   protoquiz-stats appstore
///   protoquiz-stats views
///   protoquiz-stats audit-users
///   protoquiz-stats init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Job to run (defaults to `stats`)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .protoquiz.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "PROTOQUIZ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Service account key file for the document store
    #[arg(
        long,
        value_name = "FILE",
        env = "GOOGLE_APPLICATION_CREDENTIALS",
        global = true
    )]
    pub credentials: Option<PathBuf>,

    /// Document store project id
    #[arg(long, value_name = "ID", env = "FIRESTORE_PROJECT_ID", global = true)]
    pub project_id: Option<String>,

    /// Read from a JSON export instead of the live document store
    #[arg(long, value_name = "FILE", env = "STATS_DUMP", global = true)]
    pub dump: Option<PathBuf>,

    /// HTTP request timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Aggregate usage stats and write the JSON snapshot
    Stats(StatsArgs),

    /// Check App Store Connect credentials and app metadata
    Appstore(AppStoreArgs),

    /// Print per-post blog view counts
    Views(ViewsArgs),

    /// Print user-id diagnostics (dev vs real accounts)
    AuditUsers,

    /// Generate a default .protoquiz.toml configuration file
    InitConfig,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct StatsArgs {
    /// Output file path for the snapshot
    #[arg(short, long, value_name = "FILE", env = "STATS_OUTPUT")]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct AppStoreArgs {
    /// App Store Connect issuer id
    #[arg(long, env = "APP_STORE_ISSUER_ID")]
    pub issuer_id: Option<String>,

    /// App Store Connect key id
    #[arg(long, env = "APP_STORE_KEY_ID")]
    pub key_id: Option<String>,

    /// Path to the .p8 private key
    #[arg(long, value_name = "FILE", env = "APP_STORE_PRIVATE_KEY_PATH")]
    pub private_key: Option<PathBuf>,

    /// App id to look up
    #[arg(long, env = "APP_STORE_APP_ID")]
    pub app_id: Option<String>,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ViewsArgs {
    /// Blog views endpoint
    #[arg(long, value_name = "URL", env = "BLOG_VIEWS_URL")]
    pub url: Option<String>,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The job to run.
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Stats(StatsArgs::default()))
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        // Validate timeout if provided
        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref dump) = self.dump {
            if !dump.is_file() {
                return Err(format!("Dump file does not exist: {}", dump.display()));
            }
        }

        if let Some(Command::Views(ViewsArgs { url: Some(ref url) })) = self.command {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Views URL must start with 'http://' or 'https://'".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
