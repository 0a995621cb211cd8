//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.protoquiz.toml` files. Every setting has a built-in default, so the
//! file is optional and may set only the sections it cares about.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::analysis::DEFAULT_TEST_PREFIX;
use crate::models::metric;

pub const DEFAULT_CONFIG_FILE: &str = ".protoquiz.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Document store connection.
    #[serde(default)]
    pub firestore: FirestoreConfig,

    /// Stats job settings.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Event sources and counting rules.
    #[serde(default)]
    pub events: EventsConfig,

    /// Display rounding.
    #[serde(default)]
    pub display: DisplayConfig,

    /// App Store Connect access.
    #[serde(default)]
    pub appstore: AppStoreConfig,

    /// Blog views endpoint.
    #[serde(default)]
    pub views: ViewsConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Snapshot output path.
    #[serde(default = "default_output")]
    pub output: String,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "tmp/firestore-stats.json".to_string()
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirestoreConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,

    /// Service account key file.
    #[serde(default = "default_credentials")]
    pub credentials: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_firestore_url")]
    pub base_url: String,

    /// Read from a JSON export instead of the live database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump: Option<String>,
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            credentials: default_credentials(),
            database: default_database(),
            base_url: default_firestore_url(),
            dump: None,
        }
    }
}

fn default_project_id() -> String {
    "ems-protoquiz-tracking".to_string()
}

fn default_credentials() -> String {
    "/tmp/firebase-key.json".to_string()
}

fn default_database() -> String {
    "(default)".to_string()
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// User ids starting with this prefix are test accounts.
    #[serde(default = "default_test_prefix")]
    pub test_prefix: String,

    /// Length of the "recent" window in days.
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// How many protocols to rank.
    #[serde(default = "default_top_protocols")]
    pub top_protocols: usize,

    /// Installs that predate user tracking.
    #[serde(default = "default_download_offset")]
    pub download_offset: u64,

    #[serde(default = "default_users_collection")]
    pub users_collection: String,

    #[serde(default = "default_uploads_collection")]
    pub uploads_collection: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            test_prefix: default_test_prefix(),
            window_days: default_window_days(),
            top_protocols: default_top_protocols(),
            download_offset: default_download_offset(),
            users_collection: default_users_collection(),
            uploads_collection: default_uploads_collection(),
        }
    }
}

fn default_test_prefix() -> String {
    DEFAULT_TEST_PREFIX.to_string()
}

fn default_window_days() -> i64 {
    30
}

fn default_top_protocols() -> usize {
    3
}

fn default_download_offset() -> u64 {
    122
}

fn default_users_collection() -> String {
    "users".to_string()
}

fn default_uploads_collection() -> String {
    "protocol_uploads".to_string()
}

/// One event source, tagged by the schema it was written in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum SourceConfig {
    Flat {
        collection: String,
        /// Optional `YYYY-MM` partition.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        month: Option<String>,
    },
    Monthly {
        collection: String,
        subcollection: String,
        /// First `YYYY-MM` shard.
        since: String,
    },
    Success {
        collection: String,
        category: String,
        action: String,
    },
}

impl SourceConfig {
    pub fn collection(&self) -> &str {
        match self {
            SourceConfig::Flat { collection, .. }
            | SourceConfig::Monthly { collection, .. }
            | SourceConfig::Success { collection, .. } => collection,
        }
    }
}

/// Maps a `(category, action)` pair to a counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub category: String,
    pub action: String,
    pub counter: String,
}

impl RuleConfig {
    fn new(category: &str, action: &str, counter: &str) -> Self {
        Self {
            category: category.to_string(),
            action: action.to_string(),
            counter: counter.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            rules: default_rules(),
        }
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig::Flat {
        collection: "events".to_string(),
        month: None,
    }]
}

fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig::new("quiz", "quiz_completed", metric::QUIZZES_GENERATED),
        RuleConfig::new("quiz", "quiz_started", metric::QUIZZES_GENERATED),
        RuleConfig::new("scenario", "generation_completed", metric::SCENARIOS_COMPLETED),
        RuleConfig::new("scenario", "completed", metric::SCENARIOS_COMPLETED),
        RuleConfig::new("quiz", "algorithm_completed", metric::ALGORITHM_QUIZZES),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Minimum displayed value per metric. Lifted values gain a `+`.
    #[serde(default = "default_floors")]
    pub floors: BTreeMap<String, u64>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            floors: default_floors(),
        }
    }
}

fn default_floors() -> BTreeMap<String, u64> {
    BTreeMap::from([
        (metric::QUIZZES_GENERATED.to_string(), 2500),
        (metric::SCENARIOS_COMPLETED.to_string(), 600),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStoreConfig {
    #[serde(default = "default_issuer_id")]
    pub issuer_id: String,

    #[serde(default = "default_key_id")]
    pub key_id: String,

    /// Defaults to `~/.appstoreconnect/AuthKey_<key_id>.p8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,

    #[serde(default = "default_app_id")]
    pub app_id: String,

    #[serde(default = "default_appstore_url")]
    pub base_url: String,
}

impl Default for AppStoreConfig {
    fn default() -> Self {
        Self {
            issuer_id: default_issuer_id(),
            key_id: default_key_id(),
            private_key_path: None,
            app_id: default_app_id(),
            base_url: default_appstore_url(),
        }
    }
}

impl AppStoreConfig {
    /// The configured key path, or the conventional location under `home`.
    pub fn resolved_key_path(&self, home: Option<&str>) -> String {
        match &self.private_key_path {
            Some(path) => path.clone(),
            None => format!(
                "{}/.appstoreconnect/AuthKey_{}.p8",
                home.unwrap_or("~"),
                self.key_id
            ),
        }
    }
}

fn default_issuer_id() -> String {
    "7090c596-196d-4dda-8419-ee53ef718cbf".to_string()
}

fn default_key_id() -> String {
    "F29544S3WG".to_string()
}

fn default_app_id() -> String {
    "6753611139".to_string()
}

fn default_appstore_url() -> String {
    "https://api.appstoreconnect.apple.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "default_views_url")]
    pub url: String,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            url: default_views_url(),
        }
    }
}

fn default_views_url() -> String {
    "https://ems-router.vercel.app/api/blog-views".to_string()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Check settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.stats.window_days < 1 {
            bail!("stats.window_days must be at least 1");
        }
        if self.stats.top_protocols == 0 {
            bail!("stats.top_protocols must be at least 1");
        }
        if self.events.sources.is_empty() {
            bail!("events.sources must name at least one event source");
        }
        if let Some(source) = self
            .events
            .sources
            .iter()
            .find(|s| s.collection().trim().is_empty())
        {
            bail!("event source has an empty collection: {:?}", source);
        }
        if let Some(rule) = self.events.rules.iter().find(|r| r.counter.trim().is_empty()) {
            bail!(
                "rule for {}/{} has an empty counter name",
                rule.category,
                rule.action
            );
        }
        if let Some(rule) = self
            .events
            .rules
            .iter()
            .find(|r| metric::FIXED.contains(&r.counter.as_str()))
        {
            bail!(
                "rule for {}/{} uses the reserved metric name {}",
                rule.category,
                rule.action,
                rule.counter
            );
        }
        if self.general.timeout_seconds == 0 {
            bail!("general.timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments (and their environment variables) take precedence over
    /// config file settings, but only when provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref credentials) = args.credentials {
            self.firestore.credentials = credentials.display().to_string();
        }
        if let Some(ref project_id) = args.project_id {
            self.firestore.project_id = project_id.clone();
        }
        if let Some(ref dump) = args.dump {
            self.firestore.dump = Some(dump.display().to_string());
        }
        if let Some(timeout) = args.timeout {
            self.general.timeout_seconds = timeout;
        }

        match args.command() {
            crate::cli::Command::Stats(ref stats) => {
                if let Some(ref output) = stats.output {
                    self.general.output = output.display().to_string();
                }
            }
            crate::cli::Command::Appstore(ref appstore) => {
                if let Some(ref issuer_id) = appstore.issuer_id {
                    self.appstore.issuer_id = issuer_id.clone();
                }
                if let Some(ref key_id) = appstore.key_id {
                    self.appstore.key_id = key_id.clone();
                }
                if let Some(ref path) = appstore.private_key {
                    self.appstore.private_key_path = Some(path.display().to_string());
                }
                if let Some(ref app_id) = appstore.app_id {
                    self.appstore.app_id = app_id.clone();
                }
            }
            crate::cli::Command::Views(ref views) => {
                if let Some(ref url) = views.url {
                    self.views.url = url.clone();
                }
            }
            crate::cli::Command::AuditUsers | crate::cli::Command::InitConfig => {}
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.output, "tmp/firestore-stats.json");
        assert_eq!(config.firestore.project_id, "ems-protoquiz-tracking");
        assert_eq!(config.stats.test_prefix, "UQLMSLQZ");
        assert_eq!(config.stats.window_days, 30);
        assert_eq!(config.stats.download_offset, 122);
        assert_eq!(config.events.rules.len(), 5);
        assert_eq!(config.display.floors[metric::QUIZZES_GENERATED], 2500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "out/stats.json"
timeout_seconds = 5

[stats]
window_days = 7
test_prefix = "QA-"

[[events.sources]]
schema = "flat"
collection = "events"
month = "2025-11"

[[events.sources]]
schema = "monthly"
collection = "events"
subcollection = "entries"
since = "2025-10"

[[events.sources]]
schema = "success"
collection = "quiz_successes"
category = "quiz"
action = "quiz_completed"

[display.floors]
quizzesGenerated = 1000
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "out/stats.json");
        assert_eq!(config.general.timeout_seconds, 5);
        assert_eq!(config.stats.window_days, 7);
        assert_eq!(config.stats.test_prefix, "QA-");
        assert_eq!(config.stats.top_protocols, 3);
        assert_eq!(config.events.sources.len(), 3);
        assert_eq!(
            config.events.sources[0],
            SourceConfig::Flat {
                collection: "events".to_string(),
                month: Some("2025-11".to_string()),
            }
        );
        assert_eq!(config.events.sources[2].collection(), "quiz_successes");
        // Rules were not overridden, so the standard ones remain.
        assert_eq!(config.events.rules, default_rules());
        assert_eq!(config.display.floors.len(), 1);
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let toml_content = r#"
[[events.sources]]
schema = "nested"
collection = "events"
"#;
        assert!(toml::from_str::<Config>(toml_content).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.stats.window_days = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.events.sources.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.events.rules.push(RuleConfig::new("quiz", "x", " "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_counter_named_like_fixed_metric() {
        for name in metric::FIXED {
            let mut config = Config::default();
            config.events.rules.push(RuleConfig::new("quiz", "quiz_started", name));
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("reserved metric name"));
        }
    }

    #[test]
    fn test_resolved_key_path() {
        let mut appstore = AppStoreConfig::default();
        assert_eq!(
            appstore.resolved_key_path(Some("/home/ops")),
            "/home/ops/.appstoreconnect/AuthKey_F29544S3WG.p8"
        );
        appstore.private_key_path = Some("/keys/k.p8".to_string());
        assert_eq!(appstore.resolved_key_path(Some("/home/ops")), "/keys/k.p8");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[stats]\ndownload_offset = 10\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.stats.download_offset, 10);

        std::fs::write(&path, "[stats]\nwindow_days = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[stats]"));
        assert!(toml_str.contains("schema = \"flat\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.events.rules, default_rules());
        assert_eq!(parsed.display.floors, default_floors());
    }
}
