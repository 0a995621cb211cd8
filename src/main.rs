//! ProtoQuiz Stats - operational batch jobs
//!
//! Each subcommand is one short-lived job: aggregate usage stats from the
//! document store into a JSON snapshot, check App Store Connect, report
//! blog views, or audit user ids.
//!
//! Exit codes:
//!   0 - Success (including runs where some metrics were unavailable)
//!   1 - Fatal error (config, credentials, or a job that needs every read)

mod analysis;
mod appstore;
mod audit;
mod cli;
mod config;
mod models;
mod report;
mod store;
mod views;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, Command};
use config::{Config, DEFAULT_CONFIG_FILE};
use std::path::Path;
use std::time::{Duration, Instant};
use store::auth::{AccessTokenSource, ServiceAccountKey};
use store::firestore::FirestoreSettings;
use store::{DocumentStore, FirestoreStore, MemoryStore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command(), Command::InitConfig) {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("ProtoQuiz Stats v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(&args).await {
        error!("Job failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle init-config: generate a default .protoquiz.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize event sources, counting rules, and display floors.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn run(args: &Args) -> Result<()> {
    let mut config = load_config(args)?;
    config.merge_with_args(args);
    config.validate().context("Invalid configuration")?;

    let http = http_client(&config)?;

    match args.command() {
        Command::Stats(_) => run_stats(args, &config, &http).await,
        Command::Appstore(_) => run_appstore(&config, &http).await,
        Command::Views(_) => run_views(&config, &http).await,
        Command::AuditUsers => run_audit_users(&config, &http).await,
        Command::InitConfig => handle_init_config(),
    }
}

/// Aggregate stats and write the snapshot. Failed reads degrade single
/// metrics; only setup errors end the job.
async fn run_stats(args: &Args, config: &Config, http: &reqwest::Client) -> Result<()> {
    let start_time = Instant::now();
    let store = open_store(config, http)?;

    if !args.quiet {
        println!("📥 Reading stats from {} store...", store.backend_tag());
    }

    let pipeline = analysis::StatsPipeline::new(store.as_ref(), config)?.with_progress(!args.quiet);
    let snapshot = pipeline.run(Utc::now()).await;

    let output = Path::new(&config.general.output);
    report::write_snapshot(&snapshot, output)?;

    if !args.quiet {
        report::print_summary(&snapshot);
        println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());
        println!("\n✅ Stats written to: {}", output.display());
    }

    Ok(())
}

async fn run_appstore(config: &Config, http: &reqwest::Client) -> Result<()> {
    println!("📱 Fetching App Store Connect stats...\n");

    let home = std::env::var("HOME").ok();
    let credentials = appstore::AppStoreCredentials::load(&config.appstore, home.as_deref())?;
    let client = appstore::AppStoreClient::new(&config.appstore, credentials, http.clone());

    let summary = appstore::fetch_summary(&client)
        .await
        .context("Failed to fetch App Store stats")?;

    println!("✅ Found app: {}", summary.app.app_name);
    if let Some(versions) = summary.versions {
        println!("   App Store versions: {}", versions);
    }
    println!(
        "\n📊 App Store Stats: {}",
        serde_json::to_string_pretty(&summary)?
    );

    Ok(())
}

async fn run_views(config: &Config, http: &reqwest::Client) -> Result<()> {
    println!("📊 Fetching blog view statistics...\n");

    let response = views::fetch_views(http, &config.views.url).await?;
    for line in views::render(&response.views) {
        println!("{}", line);
    }

    Ok(())
}

async fn run_audit_users(config: &Config, http: &reqwest::Client) -> Result<()> {
    let store = open_store(config, http)?;
    let audit = audit::run_audit(store.as_ref(), config, Utc::now()).await?;

    let rule = analysis::ExclusionRule::new(config.stats.test_prefix.clone());
    for line in audit.render(&rule, config.stats.window_days) {
        println!("{}", line);
    }

    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default()? {
        Some(config) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.general.timeout_seconds))
        .build()
        .context("Failed to build HTTP client")
}

/// The JSON export when one is configured, otherwise the live database.
fn open_store(config: &Config, http: &reqwest::Client) -> Result<Box<dyn DocumentStore>> {
    if let Some(ref dump) = config.firestore.dump {
        info!("Using document export: {}", dump);
        return Ok(Box::new(MemoryStore::from_dump(Path::new(dump))?));
    }

    let key = ServiceAccountKey::load(Path::new(&config.firestore.credentials))?;
    if let Some(ref key_project) = key.project_id {
        if key_project != &config.firestore.project_id {
            warn!(
                "Service account belongs to project {}, reading from {}",
                key_project, config.firestore.project_id
            );
        }
    }
    let tokens = AccessTokenSource::new(key, http.clone())?;
    let settings = FirestoreSettings {
        project_id: config.firestore.project_id.clone(),
        database: config.firestore.database.clone(),
        base_url: config.firestore.base_url.clone(),
    };

    info!("Using Firestore project: {}", settings.project_id);
    Ok(Box::new(FirestoreStore::new(settings, tokens, http.clone())))
}
