//! cronfleet - distributed cron controller.
//!
//! Usage:
//!   cronfleet run                     Run a controller until Ctrl-C
//!   cronfleet deploy <module.json>    Register a module's cron jobs as a new deployment
//!   cronfleet jobs                    List the stored cron jobs
//!   cronfleet next <pattern>          Print upcoming firings of a cron pattern

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cronfleet_core::{Clock, Controller, ControllerKey, CronfleetConfig, SystemClock};
use cronfleet_scheduler::{
    CronJobDal, CronService, DeploymentDal, LocalTaskScheduler, Module, SqliteDal,
};

mod http;

use http::HttpVerbCaller;

/// cronfleet - distributed cron controller
#[derive(Parser)]
#[command(name = "cronfleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $CRONFLEET_CONFIG or ~/.cronfleet/cronfleet.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a controller until interrupted
    Run,

    /// Register the cron jobs of a module schema as a new deployment
    Deploy {
        /// Path to the module schema JSON
        #[arg(value_name = "MODULE_JSON")]
        module: PathBuf,

        /// Replicas for the new deployment; 0 registers it without firing
        #[arg(long, default_value = "1")]
        min_replicas: u32,
    },

    /// List stored cron jobs of active deployments
    Jobs,

    /// Print the next firings of a cron pattern
    Next {
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronfleet=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit path > CRONFLEET_CONFIG env > ~/.cronfleet/cronfleet.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRONFLEET_CONFIG").ok());
    let config = match CronfleetConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) if config_path.is_some() => return Err(e.into()),
        Err(e) => {
            warn!("Config load failed ({}), using defaults", e);
            CronfleetConfig::default()
        }
    };

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Deploy {
            module,
            min_replicas,
        } => deploy(config, module, min_replicas).await,
        Commands::Jobs => list_jobs(config).await,
        Commands::Next { pattern, count } => print_next(&pattern, count),
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

fn open_store(config: &CronfleetConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<SqliteDal>> {
    let path = &config.database.path;
    ensure_parent_dir(path);
    info!(path = %path, "opening SQLite database");
    let dal = SqliteDal::open(path, clock)
        .with_context(|| format!("failed to open database at {path}"))?;
    Ok(Arc::new(dal))
}

fn controller_key(config: &CronfleetConfig) -> ControllerKey {
    config
        .controller
        .key
        .clone()
        .map(ControllerKey::from)
        .unwrap_or_default()
}

/// Static membership from config. An empty peer list means a fleet of one.
fn membership(peers: &[String], own: &ControllerKey) -> Vec<Controller> {
    if peers.is_empty() {
        return vec![Controller::new(own.clone())];
    }
    if !peers.iter().any(|p| p == own.as_str()) {
        warn!(controller = %own, "controller key missing from configured peers, no jobs will run here");
    }
    peers.iter().map(|p| Controller::new(p.as_str())).collect()
}

fn origin_host(config: &CronfleetConfig) -> String {
    config
        .verbs
        .origin_host
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn build_service(
    config: &CronfleetConfig,
    key: ControllerKey,
    clock: Arc<dyn Clock>,
    dal: Arc<SqliteDal>,
) -> anyhow::Result<CronService> {
    let service = CronService::builder()
        .key(key)
        .origin_host(origin_host(config))
        .timeout(config.cron.timeout())
        .clock(clock)
        .dal(dal)
        .verb_caller(Arc::new(HttpVerbCaller::new(&config.verbs.endpoint)))
        .build()?;
    Ok(service)
}

async fn run(config: CronfleetConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dal = open_store(&config, clock.clone())?;
    let key = controller_key(&config);
    let service = build_service(&config, key.clone(), clock.clone(), dal.clone())?;

    service.updated_controller_list(&membership(&config.controller.peers, &key));

    let cancel = CancellationToken::new();
    let tasks = LocalTaskScheduler::new(clock, dal, key.clone(), cancel.clone());
    let handle = service.start(&tasks, cancel.clone())?;
    service
        .reset_jobs()
        .await
        .context("initial job load failed")?;

    info!(
        controller = %key,
        verbs = %config.verbs.endpoint,
        timeout_secs = config.cron.timeout_secs,
        "cronfleet controller running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    handle.await?;
    Ok(())
}

async fn deploy(
    config: CronfleetConfig,
    path: PathBuf,
    min_replicas: u32,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let module: Module = serde_json::from_str(&text)
        .with_context(|| format!("invalid module schema in {}", path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dal = open_store(&config, clock.clone())?;
    let service = build_service(&config, controller_key(&config), clock, dal.clone())?;

    let jobs = service.new_jobs_for_module(&module, Utc::now());
    let count = jobs.len();
    let key = dal.create_deployment(&module.name, jobs).await?;
    dal.replace_deployment(&key, min_replicas).await?;

    println!(
        "deployed {} as {} ({} cron job{}, min replicas {})",
        module.name,
        key,
        count,
        if count == 1 { "" } else { "s" },
        min_replicas
    );
    Ok(())
}

async fn list_jobs(config: CronfleetConfig) -> anyhow::Result<()> {
    let dal = open_store(&config, Arc::new(SystemClock))?;
    let jobs = dal.list_jobs().await?;
    if jobs.is_empty() {
        println!("no cron jobs");
        return Ok(());
    }
    println!(
        "{:<24} {:<20} {:<10} {:<26} KEY",
        "VERB", "SCHEDULE", "STATE", "NEXT"
    );
    for job in jobs {
        println!(
            "{:<24} {:<20} {:<10} {:<26} {}",
            job.verb.to_string(),
            job.schedule,
            job.state.to_string(),
            job.next_execution.to_rfc3339(),
            job.key
        );
    }
    Ok(())
}

fn print_next(text: &str, count: usize) -> anyhow::Result<()> {
    let pattern = cronfleet_cron::parse(text)?;
    let mut after = Utc::now();
    for _ in 0..count {
        after = cronfleet_cron::next_after(&pattern, after, false)?;
        println!("{}", after.to_rfc3339());
    }
    Ok(())
}
