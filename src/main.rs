//! # ArkBot: scheduling host
//!
//! Runs the Ark reminder and match-lifecycle loops under the task supervisor.
//!
//! Usage:
//!   arkbot                          # Use ~/.arkbot/config.toml
//!   arkbot --config ./arkbot.toml   # Explicit config file
//!   arkbot --verbose --json-logs    # Debug logging as JSON lines
//!   arkbot --init-config            # Write a default config and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use arkbot_core::ArkConfig;
use arkbot_scheduler::{
    EntityLocks, LifecycleEngine, NotificationScheduler, SchedulerDb, StateStore, TaskSupervisor,
    ark, dispatch, engine,
};
use chrono::Utc;
use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "arkbot",
    version,
    about = "⚔️ ArkBot: durable reminders and Ark match lifecycle"
)]
struct Cli {
    /// Config file (default: ~/.arkbot/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    init_config: bool,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "arkbot=debug,arkbot_scheduler=debug,arkbot_core=debug"
    } else {
        "arkbot=info,arkbot_scheduler=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.init_config {
        let config = ArkConfig::default();
        let path = cli.config.clone().unwrap_or_else(ArkConfig::default_path);
        if path.exists() {
            anyhow::bail!("config already exists at {}", path.display());
        }
        match &cli.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => ArkConfig::load_from(path)?,
        None => ArkConfig::load()?,
    };

    let store = StateStore::open(&config.storage.state_dir())?;
    let db = Arc::new(SchedulerDb::open(&config.storage.db_path())?);
    let deliverer = dispatch::deliverer_from_config(&config.delivery);
    let locks = EntityLocks::new();

    tracing::info!(
        "⚔️ ArkBot starting (state: {}, db: {})",
        store.dir().display(),
        config.storage.db_path().display()
    );

    let mut reminders = NotificationScheduler::new(
        store.clone(),
        ark::NAMESPACE,
        config.reminders.clone(),
        deliverer,
        db.clone(),
        db.clone(),
    )?;
    let mut lifecycle = LifecycleEngine::new(
        &store,
        ark::NAMESPACE,
        ark::transitions(&config.lifecycle, db.clone()),
        ark::active_statuses(),
        db.clone(),
        db.clone(),
        locks.clone(),
    )?;

    // Startup order: rehydrate persisted work before any loop ticks.
    let report = reminders
        .rehydrate(Utc::now(), config.reminders.grace_window().num_seconds())
        .await?;
    tracing::info!("♻️ Rehydrated reminders: {report}");
    let cached = lifecycle.refresh().await?;
    tracing::info!("♻️ Loaded {cached} open match(es)");

    let reminders = Arc::new(Mutex::new(reminders));
    let lifecycle = Arc::new(Mutex::new(lifecycle));

    let mut supervisor = TaskSupervisor::new(config.supervisor.clone());
    supervisor.register(
        "ark-reminders",
        engine::reminder_task(
            reminders.clone(),
            db.clone(),
            config.reminders.offsets_seconds.clone(),
            config.reminders.tick_interval(),
        ),
    )?;
    supervisor.register(
        "ark-lifecycle",
        engine::lifecycle_task(lifecycle.clone(), config.lifecycle.tick_interval()),
    )?;
    supervisor.start_all();

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutdown requested");

    let report = supervisor
        .stop_all(config.supervisor.shutdown_timeout())
        .await;
    if !report.forced.is_empty() {
        tracing::warn!("⚠️ Forced to abort: {}", report.forced.join(", "));
    }
    for task in supervisor.snapshot() {
        tracing::debug!(
            "📋 {} {:?} restarts={} last_error={:?}",
            task.name,
            task.state,
            task.restart_count,
            task.last_error
        );
    }
    Ok(())
}
