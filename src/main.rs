//! # Pipes Main Entry Point
//!
//! Loads configuration, migrates the database and runs the autosync scheduler
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pipes::{
    central::{CentralApi, HttpCentralClient},
    config::ConfigLoader,
    db,
    integrations::{ServiceRegistry, load_catalog},
    oauth::StandardOAuthProvider,
    repositories::CredentialStore,
    scheduler::AutosyncScheduler,
    sync::SyncOrchestrator,
    telemetry::{ErrorNotifier, TracingNotifier, init_tracing},
};

#[derive(Debug, Parser)]
#[command(name = "pipes", about = "Workspace sync engine")]
struct Cli {
    /// Directory holding the layered .env files
    #[arg(long)]
    env_dir: Option<PathBuf>,

    /// Apply database migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, profile = %config.profile, "Loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;
    if cli.migrate_only {
        return Ok(());
    }
    db::health_check(&db).await?;

    let catalog = load_catalog(config.integrations_path.as_deref())
        .context("loading integration catalog")?;
    let registry = ServiceRegistry::with_catalog(catalog);
    let missing: Vec<&str> = registry
        .integrations()
        .filter(|integration| !registry.has_adapter(&integration.id))
        .map(|integration| integration.id.as_str())
        .collect();
    if !missing.is_empty() {
        warn!(services = ?missing, "No adapter registered; pipes for these services will fail");
    }
    let registry = Arc::new(registry);

    let provider = StandardOAuthProvider::new().context("building OAuth client")?;
    let credentials = CredentialStore::new(
        db.clone(),
        Arc::clone(&registry),
        Arc::new(provider),
        config.oauth2.clone(),
    );

    let central = HttpCentralClient::new(&config.central_api_url)
        .context("building central service client")?;
    if let Err(err) = central.ping().await {
        warn!(error = %err, "Central service is not reachable yet");
    }

    let notifier: Arc<dyn ErrorNotifier> = Arc::new(TracingNotifier);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        db,
        registry,
        credentials,
        Arc::new(central),
        Arc::clone(&notifier),
        &config,
    ));
    let scheduler = AutosyncScheduler::new(orchestrator, notifier, config.scheduler.clone());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    scheduler.run(shutdown).await;
    Ok(())
}
