//! bpo build coordinator server.

use bpo_config::SystemConfig;
use bpo_db::Store;
use bpo_repo::{ApkTools, RepoLayout, RepoManager, prepare_tools};
use bpo_scheduler::{Scheduler, Worker};
use bpo_server::{AppState, routes};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpo")]
#[command(about = "Build coordinator for postmarketOS packages and images", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "BPO_CONFIG", default_value = "bpo.kdl")]
    config: PathBuf,

    /// Ask for missing packages of every branch right after startup
    #[arg(long)]
    auto_get_repo_missing: bool,

    /// API token of the sourcehut job service
    #[arg(long, env = "BPO_SOURCEHUT_TOKEN", hide_env_values = true)]
    sourcehut_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = SystemConfig::load(&args.config)?;
    if args.auto_get_repo_missing {
        config.auto_get_repo_missing = true;
    }
    info!(config = %args.config.display(), branches = ?config.branch_names(), "Configuration loaded");

    info!(database = %config.database.display(), "Opening database...");
    let store = Store::open(&config.database.to_string_lossy()).await?;

    let (tools_dir, temp_dir) = (config.paths.tools.clone(), config.paths.temp.clone());
    let bin_dir = tokio::task::spawn_blocking(move || prepare_tools(&tools_dir, &temp_dir)).await??;
    let tools = ApkTools::new(bin_dir, config.sign.clone());
    if config.sign.is_none() {
        warn!("No signing key configured, repositories will not be published");
    }
    let repo = RepoManager::new(
        RepoLayout::new(&config.paths.repo_wip, &config.paths.repo_final),
        Arc::new(tools),
    );

    let backend = bpo_executor::from_config(&config, args.sourcehut_token)?;
    info!(backend = backend.name(), "Job service ready");

    let config = Arc::new(config);
    let scheduler = Arc::new(Scheduler::new(store, backend, repo, config.clone()));

    scheduler.recover().await?;

    if scheduler.backend().requires_polling() {
        let worker = Worker::new(
            scheduler.clone(),
            Duration::from_secs(config.poll_interval_secs),
        );
        tokio::spawn(async move { worker.run().await });
    }

    if config.auto_get_repo_missing {
        scheduler.request_repo_missing().await?;
    }

    // Build router
    let app = routes::router(AppState::new(scheduler)).layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
