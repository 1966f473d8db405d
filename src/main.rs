use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use appreg::{
    config::{Cli, Command, Config},
    deploy::ArchiveDir,
    state::{JsonSnapshotStore, StoreInit},
    store::LocalStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Check => check_store(&cli.config),
    }
}

fn load_store(config: &Config) -> Result<JsonSnapshotStore> {
    let store = JsonSnapshotStore::load_or_init(StoreInit {
        data_dir: config.data_dir.clone(),
    })
    .map_err(|e| anyhow::anyhow!("load store under {}: {e}", config.data_dir.display()))?;
    Ok(store)
}

fn check_store(config: &Config) -> Result<()> {
    let store = load_store(config)?;
    let state = store.state();
    println!(
        "apps={} deployments={} data_dir={}",
        state.apps.len(),
        state.deployments.len(),
        config.data_dir.display()
    );
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let store = LocalStore::new(load_store(&config)?);
    let sink = ArchiveDir::new(config.archives_dir());

    let app = appreg::http::build_router(config.clone(), Arc::new(store), Arc::new(sink))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        git_host = %config.git_host,
        max_upload_mib = config.max_upload_mib,
        "starting appreg"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
