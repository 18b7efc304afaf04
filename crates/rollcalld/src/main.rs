use anyhow::{Context, Result};
use rollcall_core::{ArtifactSpool, Gallery, RecognitionService};
use rollcall_store::Database;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod extractor;

use config::{BusKind, Config};
use dbus_interface::{ScannerService, BUS_NAME, OBJECT_PATH};
use extractor::ProcessExtractor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let gallery = Gallery::open(config.embedding_dim, Box::new(db.face_store()))
        .context("loading enrolled faces")?;

    let spool = ArtifactSpool::new(&config.spool_dir)
        .with_context(|| format!("creating spool directory {}", config.spool_dir.display()))?;
    match spool.purge_stale() {
        Ok(0) => {}
        Ok(n) => tracing::warn!(removed = n, "removed probe images left by a previous run"),
        Err(e) => tracing::warn!(error = %e, "could not sweep spool directory"),
    }

    let extractor = ProcessExtractor::new(&config.extractor_program, config.extractor_args.clone());
    tracing::info!(program = extractor.program(), "using embedding extractor");

    let pipeline = RecognitionService::new(
        Arc::new(gallery),
        Arc::new(db.ledger()),
        extractor,
        spool,
        config.policy(),
    );
    let service = ScannerService::new(Arc::new(pipeline), Some(config.db_path.clone()));

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("claiming {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
