use std::sync::Arc;

use tracing::info;

use loanledger::audit::AuditHub;
use loanledger::clock::SystemClock;
use loanledger::config::Config;
use loanledger::engine::Engine;
use loanledger::reaper;
use loanledger::store::MemStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    loanledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(MemStore::open(config.wal_path())?);
    let engine = Engine::new(
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(AuditHub::new()),
        config.engine,
    );

    info!("loanledger started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  scan every {:?}, reconcile every {:?}", config.scan_interval, config.reconcile_interval);
    info!("  overdue grace: {}ms", config.engine.overdue_grace_ms);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let scanner = tokio::spawn(reaper::run_overdue_scanner(engine.clone(), config.scan_interval));
    let reconciler = tokio::spawn(reaper::run_reconciler(engine.clone(), config.reconcile_interval));
    let compactor = tokio::spawn(reaper::run_compactor(
        store.clone(),
        config.compact_threshold,
        config.scan_interval,
    ));

    // Run until SIGTERM/ctrl-c.
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received");
    scanner.abort();
    reconciler.abort();
    compactor.abort();

    // Leave a compact WAL behind for the next start.
    if let Err(e) = store.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("loanledger stopped");
    Ok(())
}
