//! `fmxd`: forced-matrix engine daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fmx_daemon::{EngineConfig, MatrixEngine, SqliteLedger, SqliteStore, TracingEmitter};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fmxd", about = "Forced-matrix placement and cycling daemon")]
struct Args {
    /// Engine configuration (levels, cascade, scheduler).
    #[arg(long, default_value = "fmx.toml")]
    config: PathBuf,

    /// `SQLite` database path.
    #[arg(long, default_value = "fmx.db")]
    db: PathBuf,

    /// Admin API listen address.
    #[arg(long, default_value = "127.0.0.1:8087")]
    listen: SocketAddr,

    /// Drain the queue once and exit instead of serving.
    #[arg(long)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let registry = config.registry()?;

    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;
    let ledger = Arc::new(SqliteLedger::new(store.connection()));
    let engine = Arc::new(MatrixEngine::new(
        store,
        registry,
        config.engine.clone(),
        ledger,
        Arc::new(TracingEmitter),
    ));

    if args.run_once {
        let report = tokio::task::spawn_blocking({
            let engine = Arc::clone(&engine);
            move || engine.run()
        })
        .await??;
        info!(
            processed = report.processed,
            placed = report.placed,
            cycles = report.cycles,
            failed = report.failed,
            "single run complete"
        );
        return Ok(());
    }

    let scheduler = tokio::spawn(schedule_runs(
        Arc::clone(&engine),
        config.engine.scheduler_interval_secs,
    ));

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, "admin API listening");

    axum::serve(listener, fmx_daemon::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    scheduler.abort();
    info!("shutdown complete");
    Ok(())
}

/// Interval-driven queue drains. A tick that finds the lock held is
/// normal contention with a triggered run and is only logged at debug.
async fn schedule_runs(engine: Arc<MatrixEngine>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let engine = Arc::clone(&engine);
        let outcome = tokio::task::spawn_blocking(move || engine.run()).await;
        match outcome {
            Ok(Ok(report)) if report.processed > 0 => {
                info!(processed = report.processed, "scheduled run drained entries");
            },
            Ok(Ok(_)) => {},
            Ok(Err(fmx_daemon::EngineError::AlreadyRunning(_))) => {
                debug!("scheduled run skipped: lock held");
            },
            Ok(Err(err)) => {
                error!(error = %err, "scheduled run failed; lock left stuck");
            },
            Err(join_err) => {
                warn!(error = %join_err, "scheduled run task aborted");
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install ctrl-c handler");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("ctrl-c received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
