use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use sitewatch::cli::Args;
use sitewatch::config::ServerConfig;
use sitewatch::db::Database;
use sitewatch::error_tracker::ErrorTracker;
use sitewatch::hub::{Hub, PubSub};
use sitewatch::network::NetworkMonitor;
use sitewatch::performance::PerformanceMonitor;
use sitewatch::runner::{BrowserRunner, SuiteRunner};
use sitewatch::scheduler::TestScheduler;
use sitewatch::server::{self, AppState};

/// Cadence of the network retention sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_filter);
    if let Err(e) = run(args).await {
        eprintln!("{}", format!("  error: {e}").bright_red());
        std::process::exit(1);
    }
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> sitewatch::Result<()> {
    let config = ServerConfig::resolve(&args)?;

    let hub = Arc::new(Hub::new());
    let pubsub: Arc<dyn PubSub> = hub.clone();

    let errors = Arc::new(ErrorTracker::new(Arc::clone(&pubsub)));

    let performance = Arc::new(PerformanceMonitor::new(Arc::clone(&pubsub)));
    performance.start_sampling(config.monitor_sample_interval);

    let network = Arc::new(NetworkMonitor::new(
        Arc::clone(&pubsub),
        config.metrics_retention_days,
    ));
    network.start_sweeping(SWEEP_INTERVAL);

    let runner: Arc<dyn SuiteRunner> = BrowserRunner::new(config.runner_config());
    let scheduler = TestScheduler::new(
        config.scheduler_config(),
        Arc::clone(&runner),
        Arc::clone(&pubsub),
    );
    if args.no_scheduler {
        tracing::info!("automatic test scheduler disabled");
    } else {
        scheduler.start();
    }

    let db = Arc::new(Database::open(&config.database_path)?);

    let state = Arc::new(AppState {
        hub,
        errors,
        performance,
        network,
        scheduler,
        runner,
        db,
        config,
        started: Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let served = server::serve(Arc::clone(&state), shutdown_rx).await;

    // Ordered best-effort shutdown: scheduler, monitors, browsers, database.
    // A failing step must not prevent the next one from being attempted.
    eprintln!("{}", "  shutting down...".bright_blue());
    state.scheduler.stop();
    state.performance.stop();
    state.network.stop();
    state.runner.cleanup().await;
    if let Err(e) = state.db.close() {
        tracing::warn!(error = %e, "database close failed");
    }

    served
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("termination signal caught");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
