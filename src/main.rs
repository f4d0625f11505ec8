//! CouponHub server: limited-quantity coupon issuance with pluggable
//! distributed locking.
//!
//! Main entry point that wires all crates together and runs the outbox
//! publisher and reservation consumer, or a one-shot operator command.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use couponhub_cache::Backends;
use couponhub_core::config::AppConfig;
use couponhub_core::error::AppError;
use couponhub_database::DatabasePool;
use couponhub_lock::{LockManager, LockOptions, OptimisticRetry};
use couponhub_service::{CouponIssuanceService, QuotaReconciler, ReservationService};
use couponhub_worker::{OutboxPublisher, OutboxScheduler, ReservationConsumer};

/// CouponHub server and operator commands
#[derive(Debug, Parser)]
#[command(name = "couponhub-server", version, about, long_about = None)]
struct Cli {
    /// Configuration overlay loaded on top of `config/default.toml`
    #[arg(short, long)]
    env: Option<String>,

    /// Command to run; defaults to `serve`
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the outbox publisher and reservation consumer
    Serve,
    /// Compare a coupon's quota counter against the database
    Reconcile {
        /// Coupon to inspect
        #[arg(long)]
        coupon_id: Uuid,
        /// Rewrite the counter when it drifted
        #[arg(long)]
        apply: bool,
    },
    /// Move failed outbox events back to NEW
    ResubmitFailed {
        /// Only resubmit events with fewer attempts than this
        #[arg(long, default_value_t = 5)]
        max_attempts: i32,
    },
    /// Print outbox event counts per status
    OutboxStats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = cli
        .env
        .clone()
        .or_else(|| std::env::var("COUPONHUB_ENV").ok())
        .unwrap_or_else(|| "development".to_string());

    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    tracing::info!(env = %env, "Configuration loaded");

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Reconcile { coupon_id, apply } => reconcile(&config, coupon_id, apply).await,
        Command::ResubmitFailed { max_attempts } => resubmit_failed(&config, max_attempts).await,
        Command::OutboxStats => outbox_stats(&config).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "CouponHub exited with error");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Connect to the database and apply pending migrations.
async fn connect_database(config: &AppConfig) -> Result<DatabasePool, AppError> {
    tracing::info!("Connecting to database...");
    let db = DatabasePool::connect(&config.database).await?;

    tracing::info!("Running database migrations...");
    db.migrate().await?;
    tracing::info!("Database migrations complete");
    Ok(db)
}

async fn build_backends(config: &AppConfig) -> Result<Backends, AppError> {
    tracing::info!(
        provider = %config.cache.provider,
        bus = %config.message_bus.provider,
        "Initializing backends..."
    );
    Backends::new(
        &config.cache,
        &config.lock,
        &config.quota,
        &config.message_bus,
    )
    .await
}

/// Long-running mode: publish outbox events and confirm reservations
/// until a shutdown signal arrives.
async fn serve(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting CouponHub v{}", env!("CARGO_PKG_VERSION"));

    let db = connect_database(&config).await?;
    let backends = build_backends(&config).await?;

    let coupons = Arc::new(db.coupons());
    let reservation_repo = Arc::new(db.reservations());
    let outbox = Arc::new(db.outbox());

    let lock = LockManager::from_config(&config.lock, &config.retry, &backends);
    let issuance = Arc::new(CouponIssuanceService::new(
        coupons.clone(),
        backends.quota.clone(),
        lock,
        LockOptions::from_config(&config.lock),
        OptimisticRetry::from_config(&config.retry),
    ));
    let reservations = Arc::new(ReservationService::new(
        coupons,
        reservation_repo,
        backends.quota.clone(),
        issuance,
    ));

    if !config.worker.enabled {
        tracing::warn!("Worker disabled; nothing to run");
        db.close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = Arc::new(OutboxPublisher::new(
        outbox,
        backends.bus.clone(),
        config.outbox.clone(),
    ));
    let mut scheduler = OutboxScheduler::new(publisher).await?;
    scheduler
        .register_publish(&config.outbox.publish_schedule)
        .await?;
    scheduler.start().await?;

    let consumer = ReservationConsumer::new(
        backends.bus.clone(),
        reservations,
        &config.outbox,
        &config.message_bus,
        &config.worker,
    );
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(shutdown_rx).await {
            tracing::error!(error = %e, "Reservation consumer stopped");
        }
    });

    tracing::info!(
        strategy = %config.lock.strategy,
        worker_id = %config.worker.worker_id,
        "CouponHub running"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
    let _ = shutdown_tx.send(true);

    scheduler.shutdown().await?;
    if let Err(e) = consumer_handle.await {
        tracing::error!(error = %e, "Consumer task panicked");
    }

    db.close().await;
    tracing::info!("CouponHub shut down");
    Ok(())
}

async fn reconcile(config: &AppConfig, coupon_id: Uuid, apply: bool) -> Result<(), AppError> {
    let db = connect_database(config).await?;
    let backends = build_backends(config).await?;

    let reconciler = QuotaReconciler::new(
        Arc::new(db.coupons()),
        Arc::new(db.reservations()),
        backends.quota.clone(),
    );
    let report = reconciler.reconcile(coupon_id, apply).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    db.close().await;
    Ok(())
}

async fn resubmit_failed(config: &AppConfig, max_attempts: i32) -> Result<(), AppError> {
    let db = connect_database(config).await?;
    let backends = build_backends(config).await?;

    let publisher = OutboxPublisher::new(
        Arc::new(db.outbox()),
        backends.bus.clone(),
        config.outbox.clone(),
    );
    let moved = publisher.resubmit_failed(max_attempts).await?;

    println!("Resubmitted {moved} failed event(s)");
    db.close().await;
    Ok(())
}

async fn outbox_stats(config: &AppConfig) -> Result<(), AppError> {
    let db = connect_database(config).await?;
    let backends = build_backends(config).await?;

    let publisher = OutboxPublisher::new(
        Arc::new(db.outbox()),
        backends.bus.clone(),
        config.outbox.clone(),
    );
    let stats = publisher.stats().await?;

    println!(
        "new: {}\nprocessing: {}\npublished: {}\nfailed: {}",
        stats.new, stats.processing, stats.published, stats.failed
    );
    db.close().await;
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
