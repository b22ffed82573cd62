use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use tempedge::config::Config;
use tempedge::db::{self, Database};
use tempedge::executor::Executor;
use tempedge::forecast::ForecastEngine;
use tempedge::monitor::ExitEvaluator;
use tempedge::notifier::Notifier;
use tempedge::observer::ObservationService;
use tempedge::peak_hour::PeakHourEstimator;
use tempedge::resolver::Resolver;
use tempedge::scanner::MarketScanner;
use tempedge::scheduler::run_pipeline;
use tempedge::venue::VenueAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration; a malformed value stops startup here.
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tempedge=info")),
        )
        .init();

    info!(
        "tempedge starting in {} mode (evaluator {:?}, scan every {}m, observe every {}s)",
        config.trading_mode,
        config.evaluator_mode,
        config.scan_interval_minutes,
        config.fast_poll_seconds,
    );

    let db = db::shared(Database::open(&config.database_path)?);
    info!("Database initialized at {}", config.database_path);

    // Components
    let adapter = Arc::new(VenueAdapter::new(&config)?);
    let forecasts = Arc::new(ForecastEngine::new(&config)?);
    let executor = Arc::new(Executor::new(&config));
    let observer = Arc::new(ObservationService::new(&config)?);
    let resolver = Arc::new(Resolver::new(&config)?);
    let scanner = Arc::new(MarketScanner::new(&config));
    let evaluator = Arc::new(ExitEvaluator::new(&config));
    let peak_hours = Arc::new(PeakHourEstimator::new(&config));
    let notifier = Arc::new(Notifier::from_env());

    // Bankroll and peak hours reconcile from the database at startup;
    // the trades table is the source of truth.
    executor.reconcile(&db.lock().unwrap())?;
    peak_hours.refresh(&db.lock().unwrap(), Utc::now())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pipelines = Vec::new();

    // Scan pipeline
    {
        let (db, adapter, forecasts, executor, scanner, notifier) = (
            db.clone(),
            adapter.clone(),
            forecasts.clone(),
            executor.clone(),
            scanner.clone(),
            notifier.clone(),
        );
        let interval = Duration::from_secs(config.scan_interval_minutes * 60);
        pipelines.push(tokio::spawn(run_pipeline(
            "scan",
            interval,
            interval,
            shutdown_rx.clone(),
            move || {
                let (db, adapter, forecasts, executor, scanner, notifier) = (
                    db.clone(),
                    adapter.clone(),
                    forecasts.clone(),
                    executor.clone(),
                    scanner.clone(),
                    notifier.clone(),
                );
                async move {
                    scanner.tick(&db, &adapter, &forecasts, &executor).await?;
                    notifier.flush().await;
                    Ok(())
                }
            },
        )));
    }

    // Monitor pipeline, interleaved with the scanner.
    {
        let (db, adapter, forecasts, executor, evaluator, peak_hours) = (
            db.clone(),
            adapter.clone(),
            forecasts.clone(),
            executor.clone(),
            evaluator.clone(),
            peak_hours.clone(),
        );
        let interval = Duration::from_secs(config.scan_interval_minutes * 60);
        let rx = shutdown_rx.clone();
        pipelines.push(tokio::spawn(async move {
            tokio::time::sleep(interval / 2).await;
            run_pipeline("monitor", interval, interval, rx, move || {
                let (db, adapter, forecasts, executor, evaluator, peak_hours) = (
                    db.clone(),
                    adapter.clone(),
                    forecasts.clone(),
                    executor.clone(),
                    evaluator.clone(),
                    peak_hours.clone(),
                );
                async move {
                    evaluator
                        .tick(&db, &adapter, &forecasts, &executor, &peak_hours)
                        .await?;
                    Ok(())
                }
            })
            .await;
        }));
    }

    // Fast observation pipeline (guaranteed-win detection path).
    {
        let (db, adapter, executor, observer, notifier) = (
            db.clone(),
            adapter.clone(),
            executor.clone(),
            observer.clone(),
            notifier.clone(),
        );
        let interval = Duration::from_secs(config.fast_poll_seconds);
        pipelines.push(tokio::spawn(run_pipeline(
            "observe_fast",
            interval,
            interval * 3,
            shutdown_rx.clone(),
            move || {
                let (db, adapter, executor, observer, notifier) = (
                    db.clone(),
                    adapter.clone(),
                    executor.clone(),
                    observer.clone(),
                    notifier.clone(),
                );
                async move {
                    observer.fast_tick(&db, &adapter, &executor, &notifier).await?;
                    Ok(())
                }
            },
        )));
    }

    // Slow observation pipeline: full rows, WU cross-checks, peak hours.
    {
        let (db, adapter, observer, notifier, peak_hours) = (
            db.clone(),
            adapter.clone(),
            observer.clone(),
            notifier.clone(),
            peak_hours.clone(),
        );
        let interval = Duration::from_secs(config.poll_interval_minutes * 60);
        pipelines.push(tokio::spawn(run_pipeline(
            "observe_slow",
            interval,
            interval,
            shutdown_rx.clone(),
            move || {
                let (db, adapter, observer, notifier, peak_hours) = (
                    db.clone(),
                    adapter.clone(),
                    observer.clone(),
                    notifier.clone(),
                    peak_hours.clone(),
                );
                async move {
                    observer.slow_tick(&db, &adapter, &notifier).await?;
                    peak_hours.refresh(&db.lock().unwrap(), Utc::now())?;
                    notifier.flush().await;
                    Ok(())
                }
            },
        )));
    }

    // Resolver pipeline
    {
        let (db, adapter, executor, resolver, notifier) = (
            db.clone(),
            adapter.clone(),
            executor.clone(),
            resolver.clone(),
            notifier.clone(),
        );
        let interval = Duration::from_secs(config.resolve_interval_seconds);
        pipelines.push(tokio::spawn(run_pipeline(
            "resolve",
            interval,
            interval * 3,
            shutdown_rx.clone(),
            move || {
                let (db, adapter, executor, resolver, notifier) = (
                    db.clone(),
                    adapter.clone(),
                    executor.clone(),
                    resolver.clone(),
                    notifier.clone(),
                );
                async move {
                    resolver.tick(&db, &adapter, &executor, &notifier).await?;
                    notifier.flush().await;
                    Ok(())
                }
            },
        )));
    }

    info!("All pipelines running — Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received — shutting down gracefully");

    if shutdown_tx.send(true).is_err() {
        error!("Shutdown signal had no listeners");
    }
    for handle in pipelines {
        let _ = handle.await;
    }
    notifier.flush().await;
    info!("Shutdown complete");
    Ok(())
}
