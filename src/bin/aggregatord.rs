//! Aggregator daemon
//!
//! Loads the TOML config, wires the partitioned-log substrate, and runs
//! the epoch ticker: once per epoch (plus jitter) every owned zone is
//! drained and one aggregated document is emitted to the MAPE topic and
//! to ledger partition 0. `/health` and `/metrics` are served when
//! `http_addr` is set.
//!
//! Topology changes after startup are fatal by design: the daemon logs
//! the mismatch and exits nonzero so operators rerun topic provisioning.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info};

use nrgchamp::aggregator::{Aggregator, AggregatorError};
use nrgchamp::breaker::Breaker;
use nrgchamp::bus::{MemoryBus, PartitionedLog, LEDGER_PARTITIONS};
use nrgchamp::config::AggregatorConfig;
use nrgchamp::http::{aggregator_router, AggregatorApiState};
use nrgchamp::metrics::AggregatorMetrics;
use nrgchamp::Shutdown;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn init_tracing(log_path: Option<&Path>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("open log file {}: {e}", path.display()));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(move || file.try_clone().expect("clone log file handle"))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn serve_http(addr: String, router: axum::Router, shutdown: Shutdown) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind http listener on {addr}"))?;
    info!(%addr, "http listener up");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !shutdown.is_triggered() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path =
        parse_flag(&args, "--config").unwrap_or_else(|| "aggregator.toml".to_string());
    let cfg = AggregatorConfig::load(Path::new(&config_path))
        .with_context(|| format!("load aggregator config {config_path}"))?;
    init_tracing(cfg.log_path.as_deref());
    info!(config = %config_path, zones = cfg.topics.len(), epoch_ms = cfg.epoch_ms, "aggregatord starting");

    // The embedded broker; an external client binds behind the same
    // trait, selected by `brokers`.
    let bus: Arc<dyn PartitionedLog> = Arc::new(MemoryBus::new());
    let device_partitions: u32 = std::env::var("NRGCHAMP_DEVICE_PARTITIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    for topic in &cfg.topics {
        bus.ensure_topic(topic, device_partitions)?;
        let zone = AggregatorConfig::zone_of_topic(topic);
        bus.ensure_topic(&cfg.ledger_topic_for(zone), LEDGER_PARTITIONS)?;
    }
    bus.ensure_topic(&cfg.mape_topic, cfg.topics.len().max(1) as u32)?;

    let metrics = Arc::new(AggregatorMetrics::default());
    let reader = Arc::new(Breaker::new("aggregator-reader", cfg.breaker.clone()));
    let writer = Arc::new(Breaker::new("aggregator-writer", cfg.breaker.clone()));
    let mut service =
        Aggregator::new(cfg.clone(), Arc::clone(&bus), reader, writer, Arc::clone(&metrics))?;

    let shutdown = Shutdown::new();
    let fatal = Arc::new(AtomicBool::new(false));

    let ticker = {
        let shutdown = shutdown.clone();
        let fatal = Arc::clone(&fatal);
        let epoch_ms = cfg.epoch_ms;
        let jitter_ms = cfg.jitter_ms;
        std::thread::Builder::new().name("epoch-ticker".into()).spawn(move || {
            loop {
                // Sleep to the next epoch boundary, desynchronized by jitter.
                let now_ms = Utc::now().timestamp_millis();
                let jitter = if jitter_ms > 0 {
                    rand::Rng::gen_range(&mut rand::thread_rng(), 0..jitter_ms)
                } else {
                    0
                };
                let next_ms = (now_ms.div_euclid(epoch_ms) + 1) * epoch_ms + jitter as i64;
                let wait = Duration::from_millis((next_ms - now_ms).max(1) as u64);
                if shutdown.wait_timeout(wait) {
                    break;
                }
                match service.tick(Utc::now()) {
                    Ok(()) => {}
                    Err(
                        e @ (AggregatorError::TopologyChanged { .. }
                        | AggregatorError::LedgerTopology { .. }),
                    ) => {
                        error!(error = %e, "fatal partition topology error; exiting");
                        fatal.store(true, Ordering::SeqCst);
                        shutdown.trigger();
                        break;
                    }
                    Err(e) => error!(error = %e, "tick failed"),
                }
            }
        })?
    };

    if let Some(addr) = cfg.http_addr.clone() {
        let router = aggregator_router(AggregatorApiState { metrics: Arc::clone(&metrics) });
        let sd = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_http(addr, router, sd).await {
                error!(error = %e, "http server failed");
            }
        });
    }

    let sd = shutdown.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.trigger();
        }
        _ = async move {
            while !sd.is_triggered() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        } => {}
    }

    tokio::task::spawn_blocking(move || ticker.join())
        .await?
        .map_err(|_| anyhow::anyhow!("ticker thread panicked"))?;
    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("aggregatord exited on a fatal topology error");
    }
    info!("aggregatord stopped");
    Ok(())
}
