//! Ledger daemon: per-zone epoch matching, block building, queries
//!
//! One consumer thread per owned zone matches aggregator summaries
//! (partition 0) against MAPE decisions (partition 1), imputing a missing
//! side after the grace window, and appends hash-chained transactions
//! into the zone's block file. The query API serves `/events` over every
//! owned zone, and the optional public publisher emits one PII-free
//! payload per finalized epoch.
//!
//! A partition-contract violation on any owned zone is fatal: the daemon
//! logs it and exits nonzero so operators rerun topic provisioning.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info, warn};

use nrgchamp::blockstore::{BlockStore, BlockStoreConfig};
use nrgchamp::breaker::Breaker;
use nrgchamp::bus::{MemoryBus, PartitionedLog, LEDGER_PARTITIONS};
use nrgchamp::config::LedgerConfig;
use nrgchamp::http::{ledger_router, LedgerApiState};
use nrgchamp::ingest::{IngestError, IngestorOptions, ZoneIngestor};
use nrgchamp::metrics::LedgerMetrics;
use nrgchamp::publisher::Publisher;
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

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_flag(&args, "--config").unwrap_or_else(|| "ledger.toml".to_string());
    let cfg = LedgerConfig::load(Path::new(&config_path))
        .with_context(|| format!("load ledger config {config_path}"))?;
    info!(config = %config_path, zones = cfg.zones.len(), grace_ms = cfg.grace_period_ms,
        "ledgerd starting");

    let bus: Arc<dyn PartitionedLog> = Arc::new(MemoryBus::new());
    for zone in &cfg.zones {
        bus.ensure_topic(&cfg.topic_for(zone), LEDGER_PARTITIONS)?;
    }
    if cfg.publisher.enabled {
        let public_partitions: u32 = std::env::var("NRGCHAMP_PUBLIC_PARTITIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);
        bus.ensure_topic(&cfg.publisher.topic, public_partitions)?;
    }

    let metrics = Arc::new(LedgerMetrics::default());
    let public_writer = Arc::new(Breaker::new("public-writer", cfg.breaker.clone()));
    let publisher = Arc::new(Publisher::start(
        cfg.publisher.clone(),
        Arc::clone(&bus),
        public_writer,
        Arc::clone(&metrics),
    ));

    let shutdown = Shutdown::new();
    let fatal = Arc::new(AtomicBool::new(false));
    let grace = Duration::from_millis(cfg.grace_period_ms);

    // Boot every zone before serving: ledger verification failures and
    // partition-contract violations must kill the process here.
    let mut indexes = Vec::new();
    let mut workers = Vec::new();
    for zone in &cfg.zones {
        let store = BlockStore::open(BlockStoreConfig {
            path: cfg.ledger_path_for(zone),
            max_block_txs: cfg.block_max_txs,
            max_block_bytes: cfg.block_max_bytes,
        })
        .with_context(|| format!("open ledger for zone {zone}"))?;
        let consumer =
            Arc::new(Breaker::new(format!("ledger-consumer-{zone}"), cfg.breaker.clone()));
        let mut ingestor = ZoneIngestor::new(
            IngestorOptions {
                zone: zone.clone(),
                topic: cfg.topic_for(zone),
                grace_ms: cfg.grace_period_ms as i64,
                buffer_max_epochs: cfg.buffer_max_epochs,
                schema_accept: cfg.schema_accept.clone(),
            },
            Arc::clone(&bus),
            consumer,
            store,
            Arc::clone(&publisher),
            Arc::clone(&metrics),
        )
        .with_context(|| format!("bind ingestor for zone {zone}"))?;
        indexes.push(ingestor.index());

        let shutdown = shutdown.clone();
        let fatal = Arc::clone(&fatal);
        let zone = zone.clone();
        workers.push(
            std::thread::Builder::new().name(format!("ingest-{zone}")).spawn(move || {
                while !shutdown.is_triggered() {
                    match ingestor.poll(Utc::now(), grace) {
                        Ok(_) => {}
                        Err(e @ IngestError::PartitionContract { .. }) => {
                            error!(zone = %zone, error = %e, "fatal partition contract violation");
                            fatal.store(true, Ordering::SeqCst);
                            shutdown.trigger();
                            return;
                        }
                        Err(e) => warn!(zone = %zone, error = %e, "ingest poll failed"),
                    }
                }
                if let Err(e) = ingestor.flush_open_block(Utc::now()) {
                    warn!(zone = %zone, error = %e, "final block flush failed");
                }
            })?,
        );
    }

    let addr = cfg.http_addr.clone().unwrap_or_else(|| "0.0.0.0:8082".to_string());
    let router = ledger_router(LedgerApiState { indexes, metrics: Arc::clone(&metrics) });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind http listener on {addr}"))?;
    info!(%addr, "ledger query api up");

    let sd = shutdown.clone();
    let server = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !sd.is_triggered() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
            .await
    };

    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.trigger();
        }
    }

    for worker in workers {
        tokio::task::spawn_blocking(move || worker.join())
            .await?
            .map_err(|_| anyhow::anyhow!("ingest thread panicked"))?;
    }
    // All ingestors are gone; drain the public queue under a deadline.
    if let Ok(publisher) = Arc::try_unwrap(publisher) {
        publisher.shutdown(Duration::from_secs(5));
    }
    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("ledgerd exited on a fatal partition contract violation");
    }
    info!("ledgerd stopped");
    Ok(())
}
