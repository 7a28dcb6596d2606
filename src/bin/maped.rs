//! MAPE daemon
//!
//! Runs the Monitor→Analyze→Plan→Execute loop over every zone in the
//! properties file and serves the setpoint API:
//!
//! - `GET  /config/temperature`            all runtime setpoints
//! - `GET  /config/temperature/{zone}`     one zone (404 when unknown)
//! - `PUT  /config/temperature/{zone}`     `{"setpointC": <number>}`
//! - `POST /config/reload`                 re-read properties, reset all
//!
//! Setpoint changes take effect on the next tick.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::info;

use nrgchamp::breaker::Breaker;
use nrgchamp::bus::{MemoryBus, PartitionedLog, LEDGER_PARTITIONS};
use nrgchamp::config::MapeConfig;
use nrgchamp::http::{mape_router, MapeApiState};
use nrgchamp::mape::{MapeEngine, MapeRuntime};
use nrgchamp::metrics::MapeMetrics;
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
    let config_path = parse_flag(&args, "--config").unwrap_or_else(|| "mape.toml".to_string());
    let cfg = MapeConfig::load(Path::new(&config_path))
        .with_context(|| format!("load mape config {config_path}"))?;
    let runtime = Arc::new(MapeRuntime::load(&cfg)?);
    let zones = runtime.properties.read().unwrap().zones.clone();
    info!(config = %config_path, zones = zones.len(), "maped starting");

    let bus: Arc<dyn PartitionedLog> = Arc::new(MemoryBus::new());
    bus.ensure_topic(&cfg.aggregator_topic, zones.len().max(1) as u32)?;
    let command_partitions: u32 = std::env::var("NRGCHAMP_COMMAND_PARTITIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    for zone in &zones {
        bus.ensure_topic(&cfg.command_topic_for(zone), command_partitions)?;
        bus.ensure_topic(&cfg.ledger_topic_for(zone), LEDGER_PARTITIONS)?;
    }

    let metrics = Arc::new(MapeMetrics::default());
    let reader = Arc::new(Breaker::new("mape-reader", cfg.breaker.clone()));
    let writer = Arc::new(Breaker::new("mape-writer", cfg.breaker.clone()));
    let mut engine = MapeEngine::new(
        cfg.clone(),
        Arc::clone(&runtime),
        Arc::clone(&bus),
        reader,
        writer,
        Arc::clone(&metrics),
    );

    let shutdown = Shutdown::new();
    let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
    let looper = {
        let shutdown = shutdown.clone();
        std::thread::Builder::new().name("mape-loop".into()).spawn(move || loop {
            if shutdown.wait_timeout(poll_interval) {
                break;
            }
            engine.tick(Utc::now());
        })?
    };

    let addr = cfg.http_addr.clone().unwrap_or_else(|| "0.0.0.0:8081".to_string());
    let router = mape_router(MapeApiState { runtime, metrics });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind http listener on {addr}"))?;
    info!(%addr, "setpoint api up");

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

    tokio::task::spawn_blocking(move || looper.join())
        .await?
        .map_err(|_| anyhow::anyhow!("mape loop thread panicked"))?;
    info!("maped stopped");
    Ok(())
}
