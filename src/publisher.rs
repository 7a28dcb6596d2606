//! Public epoch publisher
//!
//! When a block flushes, every transaction in it is projected into a
//! PII-free [`PublicEpoch`] (summary only, no device arrays) and handed
//! to a bounded queue. A single worker drains the queue and writes one
//! message per payload to the configured public topic, with the key and
//! partition chosen by configuration.
//!
//! Back-pressure rejects callers: when the queue is full the enqueue
//! fails immediately rather than blocking the ingestor. Failed deliveries
//! count and stamp a last-error gauge but are not retried from the queue;
//! recovery is the circuit breaker's concern.
//!
//! Publishing is disabled by default; a disabled publisher's hook is a
//! no-op.

#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::breaker::Breaker;
use crate::bus::{PartitionedLog, RoundRobin};
use crate::canonical::{self, CanonicalError};
use crate::config::{KeyMode, Partitioner, PublisherConfig};
use crate::metrics::LedgerMetrics;
use crate::model::{
    BlockRef, PlannedAction, PublicAggregator, PublicEpoch, PublicMape, Transaction,
    PUBLIC_EPOCH_TYPE,
};

/// Errors surfaced to the finalization hook.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("public payload invalid: {0}")]
    Invalid(String),
    #[error("publisher queue full")]
    QueueFull,
    #[error("publisher stopped")]
    Stopped,
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

// ============================================================================
// Projection and validation
// ============================================================================

/// Project a finalized transaction and its block coordinates into the
/// public payload.
pub fn project(tx: &Transaction, block: BlockRef, schema_version: &str) -> PublicEpoch {
    PublicEpoch {
        payload_type: PUBLIC_EPOCH_TYPE.to_string(),
        schema_version: schema_version.to_string(),
        zone_id: tx.zone_id.clone(),
        epoch_index: tx.epoch_index,
        matched_at: tx.matched_at,
        block,
        aggregator: PublicAggregator { summary: tx.aggregator.summary.clone() },
        mape: PublicMape {
            planned: tx.mape.planned,
            target_c: tx.mape.target_c,
            delta_c: tx.mape.delta_c,
            fan: tx.mape.fan,
        },
    }
}

/// Reject malformed payloads before they reach the queue.
pub fn validate(p: &PublicEpoch) -> Result<(), PublishError> {
    let fail = |msg: String| Err(PublishError::Invalid(msg));
    if p.payload_type != PUBLIC_EPOCH_TYPE {
        return fail(format!("type {:?}", p.payload_type));
    }
    if p.schema_version.is_empty() {
        return fail("empty schemaVersion".into());
    }
    if p.zone_id.is_empty() {
        return fail("empty zoneId".into());
    }
    if p.epoch_index < 0 {
        return fail(format!("negative epochIndex {}", p.epoch_index));
    }
    if p.matched_at.timestamp_millis() == 0 {
        return fail("zero matchedAt".into());
    }
    if !canonical::is_lower_hex(&p.block.header_hash) || !canonical::is_lower_hex(&p.block.data_hash)
    {
        return fail("block hashes must be lowercase hex".into());
    }
    // The enum already pins planned to heat/cool/hold; numeric fields must
    // be finite for canonical serialization.
    let numbers = [p.mape.target_c, p.mape.delta_c];
    if numbers.iter().any(|n| !n.is_finite())
        || p.aggregator.summary.values().any(|n| !n.is_finite())
    {
        return fail("non-finite numeric field".into());
    }
    let _: PlannedAction = p.mape.planned;
    Ok(())
}

/// Topic key for a payload under the configured key mode.
pub fn key_for(mode: KeyMode, p: &PublicEpoch) -> String {
    match mode {
        KeyMode::Zone => p.zone_id.clone(),
        KeyMode::Epoch => format!("{}:{}", p.zone_id, p.epoch_index),
        KeyMode::None => String::new(),
    }
}

// ============================================================================
// Queue + worker
// ============================================================================

/// The publisher hook handed to the ingestor. Disabled publishers carry
/// no worker and ignore every call.
pub struct Publisher {
    inner: Option<Inner>,
}

struct Inner {
    cfg: PublisherConfig,
    queue: SyncSender<PublicEpoch>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<LedgerMetrics>,
}

impl Publisher {
    /// A no-op hook (publishing disabled).
    pub fn disabled() -> Self {
        Publisher { inner: None }
    }

    /// Start the worker thread against `bus`. Honors `cfg.enabled`.
    pub fn start(
        cfg: PublisherConfig,
        bus: Arc<dyn PartitionedLog>,
        breaker: Arc<Breaker>,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }
        let (tx, rx) = sync_channel::<PublicEpoch>(cfg.queue_depth);
        let worker_cfg = cfg.clone();
        let worker_metrics = Arc::clone(&metrics);
        let worker = std::thread::Builder::new()
            .name("public-publisher".into())
            .spawn(move || worker_loop(worker_cfg, bus, breaker, worker_metrics, rx))
            .expect("spawn publisher worker");
        info!(topic = %cfg.topic, "public publisher started");
        Publisher { inner: Some(Inner { cfg, queue: tx, worker: Some(worker), metrics }) }
    }

    /// True when a worker is running.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Project, validate, and enqueue one finalized transaction. A full
    /// queue rejects the caller immediately.
    pub fn publish(&self, tx: &Transaction, block: BlockRef) -> Result<(), PublishError> {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let payload = project(tx, block, &inner.cfg.schema_version);
        validate(&payload)?;
        match inner.queue.try_send(payload) {
            Ok(()) => {
                inner.metrics.public_queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(zone = %tx.zone_id, epoch = tx.epoch_index, "public queue full; payload rejected");
                Err(PublishError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(PublishError::Stopped),
        }
    }

    /// Stop accepting payloads and let the worker drain what is queued.
    /// Waits at most `deadline` for the drain.
    pub fn shutdown(self, deadline: Duration) {
        if let Some(mut inner) = self.inner {
            drop(inner.queue);
            if let Some(worker) = inner.worker.take() {
                let (done_tx, done_rx) = sync_channel::<()>(1);
                std::thread::spawn(move || {
                    let _ = worker.join();
                    let _ = done_tx.send(());
                });
                if done_rx.recv_timeout(deadline).is_err() {
                    warn!("public publisher did not drain before the shutdown deadline");
                }
            }
        }
    }
}

fn worker_loop(
    cfg: PublisherConfig,
    bus: Arc<dyn PartitionedLog>,
    breaker: Arc<Breaker>,
    metrics: Arc<LedgerMetrics>,
    rx: Receiver<PublicEpoch>,
) {
    let rr = RoundRobin::new();
    while let Ok(payload) = rx.recv() {
        metrics.public_queue_depth.fetch_sub(1, Ordering::Relaxed);
        let bytes = match canonical::to_canonical_json(&payload) {
            Ok(s) => s.into_bytes(),
            Err(e) => {
                warn!(error = %e, "public payload serialization failed");
                metrics.public_publish_fail.fetch_add(1, Ordering::Relaxed);
                metrics.public_last_error_ts.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                continue;
            }
        };
        let key = key_for(cfg.key_mode, &payload);
        let result = breaker.call(|| match cfg.partitioner {
            Partitioner::Hash => bus.append_keyed(&cfg.topic, &key, &bytes).map(|_| ()),
            Partitioner::Roundrobin => {
                let partitions = bus.partitions(&cfg.topic)?;
                bus.append(&cfg.topic, rr.next(partitions), &key, &bytes).map(|_| ())
            }
        });
        match result {
            Ok(()) => {
                metrics.public_publish_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // No retry from the queue; the breaker governs recovery.
                warn!(zone = %payload.zone_id, epoch = payload.epoch_index, error = %e,
                    "public publish failed");
                metrics.public_publish_fail.fetch_add(1, Ordering::Relaxed);
                metrics.public_last_error_ts.store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::bus::MemoryBus;
    use crate::model::{AggregatedEpoch, EpochId, MapeDecision, SCHEMA_V1, TX_TYPE_EPOCH_MATCH};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn sample_tx() -> Transaction {
        let epoch = EpochId::from_index(3, 60_000);
        Transaction {
            tx_type: TX_TYPE_EPOCH_MATCH.into(),
            schema_version: SCHEMA_V1.into(),
            zone_id: "zone-a".into(),
            epoch_index: 3,
            aggregator: AggregatedEpoch {
                schema_version: SCHEMA_V1.into(),
                zone_id: "zone-a".into(),
                epoch: epoch.clone(),
                by_device: BTreeMap::from([(
                    "t-1".to_string(),
                    vec![],
                )]),
                summary: BTreeMap::from([
                    ("avgTemp".to_string(), 21.5),
                    ("zoneEnergyKWhEpoch".to_string(), 0.25),
                ]),
                actuator_energy_kwh_epoch: BTreeMap::new(),
                zone_energy_kwh_epoch: 0.25,
                produced_at: epoch.end,
            },
            aggregator_received_at: epoch.end,
            mape: MapeDecision {
                schema_version: SCHEMA_V1.into(),
                epoch_index: 3,
                zone_id: "zone-a".into(),
                planned: PlannedAction::Cool,
                target_c: 21.0,
                hysteresis_c: 0.5,
                delta_c: 1.0,
                fan: 25,
                epoch_start: canonical::rfc3339_nano(&epoch.start),
                epoch_end: canonical::rfc3339_nano(&epoch.end),
                timestamp: epoch.end.timestamp_millis(),
            },
            mape_received_at: epoch.end,
            matched_at: Utc.timestamp_millis_opt(240_500).unwrap(),
            prev_hash: String::new(),
            hash: "ab".repeat(32),
        }
    }

    fn block_ref() -> BlockRef {
        BlockRef { height: 0, header_hash: "cd".repeat(32), data_hash: "ef".repeat(32) }
    }

    #[test]
    fn projection_strips_device_arrays() {
        let p = project(&sample_tx(), block_ref(), "v1");
        validate(&p).unwrap();
        let v = serde_json::to_value(&p).unwrap();
        assert!(v["aggregator"].get("byDevice").is_none());
        assert_eq!(v["aggregator"]["summary"]["avgTemp"], 21.5);
        assert_eq!(v["mape"]["planned"], "cool");
        assert_eq!(v["block"]["height"], 0);
        assert_eq!(v["type"], "epoch.public");
    }

    #[test]
    fn public_payload_is_bit_stable() {
        let p = project(&sample_tx(), block_ref(), "v1");
        let a = canonical::to_canonical_json(&p).unwrap();
        let reparsed: PublicEpoch = serde_json::from_str(&a).unwrap();
        let b = canonical::to_canonical_json(&reparsed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn validation_rejects_bad_payloads() {
        let base = project(&sample_tx(), block_ref(), "v1");

        let mut p = base.clone();
        p.zone_id.clear();
        assert!(validate(&p).is_err());

        let mut p = base.clone();
        p.epoch_index = -1;
        assert!(validate(&p).is_err());

        let mut p = base.clone();
        p.block.header_hash = "NOTHEX".into();
        assert!(validate(&p).is_err());

        let mut p = base.clone();
        p.mape.delta_c = f64::NAN;
        assert!(validate(&p).is_err());

        let mut p = base;
        p.payload_type = "epoch.private".into();
        assert!(validate(&p).is_err());
    }

    #[test]
    fn key_modes() {
        let p = project(&sample_tx(), block_ref(), "v1");
        assert_eq!(key_for(KeyMode::Zone, &p), "zone-a");
        assert_eq!(key_for(KeyMode::Epoch, &p), "zone-a:3");
        assert_eq!(key_for(KeyMode::None, &p), "");
    }

    #[test]
    fn disabled_publisher_is_a_noop() {
        let p = Publisher::disabled();
        assert!(!p.is_enabled());
        p.publish(&sample_tx(), block_ref()).unwrap();
    }

    #[test]
    fn delivery_failure_counts_and_stamps_last_error() {
        // The public topic is never created, so every delivery fails.
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(LedgerMetrics::default());
        let cfg = PublisherConfig { enabled: true, ..PublisherConfig::default() };
        let publisher = Publisher::start(
            cfg,
            bus,
            Arc::new(Breaker::new("public-writer", BreakerConfig::default())),
            Arc::clone(&metrics),
        );
        publisher.publish(&sample_tx(), block_ref()).unwrap();
        publisher.shutdown(Duration::from_secs(2));

        assert_eq!(metrics.public_publish_ok.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.public_publish_fail.load(Ordering::Relaxed), 1);
        assert!(metrics.public_last_error_ts.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn worker_delivers_to_the_public_topic() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_topic("ledger.public.epochs", 2).unwrap();
        let metrics = Arc::new(LedgerMetrics::default());
        let cfg = PublisherConfig { enabled: true, ..PublisherConfig::default() };
        let publisher = Publisher::start(
            cfg,
            bus.clone(),
            Arc::new(Breaker::new("public-writer", BreakerConfig::default())),
            Arc::clone(&metrics),
        );

        publisher.publish(&sample_tx(), block_ref()).unwrap();
        publisher.shutdown(Duration::from_secs(2));

        let partition = crate::bus::partition_for_key("zone-a", 2);
        let got = bus
            .fetch("ledger.public.epochs", partition, 0, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key, "zone-a");
        let payload: PublicEpoch = serde_json::from_slice(&got[0].payload).unwrap();
        assert_eq!(payload.epoch_index, 3);
        assert_eq!(metrics.public_publish_ok.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.public_publish_fail.load(Ordering::Relaxed), 0);
    }
}
