//! End-to-end epoch pipeline: device readings → aggregator → MAPE →
//! ledger matcher → chained block file → public payloads.
//!
//! Drives ten epochs over the in-process bus where one epoch loses its
//! aggregator side, one loses its MAPE side, and one is duplicated after
//! finalization, then replays the ledger file through the verifier.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use nrgchamp::aggregator::Aggregator;
use nrgchamp::blockstore::{verify_file, BlockStore, BlockStoreConfig, EventQuery};
use nrgchamp::breaker::{Breaker, BreakerConfig};
use nrgchamp::bus::{partition_for_key, MemoryBus, PartitionedLog};
use nrgchamp::canonical;
use nrgchamp::config::{
    AggregatorConfig, KeyMode, MapeConfig, Partitioner, PublisherConfig,
};
use nrgchamp::ingest::{IngestorOptions, ZoneIngestor};
use nrgchamp::mape::{MapeEngine, MapeRuntime};
use nrgchamp::metrics::{AggregatorMetrics, LedgerMetrics, MapeMetrics};
use nrgchamp::model::{
    DeviceType, EpochId, MapeDecision, PlannedAction, PublicEpoch, Reading, Transaction, SCHEMA_V1,
};
use nrgchamp::publisher::Publisher;

const EPOCH_MS: i64 = 60_000;
const ZONE: &str = "zone-a";
const DEVICE_TOPIC: &str = "device.readings.zone-a";
const LEDGER_TOPIC: &str = "zone.ledger.zone-a";
const PUBLIC_TOPIC: &str = "ledger.public.epochs";

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn reading(device_id: &str, device_type: DeviceType, ts: DateTime<Utc>, temp: Option<f64>, kw: Option<f64>) -> Reading {
    Reading {
        device_id: device_id.into(),
        zone_id: ZONE.into(),
        device_type,
        timestamp: ts,
        temp_c: temp,
        state: None,
        power_kw: kw,
        energy_kwh: None,
    }
}

fn inject_reading(bus: &MemoryBus, r: &Reading) {
    bus.append_at(DEVICE_TOPIC, 0, &r.device_id, &serde_json::to_vec(r).unwrap(), r.timestamp)
        .unwrap();
}

struct Pipeline {
    bus: Arc<MemoryBus>,
    aggregator: Aggregator,
    engine: MapeEngine,
    ingestor: ZoneIngestor,
    publisher: Arc<Publisher>,
    metrics: Arc<LedgerMetrics>,
    ledger_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MemoryBus::new());
    bus.ensure_topic(DEVICE_TOPIC, 1).unwrap();
    bus.ensure_topic("agg-to-mape", 1).unwrap();
    bus.ensure_topic("zone.commands.zone-a", 3).unwrap();
    bus.ensure_topic(LEDGER_TOPIC, 2).unwrap();
    bus.ensure_topic(PUBLIC_TOPIC, 2).unwrap();

    let breaker = BreakerConfig::default();

    let agg_cfg = AggregatorConfig {
        brokers: "mem".into(),
        topics: vec![DEVICE_TOPIC.into()],
        epoch_ms: EPOCH_MS,
        max_per_partition: 500,
        offsets_path: dir.path().join("offsets.json"),
        mape_topic: "agg-to-mape".into(),
        ledger_topic_template: "zone.ledger.{zone}".into(),
        ledger_partition_aggregator: 0,
        ledger_partition_mape: 1,
        outlier_z: 4.0,
        log_path: None,
        jitter_ms: 0,
        http_addr: None,
        breaker: breaker.clone(),
    };
    let aggregator = Aggregator::new(
        agg_cfg,
        bus.clone(),
        Arc::new(Breaker::new("aggregator-reader", breaker.clone())),
        Arc::new(Breaker::new("aggregator-writer", breaker.clone())),
        Arc::new(AggregatorMetrics::default()),
    )
    .unwrap();

    let props_path = dir.path().join("mape.properties");
    std::fs::write(
        &props_path,
        "zones=zone-a\ntarget=21.0\nhysteresis=0.5\n\
         fan.steps=0.5,1.0,2.0,4.0\nfan.speeds=25,50,75,100\n\
         actuators.heating.zone-a=heat-1\nactuators.cooling.zone-a=cool-1\n\
         actuators.ventilation.zone-a=vent-1\n",
    )
    .unwrap();
    let mape_cfg = MapeConfig {
        brokers: "mem".into(),
        aggregator_topic: "agg-to-mape".into(),
        actuator_topic_prefix: "zone.commands.".into(),
        ledger_topic_prefix: "zone.ledger.".into(),
        mape_partition_id: 1,
        poll_interval_ms: 100,
        properties_path: props_path,
        http_addr: None,
        breaker: breaker.clone(),
    };
    let runtime = Arc::new(MapeRuntime::load(&mape_cfg).unwrap());
    let engine = MapeEngine::new(
        mape_cfg,
        runtime,
        bus.clone(),
        Arc::new(Breaker::new("mape-reader", breaker.clone())),
        Arc::new(Breaker::new("mape-writer", breaker.clone())),
        Arc::new(MapeMetrics::default()),
    );

    let metrics = Arc::new(LedgerMetrics::default());
    let publisher = Arc::new(Publisher::start(
        PublisherConfig {
            enabled: true,
            topic: PUBLIC_TOPIC.into(),
            brokers: "mem".into(),
            acks: -1,
            partitioner: Partitioner::Hash,
            key_mode: KeyMode::Epoch,
            schema_version: "v1".into(),
            queue_depth: 256,
        },
        bus.clone(),
        Arc::new(Breaker::new("public-writer", breaker.clone())),
        Arc::clone(&metrics),
    ));

    let ledger_path = dir.path().join("zone-a.ledger");
    let store = BlockStore::open(BlockStoreConfig {
        path: ledger_path.clone(),
        max_block_txs: 3,
        max_block_bytes: 1 << 20,
    })
    .unwrap();
    let ingestor = ZoneIngestor::new(
        IngestorOptions {
            zone: ZONE.into(),
            topic: LEDGER_TOPIC.into(),
            grace_ms: 2_000,
            buffer_max_epochs: 200,
            schema_accept: vec!["v1".into()],
        },
        bus.clone(),
        Arc::new(Breaker::new("ledger-consumer", breaker)),
        store,
        Arc::clone(&publisher),
        Arc::clone(&metrics),
    )
    .unwrap();

    Pipeline {
        bus,
        aggregator,
        engine,
        ingestor,
        publisher,
        metrics,
        ledger_path,
        _dir: dir,
    }
}

#[test]
fn ten_epoch_run_with_losses_and_duplicates_replays_clean() {
    let mut p = pipeline();
    let lost_aggregator_epoch = 4i64;
    let lost_mape_epoch = 7i64;

    for epoch in 1..=10i64 {
        let base = epoch * EPOCH_MS;
        let tick_at = at(base + 50_000);

        if epoch == lost_aggregator_epoch {
            // The aggregator never reports this epoch; a decision still
            // arrives on partition 1 (scenario: imputed aggregator).
            let bounds = EpochId::from_index(epoch, EPOCH_MS);
            let decision = MapeDecision {
                schema_version: SCHEMA_V1.into(),
                epoch_index: epoch,
                zone_id: ZONE.into(),
                planned: PlannedAction::Heat,
                target_c: 19.5,
                hysteresis_c: 0.5,
                delta_c: -1.2,
                fan: 50,
                epoch_start: canonical::rfc3339_nano(&bounds.start),
                epoch_end: canonical::rfc3339_nano(&bounds.end),
                timestamp: tick_at.timestamp_millis(),
            };
            p.bus
                .append(LEDGER_TOPIC, 1, "zone-a|mape", &serde_json::to_vec(&decision).unwrap())
                .unwrap();
        } else {
            // Temperature drifts with the epoch so the planner exercises
            // heat, cool, and hold.
            let temp = 19.0 + epoch as f64 * 0.5;
            inject_reading(
                &p.bus,
                &reading("t-1", DeviceType::TempSensor, at(base + 5_000), Some(temp), None),
            );
            inject_reading(
                &p.bus,
                &reading("t-1", DeviceType::TempSensor, at(base + 25_000), Some(temp + 0.2), None),
            );
            inject_reading(
                &p.bus,
                &reading("h-1", DeviceType::ActHeating, at(base + 10_000), None, Some(1.0)),
            );
            p.aggregator.tick(tick_at).unwrap();

            if epoch != lost_mape_epoch {
                // The engine consumes the freshest document and emits one
                // decision onto partition 1.
                p.engine.tick(at(base + 51_000));
            }
        }

        p.ingestor.poll(at(base + 52_000), Duration::ZERO).unwrap();
    }

    // Let the grace window lapse for whatever is still pending, then
    // replay a duplicate of the epoch-1 aggregator document.
    p.ingestor.poll(at(11 * EPOCH_MS + 55_000), Duration::ZERO).unwrap();
    let original = p.bus.fetch(LEDGER_TOPIC, 0, 0, 1, Duration::ZERO).unwrap();
    p.bus.append(LEDGER_TOPIC, 0, "zone-a|agg", &original[0].payload).unwrap();
    p.ingestor.poll(at(11 * EPOCH_MS + 56_000), Duration::ZERO).unwrap();

    p.ingestor.flush_open_block(at(12 * EPOCH_MS)).unwrap();

    // ------------------------------------------------------------------
    // Ledger content: one transaction per epoch, imputed sides marked.
    // ------------------------------------------------------------------
    let index = p.ingestor.index();
    let entries = {
        let guard = index.read().unwrap();
        nrgchamp::blockstore::query_entries(&guard, &EventQuery { size: 100, ..EventQuery::default() })
    };
    assert_eq!(entries.len(), 10, "exactly one transaction per epoch");
    let mut epochs: Vec<i64> = entries.iter().filter_map(|e| e.epoch_index).collect();
    epochs.sort_unstable();
    assert_eq!(epochs, (1..=10).collect::<Vec<_>>());

    let tx_for = |epoch: i64| -> Transaction {
        let entry = entries.iter().find(|e| e.epoch_index == Some(epoch)).unwrap();
        serde_json::from_value(entry.value.clone()).unwrap()
    };

    let imputed_agg = tx_for(lost_aggregator_epoch);
    assert_eq!(imputed_agg.aggregator.summary.get("imputed"), Some(&1.0));
    assert!(imputed_agg.aggregator.by_device.is_empty());
    assert_eq!(imputed_agg.mape.planned, PlannedAction::Heat);
    assert_eq!(imputed_agg.mape.fan, 50);

    let imputed_mape = tx_for(lost_mape_epoch);
    assert_eq!(imputed_mape.mape.planned, PlannedAction::Hold);
    assert_eq!(imputed_mape.mape.fan, 0);
    assert!(!imputed_mape.aggregator.by_device.is_empty(), "real aggregator side kept");

    let matched = tx_for(2);
    assert!(matched.aggregator.summary.contains_key("avgTemp"));
    assert!(matched.aggregator.summary.contains_key("zoneEnergyKWhEpoch"));
    let sum: f64 = matched.aggregator.actuator_energy_kwh_epoch.values().sum();
    assert!((matched.aggregator.zone_energy_kwh_epoch - sum).abs() < 1e-9);

    assert_eq!(p.metrics.imputed_total.load(Ordering::Relaxed), 2);

    // ------------------------------------------------------------------
    // Replay + verification: chain, Merkle roots, heights.
    // ------------------------------------------------------------------
    let summary = verify_file(&p.ledger_path).unwrap();
    assert_eq!(summary.transactions, 10);
    assert_eq!(summary.blocks, 4, "3+3+3+1 under the 3-transaction flush threshold");
    assert_eq!(summary.next_height, 4, "heights 0..=3, monotonic");
    assert_eq!(summary.v1_events, 0);

    // The chain tail in the file matches the in-memory tail.
    let txs: Vec<Transaction> =
        entries.iter().map(|e| serde_json::from_value(e.value.clone()).unwrap()).collect();
    for pair in txs.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
    }
    assert_eq!(txs[0].prev_hash, "");
    assert_eq!(summary.last_tx_hash, txs.last().unwrap().hash);

    // ------------------------------------------------------------------
    // Public payloads: one per finalized epoch, summary only.
    // ------------------------------------------------------------------
    drop(p.ingestor);
    Arc::try_unwrap(p.publisher).ok().expect("sole publisher handle").shutdown(
        Duration::from_secs(5),
    );

    let mut public: Vec<PublicEpoch> = Vec::new();
    for partition in 0..2 {
        for rec in p.bus.fetch(PUBLIC_TOPIC, partition, 0, 100, Duration::ZERO).unwrap() {
            public.push(serde_json::from_slice(&rec.payload).unwrap());
        }
    }
    assert_eq!(public.len(), 10);
    let mut public_epochs: Vec<i64> = public.iter().map(|p| p.epoch_index).collect();
    public_epochs.sort_unstable();
    assert_eq!(public_epochs, (1..=10).collect::<Vec<_>>());
    for payload in &public {
        let v = serde_json::to_value(payload).unwrap();
        assert!(v["aggregator"].get("byDevice").is_none(), "no device-level arrays");
        assert!(canonical::is_lower_hex(&payload.block.header_hash));
        assert!(payload.block.height >= 0);
    }
    assert_eq!(p.metrics.public_publish_ok.load(Ordering::Relaxed), 10);
    assert_eq!(p.metrics.public_publish_fail.load(Ordering::Relaxed), 0);
}

#[test]
fn actuator_commands_route_by_murmur2_key() {
    let mut p = pipeline();
    let base = EPOCH_MS;
    inject_reading(
        &p.bus,
        &reading("t-1", DeviceType::TempSensor, at(base + 5_000), Some(24.0), None),
    );
    p.aggregator.tick(at(base + 50_000)).unwrap();
    p.engine.tick(at(base + 51_000));

    // 24.0 vs target 21.0 ⇒ cool; commands for all three actuators land
    // on the partition their id hashes to.
    for id in ["heat-1", "cool-1", "vent-1"] {
        let partition = partition_for_key(id, 3);
        let recs = p.bus.fetch("zone.commands.zone-a", partition, 0, 100, Duration::ZERO).unwrap();
        assert!(
            recs.iter().any(|r| r.key == id),
            "command for {id} must sit on partition {partition}"
        );
    }
}
