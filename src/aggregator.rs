//! Aggregator: epoch-aligned consumption and per-zone aggregation
//!
//! One instance owns a set of zones. A wall-clock ticker fires once per
//! epoch (plus a small random jitter so instances desynchronize); each
//! tick drains the owned device-reading topics partition by partition and
//! emits exactly one [`AggregatedEpoch`] per zone for the epoch the tick
//! landed in.
//!
//! ## Drain protocol
//!
//! Per partition, starting from the persisted committed offset + 1:
//!
//! - a message whose epoch precedes the tick epoch is late: the offset
//!   advances and the message is not included;
//! - a message in the tick epoch is decoded and included (decode failures
//!   advance the offset and count);
//! - the first message from a *future* epoch stops the drain for that
//!   partition, and the offset does not advance past it.
//!
//! Offsets are committed and persisted only after the epoch document is
//! successfully emitted, so a failed emission replays the same records on
//! a later tick.
//!
//! ## Energy integration
//!
//! Actuator power samples integrate piecewise-constant, using the
//! previous sample's value over each interval, with the last observed
//! power from earlier epochs (`carry`) as the prefix value. The carry
//! also covers sample-free epochs: a device that reported 1 kW once keeps
//! accruing 1 kW until it reports again.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::breaker::{Breaker, BreakerError};
use crate::bus::{BusError, PartitionedLog, Record, LEDGER_PARTITIONS, OffsetStore};
use crate::canonical::{self, CanonicalError};
use crate::config::AggregatorConfig;
use crate::metrics::AggregatorMetrics;
use crate::model::{epoch_index_of, AggregatedEpoch, EpochId, Reading, SCHEMA_V1};

/// Errors surfaced by the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("ledger topic {topic} has {partitions} partitions, expected {LEDGER_PARTITIONS}")]
    LedgerTopology { topic: String, partitions: u32 },
    #[error("topic {topic} partition count changed from {was} to {now}; restart required")]
    TopologyChanged { topic: String, was: u32, now: u32 },
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

impl From<BreakerError<BusError>> for AggregatorError {
    fn from(e: BreakerError<BusError>) -> Self {
        match e {
            BreakerError::Open(name) => AggregatorError::CircuitOpen(name),
            BreakerError::Inner(e) => AggregatorError::Bus(e),
        }
    }
}

// ============================================================================
// Outlier filtering
// ============================================================================

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, var.sqrt())
}

fn field_values(readings: &[Reading], field: impl Fn(&Reading) -> Option<f64>) -> Vec<f64> {
    readings.iter().filter_map(&field).collect()
}

/// Drop readings whose z-score exceeds `z_max` on any present field among
/// temperature, power (watts), and cumulative energy. A zero standard
/// deviation imposes no constraint on that field.
pub fn filter_outliers(readings: Vec<Reading>, z_max: f64) -> (Vec<Reading>, usize) {
    let temp = mean_std(&field_values(&readings, |r| r.temp_c));
    let power = mean_std(&field_values(&readings, |r| r.power_kw.map(|kw| kw * 1000.0)));
    let energy = mean_std(&field_values(&readings, |r| r.energy_kwh));

    let keeps = |value: Option<f64>, (mean, std): (f64, f64)| match value {
        Some(v) if std > 0.0 => ((v - mean) / std).abs() <= z_max,
        _ => true,
    };

    let before = readings.len();
    let kept: Vec<Reading> = readings
        .into_iter()
        .filter(|r| {
            keeps(r.temp_c, temp)
                && keeps(r.power_kw.map(|kw| kw * 1000.0), power)
                && keeps(r.energy_kwh, energy)
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

// ============================================================================
// Energy integration
// ============================================================================

fn hours_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_milliseconds().max(0) as f64 / 3_600_000.0
}

/// Integrate one device's power samples over an epoch.
///
/// `samples` are (timestamp, powerKW) pairs in arrival order. Timestamps
/// are clamped into the epoch window and duplicate timestamps keep the
/// last value. Returns the epoch energy in kWh and the new carry (the
/// last sample's power, or the old carry when no samples arrived).
pub fn integrate_epoch_energy(
    samples: &[(DateTime<Utc>, f64)],
    carry: Option<f64>,
    epoch: &EpochId,
) -> (f64, Option<f64>) {
    let mut pts: Vec<(DateTime<Utc>, f64)> = samples
        .iter()
        .map(|(t, p)| ((*t).clamp(epoch.start, epoch.end), *p))
        .collect();
    pts.sort_by_key(|(t, _)| *t);
    // Keep the last value for duplicate timestamps.
    let mut dedup: Vec<(DateTime<Utc>, f64)> = Vec::with_capacity(pts.len());
    for (t, p) in pts {
        match dedup.last_mut() {
            Some((last_t, last_p)) if *last_t == t => *last_p = p,
            _ => dedup.push((t, p)),
        }
    }

    if dedup.is_empty() {
        return match carry {
            Some(p) => (p.max(0.0) * epoch.len_hours(), carry),
            None => (0.0, None),
        };
    }

    let mut energy = 0.0;
    let mut prev_t = epoch.start;
    let mut prev_p = carry;
    for (t, p) in &dedup {
        if let Some(pp) = prev_p {
            energy += pp.max(0.0) * hours_between(prev_t, *t);
        }
        prev_t = *t;
        prev_p = Some(*p);
    }
    if let Some(pp) = prev_p {
        energy += pp.max(0.0) * hours_between(prev_t, epoch.end);
    }
    (energy, prev_p)
}

// ============================================================================
// Aggregation
// ============================================================================

/// Outcome of building one zone's epoch document: the document itself and
/// the per-device carries to apply once it is emitted.
pub struct BuiltEpoch {
    pub doc: AggregatedEpoch,
    pub new_carries: HashMap<String, f64>,
}

/// Build the aggregated document for `zone` and `epoch` from cleaned
/// readings, with `carries` holding each device's last known power from
/// earlier epochs.
pub fn build_epoch(
    zone: &str,
    epoch: &EpochId,
    cleaned: Vec<Reading>,
    carries: &HashMap<String, f64>,
    produced_at: DateTime<Utc>,
) -> BuiltEpoch {
    let mut by_device: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
    for r in cleaned {
        by_device.entry(r.device_id.clone()).or_default().push(r);
    }

    let mut summary: BTreeMap<String, f64> = BTreeMap::new();
    let temps: Vec<f64> =
        by_device.values().flatten().filter_map(|r| r.temp_c).collect();
    if !temps.is_empty() {
        summary.insert("avgTemp".into(), temps.iter().sum::<f64>() / temps.len() as f64);
    }
    let powers: Vec<f64> =
        by_device.values().flatten().filter_map(|r| r.power_kw.map(|kw| kw * 1000.0)).collect();
    if !powers.is_empty() {
        summary.insert("avgPowerW".into(), powers.iter().sum::<f64>() / powers.len() as f64);
    }

    // Energy per actuator: every actuator with samples this epoch, plus
    // every device still carrying power from earlier epochs.
    let mut energy_devices: BTreeMap<String, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
    for (dev, readings) in &by_device {
        if readings.iter().any(|r| r.device_type.is_actuator()) {
            let samples: Vec<(DateTime<Utc>, f64)> = readings
                .iter()
                .filter_map(|r| r.power_kw.map(|kw| (r.timestamp, kw)))
                .collect();
            energy_devices.insert(dev.clone(), samples);
        }
    }
    for dev in carries.keys() {
        energy_devices.entry(dev.clone()).or_default();
    }

    let mut actuator_energy: BTreeMap<String, f64> = BTreeMap::new();
    let mut new_carries: HashMap<String, f64> = HashMap::new();
    let mut zone_energy = 0.0;
    for (dev, samples) in &energy_devices {
        let carry = carries.get(dev).copied();
        let (kwh, new_carry) = integrate_epoch_energy(samples, carry, epoch);
        zone_energy += kwh;
        actuator_energy.insert(dev.clone(), kwh);
        if let Some(c) = new_carry {
            new_carries.insert(dev.clone(), c);
        }
    }
    summary.insert("zoneEnergyKWhEpoch".into(), zone_energy);

    BuiltEpoch {
        doc: AggregatedEpoch {
            schema_version: SCHEMA_V1.into(),
            zone_id: zone.to_string(),
            epoch: epoch.clone(),
            by_device,
            summary,
            actuator_energy_kwh_epoch: actuator_energy,
            zone_energy_kwh_epoch: zone_energy,
            produced_at,
        },
        new_carries,
    }
}

// ============================================================================
// Service
// ============================================================================

/// Per-partition drain result: readings attributed to the tick epoch and
/// the next fetch position reached.
struct PartitionDrain {
    included: Vec<Reading>,
    next_offset: Option<u64>,
    late: u64,
    decode_errors: u64,
}

/// The aggregator service for one set of owned zones.
pub struct Aggregator {
    cfg: AggregatorConfig,
    bus: Arc<dyn PartitionedLog>,
    offsets: OffsetStore,
    reader: Arc<Breaker>,
    writer: Arc<Breaker>,
    metrics: Arc<AggregatorMetrics>,
    /// Last observed powerKW per (zone, device).
    carries: HashMap<String, HashMap<String, f64>>,
    last_emitted: HashMap<String, i64>,
    /// Partition counts snapshotted at startup; a change later is fatal.
    partition_counts: HashMap<String, u32>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Wire up the service and verify the partition contract: every owned
    /// zone's ledger topic must have exactly two partitions.
    pub fn new(
        cfg: AggregatorConfig,
        bus: Arc<dyn PartitionedLog>,
        reader: Arc<Breaker>,
        writer: Arc<Breaker>,
        metrics: Arc<AggregatorMetrics>,
    ) -> Result<Self, AggregatorError> {
        let offsets = OffsetStore::open(&cfg.offsets_path)?;
        let mut partition_counts = HashMap::new();
        for topic in &cfg.topics {
            let zone = AggregatorConfig::zone_of_topic(topic);
            let ledger_topic = cfg.ledger_topic_for(zone);
            let n = bus.partitions(&ledger_topic)?;
            if n != LEDGER_PARTITIONS {
                return Err(AggregatorError::LedgerTopology { topic: ledger_topic, partitions: n });
            }
            partition_counts.insert(topic.clone(), bus.partitions(topic)?);
        }
        Ok(Aggregator {
            cfg,
            bus,
            offsets,
            reader,
            writer,
            metrics,
            carries: HashMap::new(),
            last_emitted: HashMap::new(),
            partition_counts,
        })
    }

    /// Run one tick at wall time `now` across all owned zones.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), AggregatorError> {
        for topic in self.cfg.topics.clone() {
            let zone = AggregatorConfig::zone_of_topic(&topic).to_string();
            if let Err(e) = self.tick_zone(&topic, &zone, now) {
                match e {
                    AggregatorError::TopologyChanged { .. } => return Err(e),
                    AggregatorError::LedgerTopology { .. } => return Err(e),
                    other => {
                        warn!(zone = %zone, error = %other, "zone tick failed; will retry next epoch");
                    }
                }
            }
        }
        Ok(())
    }

    fn tick_zone(
        &mut self,
        topic: &str,
        zone: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AggregatorError> {
        let epoch = EpochId::containing(&now, self.cfg.epoch_ms);
        if self.last_emitted.get(zone) == Some(&epoch.index) {
            return Ok(());
        }

        let expected = *self.partition_counts.get(topic).unwrap_or(&0);
        let current = self.bus.partitions(topic)?;
        if current != expected {
            return Err(AggregatorError::TopologyChanged {
                topic: topic.to_string(),
                was: expected,
                now: current,
            });
        }

        // Round-robin over partitions; each drains up to max_per_partition.
        let mut included: Vec<Reading> = Vec::new();
        let mut advances: Vec<(u32, u64)> = Vec::new();
        let mut late = 0u64;
        let mut decode_errors = 0u64;
        for partition in 0..current {
            let drain = self.drain_partition(topic, partition, epoch.index)?;
            included.extend(drain.included);
            late += drain.late;
            decode_errors += drain.decode_errors;
            if let Some(next) = drain.next_offset {
                advances.push((partition, next));
            }
        }

        let (cleaned, dropped) = filter_outliers(included, self.cfg.outlier_z);
        let zone_carries = self.carries.entry(zone.to_string()).or_default().clone();
        let built = build_epoch(zone, &epoch, cleaned, &zone_carries, now);

        self.emit(zone, &built.doc)?;

        // Emission succeeded: commit offsets, persist, roll the carries.
        for (partition, next) in advances {
            // The committed offset is the last consumed record.
            self.offsets.commit(topic, partition, next - 1);
        }
        self.offsets.persist()?;
        let slot = self.carries.entry(zone.to_string()).or_default();
        for (dev, p) in built.new_carries {
            slot.insert(dev, p);
        }
        self.last_emitted.insert(zone.to_string(), epoch.index);

        self.metrics.epochs_emitted_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.metrics
            .readings_included_total
            .fetch_add(built.doc.by_device.values().map(|v| v.len() as u64).sum(),
                std::sync::atomic::Ordering::Relaxed);
        self.metrics.readings_late_total.fetch_add(late, std::sync::atomic::Ordering::Relaxed);
        self.metrics
            .readings_outlier_total
            .fetch_add(dropped as u64, std::sync::atomic::Ordering::Relaxed);
        self.metrics
            .decode_errors_total
            .fetch_add(decode_errors, std::sync::atomic::Ordering::Relaxed);
        info!(
            zone = %zone,
            epoch = epoch.index,
            devices = built.doc.by_device.len(),
            energy_kwh = built.doc.zone_energy_kwh_epoch,
            "aggregated epoch emitted"
        );
        Ok(())
    }

    fn drain_partition(
        &mut self,
        topic: &str,
        partition: u32,
        tick_epoch: i64,
    ) -> Result<PartitionDrain, AggregatorError> {
        let mut cursor = self.offsets.committed(topic, partition).map(|o| o + 1).unwrap_or(0);
        let mut drain =
            PartitionDrain { included: Vec::new(), next_offset: None, late: 0, decode_errors: 0 };
        let mut budget = self.cfg.max_per_partition;

        'outer: while budget > 0 {
            let batch: Vec<Record> = self
                .reader
                .call(|| {
                    self.bus.fetch(topic, partition, cursor, budget, std::time::Duration::ZERO)
                })
                .map_err(AggregatorError::from)?;
            if batch.is_empty() {
                break;
            }
            for rec in batch {
                let msg_epoch = epoch_index_of(&rec.timestamp, self.cfg.epoch_ms);
                if msg_epoch > tick_epoch {
                    // Future epoch: leave it for the next tick.
                    break 'outer;
                }
                if msg_epoch < tick_epoch {
                    drain.late += 1;
                } else {
                    match serde_json::from_slice::<Reading>(&rec.payload) {
                        Ok(reading) => drain.included.push(reading),
                        Err(e) => {
                            drain.decode_errors += 1;
                            debug!(topic, partition, offset = rec.offset, error = %e,
                                "reading decode failed; offset advanced");
                        }
                    }
                }
                cursor = rec.offset + 1;
                drain.next_offset = Some(cursor);
                budget -= 1;
                if budget == 0 {
                    break 'outer;
                }
            }
        }
        Ok(drain)
    }

    fn emit(&self, zone: &str, doc: &AggregatedEpoch) -> Result<(), AggregatorError> {
        let payload = canonical::to_canonical_json(doc)?;
        let bytes = payload.as_bytes();

        self.writer
            .call(|| self.bus.append_keyed(&self.cfg.mape_topic, zone, bytes))
            .map_err(AggregatorError::from)?;

        let ledger_topic = self.cfg.ledger_topic_for(zone);
        let ledger_key = format!("{zone}|agg");
        self.writer
            .call(|| {
                self.bus.append(
                    &ledger_topic,
                    self.cfg.ledger_partition_aggregator,
                    &ledger_key,
                    bytes,
                )
            })
            .map_err(AggregatorError::from)?;
        Ok(())
    }

    /// Committed offset for a partition, for inspection and tests.
    pub fn committed_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        self.offsets.committed(topic, partition)
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
    use crate::model::DeviceType;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn reading(dev: &str, ts_ms: i64, temp: Option<f64>, kw: Option<f64>) -> Reading {
        Reading {
            device_id: dev.into(),
            zone_id: "zone-a".into(),
            device_type: if kw.is_some() {
                DeviceType::ActHeating
            } else {
                DeviceType::TempSensor
            },
            timestamp: at(ts_ms),
            temp_c: temp,
            state: None,
            power_kw: kw,
            energy_kwh: None,
        }
    }

    // ------------------------------------------------------------------
    // Energy integration
    // ------------------------------------------------------------------

    #[test]
    fn single_sample_integrates_to_epoch_end() {
        let epoch = EpochId::from_index(0, 3_600_000); // one hour
        // 1 kW sampled 15 minutes in: 45 minutes of accrual.
        let (kwh, carry) = integrate_epoch_energy(&[(at(900_000), 1.0)], None, &epoch);
        assert!((kwh - 0.75).abs() < 1e-9);
        assert_eq!(carry, Some(1.0));
    }

    #[test]
    fn carry_only_epoch_accrues_full_window() {
        let epoch = EpochId::from_index(2, 3_600_000);
        let (kwh, carry) = integrate_epoch_energy(&[], Some(2.0), &epoch);
        assert!((kwh - 2.0).abs() < 1e-9);
        assert_eq!(carry, Some(2.0));
    }

    #[test]
    fn no_samples_no_carry_is_zero() {
        let epoch = EpochId::from_index(0, 60_000);
        assert_eq!(integrate_epoch_energy(&[], None, &epoch), (0.0, None));
    }

    #[test]
    fn carry_prefixes_the_first_interval() {
        let epoch = EpochId::from_index(0, 3_600_000);
        // 2 kW carried for 30 min, then 0 kW for the remaining 30 min.
        let (kwh, carry) = integrate_epoch_energy(&[(at(1_800_000), 0.0)], Some(2.0), &epoch);
        assert!((kwh - 1.0).abs() < 1e-9);
        assert_eq!(carry, Some(0.0));
    }

    #[test]
    fn piecewise_integration_uses_previous_value() {
        let epoch = EpochId::from_index(0, 3_600_000);
        // 1 kW from t=0, 3 kW from t=30min: 0.5 + 1.5 kWh.
        let samples = [(at(0), 1.0), (at(1_800_000), 3.0)];
        let (kwh, _) = integrate_epoch_energy(&samples, None, &epoch);
        assert!((kwh - 2.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_timestamps_keep_last_and_clamping_applies() {
        let epoch = EpochId::from_index(0, 3_600_000);
        // Both samples clamp to the window; the duplicate keeps 4 kW.
        let samples = [(at(-5_000), 9.0), (at(0), 4.0), (at(7_200_000), 2.0)];
        let (kwh, carry) = integrate_epoch_energy(&samples, None, &epoch);
        // 4 kW for the whole hour; the end-clamped sample contributes zero width.
        assert!((kwh - 4.0).abs() < 1e-9);
        assert_eq!(carry, Some(2.0));
    }

    // ------------------------------------------------------------------
    // Outlier filter
    // ------------------------------------------------------------------

    #[test]
    fn outliers_dropped_by_z_score() {
        let mut rs: Vec<Reading> =
            (0..20).map(|i| reading("t-1", i, Some(21.0 + (i % 2) as f64 * 0.2), None)).collect();
        rs.push(reading("t-1", 21, Some(400.0), None));
        let (kept, dropped) = filter_outliers(rs, 4.0);
        assert_eq!(dropped, 1);
        assert!(kept.iter().all(|r| r.temp_c.unwrap() < 100.0));
    }

    #[test]
    fn zero_sigma_imposes_no_constraint() {
        let rs: Vec<Reading> = (0..5).map(|i| reading("t-1", i, Some(21.0), None)).collect();
        let (kept, dropped) = filter_outliers(rs, 4.0);
        assert_eq!(kept.len(), 5);
        assert_eq!(dropped, 0);
    }

    // ------------------------------------------------------------------
    // Aggregation invariants
    // ------------------------------------------------------------------

    #[test]
    fn zone_energy_is_sum_of_actuator_energies() {
        let epoch = EpochId::from_index(0, 3_600_000);
        let cleaned = vec![
            reading("h-1", 0, None, Some(1.0)),
            reading("h-2", 0, None, Some(0.5)),
            reading("t-1", 10, Some(21.0), None),
        ];
        let built = build_epoch("zone-a", &epoch, cleaned, &HashMap::new(), epoch.end);
        let sum: f64 = built.doc.actuator_energy_kwh_epoch.values().sum();
        assert!((built.doc.zone_energy_kwh_epoch - sum).abs() < 1e-9);
        assert_eq!(built.doc.summary["zoneEnergyKWhEpoch"], built.doc.zone_energy_kwh_epoch);
        assert_eq!(built.doc.summary["avgTemp"], 21.0);
        // The sensor contributes no energy entry.
        assert!(!built.doc.actuator_energy_kwh_epoch.contains_key("t-1"));
    }

    #[test]
    fn carry_only_device_still_appears() {
        let epoch = EpochId::from_index(1, 3_600_000);
        let carries = HashMap::from([("h-9".to_string(), 1.5)]);
        let built = build_epoch("zone-a", &epoch, Vec::new(), &carries, epoch.end);
        assert!((built.doc.actuator_energy_kwh_epoch["h-9"] - 1.5).abs() < 1e-9);
        assert_eq!(built.new_carries["h-9"], 1.5);
    }

    // ------------------------------------------------------------------
    // Drain protocol
    // ------------------------------------------------------------------

    fn service(bus: Arc<MemoryBus>, dir: &std::path::Path) -> Aggregator {
        let cfg = AggregatorConfig {
            brokers: "mem".into(),
            topics: vec!["device.readings.zone-a".into()],
            epoch_ms: 60_000,
            max_per_partition: 100,
            offsets_path: dir.join("offsets.json"),
            mape_topic: "agg-to-mape".into(),
            ledger_topic_template: "zone.ledger.{zone}".into(),
            ledger_partition_aggregator: 0,
            ledger_partition_mape: 1,
            outlier_z: 4.0,
            log_path: None,
            jitter_ms: 0,
            http_addr: None,
            breaker: BreakerConfig::default(),
        };
        let b = BreakerConfig::default();
        Aggregator::new(
            cfg,
            bus,
            Arc::new(Breaker::new("agg-reader", b.clone())),
            Arc::new(Breaker::new("agg-writer", b)),
            Arc::new(AggregatorMetrics::default()),
        )
        .unwrap()
    }

    fn publish_reading(bus: &MemoryBus, r: &Reading) {
        let payload = serde_json::to_vec(r).unwrap();
        bus.append_at("device.readings.zone-a", 0, &r.device_id, &payload, r.timestamp).unwrap();
    }

    #[test]
    fn drain_stops_at_future_epoch_and_skips_late() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_topic("device.readings.zone-a", 1).unwrap();
        bus.ensure_topic("agg-to-mape", 1).unwrap();
        bus.ensure_topic("zone.ledger.zone-a", 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut agg = service(bus.clone(), dir.path());

        // Epoch 1 spans [60s, 120s). One late message, two current, one future.
        publish_reading(&bus, &reading("t-1", 30_000, Some(20.0), None)); // epoch 0: late
        publish_reading(&bus, &reading("t-1", 61_000, Some(21.0), None));
        publish_reading(&bus, &reading("t-1", 62_000, Some(21.4), None));
        publish_reading(&bus, &reading("t-1", 121_000, Some(25.0), None)); // epoch 2

        agg.tick(at(65_000)).unwrap();

        // Offset committed through the last epoch-1 record (offset 2), not
        // past the future message.
        assert_eq!(agg.committed_offset("device.readings.zone-a", 0), Some(2));

        let docs = bus.fetch("agg-to-mape", 0, 0, 10, std::time::Duration::ZERO).unwrap();
        assert_eq!(docs.len(), 1);
        let doc: AggregatedEpoch = serde_json::from_slice(&docs[0].payload).unwrap();
        assert_eq!(doc.epoch.index, 1);
        assert_eq!(doc.by_device["t-1"].len(), 2);
        assert!((doc.summary["avgTemp"] - 21.2).abs() < 1e-9);

        let ledger = bus.fetch("zone.ledger.zone-a", 0, 0, 10, std::time::Duration::ZERO).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].key, "zone-a|agg");
    }

    #[test]
    fn at_most_once_per_zone_epoch() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_topic("device.readings.zone-a", 1).unwrap();
        bus.ensure_topic("agg-to-mape", 1).unwrap();
        bus.ensure_topic("zone.ledger.zone-a", 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut agg = service(bus.clone(), dir.path());

        publish_reading(&bus, &reading("t-1", 61_000, Some(21.0), None));
        agg.tick(at(65_000)).unwrap();
        agg.tick(at(70_000)).unwrap(); // same epoch, second tick

        let docs = bus.fetch("agg-to-mape", 0, 0, 10, std::time::Duration::ZERO).unwrap();
        assert_eq!(docs.len(), 1, "one document per (zone, epoch)");
    }

    #[test]
    fn ledger_topology_mismatch_is_fatal_at_startup() {
        let bus = Arc::new(MemoryBus::new());
        bus.ensure_topic("device.readings.zone-a", 1).unwrap();
        bus.ensure_topic("agg-to-mape", 1).unwrap();
        bus.ensure_topic("zone.ledger.zone-a", 3).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = AggregatorConfig {
            brokers: "mem".into(),
            topics: vec!["device.readings.zone-a".into()],
            epoch_ms: 60_000,
            max_per_partition: 100,
            offsets_path: dir.path().join("offsets.json"),
            mape_topic: "agg-to-mape".into(),
            ledger_topic_template: "zone.ledger.{zone}".into(),
            ledger_partition_aggregator: 0,
            ledger_partition_mape: 1,
            outlier_z: 4.0,
            log_path: None,
            jitter_ms: 0,
            http_addr: None,
            breaker: BreakerConfig::default(),
        };
        let b = BreakerConfig::default();
        let err = Aggregator::new(
            cfg,
            bus,
            Arc::new(Breaker::new("r", b.clone())),
            Arc::new(Breaker::new("w", b)),
            Arc::new(AggregatorMetrics::default()),
        )
        .unwrap_err();
        assert!(matches!(err, AggregatorError::LedgerTopology { partitions: 3, .. }));
    }
}
