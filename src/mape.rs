//! MAPE engine: Monitor → Analyze → Plan → Execute
//!
//! A periodic loop visits every owned zone. Per tick and zone it drains
//! the zone's partition on the aggregated-epoch topic under a short
//! deadline and keeps only the most recent document (older batch entries
//! are stale and discarded), analyzes the temperature error against the
//! zone's runtime setpoint with hysteresis, plans per-actuator commands
//! grouped by role, and executes: commands keyed by actuator id on the
//! zone command topic, plus exactly one decision record on ledger
//! partition 1.
//!
//! Setpoints live in a reader-writer store mutated by the HTTP API;
//! changes become visible at the next tick (the loop reads under a short
//! read lock and never blocks while holding it).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::breaker::{Breaker, BreakerError};
use crate::bus::{partition_for_key, BusError, PartitionedLog};
use crate::canonical::{self, CanonicalError};
use crate::config::{ConfigError, MapeConfig, MapeProperties};
use crate::metrics::MapeMetrics;
use crate::model::{
    ActuatorCommand, ActuatorRole, AggregatedEpoch, CommandMode, MapeDecision, PlannedAction,
    SCHEMA_V1,
};

/// Deadline for one zone's monitor drain.
const MONITOR_DEADLINE: Duration = Duration::from_millis(350);

/// Setpoints are accepted in this inclusive range (°C).
pub const SETPOINT_MIN_C: f64 = 5.0;
pub const SETPOINT_MAX_C: f64 = 35.0;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum MapeError {
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<BreakerError<BusError>> for MapeError {
    fn from(e: BreakerError<BusError>) -> Self {
        match e {
            BreakerError::Open(name) => MapeError::CircuitOpen(name),
            BreakerError::Inner(e) => MapeError::Bus(e),
        }
    }
}

// ============================================================================
// Setpoint store
// ============================================================================

/// Rejections from the setpoint API.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SetpointError {
    #[error("unknown zone {0}")]
    UnknownZone(String),
    #[error("setpoint {value}°C out of range [{SETPOINT_MIN_C}, {SETPOINT_MAX_C}]")]
    OutOfRange { value: f64 },
}

/// Thread-safe runtime setpoints, one per zone.
///
/// Writers (the HTTP API, reloads) take the write lock briefly; the MAPE
/// loop snapshots values under the read lock at the top of each tick.
pub struct SetpointStore {
    inner: RwLock<HashMap<String, f64>>,
}

impl SetpointStore {
    pub fn from_properties(props: &MapeProperties) -> Self {
        let map =
            props.zones.iter().map(|z| (z.clone(), props.target_for(z))).collect::<HashMap<_, _>>();
        SetpointStore { inner: RwLock::new(map) }
    }

    pub fn get(&self, zone: &str) -> Option<f64> {
        self.inner.read().unwrap().get(zone).copied()
    }

    /// Update one zone's setpoint. Unknown zones and out-of-range values
    /// leave the store untouched.
    pub fn set(&self, zone: &str, value: f64) -> Result<(), SetpointError> {
        if !value.is_finite() || !(SETPOINT_MIN_C..=SETPOINT_MAX_C).contains(&value) {
            return Err(SetpointError::OutOfRange { value });
        }
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(zone) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(SetpointError::UnknownZone(zone.to_string())),
        }
    }

    /// Replace every setpoint from freshly parsed properties.
    pub fn reset_from(&self, props: &MapeProperties) {
        let map =
            props.zones.iter().map(|z| (z.clone(), props.target_for(z))).collect::<HashMap<_, _>>();
        *self.inner.write().unwrap() = map;
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.inner.read().unwrap().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

// ============================================================================
// Analyze
// ============================================================================

/// Parallel fan step/speed tables: the smallest step at least |Δ| selects
/// the speed; past the last step the last speed applies.
#[derive(Debug, Clone)]
pub struct FanTable {
    steps: Vec<f64>,
    speeds: Vec<u8>,
}

impl FanTable {
    pub fn new(steps: Vec<f64>, speeds: Vec<u8>) -> Self {
        debug_assert_eq!(steps.len(), speeds.len());
        FanTable { steps, speeds }
    }

    pub fn from_properties(props: &MapeProperties) -> Self {
        Self::new(props.fan_steps.clone(), props.fan_speeds.clone())
    }

    pub fn select(&self, magnitude: f64) -> u8 {
        self.steps
            .iter()
            .position(|s| *s >= magnitude)
            .map(|i| self.speeds[i])
            .or_else(|| self.speeds.last().copied())
            .unwrap_or(0)
    }
}

/// Outcome of the analyze phase for one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub action: PlannedAction,
    pub fan: u8,
    pub delta_c: f64,
    pub reason: &'static str,
}

/// Hysteresis control: Δ = avgTemp − target. Strictly beyond +h cools,
/// strictly beyond −h heats, anything else (including Δ = ±h exactly)
/// holds with the fan off. A missing temperature always holds.
pub fn analyze(avg_temp: Option<f64>, target: f64, hysteresis: f64, fans: &FanTable) -> Analysis {
    let t = match avg_temp {
        Some(t) => t,
        None => {
            return Analysis {
                action: PlannedAction::Hold,
                fan: 0,
                delta_c: 0.0,
                reason: "no temperature",
            }
        }
    };
    let delta = t - target;
    if delta > hysteresis {
        Analysis {
            action: PlannedAction::Cool,
            fan: fans.select(delta.abs()),
            delta_c: delta,
            reason: "temperature above target",
        }
    } else if delta < -hysteresis {
        Analysis {
            action: PlannedAction::Heat,
            fan: fans.select(delta.abs()),
            delta_c: delta,
            reason: "temperature below target",
        }
    } else {
        Analysis { action: PlannedAction::Hold, fan: 0, delta_c: delta, reason: "within hysteresis" }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Expand an analysis into per-actuator commands for the zone's roster.
pub fn plan(
    zone: &str,
    epoch_index: i64,
    analysis: &Analysis,
    roster: &BTreeMap<ActuatorRole, Vec<String>>,
    issued_at: DateTime<Utc>,
) -> Vec<ActuatorCommand> {
    // Per-role (mode, fan) policy for the chosen action.
    let policy = |role: ActuatorRole| -> (CommandMode, u8) {
        match (analysis.action, role) {
            (PlannedAction::Heat, ActuatorRole::Heating) => (CommandMode::On, analysis.fan),
            (PlannedAction::Cool, ActuatorRole::Cooling) => (CommandMode::On, analysis.fan),
            (PlannedAction::Heat, ActuatorRole::Ventilation)
            | (PlannedAction::Cool, ActuatorRole::Ventilation) => {
                if analysis.fan > 0 {
                    (CommandMode::On, analysis.fan)
                } else {
                    (CommandMode::Off, 0)
                }
            }
            _ => (CommandMode::Off, 0),
        }
    };

    let mut out = Vec::new();
    for (role, ids) in roster {
        let (mode, fan) = policy(*role);
        for id in ids {
            out.push(ActuatorCommand {
                zone_id: zone.to_string(),
                actuator_id: id.clone(),
                mode,
                fan_percent: fan,
                reason: analysis.reason.to_string(),
                epoch_index,
                issued_at,
            });
        }
    }
    out
}

// ============================================================================
// Engine
// ============================================================================

/// State shared between the engine loop and the HTTP API.
pub struct MapeRuntime {
    pub setpoints: Arc<SetpointStore>,
    pub properties: Arc<RwLock<MapeProperties>>,
    pub properties_path: std::path::PathBuf,
}

impl MapeRuntime {
    pub fn load(cfg: &MapeConfig) -> Result<Self, ConfigError> {
        let props = MapeProperties::load(&cfg.properties_path)?;
        Ok(MapeRuntime {
            setpoints: Arc::new(SetpointStore::from_properties(&props)),
            properties: Arc::new(RwLock::new(props)),
            properties_path: cfg.properties_path.clone(),
        })
    }

    /// Re-read the properties file and reset every runtime setpoint.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let props = MapeProperties::load(&self.properties_path)?;
        self.setpoints.reset_from(&props);
        *self.properties.write().unwrap() = props;
        info!(path = %self.properties_path.display(), "properties reloaded; setpoints reset");
        Ok(())
    }
}

/// The MAPE engine over one set of owned zones.
pub struct MapeEngine {
    cfg: MapeConfig,
    runtime: Arc<MapeRuntime>,
    bus: Arc<dyn PartitionedLog>,
    reader: Arc<Breaker>,
    writer: Arc<Breaker>,
    metrics: Arc<MapeMetrics>,
    /// Next fetch position per zone on the aggregated topic.
    cursors: HashMap<String, u64>,
}

impl MapeEngine {
    pub fn new(
        cfg: MapeConfig,
        runtime: Arc<MapeRuntime>,
        bus: Arc<dyn PartitionedLog>,
        reader: Arc<Breaker>,
        writer: Arc<Breaker>,
        metrics: Arc<MapeMetrics>,
    ) -> Self {
        MapeEngine { cfg, runtime, bus, reader, writer, metrics, cursors: HashMap::new() }
    }

    /// Run one tick at `now` over every owned zone, sequentially.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let zones = self.runtime.properties.read().unwrap().zones.clone();
        for zone in zones {
            if let Err(e) = self.tick_zone(&zone, now) {
                warn!(zone = %zone, error = %e, "mape tick failed for zone");
            }
        }
    }

    /// Monitor: drain the zone's partition and keep only the freshest
    /// document.
    fn monitor(&mut self, zone: &str) -> Result<Option<AggregatedEpoch>, MapeError> {
        let partitions = self.bus.partitions(&self.cfg.aggregator_topic)?;
        let partition = partition_for_key(zone, partitions);
        let mut cursor = self.cursors.get(zone).copied().unwrap_or(0);

        let mut latest: Option<AggregatedEpoch> = None;
        let mut stale = 0u64;
        let mut first_fetch = true;
        loop {
            let wait = if first_fetch { MONITOR_DEADLINE } else { Duration::ZERO };
            first_fetch = false;
            let from = cursor;
            let batch = self
                .reader
                .call(|| self.bus.fetch(&self.cfg.aggregator_topic, partition, from, 64, wait))
                .map_err(MapeError::from)?;
            if batch.is_empty() {
                break;
            }
            for rec in batch {
                cursor = rec.offset + 1;
                match serde_json::from_slice::<AggregatedEpoch>(&rec.payload) {
                    Ok(doc) if doc.zone_id == zone => {
                        if latest.is_some() {
                            stale += 1;
                        }
                        latest = Some(doc);
                    }
                    Ok(_) => {} // another zone sharing the partition
                    Err(e) => {
                        debug!(zone, offset = rec.offset, error = %e, "aggregated doc decode failed")
                    }
                }
            }
        }
        self.cursors.insert(zone.to_string(), cursor);
        if stale > 0 {
            self.metrics.stale_documents_total.fetch_add(stale, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(latest)
    }

    fn tick_zone(&mut self, zone: &str, now: DateTime<Utc>) -> Result<(), MapeError> {
        let doc = match self.monitor(zone)? {
            Some(doc) => doc,
            None => return Ok(()),
        };

        // Snapshot runtime state; never block while holding these locks.
        let target = self.runtime.setpoints.get(zone).unwrap_or_else(|| {
            self.runtime.properties.read().unwrap().target_for(zone)
        });
        let (hysteresis, fans, roster) = {
            let props = self.runtime.properties.read().unwrap();
            (
                props.hysteresis_for(zone),
                FanTable::from_properties(&props),
                props.actuators.get(zone).cloned().unwrap_or_default(),
            )
        };

        let analysis = analyze(doc.summary.get("avgTemp").copied(), target, hysteresis, &fans);
        let commands = plan(zone, doc.epoch.index, &analysis, &roster, now);

        // Execute: commands keyed by actuator id, then exactly one
        // decision on the ledger's MAPE partition.
        let command_topic = self.cfg.command_topic_for(zone);
        for cmd in &commands {
            let payload = canonical::to_canonical_json(cmd)?;
            self.writer
                .call(|| self.bus.append_keyed(&command_topic, &cmd.actuator_id, payload.as_bytes()))
                .map_err(MapeError::from)?;
        }
        self.metrics
            .commands_total
            .fetch_add(commands.len() as u64, std::sync::atomic::Ordering::Relaxed);

        let decision = MapeDecision {
            schema_version: SCHEMA_V1.into(),
            epoch_index: doc.epoch.index,
            zone_id: zone.to_string(),
            planned: analysis.action,
            target_c: target,
            hysteresis_c: hysteresis,
            delta_c: analysis.delta_c,
            fan: analysis.fan,
            epoch_start: canonical::rfc3339_nano(&doc.epoch.start),
            epoch_end: canonical::rfc3339_nano(&doc.epoch.end),
            timestamp: now.timestamp_millis(),
        };
        let ledger_topic = self.cfg.ledger_topic_for(zone);
        let payload = canonical::to_canonical_json(&decision)?;
        let key = format!("{zone}|mape");
        self.writer
            .call(|| {
                self.bus.append(&ledger_topic, self.cfg.mape_partition_id, &key, payload.as_bytes())
            })
            .map_err(MapeError::from)?;
        self.metrics.decisions_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            zone,
            epoch = doc.epoch.index,
            planned = analysis.action.as_str(),
            delta_c = analysis.delta_c,
            fan = analysis.fan,
            "decision emitted"
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
