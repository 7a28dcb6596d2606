//! Service configuration
//!
//! Each daemon loads one TOML file. Validation happens at load time so a
//! misconfigured service dies before it touches the log: ledger topics
//! must route aggregator traffic to partition 0 and MAPE traffic to
//! partition 1, fan step/speed tables must be parallel and sorted, zone
//! lists must be non-empty.
//!
//! The MAPE engine additionally reads a `key=value` properties file at
//! startup (and on `POST /config/reload`) for runtime setpoints, fan
//! tables, and per-zone actuator rosters.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::bus::{LEDGER_PARTITION_AGGREGATOR, LEDGER_PARTITION_MAPE};
use crate::model::ActuatorRole;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parse {}: {source}", .path.display())]
    Toml { path: PathBuf, source: toml::de::Error },
    #[error("{0}")]
    Invalid(String),
    #[error("properties line {line}: expected key=value, got `{text}`")]
    BadProperty { line: usize, text: String },
    #[error("properties key {key}: {reason}")]
    BadPropertyValue { key: String, reason: String },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    toml::from_str(&text).map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    pub brokers: String,
    /// Device-reading topics this instance owns, one per zone, e.g.
    /// `device.readings.zone-a`.
    pub topics: Vec<String>,
    pub epoch_ms: i64,
    #[serde(default = "default_max_per_partition")]
    pub max_per_partition: usize,
    pub offsets_path: PathBuf,
    pub mape_topic: String,
    /// Must contain `{zone}`, e.g. `zone.ledger.{zone}`.
    pub ledger_topic_template: String,
    #[serde(default)]
    pub ledger_partition_aggregator: u32,
    #[serde(default = "default_mape_partition")]
    pub ledger_partition_mape: u32,
    #[serde(default = "default_outlier_z")]
    pub outlier_z: f64,
    /// Optional log file; stdout when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Tick jitter upper bound, to desynchronize instances.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_max_per_partition() -> usize {
    500
}
fn default_mape_partition() -> u32 {
    1
}
fn default_outlier_z() -> f64 {
    4.0
}
fn default_jitter_ms() -> u64 {
    250
}

impl AggregatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(invalid("aggregator owns no topics"));
        }
        if self.epoch_ms <= 0 {
            return Err(invalid(format!("epoch_ms must be positive, got {}", self.epoch_ms)));
        }
        if !self.ledger_topic_template.contains("{zone}") {
            return Err(invalid(format!(
                "ledger_topic_template `{}` must contain `{{zone}}`",
                self.ledger_topic_template
            )));
        }
        if self.ledger_partition_aggregator != LEDGER_PARTITION_AGGREGATOR {
            return Err(invalid(format!(
                "ledger_partition_aggregator must be {LEDGER_PARTITION_AGGREGATOR}, got {}",
                self.ledger_partition_aggregator
            )));
        }
        if self.ledger_partition_mape != LEDGER_PARTITION_MAPE {
            return Err(invalid(format!(
                "ledger_partition_mape must be {LEDGER_PARTITION_MAPE}, got {}",
                self.ledger_partition_mape
            )));
        }
        if self.outlier_z <= 0.0 {
            return Err(invalid(format!("outlier_z must be positive, got {}", self.outlier_z)));
        }
        Ok(())
    }

    /// Zone id a device-reading topic belongs to (the suffix after the
    /// final dot).
    pub fn zone_of_topic(topic: &str) -> &str {
        topic.rsplit('.').next().unwrap_or(topic)
    }

    pub fn ledger_topic_for(&self, zone: &str) -> String {
        self.ledger_topic_template.replace("{zone}", zone)
    }
}

// ============================================================================
// MAPE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapeConfig {
    pub brokers: String,
    pub aggregator_topic: String,
    /// Prefix for actuator command topics; zone id is appended.
    pub actuator_topic_prefix: String,
    /// Prefix for ledger topics; zone id is appended.
    pub ledger_topic_prefix: String,
    #[serde(default = "default_mape_partition")]
    pub mape_partition_id: u32,
    pub poll_interval_ms: u64,
    /// Runtime properties (setpoints, fan tables, actuator rosters).
    pub properties_path: PathBuf,
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl MapeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mape_partition_id != LEDGER_PARTITION_MAPE {
            return Err(invalid(format!(
                "mape_partition_id must be {LEDGER_PARTITION_MAPE}, got {}",
                self.mape_partition_id
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn command_topic_for(&self, zone: &str) -> String {
        format!("{}{}", self.actuator_topic_prefix, zone)
    }

    pub fn ledger_topic_for(&self, zone: &str) -> String {
        format!("{}{}", self.ledger_topic_prefix, zone)
    }
}

/// Parsed MAPE properties file.
#[derive(Debug, Clone, PartialEq)]
pub struct MapeProperties {
    pub zones: Vec<String>,
    pub default_target_c: f64,
    pub default_hysteresis_c: f64,
    pub target_overrides: BTreeMap<String, f64>,
    pub hysteresis_overrides: BTreeMap<String, f64>,
    /// Parallel arrays: the smallest step >= |Δ| selects the speed.
    pub fan_steps: Vec<f64>,
    pub fan_speeds: Vec<u8>,
    /// Per zone, per role, the actuator ids.
    pub actuators: BTreeMap<String, BTreeMap<ActuatorRole, Vec<String>>>,
}

impl MapeProperties {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    /// Parse `key=value` lines. `#` starts a comment; blank lines are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut raw: BTreeMap<String, String> = BTreeMap::new();
        for (idx, line_raw) in text.lines().enumerate() {
            let line = match line_raw.find('#') {
                Some(pos) => &line_raw[..pos],
                None => line_raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::BadProperty {
                line: idx + 1,
                text: line_raw.to_string(),
            })?;
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let zones = list(&raw, "zones")?;
        if zones.is_empty() {
            return Err(invalid("properties: `zones` must list at least one zone"));
        }
        let default_target_c = float(&raw, "target")?.ok_or_else(|| {
            ConfigError::BadPropertyValue { key: "target".into(), reason: "missing".into() }
        })?;
        let default_hysteresis_c = float(&raw, "hysteresis")?.unwrap_or(0.5);

        let mut target_overrides = BTreeMap::new();
        let mut hysteresis_overrides = BTreeMap::new();
        let mut actuators: BTreeMap<String, BTreeMap<ActuatorRole, Vec<String>>> = BTreeMap::new();
        for (key, value) in &raw {
            if let Some(zone) = key.strip_prefix("target.") {
                target_overrides.insert(zone.to_string(), parse_float(key, value)?);
            } else if let Some(zone) = key.strip_prefix("hysteresis.") {
                hysteresis_overrides.insert(zone.to_string(), parse_float(key, value)?);
            } else if let Some(rest) = key.strip_prefix("actuators.") {
                let (role_s, zone) = rest.split_once('.').ok_or_else(|| {
                    ConfigError::BadPropertyValue {
                        key: key.clone(),
                        reason: "expected actuators.<role>.<zone>".into(),
                    }
                })?;
                let role = match role_s {
                    "heating" => ActuatorRole::Heating,
                    "cooling" => ActuatorRole::Cooling,
                    "ventilation" => ActuatorRole::Ventilation,
                    other => {
                        return Err(ConfigError::BadPropertyValue {
                            key: key.clone(),
                            reason: format!("unknown actuator role `{other}`"),
                        })
                    }
                };
                let ids: Vec<String> = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                actuators.entry(zone.to_string()).or_default().insert(role, ids);
            }
        }

        let fan_steps: Vec<f64> = list(&raw, "fan.steps")?
            .iter()
            .map(|s| parse_float("fan.steps", s))
            .collect::<Result<_, _>>()?;
        let fan_speeds: Vec<u8> = list(&raw, "fan.speeds")?
            .iter()
            .map(|s| {
                s.parse::<u8>().map_err(|e| ConfigError::BadPropertyValue {
                    key: "fan.speeds".into(),
                    reason: format!("`{s}`: {e}"),
                })
            })
            .collect::<Result<_, _>>()?;
        if fan_steps.len() != fan_speeds.len() || fan_steps.is_empty() {
            return Err(invalid(format!(
                "fan.steps ({}) and fan.speeds ({}) must be parallel and non-empty",
                fan_steps.len(),
                fan_speeds.len()
            )));
        }
        if fan_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("fan.steps must be strictly increasing"));
        }

        Ok(MapeProperties {
            zones,
            default_target_c,
            default_hysteresis_c,
            target_overrides,
            hysteresis_overrides,
            fan_steps,
            fan_speeds,
            actuators,
        })
    }

    pub fn target_for(&self, zone: &str) -> f64 {
        self.target_overrides.get(zone).copied().unwrap_or(self.default_target_c)
    }

    pub fn hysteresis_for(&self, zone: &str) -> f64 {
        self.hysteresis_overrides.get(zone).copied().unwrap_or(self.default_hysteresis_c)
    }
}

fn list(raw: &BTreeMap<String, String>, key: &str) -> Result<Vec<String>, ConfigError> {
    Ok(raw
        .get(key)
        .map(|v| {
            v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        })
        .unwrap_or_default())
}

fn float(raw: &BTreeMap<String, String>, key: &str) -> Result<Option<f64>, ConfigError> {
    raw.get(key).map(|v| parse_float(key, v)).transpose()
}

fn parse_float(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|e| ConfigError::BadPropertyValue {
        key: key.to_string(),
        reason: format!("`{value}`: {e}"),
    })
}

// ============================================================================
// Ledger (ingestor + block store + query + publisher)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    pub brokers: String,
    pub group_id: String,
    /// Must contain `{zone}`.
    pub topic_template: String,
    pub zones: Vec<String>,
    #[serde(default = "default_grace_ms", alias = "grace_period")]
    pub grace_period_ms: u64,
    #[serde(default = "default_buffer_max_epochs")]
    pub buffer_max_epochs: usize,
    #[serde(default = "default_schema_accept")]
    pub schema_accept: Vec<String>,
    /// Directory holding one `{zone}.ledger` file per zone.
    pub ledger_dir: PathBuf,
    #[serde(default = "default_block_max_txs")]
    pub block_max_txs: usize,
    #[serde(default = "default_block_max_bytes")]
    pub block_max_bytes: u64,
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_grace_ms() -> u64 {
    2_000
}
fn default_buffer_max_epochs() -> usize {
    200
}
fn default_schema_accept() -> Vec<String> {
    vec!["v1".to_string()]
}
fn default_block_max_txs() -> usize {
    16
}
fn default_block_max_bytes() -> u64 {
    256 * 1024
}

impl LedgerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zones.is_empty() {
            return Err(invalid("ledger ingestor owns no zones"));
        }
        if !self.topic_template.contains("{zone}") {
            return Err(invalid(format!(
                "topic_template `{}` must contain `{{zone}}`",
                self.topic_template
            )));
        }
        if self.buffer_max_epochs == 0 {
            return Err(invalid("buffer_max_epochs must be positive"));
        }
        if self.schema_accept.is_empty() {
            return Err(invalid("schema_accept must list at least one version"));
        }
        if self.block_max_txs == 0 {
            return Err(invalid("block_max_txs must be positive"));
        }
        self.publisher.validate()?;
        Ok(())
    }

    pub fn topic_for(&self, zone: &str) -> String {
        self.topic_template.replace("{zone}", zone)
    }

    pub fn ledger_path_for(&self, zone: &str) -> PathBuf {
        self.ledger_dir.join(format!("{zone}.ledger"))
    }
}

// ============================================================================
// Public publisher
// ============================================================================

/// How the public topic key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    Zone,
    Epoch,
    None,
}

/// How the public topic partition is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioner {
    Hash,
    Roundrobin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub enabled: bool,
    pub topic: String,
    pub brokers: String,
    /// Producer acks: -1 (all), 0 (none), or 1 (leader).
    pub acks: i8,
    pub partitioner: Partitioner,
    pub key_mode: KeyMode,
    pub schema_version: String,
    pub queue_depth: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            enabled: false,
            topic: "ledger.public.epochs".to_string(),
            brokers: String::new(),
            acks: -1,
            partitioner: Partitioner::Hash,
            key_mode: KeyMode::Zone,
            schema_version: "v1".to_string(),
            queue_depth: 256,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.acks, -1 | 0 | 1) {
            return Err(invalid(format!("publisher acks must be -1, 0, or 1, got {}", self.acks)));
        }
        if self.enabled && self.topic.is_empty() {
            return Err(invalid("publisher enabled but topic is empty"));
        }
        if self.queue_depth == 0 {
            return Err(invalid("publisher queue_depth must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PROPS: &str = r#"
# runtime setpoints
zones = zone-a, zone-b
target = 21.0
hysteresis = 0.5
target.zone-b = 19.5
hysteresis.zone-b = 1.0
fan.steps = 0.5, 1.0, 2.0, 4.0
fan.speeds = 25, 50, 75, 100
actuators.heating.zone-a = heat-a1
actuators.cooling.zone-a = cool-a1, cool-a2
actuators.ventilation.zone-a = vent-a1
actuators.heating.zone-b = heat-b1
"#;

    #[test]
    fn properties_parse_and_overrides() {
        let p = MapeProperties::parse(PROPS).unwrap();
        assert_eq!(p.zones, vec!["zone-a", "zone-b"]);
        assert_eq!(p.target_for("zone-a"), 21.0);
        assert_eq!(p.target_for("zone-b"), 19.5);
        assert_eq!(p.hysteresis_for("zone-a"), 0.5);
        assert_eq!(p.hysteresis_for("zone-b"), 1.0);
        assert_eq!(p.fan_steps, vec![0.5, 1.0, 2.0, 4.0]);
        assert_eq!(p.fan_speeds, vec![25, 50, 75, 100]);
        let a = &p.actuators["zone-a"];
        assert_eq!(a[&ActuatorRole::Cooling], vec!["cool-a1", "cool-a2"]);
    }

    #[test]
    fn properties_reject_ragged_fan_tables() {
        let text = "zones=z\ntarget=21\nfan.steps=1.0,2.0\nfan.speeds=50\n";
        assert!(MapeProperties::parse(text).is_err());
    }

    #[test]
    fn properties_reject_unsorted_steps() {
        let text = "zones=z\ntarget=21\nfan.steps=2.0,1.0\nfan.speeds=50,75\n";
        assert!(MapeProperties::parse(text).is_err());
    }

    #[test]
    fn properties_reject_garbage_lines() {
        let err = MapeProperties::parse("zones=z\ntarget=21\nnot a property\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadProperty { line: 3, .. }));
    }

    fn aggregator_cfg() -> AggregatorConfig {
        AggregatorConfig {
            brokers: "local".into(),
            topics: vec!["device.readings.zone-a".into()],
            epoch_ms: 60_000,
            max_per_partition: 500,
            offsets_path: "/tmp/offsets.json".into(),
            mape_topic: "agg-to-mape".into(),
            ledger_topic_template: "zone.ledger.{zone}".into(),
            ledger_partition_aggregator: 0,
            ledger_partition_mape: 1,
            outlier_z: 4.0,
            log_path: None,
            jitter_ms: 250,
            http_addr: None,
            breaker: BreakerConfig::default(),
        }
    }

    #[test]
    fn aggregator_partition_pins_are_enforced() {
        let mut cfg = aggregator_cfg();
        assert!(cfg.validate().is_ok());
        cfg.ledger_partition_aggregator = 1;
        assert!(cfg.validate().is_err());
        cfg.ledger_partition_aggregator = 0;
        cfg.ledger_partition_mape = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zone_suffix_extraction() {
        assert_eq!(AggregatorConfig::zone_of_topic("device.readings.zone-a"), "zone-a");
        assert_eq!(aggregator_cfg().ledger_topic_for("zone-a"), "zone.ledger.zone-a");
    }

    #[test]
    fn publisher_acks_validated() {
        let mut p = PublisherConfig::default();
        assert!(p.validate().is_ok());
        p.acks = 2;
        assert!(p.validate().is_err());
    }
}
