//! Wire and ledger data model
//!
//! Every document that crosses a topic or lands in the ledger file is
//! defined here: device readings, epoch identity, the per-epoch aggregated
//! document, the MAPE decision, actuator commands, ledger transactions and
//! blocks, and the public epoch projection.
//!
//! ## Invariants
//!
//! - Epoch identity is pure arithmetic on wall time:
//!   `index = floor(unix_ms(start) / len_ms)` and `end = start + len`.
//!   Boundaries are globally aligned; every service and zone computes the
//!   same index for the same instant.
//! - `Transaction.hash = SHA-256(canonicalJSON(tx minus hash))`, and
//!   `prevHash` chains to the previous transaction in the same file
//!   (empty string at genesis).
//! - A block header's `headerHash` covers the header minus itself;
//!   `dataHash` is the Merkle root over the transactions' canonical
//!   hashes.
//!
//! JSON field names are camelCase; the handful of fields with unit
//! suffixes (`powerKW`, `energyKWh`, the per-epoch energy maps) carry
//! explicit renames because their capitalization is part of the wire
//! contract.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::{self, CanonicalError};

/// Schema version stamped on every v1 document.
pub const SCHEMA_V1: &str = "v1";

// ============================================================================
// Devices and readings
// ============================================================================

/// Kind of device a reading originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    TempSensor,
    ActHeating,
    ActCooling,
    ActVentilation,
}

impl DeviceType {
    /// Actuators contribute to energy accounting; sensors do not.
    pub fn is_actuator(self) -> bool {
        !matches!(self, DeviceType::TempSensor)
    }

    /// The control role of an actuator, if it is one.
    pub fn role(self) -> Option<ActuatorRole> {
        match self {
            DeviceType::TempSensor => None,
            DeviceType::ActHeating => Some(ActuatorRole::Heating),
            DeviceType::ActCooling => Some(ActuatorRole::Cooling),
            DeviceType::ActVentilation => Some(ActuatorRole::Ventilation),
        }
    }
}

/// Control role an actuator plays in a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorRole {
    Heating,
    Cooling,
    Ventilation,
}

impl ActuatorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActuatorRole::Heating => "heating",
            ActuatorRole::Cooling => "cooling",
            ActuatorRole::Ventilation => "ventilation",
        }
    }
}

/// One decoded device reading.
///
/// Unknown upstream fields are dropped at decode time (serde ignores
/// them), so re-encoding a reading emits only the contract fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    pub zone_id: String,
    pub device_type: DeviceType,
    #[serde(with = "canonical::ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tempC", skip_serializing_if = "Option::is_none", default)]
    pub temp_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    /// Authoritative power sample in kilowatts.
    #[serde(rename = "powerKW", skip_serializing_if = "Option::is_none", default)]
    pub power_kw: Option<f64>,
    #[serde(rename = "energyKWh", skip_serializing_if = "Option::is_none", default)]
    pub energy_kwh: Option<f64>,
}

// ============================================================================
// Epoch identity
// ============================================================================

/// Epoch index for the instant `t` under windows of `len_ms` milliseconds.
///
/// Euclidean division keeps pre-1970 instants on the same global grid.
pub fn epoch_index_of(t: &DateTime<Utc>, len_ms: i64) -> i64 {
    t.timestamp_millis().div_euclid(len_ms)
}

/// A globally aligned fixed-length wall-clock window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochId {
    pub index: i64,
    #[serde(with = "canonical::ts")]
    pub start: DateTime<Utc>,
    #[serde(with = "canonical::ts")]
    pub end: DateTime<Utc>,
    /// Window length in milliseconds.
    pub len_ms: i64,
}

impl EpochId {
    /// The epoch with the given index under `len_ms` windows.
    pub fn from_index(index: i64, len_ms: i64) -> Self {
        let start = Utc.timestamp_millis_opt(index * len_ms).unwrap();
        EpochId { index, start, end: start + Duration::milliseconds(len_ms), len_ms }
    }

    /// The epoch containing instant `t`.
    pub fn containing(t: &DateTime<Utc>, len_ms: i64) -> Self {
        Self::from_index(epoch_index_of(t, len_ms), len_ms)
    }

    /// Window length in fractional hours, for kWh integration.
    pub fn len_hours(&self) -> f64 {
        self.len_ms as f64 / 3_600_000.0
    }
}

// ============================================================================
// Aggregated epoch (A → B, A → ledger partition 0)
// ============================================================================

/// One aggregated document per zone per epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEpoch {
    pub schema_version: String,
    pub zone_id: String,
    pub epoch: EpochId,
    /// Cleaned readings grouped per device, in arrival order.
    pub by_device: BTreeMap<String, Vec<Reading>>,
    /// At minimum `avgTemp`, `avgPowerW`, and `zoneEnergyKWhEpoch` when
    /// applicable. Open-ended so upstream annotations (e.g. `targetC`)
    /// survive the trip to the ledger.
    pub summary: BTreeMap<String, f64>,
    #[serde(rename = "actuatorEnergyKWhEpoch")]
    pub actuator_energy_kwh_epoch: BTreeMap<String, f64>,
    #[serde(rename = "zoneEnergyKWhEpoch")]
    pub zone_energy_kwh_epoch: f64,
    #[serde(with = "canonical::ts")]
    pub produced_at: DateTime<Utc>,
}

// ============================================================================
// MAPE decision (B → ledger partition 1) and actuator commands
// ============================================================================

/// Planned HVAC action for one zone and epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Heat,
    Cool,
    Hold,
}

impl PlannedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PlannedAction::Heat => "heat",
            PlannedAction::Cool => "cool",
            PlannedAction::Hold => "hold",
        }
    }
}

/// The decision record the MAPE engine writes to ledger partition 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapeDecision {
    pub schema_version: String,
    pub epoch_index: i64,
    pub zone_id: String,
    pub planned: PlannedAction,
    #[serde(rename = "targetC")]
    pub target_c: f64,
    #[serde(rename = "hysteresisC")]
    pub hysteresis_c: f64,
    #[serde(rename = "deltaC")]
    pub delta_c: f64,
    /// Fan magnitude, one of the configured speed steps.
    pub fan: u8,
    /// RFC3339 epoch bounds, carried as strings on the wire.
    pub epoch_start: String,
    pub epoch_end: String,
    /// Unix milliseconds at decision time.
    pub timestamp: i64,
}

/// Power state commanded to a single actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    On,
    Off,
}

/// One per-actuator command, keyed by `actuatorId` on the command topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    pub zone_id: String,
    pub actuator_id: String,
    pub mode: CommandMode,
    pub fan_percent: u8,
    pub reason: String,
    pub epoch_index: i64,
    #[serde(with = "canonical::ts")]
    pub issued_at: DateTime<Utc>,
}

// ============================================================================
// Ledger transaction and blocks
// ============================================================================

/// Document type tag of a matched-epoch transaction.
pub const TX_TYPE_EPOCH_MATCH: &str = "epoch.match";

/// A fully matched (or imputed) epoch, hash-chained to its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "type")]
    pub tx_type: String,
    pub schema_version: String,
    pub zone_id: String,
    pub epoch_index: i64,
    pub aggregator: AggregatedEpoch,
    #[serde(with = "canonical::ts")]
    pub aggregator_received_at: DateTime<Utc>,
    pub mape: MapeDecision,
    #[serde(with = "canonical::ts")]
    pub mape_received_at: DateTime<Utc>,
    #[serde(with = "canonical::ts")]
    pub matched_at: DateTime<Utc>,
    /// Hash of the previous transaction in the same file, "" at genesis.
    pub prev_hash: String,
    pub hash: String,
}

impl Transaction {
    /// `SHA-256(canonicalJSON(self minus hash))`, lowercase hex.
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        canonical::hash_canonical_without(self, "hash")
    }

    /// Leaf digest used by the block Merkle root: SHA-256 over the full
    /// canonical transaction (including its `hash` field).
    pub fn leaf_digest(&self) -> Result<[u8; 32], CanonicalError> {
        Ok(canonical::sha256_raw(canonical::to_canonical_json(self)?.as_bytes()))
    }
}

/// Block format version written by this store.
pub const BLOCK_VERSION_V2: &str = "v2";

/// Header of a v2 ledger block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: String,
    /// Genesis is 0; heights increase by exactly 1.
    pub height: i64,
    /// Previous block's `headerHash`, "" at genesis (and at the first v2
    /// block after a legacy v1 prefix).
    pub prev_header_hash: String,
    /// Merkle root over the transactions' canonical SHA-256 digests.
    pub data_hash: String,
    #[serde(with = "canonical::ts")]
    pub timestamp: DateTime<Utc>,
    /// Byte length of the serialized block line (without the newline).
    pub block_size: u64,
    /// 16 random bytes, lowercase hex.
    pub nonce: String,
    pub header_hash: String,
}

impl BlockHeader {
    /// `SHA-256(canonicalJSON(header minus headerHash))`, lowercase hex.
    pub fn compute_header_hash(&self) -> Result<String, CanonicalError> {
        canonical::hash_canonical_without(self, "headerHash")
    }
}

/// Transactions carried by a block, in matched order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    pub transactions: Vec<Transaction>,
}

/// One v2 ledger block: a hash-chained container of ordered transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    pub data: BlockData,
}

// ============================================================================
// Public epoch projection (E)
// ============================================================================

/// Document type tag of the public epoch payload.
pub const PUBLIC_EPOCH_TYPE: &str = "epoch.public";

/// Block coordinates a finalized transaction landed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub height: i64,
    pub header_hash: String,
    pub data_hash: String,
}

/// Aggregator slice of the public payload: summary only, never device
/// arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAggregator {
    pub summary: BTreeMap<String, f64>,
}

/// MAPE slice of the public payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMape {
    pub planned: PlannedAction,
    #[serde(rename = "targetC")]
    pub target_c: f64,
    #[serde(rename = "deltaC")]
    pub delta_c: f64,
    pub fan: u8,
}

/// The PII-free per-epoch payload emitted to the shared public topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicEpoch {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub schema_version: String,
    pub zone_id: String,
    pub epoch_index: i64,
    #[serde(with = "canonical::ts")]
    pub matched_at: DateTime<Utc>,
    pub block: BlockRef,
    pub aggregator: PublicAggregator,
    pub mape: PublicMape,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_index_is_floor_division() {
        let len = 60_000;
        let t = Utc.timestamp_millis_opt(3 * 60_000 + 59_999).unwrap();
        assert_eq!(epoch_index_of(&t, len), 3);
        let t = Utc.timestamp_millis_opt(4 * 60_000).unwrap();
        assert_eq!(epoch_index_of(&t, len), 4);
        // Pre-epoch instants stay on the same grid.
        let t = Utc.timestamp_millis_opt(-1).unwrap();
        assert_eq!(epoch_index_of(&t, len), -1);
    }

    #[test]
    fn epoch_id_bounds_are_aligned() {
        let e = EpochId::from_index(7, 30_000);
        assert_eq!(e.start.timestamp_millis(), 210_000);
        assert_eq!(e.end.timestamp_millis(), 240_000);
        assert_eq!(e.index, epoch_index_of(&e.start, 30_000));
        assert_eq!(EpochId::containing(&e.start, 30_000), e);
    }

    #[test]
    fn reading_drops_unknown_fields_on_decode() {
        let raw = r#"{
            "deviceId":"t-1","zoneId":"zone-a","deviceType":"temp_sensor",
            "timestamp":"2024-03-01T12:00:00Z","tempC":21.5,
            "firmware":"9.1","vendorBlob":{"x":1}
        }"#;
        let r: Reading = serde_json::from_str(raw).unwrap();
        assert_eq!(r.device_id, "t-1");
        assert_eq!(r.temp_c, Some(21.5));
        let out = serde_json::to_value(&r).unwrap();
        assert!(out.get("firmware").is_none());
        assert!(out.get("vendorBlob").is_none());
    }

    #[test]
    fn reading_wire_field_names() {
        let r = Reading {
            device_id: "h-1".into(),
            zone_id: "zone-a".into(),
            device_type: DeviceType::ActHeating,
            timestamp: Utc.timestamp_millis_opt(0).unwrap(),
            temp_c: None,
            state: Some("on".into()),
            power_kw: Some(1.2),
            energy_kwh: Some(0.4),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("powerKW").is_some());
        assert!(v.get("energyKWh").is_some());
        assert_eq!(v["deviceType"], "act_heating");
    }

    #[test]
    fn transaction_hash_covers_everything_but_hash() {
        let tx = sample_tx();
        let h = tx.compute_hash().unwrap();
        assert_eq!(h.len(), 64);

        // The stored hash value must not influence the digest.
        let mut with_hash = tx.clone();
        with_hash.hash = h.clone();
        assert_eq!(with_hash.compute_hash().unwrap(), h);

        // Any other field does.
        let mut changed = tx;
        changed.epoch_index += 1;
        assert_ne!(changed.compute_hash().unwrap(), h);
    }

    fn sample_tx() -> Transaction {
        let epoch = EpochId::from_index(1, 60_000);
        Transaction {
            tx_type: TX_TYPE_EPOCH_MATCH.into(),
            schema_version: SCHEMA_V1.into(),
            zone_id: "zone-a".into(),
            epoch_index: 1,
            aggregator: AggregatedEpoch {
                schema_version: SCHEMA_V1.into(),
                zone_id: "zone-a".into(),
                epoch: epoch.clone(),
                by_device: BTreeMap::new(),
                summary: BTreeMap::from([("avgTemp".into(), 21.5)]),
                actuator_energy_kwh_epoch: BTreeMap::new(),
                zone_energy_kwh_epoch: 0.0,
                produced_at: epoch.end,
            },
            aggregator_received_at: epoch.end,
            mape: MapeDecision {
                schema_version: SCHEMA_V1.into(),
                epoch_index: 1,
                zone_id: "zone-a".into(),
                planned: PlannedAction::Hold,
                target_c: 21.0,
                hysteresis_c: 0.5,
                delta_c: 0.0,
                fan: 0,
                epoch_start: crate::canonical::rfc3339_nano(&epoch.start),
                epoch_end: crate::canonical::rfc3339_nano(&epoch.end),
                timestamp: epoch.end.timestamp_millis(),
            },
            mape_received_at: epoch.end,
            matched_at: epoch.end,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }
}
