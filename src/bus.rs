//! Partitioned-log substrate
//!
//! All cross-component coupling in this system rides an at-least-once
//! partitioned log. The [`PartitionedLog`] trait pins the contract the
//! services rely on:
//!
//! - per-partition ordering,
//! - explicit partition writes (producer names the partition index, or a
//!   key routed through the Murmur2 balancer),
//! - explicit partition reads (consumer binds to topic + partition and an
//!   offset),
//! - topic metadata listing partition counts.
//!
//! Committed offsets are the consumer's responsibility; [`OffsetStore`]
//! persists them per (topic, partition) behind one lock per file.
//!
//! [`MemoryBus`] is the in-tree implementation: an in-process broker with
//! condvar-blocking fetches. External brokers slot in behind the same
//! trait.
//!
//! ## Key hashing
//!
//! [`partition_for_key`] must agree with the Java Kafka client's default
//! partitioner (Murmur2 over the key bytes, sign bit masked, modulo the
//! partition count) so that the same key routes to the same partition
//! across implementations. Downstream consumers compute their partition
//! with the same function.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Ledger topics carry exactly two partitions with fixed roles.
pub const LEDGER_PARTITION_AGGREGATOR: u32 = 0;
/// Partition the MAPE engine writes decisions to.
pub const LEDGER_PARTITION_MAPE: u32 = 1;
/// Required partition count of every `zone.ledger.{zoneId}` topic.
pub const LEDGER_PARTITIONS: u32 = 2;

/// One message on a partition, in offset order.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by the substrate.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("topic {topic} has {partitions} partitions; partition {partition} out of range")]
    PartitionOutOfRange { topic: String, partition: u32, partitions: u32 },
    #[error("topic {topic} already exists with {existing} partitions (asked for {requested})")]
    TopicMismatch { topic: String, existing: u32, requested: u32 },
    #[error("topic {0} must have at least one partition")]
    NoPartitions(String),
    #[error("offset store {}: {source}", .path.display())]
    OffsetIo { path: PathBuf, source: std::io::Error },
    #[error("offset store {} is corrupt: {source}", .path.display())]
    OffsetCorrupt { path: PathBuf, source: serde_json::Error },
}

/// The at-least-once partitioned log the whole pipeline is built on.
pub trait PartitionedLog: Send + Sync {
    /// Create `topic` with `partitions` partitions, or verify an existing
    /// topic has exactly that many.
    fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<(), BusError>;

    /// Partition count of `topic`.
    fn partitions(&self, topic: &str) -> Result<u32, BusError>;

    /// Append to an explicit partition with an explicit message timestamp.
    /// Returns the assigned offset.
    fn append_at(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<u64, BusError>;

    /// Read up to `max` records from `(topic, partition)` starting at
    /// offset `from`, waiting up to `wait` for the first record.
    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Record>, BusError>;

    /// Append to an explicit partition, stamped with the current time.
    fn append(&self, topic: &str, partition: u32, key: &str, payload: &[u8]) -> Result<u64, BusError> {
        self.append_at(topic, partition, key, payload, Utc::now())
    }

    /// Append routed by the Murmur2 hash balancer over `key`.
    /// Returns the chosen partition and the assigned offset.
    fn append_keyed(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(u32, u64), BusError> {
        let n = self.partitions(topic)?;
        let partition = partition_for_key(key, n);
        let offset = self.append(topic, partition, key, payload)?;
        Ok((partition, offset))
    }
}

// ============================================================================
// Murmur2 balancer (Java Kafka compatible)
// ============================================================================

/// Murmur2 as implemented by the Java Kafka client (seed `0x9747b28c`,
/// little-endian 4-byte chunks, fall-through tail).
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h: u32 = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition a key the way the Java client's default partitioner does:
/// mask the sign bit, modulo the partition count.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    (murmur2(key.as_bytes()) & 0x7fff_ffff) % partitions.max(1)
}

/// Round-robin partition selector for keyless producers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: std::sync::atomic::AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, partitions: u32) -> u32 {
        let n = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        (n % u64::from(partitions.max(1))) as u32
    }
}

// ============================================================================
// In-process broker
// ============================================================================

struct TopicState {
    partitions: Vec<Vec<Record>>,
}

/// In-process [`PartitionedLog`]: per-partition ordered vectors behind one
/// mutex, with a condvar so fetches can block until data arrives or the
/// wait expires.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, TopicState>>,
    data_arrived: Condvar,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus { topics: Mutex::new(HashMap::new()), data_arrived: Condvar::new() }
    }
}

impl PartitionedLog for MemoryBus {
    fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<(), BusError> {
        if partitions == 0 {
            return Err(BusError::NoPartitions(topic.to_string()));
        }
        let mut topics = self.topics.lock().unwrap();
        match topics.get(topic) {
            Some(existing) if existing.partitions.len() as u32 != partitions => {
                Err(BusError::TopicMismatch {
                    topic: topic.to_string(),
                    existing: existing.partitions.len() as u32,
                    requested: partitions,
                })
            }
            Some(_) => Ok(()),
            None => {
                topics.insert(
                    topic.to_string(),
                    TopicState { partitions: vec![Vec::new(); partitions as usize] },
                );
                Ok(())
            }
        }
    }

    fn partitions(&self, topic: &str) -> Result<u32, BusError> {
        let topics = self.topics.lock().unwrap();
        topics
            .get(topic)
            .map(|t| t.partitions.len() as u32)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    fn append_at(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<u64, BusError> {
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let n = state.partitions.len() as u32;
        let slot = state.partitions.get_mut(partition as usize).ok_or(
            BusError::PartitionOutOfRange { topic: topic.to_string(), partition, partitions: n },
        )?;
        let offset = slot.len() as u64;
        slot.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            payload: payload.to_vec(),
            timestamp,
        });
        drop(topics);
        self.data_arrived.notify_all();
        Ok(offset)
    }

    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Record>, BusError> {
        let deadline = std::time::Instant::now() + wait;
        let mut topics = self.topics.lock().unwrap();
        loop {
            let state = topics
                .get(topic)
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
            let n = state.partitions.len() as u32;
            let slot = state.partitions.get(partition as usize).ok_or(
                BusError::PartitionOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    partitions: n,
                },
            )?;
            if (slot.len() as u64) > from {
                let end = slot.len().min(from as usize + max);
                return Ok(slot[from as usize..end].to_vec());
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let (guard, timeout) = self.data_arrived.wait_timeout(topics, remaining).unwrap();
            topics = guard;
            if timeout.timed_out() {
                // One last look under the lock before giving up.
                continue;
            }
        }
    }
}

// ============================================================================
// Durable consumer offsets
// ============================================================================

/// Committed offsets per (topic, partition), persisted as sorted JSON.
///
/// The aggregator owns one of these per offsets file; all mutation happens
/// behind the single per-file lock, and `commit` rewrites the file through
/// a temp-and-rename so a crash never leaves a torn file.
pub struct OffsetStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, u64>>,
}

impl OffsetStore {
    /// Open (or start) the offsets file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| BusError::OffsetCorrupt { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(BusError::OffsetIo { path, source }),
        };
        Ok(OffsetStore { path, state: Mutex::new(state) })
    }

    fn slot(topic: &str, partition: u32) -> String {
        format!("{topic}/{partition}")
    }

    /// Last committed offset, if any.
    pub fn committed(&self, topic: &str, partition: u32) -> Option<u64> {
        self.state.lock().unwrap().get(&Self::slot(topic, partition)).copied()
    }

    /// Stage a committed offset in memory. Call [`OffsetStore::persist`]
    /// to flush, typically once per tick.
    pub fn commit(&self, topic: &str, partition: u32, offset: u64) {
        self.state.lock().unwrap().insert(Self::slot(topic, partition), offset);
    }

    /// Write the offsets file (temp file, fsync, rename).
    pub fn persist(&self) -> Result<(), BusError> {
        let state = self.state.lock().unwrap();
        let bytes = serde_json::to_vec_pretty(&*state)
            .map_err(|source| BusError::OffsetCorrupt { path: self.path.clone(), source })?;
        drop(state);
        let tmp = self.path.with_extension("tmp");
        let io = |source| BusError::OffsetIo { path: self.path.clone(), source };
        let mut f = fs::File::create(&tmp).map_err(io)?;
        f.write_all(&bytes).map_err(io)?;
        f.sync_all().map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_routing_is_stable_and_in_range() {
        for key in ["zone-a", "zone-b", "act-heat-1", "", "日本語"] {
            let p1 = partition_for_key(key, 12);
            let p2 = partition_for_key(key, 12);
            assert_eq!(p1, p2, "same key must route identically");
            assert!(p1 < 12);
        }
    }

    #[test]
    fn producer_and_consumer_agree_on_partition() {
        let bus = MemoryBus::new();
        bus.ensure_topic("zone.commands.zone-a", 4).unwrap();
        let (partition, _) = bus.append_keyed("zone.commands.zone-a", "act-1", b"{}").unwrap();
        // A consumer binding by the same hash reads the same partition.
        assert_eq!(partition, partition_for_key("act-1", 4));
        let got = bus
            .fetch("zone.commands.zone-a", partition, 0, 10, Duration::ZERO)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key, "act-1");
    }

    #[test]
    fn per_partition_order_and_offsets() {
        let bus = MemoryBus::new();
        bus.ensure_topic("t", 2).unwrap();
        for i in 0..5u8 {
            bus.append("t", 0, "k", &[i]).unwrap();
        }
        bus.append("t", 1, "k", &[99]).unwrap();
        let got = bus.fetch("t", 0, 2, 10, Duration::ZERO).unwrap();
        assert_eq!(got.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(got[0].payload, vec![2]);
    }

    #[test]
    fn fetch_respects_max_and_empty_timeout() {
        let bus = MemoryBus::new();
        bus.ensure_topic("t", 1).unwrap();
        for i in 0..10u8 {
            bus.append("t", 0, "k", &[i]).unwrap();
        }
        let got = bus.fetch("t", 0, 0, 3, Duration::ZERO).unwrap();
        assert_eq!(got.len(), 3);
        let none = bus.fetch("t", 0, 10, 3, Duration::from_millis(10)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn topic_mismatch_is_detected() {
        let bus = MemoryBus::new();
        bus.ensure_topic("zone.ledger.zone-a", 2).unwrap();
        let err = bus.ensure_topic("zone.ledger.zone-a", 3).unwrap_err();
        assert!(matches!(err, BusError::TopicMismatch { existing: 2, requested: 3, .. }));
    }

    #[test]
    fn round_robin_cycles() {
        let rr = RoundRobin::new();
        let picks: Vec<u32> = (0..6).map(|_| rr.next(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn offsets_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        {
            let store = OffsetStore::open(&path).unwrap();
            assert_eq!(store.committed("device.readings.zone-a", 0), None);
            store.commit("device.readings.zone-a", 0, 41);
            store.commit("device.readings.zone-a", 1, 7);
            store.persist().unwrap();
        }
        let store = OffsetStore::open(&path).unwrap();
        assert_eq!(store.committed("device.readings.zone-a", 0), Some(41));
        assert_eq!(store.committed("device.readings.zone-a", 1), Some(7));
    }
}
