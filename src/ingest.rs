//! Ledger ingestor: the per-zone epoch matcher
//!
//! One single-threaded consumer per zone subscribes to the zone's ledger
//! topic with strict partition roles (0 = aggregator summary, 1 = MAPE
//! decision; anything else is a fatal contract violation caught at
//! startup). Messages pair up by epoch index:
//!
//! - `pending`: one side arrived; waits for the counterpart.
//! - `matched`: both sides present; finalize immediately.
//! - `expired`: the grace window elapsed; finalize with the missing
//!   side imputed.
//! - `finalized`: remembered in a bounded LRU so duplicates are
//!   acknowledged without re-persisting.
//! - `rejected`: an unknown schemaVersion poisoned the epoch; both
//!   sides are dropped (and acknowledged) for a bounded window.
//!
//! Offsets commit only when a message reaches a terminal disposition.
//! A pending message holds back the committed offset on its partition,
//! so a crash replays it (at-least-once).
//!
//! Finalization builds the hash-chained transaction, appends it to the
//! open block, and, when the block flushes, hands every contained
//! transaction to the public-publisher hook.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::breaker::{Breaker, BreakerError};
use crate::blockstore::{BlockStore, BlockStoreError, FlushedBlock};
use crate::bus::{
    BusError, PartitionedLog, Record, LEDGER_PARTITIONS, LEDGER_PARTITION_AGGREGATOR,
    LEDGER_PARTITION_MAPE,
};
use crate::canonical::{self, CanonicalError};
use crate::metrics::LedgerMetrics;
use crate::model::{
    AggregatedEpoch, EpochId, MapeDecision, PlannedAction, Transaction, SCHEMA_V1,
    TX_TYPE_EPOCH_MATCH,
};
use crate::publisher::Publisher;

/// Errors surfaced by the ingestor. Partition-contract violations are
/// fatal at the zone level.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(
        "ledger topic {topic} has {partitions} partitions; the contract requires exactly {LEDGER_PARTITIONS}"
    )]
    PartitionContract { topic: String, partitions: u32 },
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

impl From<BreakerError<BusError>> for IngestError {
    fn from(e: BreakerError<BusError>) -> Self {
        match e {
            BreakerError::Open(name) => IngestError::CircuitOpen(name),
            BreakerError::Inner(e) => IngestError::Bus(e),
        }
    }
}

/// Ingestor tuning for one zone.
#[derive(Debug, Clone)]
pub struct IngestorOptions {
    pub zone: String,
    pub topic: String,
    pub grace_ms: i64,
    pub buffer_max_epochs: usize,
    pub schema_accept: Vec<String>,
}

// ============================================================================
// Bounded LRU set
// ============================================================================

/// Insertion-ordered set that forgets its oldest members past `cap`.
/// Keeps finalized/rejected bookkeeping at O(buffer) per zone.
struct BoundedLruSet {
    cap: usize,
    set: HashSet<i64>,
    order: VecDeque<i64>,
}

impl BoundedLruSet {
    fn new(cap: usize) -> Self {
        BoundedLruSet { cap: cap.max(1), set: HashSet::new(), order: VecDeque::new() }
    }

    fn contains(&self, key: i64) -> bool {
        self.set.contains(&key)
    }

    fn insert(&mut self, key: i64) {
        if !self.set.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

// ============================================================================
// Match state
// ============================================================================

struct PendingEpoch {
    agg: Option<(AggregatedEpoch, DateTime<Utc>, u64)>,
    mape: Option<(MapeDecision, DateTime<Utc>, u64)>,
    first_seen: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Aggregator,
    Mape,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Aggregator => LEDGER_PARTITION_AGGREGATOR as usize,
            Side::Mape => LEDGER_PARTITION_MAPE as usize,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::Aggregator => "aggregator",
            Side::Mape => "mape",
        }
    }
}

// ============================================================================
// Zone ingestor
// ============================================================================

/// The single-threaded matcher for one zone.
pub struct ZoneIngestor {
    opts: IngestorOptions,
    bus: Arc<dyn PartitionedLog>,
    consumer: Arc<Breaker>,
    store: BlockStore,
    publisher: Arc<Publisher>,
    metrics: Arc<LedgerMetrics>,

    pending: HashMap<i64, PendingEpoch>,
    finalized: BoundedLruSet,
    rejected: BoundedLruSet,

    /// Next fetch position per partition.
    cursors: [u64; 2],
    /// Offsets consumed but not yet at a terminal disposition.
    outstanding: [BTreeSet<u64>; 2],
    /// Highest offset per partition where everything at or below it is
    /// terminal.
    committed: [Option<u64>; 2],
}

impl std::fmt::Debug for ZoneIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneIngestor").finish_non_exhaustive()
    }
}

impl ZoneIngestor {
    /// Bind to the zone topic and enforce the partition contract.
    pub fn new(
        opts: IngestorOptions,
        bus: Arc<dyn PartitionedLog>,
        consumer: Arc<Breaker>,
        store: BlockStore,
        publisher: Arc<Publisher>,
        metrics: Arc<LedgerMetrics>,
    ) -> Result<Self, IngestError> {
        let partitions = bus.partitions(&opts.topic)?;
        if partitions != LEDGER_PARTITIONS {
            return Err(IngestError::PartitionContract { topic: opts.topic.clone(), partitions });
        }
        let buffer = opts.buffer_max_epochs;
        Ok(ZoneIngestor {
            opts,
            bus,
            consumer,
            store,
            publisher,
            metrics,
            pending: HashMap::new(),
            finalized: BoundedLruSet::new(buffer),
            rejected: BoundedLruSet::new(buffer),
            cursors: [0, 0],
            outstanding: [BTreeSet::new(), BTreeSet::new()],
            committed: [None, None],
        })
    }

    /// One poll cycle: fetch both partitions (waiting up to `wait` for
    /// the first), process in offset order, then sweep expired epochs.
    /// Returns the blocks flushed during the cycle.
    pub fn poll(
        &mut self,
        now: DateTime<Utc>,
        wait: Duration,
    ) -> Result<Vec<FlushedBlock>, IngestError> {
        let mut flushed = Vec::new();
        for side in [Side::Aggregator, Side::Mape] {
            let idx = side.index();
            let from = self.cursors[idx];
            let wait = if idx == 0 { wait } else { Duration::ZERO };
            let batch: Vec<Record> = self
                .consumer
                .call(|| self.bus.fetch(&self.opts.topic, idx as u32, from, 256, wait))
                .map_err(IngestError::from)?;
            for rec in batch {
                self.cursors[idx] = rec.offset + 1;
                self.outstanding[idx].insert(rec.offset);
                self.handle_record(side, &rec, now, &mut flushed)?;
            }
        }
        self.sweep_expired(now, &mut flushed)?;
        Ok(flushed)
    }

    /// Highest committed (terminal) offset for a ledger partition.
    pub fn committed_offset(&self, partition: u32) -> Option<u64> {
        self.committed.get(partition as usize).copied().flatten()
    }

    /// Flush whatever sits in the open block (shutdown path).
    pub fn flush_open_block(&mut self, now: DateTime<Utc>) -> Result<Option<FlushedBlock>, IngestError> {
        let flushed = self.store.flush_block(now)?;
        if let Some(block) = &flushed {
            self.hook_published(block);
        }
        Ok(flushed)
    }

    /// Shared handle to the query index.
    pub fn index(&self) -> std::sync::Arc<std::sync::RwLock<Vec<crate::blockstore::LedgerEntry>>> {
        self.store.index()
    }

    fn ack(&mut self, side: Side, offset: u64) {
        let idx = side.index();
        self.outstanding[idx].remove(&offset);
        self.committed[idx] = match self.outstanding[idx].iter().next() {
            Some(lowest_pending) => lowest_pending.checked_sub(1),
            None => self.cursors[idx].checked_sub(1),
        };
    }

    fn handle_record(
        &mut self,
        side: Side,
        rec: &Record,
        now: DateTime<Utc>,
        flushed: &mut Vec<FlushedBlock>,
    ) -> Result<(), IngestError> {
        let value: serde_json::Value = match serde_json::from_slice(&rec.payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(zone = %self.opts.zone, offset = rec.offset, error = %e,
                    "undecodable ledger payload acknowledged");
                self.metrics.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                self.ack(side, rec.offset);
                return Ok(());
            }
        };

        // Schema gate. Empty versions count and pass as v1; unknown
        // versions poison the epoch.
        let raw_version = value.get("schemaVersion").and_then(|v| v.as_str()).unwrap_or("");
        let version = if raw_version.is_empty() {
            self.metrics.tx_schema_empty_total.fetch_add(1, Ordering::Relaxed);
            SCHEMA_V1
        } else {
            raw_version
        };
        let epoch_index = match side {
            Side::Aggregator => value.pointer("/epoch/index").and_then(|v| v.as_i64()),
            Side::Mape => value.get("epochIndex").and_then(|v| v.as_i64()),
        };
        let epoch_index = match epoch_index {
            Some(i) => i,
            None => {
                self.metrics.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                self.ack(side, rec.offset);
                return Ok(());
            }
        };

        if !self.opts.schema_accept.iter().any(|v| v == version) {
            warn!(zone = %self.opts.zone, epoch = epoch_index, side = side.label(),
                version, "unknown schema version; epoch rejected");
            match side {
                Side::Aggregator => {
                    self.metrics.unknown_schema_aggregator_total.fetch_add(1, Ordering::Relaxed)
                }
                Side::Mape => {
                    self.metrics.unknown_schema_mape_total.fetch_add(1, Ordering::Relaxed)
                }
            };
            self.rejected.insert(epoch_index);
            // Any half-matched state for this epoch is dropped; its
            // offsets become terminal.
            if let Some(dropped) = self.pending.remove(&epoch_index) {
                if let Some((_, _, offset)) = dropped.agg {
                    self.ack(Side::Aggregator, offset);
                }
                if let Some((_, _, offset)) = dropped.mape {
                    self.ack(Side::Mape, offset);
                }
            }
            self.ack(side, rec.offset);
            return Ok(());
        }

        if self.rejected.contains(epoch_index) || self.finalized.contains(epoch_index) {
            // Duplicate after finalize, or counterpart of a rejected
            // epoch: acknowledge, never re-persist.
            self.ack(side, rec.offset);
            return Ok(());
        }

        // First arrival of this side only; a repeat before finalization
        // is acknowledged and otherwise ignored.
        let already_present = self
            .pending
            .get(&epoch_index)
            .map(|p| match side {
                Side::Aggregator => p.agg.is_some(),
                Side::Mape => p.mape.is_some(),
            })
            .unwrap_or(false);
        if already_present {
            self.ack(side, rec.offset);
            return Ok(());
        }

        match side {
            Side::Aggregator => match serde_json::from_value::<AggregatedEpoch>(value) {
                Ok(doc) => {
                    self.pending
                        .entry(epoch_index)
                        .or_insert_with(|| PendingEpoch { agg: None, mape: None, first_seen: now })
                        .agg = Some((doc, now, rec.offset));
                }
                Err(e) => {
                    debug!(zone = %self.opts.zone, epoch = epoch_index, error = %e,
                        "aggregated document decode failed");
                    self.metrics.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                    self.ack(side, rec.offset);
                    return Ok(());
                }
            },
            Side::Mape => match serde_json::from_value::<MapeDecision>(value) {
                Ok(doc) => {
                    self.pending
                        .entry(epoch_index)
                        .or_insert_with(|| PendingEpoch { agg: None, mape: None, first_seen: now })
                        .mape = Some((doc, now, rec.offset));
                }
                Err(e) => {
                    debug!(zone = %self.opts.zone, epoch = epoch_index, error = %e,
                        "decision decode failed");
                    self.metrics.decode_errors_total.fetch_add(1, Ordering::Relaxed);
                    self.ack(side, rec.offset);
                    return Ok(());
                }
            },
        }

        if self.pending.get(&epoch_index).map(|p| p.agg.is_some() && p.mape.is_some())
            == Some(true)
        {
            self.finalize(epoch_index, now, false, flushed)?;
        } else if self.pending.len() > self.opts.buffer_max_epochs {
            // Bounded memory: the oldest pending epoch is force-expired.
            if let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.first_seen)
                .map(|(k, _)| *k)
            {
                self.finalize(oldest, now, true, flushed)?;
            }
        }
        Ok(())
    }

    fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
        flushed: &mut Vec<FlushedBlock>,
    ) -> Result<(), IngestError> {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| (now - p.first_seen).num_milliseconds() > self.opts.grace_ms)
            .map(|(k, _)| *k)
            .collect();
        for epoch in expired {
            self.finalize(epoch, now, true, flushed)?;
        }
        Ok(())
    }

    fn finalize(
        &mut self,
        epoch_index: i64,
        now: DateTime<Utc>,
        imputed: bool,
        flushed: &mut Vec<FlushedBlock>,
    ) -> Result<(), IngestError> {
        let entry = match self.pending.remove(&epoch_index) {
            Some(e) => e,
            None => return Ok(()),
        };
        let first_seen = entry.first_seen;
        let mut acks: Vec<(Side, u64)> = Vec::new();

        let (agg, agg_received_at) = match entry.agg {
            Some((doc, at, offset)) => {
                acks.push((Side::Aggregator, offset));
                (doc, at)
            }
            None => {
                let mape = entry.mape.as_ref().map(|(d, _, _)| d);
                (self.impute_aggregator(epoch_index, mape, now), now)
            }
        };
        let (mape, mape_received_at) = match entry.mape {
            Some((doc, at, offset)) => {
                acks.push((Side::Mape, offset));
                (doc, at)
            }
            None => (impute_mape(epoch_index, &agg, now), now),
        };

        if imputed {
            let missing = if acks.iter().any(|(s, _)| *s == Side::Aggregator) {
                Side::Mape
            } else {
                Side::Aggregator
            };
            self.metrics.imputed_total.fetch_add(1, Ordering::Relaxed);
            info!(zone = %self.opts.zone, epoch = epoch_index, missing = missing.label(),
                "epoch finalized by imputation");
        }

        let tx = Transaction {
            tx_type: TX_TYPE_EPOCH_MATCH.into(),
            schema_version: SCHEMA_V1.into(),
            zone_id: self.opts.zone.clone(),
            epoch_index,
            aggregator: agg,
            aggregator_received_at: agg_received_at,
            mape,
            mape_received_at,
            matched_at: now,
            prev_hash: String::new(),
            hash: String::new(),
        };

        if let Some(block) = self.store.append_transaction(tx, now)? {
            self.hook_published(&block);
            flushed.push(block);
        }

        self.finalized.insert(epoch_index);
        for (side, offset) in acks {
            self.ack(side, offset);
        }
        let latency = (now - first_seen).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.match_latency.get().observe(latency);
        Ok(())
    }

    fn hook_published(&self, block: &FlushedBlock) {
        for tx in &block.transactions {
            if let Err(e) = self.publisher.publish(tx, block.block_ref()) {
                warn!(zone = %tx.zone_id, epoch = tx.epoch_index, error = %e,
                    "public publish hook failed");
            }
        }
    }

    /// Synthesize the aggregator side of an epoch that never produced
    /// one. Epoch bounds come from the decision when it carries them.
    fn impute_aggregator(
        &self,
        epoch_index: i64,
        mape: Option<&MapeDecision>,
        now: DateTime<Utc>,
    ) -> AggregatedEpoch {
        let epoch = mape
            .and_then(|d| {
                let start = canonical::parse_rfc3339(&d.epoch_start).ok()?;
                let end = canonical::parse_rfc3339(&d.epoch_end).ok()?;
                let len_ms = (end - start).num_milliseconds();
                (len_ms > 0).then(|| EpochId { index: epoch_index, start, end, len_ms })
            })
            .unwrap_or_else(|| EpochId::from_index(epoch_index, 60_000));
        AggregatedEpoch {
            schema_version: SCHEMA_V1.into(),
            zone_id: self.opts.zone.clone(),
            epoch,
            by_device: Default::default(),
            summary: std::collections::BTreeMap::from([("imputed".to_string(), 1.0)]),
            actuator_energy_kwh_epoch: Default::default(),
            zone_energy_kwh_epoch: 0.0,
            produced_at: now,
        }
    }
}

/// Synthesize a hold decision for an epoch whose MAPE side never
/// arrived. `targetC` echoes the aggregator's summary when present and
/// is otherwise 0; it is not authoritative for hold events.
fn impute_mape(epoch_index: i64, agg: &AggregatedEpoch, now: DateTime<Utc>) -> MapeDecision {
    MapeDecision {
        schema_version: SCHEMA_V1.into(),
        epoch_index,
        zone_id: agg.zone_id.clone(),
        planned: PlannedAction::Hold,
        target_c: agg.summary.get("targetC").copied().unwrap_or(0.0),
        hysteresis_c: 0.0,
        delta_c: 0.0,
        fan: 0,
        epoch_start: canonical::rfc3339_nano(&agg.epoch.start),
        epoch_end: canonical::rfc3339_nano(&agg.epoch.end),
        timestamp: now.timestamp_millis(),
    }
}

// ============================================================================
// Tests
// ============================================================================
