//! Crate root: public surface and platform-wide invariants
//!
//! NRG CHAMP is a zone-scoped epoch pipeline for distributed HVAC
//! control. For every fixed wall-clock window ("epoch"), device telemetry
//! is aggregated per zone, a control decision is planned with hysteresis,
//! actuator commands are dispatched, and an immutable match record
//! linking aggregation and decision is appended to a per-zone
//! hash-chained ledger.
//!
//! ## Invariants (platform-wide)
//!
//! - **Epoch alignment.** `index = floor(unix_ms(t) / epoch_len_ms)`,
//!   identical across services and zones; no component invents its own
//!   grid.
//! - **Partition roles.** `zone.ledger.{zoneId}` has exactly two
//!   partitions: 0 carries aggregator summaries, 1 carries MAPE
//!   decisions. Anything else is a fatal contract violation.
//! - **One canonical serialization.** Every hashing site (transaction
//!   hashes, Merkle leaves, header hashes) and the public payload go
//!   through [`canonical`]; two canonicalizations of the same value are
//!   byte-identical.
//! - **Breaker-wrapped I/O.** Every outbound log call is routed through a
//!   named circuit breaker shared per logical role, so failures
//!   accumulate where operators expect them.
//!
//! The service daemons live in `src/bin/`: `aggregatord`, `maped`,
//! `ledgerd`, and the offline `ledger_verify`.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Canonical JSON, SHA-256 digests, RFC3339Nano time codec.
pub mod canonical;
/// Wire and ledger data model.
pub mod model;
/// Partitioned-log contract, Murmur2 balancer, in-process broker,
/// durable offsets.
pub mod bus;
/// Named circuit breaker.
pub mod breaker;
/// Fixed-name counters, gauges, and histograms.
pub mod metrics;
/// TOML service configs and the MAPE properties file.
pub mod config;
/// Component A: epoch-aligned aggregation.
pub mod aggregator;
/// Component B: the MAPE control loop.
pub mod mape;
/// Component C: the per-zone epoch matcher.
pub mod ingest;
/// Component D: the hash-chained block store.
pub mod blockstore;
/// Component E: the public epoch publisher.
pub mod publisher;
/// HTTP surfaces (MAPE config API, ledger query API).
pub mod http;

// ============================================================================
// Canonical re-exports
// ============================================================================

pub use crate::aggregator::Aggregator;
pub use crate::breaker::{Breaker, BreakerConfig};
pub use crate::bus::{MemoryBus, OffsetStore, PartitionedLog};
pub use crate::ingest::ZoneIngestor;
pub use crate::mape::MapeEngine;
pub use crate::model::{AggregatedEpoch, EpochId, MapeDecision, PublicEpoch, Reading, Transaction};
pub use crate::publisher::Publisher;

// ============================================================================
// Shutdown token
// ============================================================================

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cooperative cancellation shared by every service loop.
///
/// Loops sleep with [`Shutdown::wait_timeout`] instead of a bare sleep so
/// a trigger wakes them immediately.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown { inner: Arc::new((Mutex::new(false), Condvar::new())) }
    }

    /// Trip the token and wake every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Sleep for at most `timeout`. Returns true when the token tripped
    /// (now or earlier), false when the timeout elapsed quietly.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*triggered {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(triggered, remaining).unwrap();
            triggered = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_wakes_waiters() {
        let token = Shutdown::new();
        assert!(!token.is_triggered());
        assert!(!token.wait_timeout(Duration::from_millis(5)));

        let t2 = token.clone();
        let handle = std::thread::spawn(move || t2.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.trigger();
        assert!(handle.join().unwrap());
        assert!(token.is_triggered());
        assert!(token.wait_timeout(Duration::from_millis(1)), "already-tripped returns fast");
    }
}
