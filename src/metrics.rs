//! Counters, gauges, and the match-latency histogram
//!
//! Metric names and semantics on the ledger path are a fixed contract:
//!
//! - `ledger_ingest_imputed_total`
//! - `ledger_ingest_decode_errors_total`
//! - `ledger_ingest_match_latency_seconds` (histogram)
//! - `ledger_ingest_unknown_schema_total{side="aggregator"|"mape"}`
//! - `ledger_load_tx_schema_empty_total`
//! - `ledger_public_publish_total{result="ok"|"fail"}`
//! - `ledger_public_last_error_ts`
//! - `ledger_public_queue_depth`
//!
//! Everything is a plain atomic; collectors are shared behind `Arc` and
//! rendered into Prometheus text exposition on demand by the `/metrics`
//! handlers.

#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fixed-bucket latency histogram (seconds), safe for concurrent observes.
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum kept in microseconds so it stays an atomic integer.
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = (0..bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Histogram { bounds, counts, sum_micros: AtomicU64::new(0), total: AtomicU64::new(0) }
    }

    /// Buckets suited to a grace period measured in seconds.
    pub fn match_latency_default() -> Self {
        Self::new(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    }

    pub fn observe(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        for (i, bound) in self.bounds.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros.fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, bound) in self.bounds.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.counts[i].load(Ordering::Relaxed)
            );
        }
        let total = self.total.load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}");
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {total}");
    }
}

/// Ledger-path collector: ingest, load, and public-publish metrics.
#[derive(Default)]
pub struct LedgerMetrics {
    pub imputed_total: AtomicU64,
    pub decode_errors_total: AtomicU64,
    pub unknown_schema_aggregator_total: AtomicU64,
    pub unknown_schema_mape_total: AtomicU64,
    pub tx_schema_empty_total: AtomicU64,
    pub match_latency: OnceHistogram,
    pub public_publish_ok: AtomicU64,
    pub public_publish_fail: AtomicU64,
    /// Unix seconds of the last failed public publish, 0 when none.
    pub public_last_error_ts: AtomicI64,
    pub public_queue_depth: AtomicI64,
}

/// Lazily built histogram so `LedgerMetrics` can derive `Default`.
pub struct OnceHistogram(std::sync::OnceLock<Histogram>);

impl Default for OnceHistogram {
    fn default() -> Self {
        OnceHistogram(std::sync::OnceLock::new())
    }
}

impl OnceHistogram {
    pub fn get(&self) -> &Histogram {
        self.0.get_or_init(Histogram::match_latency_default)
    }
}

impl LedgerMetrics {
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        counter(
            &mut out,
            "ledger_ingest_imputed_total",
            self.imputed_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ledger_ingest_decode_errors_total",
            self.decode_errors_total.load(Ordering::Relaxed),
        );
        let _ = writeln!(out, "# TYPE ledger_ingest_unknown_schema_total counter");
        let _ = writeln!(
            out,
            "ledger_ingest_unknown_schema_total{{side=\"aggregator\"}} {}",
            self.unknown_schema_aggregator_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "ledger_ingest_unknown_schema_total{{side=\"mape\"}} {}",
            self.unknown_schema_mape_total.load(Ordering::Relaxed)
        );
        counter(
            &mut out,
            "ledger_load_tx_schema_empty_total",
            self.tx_schema_empty_total.load(Ordering::Relaxed),
        );
        self.match_latency.get().render("ledger_ingest_match_latency_seconds", &mut out);
        let _ = writeln!(out, "# TYPE ledger_public_publish_total counter");
        let _ = writeln!(
            out,
            "ledger_public_publish_total{{result=\"ok\"}} {}",
            self.public_publish_ok.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "ledger_public_publish_total{{result=\"fail\"}} {}",
            self.public_publish_fail.load(Ordering::Relaxed)
        );
        gauge(
            &mut out,
            "ledger_public_last_error_ts",
            self.public_last_error_ts.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ledger_public_queue_depth",
            self.public_queue_depth.load(Ordering::Relaxed),
        );
        out
    }
}

/// Aggregator-side collector.
#[derive(Default)]
pub struct AggregatorMetrics {
    pub epochs_emitted_total: AtomicU64,
    pub readings_included_total: AtomicU64,
    pub readings_late_total: AtomicU64,
    pub readings_outlier_total: AtomicU64,
    pub decode_errors_total: AtomicU64,
}

impl AggregatorMetrics {
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(512);
        counter(
            &mut out,
            "aggregator_epochs_emitted_total",
            self.epochs_emitted_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "aggregator_readings_included_total",
            self.readings_included_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "aggregator_readings_late_total",
            self.readings_late_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "aggregator_readings_outlier_total",
            self.readings_outlier_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "aggregator_decode_errors_total",
            self.decode_errors_total.load(Ordering::Relaxed),
        );
        out
    }
}

/// MAPE-side collector.
#[derive(Default)]
pub struct MapeMetrics {
    pub decisions_total: AtomicU64,
    pub commands_total: AtomicU64,
    pub stale_documents_total: AtomicU64,
}

impl MapeMetrics {
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(256);
        counter(&mut out, "mape_decisions_total", self.decisions_total.load(Ordering::Relaxed));
        counter(&mut out, "mape_commands_total", self.commands_total.load(Ordering::Relaxed));
        counter(
            &mut out,
            "mape_stale_documents_total",
            self.stale_documents_total.load(Ordering::Relaxed),
        );
        out
    }
}

fn counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, value: i64) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(vec![0.1, 1.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(5.0);
        let mut out = String::new();
        h.render("m", &mut out);
        assert!(out.contains("m_bucket{le=\"0.1\"} 1"));
        assert!(out.contains("m_bucket{le=\"1\"} 2"));
        assert!(out.contains("m_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("m_count 3"));
    }

    #[test]
    fn ledger_render_uses_fixed_names() {
        let m = LedgerMetrics::default();
        m.imputed_total.fetch_add(2, Ordering::Relaxed);
        m.public_publish_fail.fetch_add(1, Ordering::Relaxed);
        m.public_queue_depth.store(3, Ordering::Relaxed);
        let text = m.render_prometheus();
        assert!(text.contains("ledger_ingest_imputed_total 2"));
        assert!(text.contains("ledger_public_publish_total{result=\"fail\"} 1"));
        assert!(text.contains("ledger_public_publish_total{result=\"ok\"} 0"));
        assert!(text.contains("ledger_public_queue_depth 3"));
        assert!(text.contains("ledger_ingest_match_latency_seconds_count 0"));
        assert!(text.contains("ledger_load_tx_schema_empty_total 0"));
    }
}
