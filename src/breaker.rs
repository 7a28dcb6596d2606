//! Named circuit breaker wrapping every outbound log call
//!
//! One breaker exists per logical role (reader, writer, public-writer,
//! ledger-consumer) and is shared across everything performing that role,
//! so repeated failures accumulate in one place.
//!
//! States and transitions:
//!
//! - `closed`: calls pass through; `failure_threshold` consecutive
//!   failures trip the breaker open.
//! - `open`: calls fail fast for `open_seconds`; when the window
//!   expires the next call is admitted as a half-open probe.
//! - `half-open`: exactly one probe in flight at a time; callers that
//!   lose the race fail fast. `success_threshold` probe successes close
//!   the breaker; one probe failure re-opens it.
//!
//! Every transition is logged with the breaker's name.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

/// Breaker tuning, deserialized from service config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_seconds: u64,
    /// Upper bound services apply to a single fetch/produce wait.
    pub timeout_ms: u64,
    /// Pause between consecutive failed probes driven by callers.
    pub backoff_ms: u64,
    pub enabled: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_seconds: 10,
            timeout_ms: 2_000,
            backoff_ms: 250,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        })
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    probe_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// Error surface of a breaker-guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker refused the call without attempting it.
    #[error("circuit breaker {0} is open")]
    Open(String),
    /// The underlying call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// A named circuit breaker. Cheap to share behind an `Arc`.
pub struct Breaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Breaker {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as a label, for metrics and diagnostics.
    pub fn state_label(&self) -> &'static str {
        match self.inner.lock().unwrap().state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    /// Run `op` under the breaker.
    ///
    /// The operation itself executes outside the state lock; only the
    /// admit/record steps are serialized.
    pub fn call<T, E>(&self, op: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        if !self.cfg.enabled {
            return op().map_err(BreakerError::Inner);
        }
        let is_probe = self.admit().map_err(BreakerError::Open)?;
        match op() {
            Ok(v) => {
                self.record_success(is_probe);
                Ok(v)
            }
            Err(e) => {
                self.record_failure(is_probe);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Admit or refuse a call. `Ok(true)` marks the admitted call as the
    /// half-open probe; `Err` carries the breaker name for fail-fast.
    fn admit(&self) -> Result<bool, String> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(false),
            State::Open => {
                let elapsed =
                    inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.cfg.open_seconds) {
                    self.transition(&mut inner, State::HalfOpen);
                    inner.probe_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.name.clone())
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.name.clone())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self, is_probe: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => inner.consecutive_failures = 0,
            State::HalfOpen => {
                if is_probe {
                    inner.probe_in_flight = false;
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.cfg.success_threshold {
                        self.transition(&mut inner, State::Closed);
                        inner.consecutive_failures = 0;
                    }
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self, is_probe: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition(&mut inner, State::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                if is_probe {
                    inner.probe_in_flight = false;
                }
                self.transition(&mut inner, State::Open);
                inner.opened_at = Some(Instant::now());
            }
            State::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        if inner.state == to {
            return;
        }
        if to == State::Open {
            warn!(breaker = %self.name, from = %inner.state, to = %to, "circuit breaker opened");
        } else {
            info!(breaker = %self.name, from = %inner.state, to = %to, "circuit breaker transition");
        }
        inner.state = to;
    }
}

impl<E> BreakerError<E> {
    /// True when the call never ran because the breaker was open.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

// ============================================================================
// Tests
// ============================================================================
