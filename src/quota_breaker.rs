// =============================================================================
// quota_breaker.rs - KNOWING WHEN TO STOP
// =============================================================================
//
// The analyzer already retries rate-limit errors with backoff. If an item
// still fails after that, and the next one fails, and the one after that,
// the provider's daily quota is almost certainly gone. Every further call
// would burn a minute of backoff for nothing.
//
// So this is a circuit breaker without a half-open state: it trips after N
// consecutive failures and stays open for the rest of the run. A success
// anywhere in between resets the count. Tomorrow's scheduled run starts
// with a fresh breaker.
// =============================================================================

use parking_lot::RwLock;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Quota considered exhausted; no more calls this run.
    Tripped,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Tripped => write!(f, "TRIPPED"),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    tripped_at: Option<Instant>,
    last_error: Option<String>,
}

pub struct QuotaBreaker {
    name: String,
    inner: RwLock<BreakerInner>,
    failure_threshold: u32,
}

impl QuotaBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32) -> Self {
        let name = name.into();
        let failure_threshold = failure_threshold.max(1);
        info!(name = %name, failure_threshold, "Quota breaker armed");

        Self {
            name,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                tripped_at: None,
                last_error: None,
            }),
            failure_threshold,
        }
    }

    pub fn allow_request(&self) -> bool {
        self.inner.read().state == BreakerState::Closed
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    /// Record a failed item. Returns `true` when this failure tripped the
    /// breaker.
    pub fn record_failure(&self, error: &str) -> bool {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());

        if inner.state == BreakerState::Tripped {
            return false;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.state = BreakerState::Tripped;
            inner.tripped_at = Some(Instant::now());
            warn!(
                name = %self.name,
                failures = inner.consecutive_failures,
                last_error = %error,
                "Quota breaker TRIPPED - treating provider quota as exhausted for this run"
            );
            true
        } else {
            warn!(
                name = %self.name,
                failures = inner.consecutive_failures,
                threshold = self.failure_threshold,
                "Analysis failure {}/{} before the breaker trips",
                inner.consecutive_failures,
                self.failure_threshold
            );
            false
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    pub fn is_tripped(&self) -> bool {
        self.state() == BreakerState::Tripped
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            secs_since_trip: inner.tripped_at.map(|t| t.elapsed().as_secs()),
            last_error: inner.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub secs_since_trip: Option<u64>,
    pub last_error: Option<String>,
}
