// =============================================================================
// rate_budget.rs - THE ROLLING MINUTE
// =============================================================================
//
// Both providers enforce per-minute ceilings on requests and on input tokens.
// Before each analysis call we reserve one request plus the estimated token
// count against a window that resets once sixty seconds have passed since it
// opened. If the reservation would break either ceiling we sleep until the
// window rolls over and start a fresh one.
//
// The arithmetic lives in `reserve_at`, which takes "now" as an argument so
// tests don't have to sleep.
// =============================================================================

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    requests: u32,
    tokens: u64,
}

pub struct RateBudget {
    requests_per_minute: u32,
    tokens_per_minute: u64,
    window: Mutex<Window>,
}

impl RateBudget {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            tokens_per_minute: tokens_per_minute.max(1),
            window: Mutex::new(Window {
                started: Instant::now(),
                requests: 0,
                tokens: 0,
            }),
        }
    }

    /// Reserve one request of `tokens` at `now`. Returns how long the caller
    /// must wait before sending it; the reservation itself is already booked
    /// into the window that will be current at that time.
    pub fn reserve_at(&self, now: Instant, tokens: u64) -> Duration {
        let mut window = self.window.lock();

        if now.saturating_duration_since(window.started) >= WINDOW {
            window.started = now;
            window.requests = 0;
            window.tokens = 0;
        }

        let over_requests = window.requests + 1 > self.requests_per_minute;
        // A single oversized document still gets sent, alone in its window.
        let over_tokens = window.requests > 0 && window.tokens + tokens > self.tokens_per_minute;

        if over_requests || over_tokens {
            let wait = (window.started + WINDOW).saturating_duration_since(now);
            window.started = now + wait;
            window.requests = 1;
            window.tokens = tokens;
            return wait;
        }

        window.requests += 1;
        window.tokens += tokens;
        Duration::ZERO
    }

    /// Sleep as long as the budget demands, then return.
    pub async fn acquire(&self, tokens: u64) {
        let wait = self.reserve_at(Instant::now(), tokens);
        if !wait.is_zero() {
            info!(
                wait_secs = wait.as_secs(),
                tokens,
                rpm = self.requests_per_minute,
                tpm = self.tokens_per_minute,
                "Per-minute budget reached, waiting for the window to roll over"
            );
            tokio::time::sleep(wait).await;
        }
    }

    pub fn usage(&self) -> (u32, u64) {
        let window = self.window.lock();
        (window.requests, window.tokens)
    }
}
