//! Per-client upload budget limiter.
//!
//! Each client accumulates accepted bytes inside a renewing window: every
//! accepted upload pushes the window expiry a full hour forward from that
//! moment. A single request at or above the per-request cap is rejected
//! outright, and a request that would push the window total to the budget is
//! rejected with hints about the remaining allowance and the wait time.
//!
//! `check` never mutates an entry; callers commit the upload first and then
//! call `record` with the usage the check reported. All map mutation goes
//! through one mutex, which serializes the read-modify-write per client.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Largest single request accepted, in bytes.
    pub max_request_bytes: u64,
    /// Total bytes a client may upload within one window.
    pub window_budget_bytes: u64,
    /// Window length; renewed on every accepted upload.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 10 * 1024 * 1024,
            window_budget_bytes: 50 * 1024 * 1024,
            window: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of a budget check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Admit the request. `bytes_used` is the window usage the check saw;
    /// pass it back to [`RateLimiter::record`] after the commit succeeds.
    Allow { bytes_used: u64 },
    /// The request alone reaches the per-request cap.
    TooLarge,
    /// The window budget would be reached.
    BudgetExceeded {
        /// Bytes the client could still upload in this window.
        remaining_bytes: u64,
        /// Whole minutes until the window lapses, rounded up.
        wait_minutes: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_expires_at_ms: u64,
    bytes_used: u64,
}

/// Byte-budget rate limiter keyed by client address.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    config: RateLimitConfig,
    entries: Mutex<HashMap<IpAddr, WindowEntry>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or_default()
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                config,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Decide whether a request of `request_bytes` from `client` is admitted.
    pub fn check(&self, client: IpAddr, request_bytes: u64) -> Decision {
        self.check_at(client, request_bytes, now_ms())
    }

    /// Commit an accepted upload: replace the client's entry with a freshly
    /// renewed window holding `total_bytes` (prior usage plus this request).
    pub fn record(&self, client: IpAddr, total_bytes: u64) {
        self.record_at(client, total_bytes, now_ms());
    }

    /// Drop entries whose window has lapsed so the map stays bounded.
    /// Returns the number of entries evicted.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(now_ms())
    }

    /// Number of tracked clients.
    pub fn tracked_clients(&self) -> usize {
        self.inner.entries.lock().len()
    }

    fn check_at(&self, client: IpAddr, request_bytes: u64, now: u64) -> Decision {
        let config = &self.inner.config;

        if request_bytes >= config.max_request_bytes {
            return Decision::TooLarge;
        }

        let entries = self.inner.entries.lock();
        // A lapsed window counts as zero usage; the stale entry itself is
        // only replaced by the next accepted upload or the eviction pass.
        let entry = entries
            .get(&client)
            .filter(|entry| now < entry.window_expires_at_ms);

        let bytes_used = entry.map(|entry| entry.bytes_used).unwrap_or(0);
        if bytes_used + request_bytes >= config.window_budget_bytes {
            let window_expires_at_ms = entry
                .map(|entry| entry.window_expires_at_ms)
                .unwrap_or(now);
            let wait_ms = window_expires_at_ms.saturating_sub(now);
            return Decision::BudgetExceeded {
                remaining_bytes: config.window_budget_bytes - bytes_used,
                wait_minutes: wait_ms.div_ceil(60_000),
            };
        }

        Decision::Allow { bytes_used }
    }

    fn record_at(&self, client: IpAddr, total_bytes: u64, now: u64) {
        let window = self.inner.config.window.as_millis() as u64;
        let mut entries = self.inner.entries.lock();
        entries.insert(
            client,
            WindowEntry {
                window_expires_at_ms: now + window,
                bytes_used: total_bytes,
            },
        );
        debug!(%client, bytes = total_bytes, "renewed rate-limit window");
    }

    fn evict_stale_at(&self, now: u64) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.window_expires_at_ms);
        before - entries.len()
    }
}
