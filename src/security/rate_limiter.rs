//! Fixed-window admission control keyed by caller identity.
//!
//! Counting happens against a shared [`CounterStore`] whose
//! increment-and-set-expiry is one indivisible operation: the expiry for
//! a window is written in the same locked step that creates its counter,
//! so no counter can outlive its window because a caller died between
//! "increment" and "expire".

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Current epoch seconds.
fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Counter store ────────────────────────────────────────────────

#[derive(Debug)]
struct WindowCounter {
    count: u64,
    expires_at: u64,
}

/// Shared store of auto-expiring counters. One instance per process,
/// shared by reference into every session.
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `key`, creating it with `expires_at` when absent, and
    /// return the post-increment value. Expired counters are swept in
    /// the same locked step.
    pub fn incr_with_expiry(&self, key: &str, expires_at: u64, now: u64) -> u64 {
        let mut counters = self.counters.lock();
        counters.retain(|_, counter| counter.expires_at > now);

        let counter = counters.entry(key.to_owned()).or_insert(WindowCounter {
            count: 0,
            expires_at,
        });
        counter.count += 1;
        counter.count
    }

    /// Number of live (unexpired as of last access) counters.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Limiter ──────────────────────────────────────────────────────

/// Fixed-window rate limiter: at most `limit` admissions per identity
/// per `window_secs`-second window. A limit of 0 disables limiting.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    store: Arc<CounterStore>,
    limit: u64,
    window_secs: u64,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<CounterStore>, limit: u64, window_secs: u64) -> Self {
        Self {
            store,
            limit,
            window_secs: window_secs.max(1),
        }
    }

    /// Whether this identity is admitted right now.
    pub fn admit(&self, identity: &str) -> bool {
        self.admit_at(identity, now_secs())
    }

    fn admit_at(&self, identity: &str, now: u64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let window_id = now / self.window_secs;
        let key = format!("{identity}:{window_id}");
        let window_end = (window_id + 1) * self.window_secs;
        let count = self.store.incr_with_expiry(&key, window_end, now);
        if count > self.limit {
            tracing::warn!(identity, count, limit = self.limit, "admission denied");
            return false;
        }
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
