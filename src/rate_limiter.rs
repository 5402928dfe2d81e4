//! Per-identity sliding-window admission control.
//!
//! Each identity owns its own window behind its own mutex, so the
//! prune-check-append sequence is atomic per identity while unrelated
//! identities never wait on each other. The identity map itself is a
//! sharded [`DashMap`]; a shard guard is only held long enough to clone the
//! window handle.

use std::{
    collections::VecDeque,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::LimiterConfig;

/// Idle identities are swept once per this many windows.
const SWEEP_INTERVAL_WINDOWS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    /// Whole seconds to wait, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        };
        rounded.max(1)
    }
}

#[derive(Debug, Default)]
struct RequestWindow {
    timestamps: VecDeque<Instant>,
}

impl RequestWindow {
    fn prune(&mut self, cutoff: Instant) {
        while self
            .timestamps
            .front()
            .is_some_and(|timestamp| *timestamp <= cutoff)
        {
            self.timestamps.pop_front();
        }
    }

    fn last_seen(&self) -> Option<Instant> {
        self.timestamps.back().copied()
    }
}

#[derive(Debug)]
pub struct RateLimiter<K = String>
where
    K: Eq + Hash,
{
    max_requests: usize,
    window: Duration,
    windows: DashMap<K, Arc<Mutex<RequestWindow>>>,
    last_sweep: Mutex<Option<Instant>>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1),
            window: config.window,
            windows: DashMap::new(),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of identities currently holding window state.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    pub fn admit(&self, identity: &K) -> Result<(), RateLimitExceeded> {
        self.admit_at(identity, Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn admit_at(&self, identity: &K, now: Instant) -> Result<(), RateLimitExceeded> {
        self.maybe_sweep(now);

        let window = self.window_for(identity);
        let mut state = lock(&window);

        // Clock readings taken just before the lock can arrive out of order;
        // the window stays sorted by never recording an earlier time.
        let now = state.last_seen().map_or(now, |last| last.max(now));

        if let Some(cutoff) = now.checked_sub(self.window) {
            state.prune(cutoff);
        }

        if state.timestamps.len() >= self.max_requests {
            let retry_after = state
                .timestamps
                .front()
                .and_then(|oldest| oldest.checked_add(self.window))
                .map(|leaves_at| leaves_at.saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(RateLimitExceeded { retry_after });
        }

        state.timestamps.push_back(now);
        Ok(())
    }

    fn window_for(&self, identity: &K) -> Arc<Mutex<RequestWindow>> {
        if let Some(existing) = self.windows.get(identity) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.windows
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(RequestWindow::default())))
                .value(),
        )
    }

    fn maybe_sweep(&self, now: Instant) {
        // A window this long never leaves anything idle enough to sweep.
        let Some(interval) = self.window.checked_mul(SWEEP_INTERVAL_WINDOWS) else {
            return;
        };

        {
            let mut last_sweep = self
                .last_sweep
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *last_sweep {
                None => {
                    *last_sweep = Some(now);
                    return;
                }
                Some(previous) if now.saturating_duration_since(previous) < interval => return,
                Some(_) => *last_sweep = Some(now),
            }
        }

        let Some(cutoff) = now.checked_sub(interval) else {
            return;
        };

        let before = self.windows.len();
        // A handle cloned by an in-flight call keeps its entry alive, so an
        // admitted timestamp can never be dropped together with its window.
        self.windows.retain(|_, window| {
            Arc::strong_count(window) > 1
                || lock(window)
                    .last_seen()
                    .is_some_and(|last_seen| last_seen > cutoff)
        });
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!("rate limiter evicted {evicted} idle identities");
        }
    }
}

fn lock(window: &Mutex<RequestWindow>) -> MutexGuard<'_, RequestWindow> {
    window.lock().unwrap_or_else(PoisonError::into_inner)
}
