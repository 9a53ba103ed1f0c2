// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Leaky-bucket rate limiter keyed by IP or sender id, with whitelisting
//! and an age-based reaper task.

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitParams {
    pub capacity: u32,
    pub leaked_tokens: u32,
    pub leak_duration: Duration,
    pub poll_duration: Duration,
    pub bucket_max_age: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_leak: Instant,
    whitelisted: bool,
    last_access: Instant,
}

/// A single leaky bucket. Interior-mutable so it can live behind a shared
/// map entry without an outer lock on every access.
pub struct LeakyBucket {
    capacity: u32,
    leaked_tokens: u32,
    leak_duration: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    fn new(params: &RateLimitParams, whitelisted: bool) -> Self {
        let now = Instant::now();
        LeakyBucket {
            capacity: params.capacity,
            leaked_tokens: params.leaked_tokens,
            leak_duration: params.leak_duration,
            state: Mutex::new(BucketState {
                tokens: 0,
                last_leak: now,
                whitelisted,
                last_access: now,
            }),
        }
    }

    fn leak(&self, state: &mut BucketState, now: Instant) {
        if self.leak_duration.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_leak);
        let periods = (elapsed.as_nanos() / self.leak_duration.as_nanos().max(1)) as u32;
        if periods > 0 {
            let leaked = periods.saturating_mul(self.leaked_tokens);
            state.tokens = state.tokens.saturating_sub(leaked);
            state.last_leak += self.leak_duration * periods;
        }
    }

    /// Applies the leak, then admits `n` tokens if `tokens + n <= capacity`.
    pub fn add(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        state.last_access = now;
        if state.tokens + n <= self.capacity {
            state.tokens += n;
            true
        } else {
            false
        }
    }

    pub fn is_whitelisted(&self) -> bool {
        self.state.lock().whitelisted
    }

    pub fn set_whitelisted(&self, whitelisted: bool) {
        self.state.lock().whitelisted = whitelisted;
    }

    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.leak(&mut state, now);
        self.capacity.saturating_sub(state.tokens)
    }

    fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        let state = self.state.lock();
        !state.whitelisted && now.saturating_duration_since(state.last_access) > max_age
    }
}

/// Map from key (IP or sender id, as a string) to [`LeakyBucket`]. Lookup is
/// lazy-create.
pub struct RateLimiter {
    params: RateLimitParams,
    buckets: DashMap<String, std::sync::Arc<LeakyBucket>>,
}

impl RateLimiter {
    pub fn new(params: RateLimitParams) -> Self {
        RateLimiter {
            params,
            buckets: DashMap::new(),
        }
    }

    pub fn lookup_bucket(&self, key: &str) -> std::sync::Arc<LeakyBucket> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(LeakyBucket::new(&self.params, false)))
            .clone()
    }

    pub fn whitelist(&self, key: &str) {
        self.lookup_bucket(key).set_whitelisted(true);
    }

    /// Evicts buckets whose `last_access` is older than `bucket_max_age` and
    /// that are not whitelisted.
    pub fn reap(&self) {
        let now = Instant::now();
        let max_age = self.params.bucket_max_age;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_stale(now, max_age));
        let reaped = before - self.buckets.len();
        if reaped > 0 {
            debug!("rate limiter reaper evicted {reaped} stale buckets");
        }
    }

    pub fn poll_duration(&self) -> Duration {
        self.params.poll_duration
    }

    /// Spawns the background reaper loop. The returned handle is not
    /// awaited by callers; it runs for the lifetime of the orchestrator.
    pub fn spawn_reaper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_duration());
            loop {
                interval.tick().await;
                self.reap();
            }
        })
    }

    /// Admission policy used by `PutMessage`/`PutManyMessages`: rejected
    /// only if neither the IP bucket is whitelisted nor the id bucket
    /// accepts one token.
    pub fn admit(&self, ip_key: &str, id_key: &str) -> bool {
        let ip_bucket = self.lookup_bucket(ip_key);
        if ip_bucket.is_whitelisted() {
            return true;
        }
        let id_bucket = self.lookup_bucket(id_key);
        id_bucket.add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RateLimitParams {
        RateLimitParams {
            capacity: 5,
            leaked_tokens: 1,
            leak_duration: Duration::from_secs(3600),
            poll_duration: Duration::from_secs(60),
            bucket_max_age: Duration::from_secs(60),
        }
    }

    #[test]
    fn add_respects_capacity_boundary() {
        let bucket = LeakyBucket::new(&params(), false);
        for _ in 0..5 {
            assert!(bucket.add(1));
        }
        assert!(!bucket.add(1));
    }

    #[test]
    fn whitelisted_bypasses_admission() {
        let limiter = RateLimiter::new(params());
        limiter.whitelist("1.2.3.4");
        for _ in 0..10 {
            assert!(limiter.admit("1.2.3.4", "some-id"));
        }
    }

    #[test]
    fn admission_rejected_when_id_bucket_full() {
        let limiter = RateLimiter::new(params());
        for _ in 0..5 {
            assert!(limiter.admit("1.2.3.4", "some-id"));
        }
        assert!(!limiter.admit("1.2.3.4", "some-id"));
    }

    #[test]
    fn remaining_reflects_capacity_minus_tokens() {
        let bucket = LeakyBucket::new(&params(), false);
        bucket.add(2);
        assert_eq!(bucket.remaining(), 3);
    }
}
