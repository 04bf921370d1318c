//! Progressive login rate limiting
//!
//! Failed logins feed per-key buckets whose cooldown grows with the
//! failure count: 3 failures lock for 30 s, 6 for 60 s, 9 for 5 min and
//! 12 for 15 min. The count never decays on its own; only a successful
//! authentication resets the bucket. Login attempts are double-keyed by
//! client IP and by target username so neither can be used to sidestep
//! the other.

use dashmap::DashMap;

use crate::now_ms;

/// Cooldown tiers: (failure count threshold, lock duration in ms).
const TIERS: [(u32, u64); 4] = [
    (12, 15 * 60 * 1000),
    (9, 5 * 60 * 1000),
    (6, 60 * 1000),
    (3, 30 * 1000),
];

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    locked_until: u64,
}

/// Shared login rate limiter keyed by opaque strings.
#[derive(Debug, Default)]
pub struct LoginRateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock duration for a given failure count (monotonic step function).
    fn tier(count: u32) -> u64 {
        for &(threshold, duration) in &TIERS {
            if count >= threshold {
                return duration;
            }
        }
        0
    }

    /// Remaining lock time for a key in milliseconds; 0 when unlocked.
    pub fn check(&self, key: &str) -> u64 {
        self.check_at(key, now_ms())
    }

    fn check_at(&self, key: &str, now: u64) -> u64 {
        match self.buckets.get(key) {
            Some(bucket) => bucket.locked_until.saturating_sub(now),
            None => 0,
        }
    }

    /// Record a failed attempt against a key.
    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, now_ms());
    }

    fn record_failure_at(&self, key: &str, now: u64) {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert(Bucket { count: 0, locked_until: 0 });
        bucket.count += 1;
        bucket.locked_until = now + Self::tier(bucket.count);
    }

    /// Clear a key after successful authentication.
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn ip_key(ip: &str) -> String {
        format!("ip:{ip}")
    }

    fn user_key(username: &str) -> String {
        format!("user:{}", username.to_lowercase())
    }

    /// Remaining lock across both the IP and the username key.
    pub fn check_double(&self, ip: &str, username: &str) -> u64 {
        self.check(&Self::ip_key(ip))
            .max(self.check(&Self::user_key(username)))
    }

    /// Penalise both keys for a failed attempt.
    pub fn record_double_failure(&self, ip: &str, username: &str) {
        self.record_failure(&Self::ip_key(ip));
        self.record_failure(&Self::user_key(username));
    }

    /// Reset both keys after a successful login.
    pub fn reset_double(&self, ip: &str, username: &str) {
        self.reset(&Self::ip_key(ip));
        self.reset(&Self::user_key(username));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_lock_below_three_failures() {
        let limiter = LoginRateLimiter::new();
        let now = 1_000_000;
        limiter.record_failure_at("k", now);
        limiter.record_failure_at("k", now);
        assert_eq!(limiter.check_at("k", now), 0);
    }

    #[test]
    fn test_tier_progression() {
        assert_eq!(LoginRateLimiter::tier(2), 0);
        assert_eq!(LoginRateLimiter::tier(3), 30_000);
        assert_eq!(LoginRateLimiter::tier(5), 30_000);
        assert_eq!(LoginRateLimiter::tier(6), 60_000);
        assert_eq!(LoginRateLimiter::tier(9), 300_000);
        assert_eq!(LoginRateLimiter::tier(12), 900_000);
        assert_eq!(LoginRateLimiter::tier(100), 900_000);
    }

    #[test]
    fn test_cooldown_monotonic_in_failures() {
        let limiter = LoginRateLimiter::new();
        let now = 1_000_000;
        let mut last = 0;
        for _ in 0..15 {
            limiter.record_failure_at("k", now);
            let remaining = limiter.check_at("k", now);
            assert!(remaining >= last, "cooldown must not shrink as failures grow");
            last = remaining;
        }
    }

    #[test]
    fn test_lock_expires_but_count_persists() {
        let limiter = LoginRateLimiter::new();
        let now = 1_000_000;
        for _ in 0..3 {
            limiter.record_failure_at("k", now);
        }
        assert_eq!(limiter.check_at("k", now), 30_000);
        // Past the lock the key is usable again...
        assert_eq!(limiter.check_at("k", now + 31_000), 0);
        // ...but the next failure escalates from the undecayed count
        for _ in 0..3 {
            limiter.record_failure_at("k", now + 31_000);
        }
        assert_eq!(limiter.check_at("k", now + 31_000), 60_000);
    }

    #[test]
    fn test_reset_clears_cooldown() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..12 {
            limiter.record_failure("k");
        }
        assert!(limiter.check("k") > 0);
        limiter.reset("k");
        assert_eq!(limiter.check("k"), 0);
    }

    #[test]
    fn test_double_key_takes_maximum() {
        let limiter = LoginRateLimiter::new();
        let now = 1_000_000;
        // Lock the user key harder than the IP key
        for _ in 0..6 {
            limiter.record_failure_at("user:alice", now);
        }
        for _ in 0..3 {
            limiter.record_failure_at("ip:1.2.3.4", now);
        }
        let remaining = limiter.check_double("1.2.3.4", "Alice");
        assert!(remaining > 30_000, "must reflect the user key's longer lock");
    }

    #[test]
    fn test_double_key_failure_hits_both() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..3 {
            limiter.record_double_failure("1.2.3.4", "Alice");
        }
        assert!(limiter.check("ip:1.2.3.4") > 0);
        assert!(limiter.check("user:alice") > 0);

        limiter.reset_double("1.2.3.4", "alice");
        assert_eq!(limiter.check_double("1.2.3.4", "alice"), 0);
    }
}
