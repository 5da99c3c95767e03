use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::Clock;

/// Token-bucket state for one scope.
#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last: f64,
}

impl Bucket {
    fn new(burst: u32, rate: u32, now: f64) -> Self {
        Self {
            tokens: burst as f64,
            capacity: burst as f64,
            rate: rate as f64,
            last: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last).max(0.0);
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }

    /// Seconds until this bucket holds a full token again.
    fn shortfall_wait(&self) -> f64 {
        if self.tokens >= 1.0 {
            0.0
        } else if self.rate > 0.0 {
            (1.0 - self.tokens) / self.rate
        } else {
            f64::INFINITY
        }
    }
}

/// Admission decision for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Client-scope burst size, floored.
    pub limit: u64,
    /// Client-scope tokens left after this decision, floored.
    pub remaining: u64,
    /// Seconds to wait before retrying; 0 on allow, at least 1 on deny.
    pub retry_after_secs: u64,
}

struct Buckets {
    global: Bucket,
    clients: HashMap<String, Bucket>,
}

/// Dual-scope token-bucket limiter: one global bucket plus a lazily created
/// bucket per client key. A request is admitted only when both scopes hold a
/// full token, and then pays one token to each.
///
/// All buckets sit behind one lock; the critical section is O(1).
pub struct TokenBucketLimiter {
    clock: Arc<dyn Clock>,
    client_rate: u32,
    client_burst: u32,

    /// Bound on the per-client map. When a new key would exceed it, the
    /// bucket with the oldest refill timestamp is evicted; live keys keep
    /// the exact refill arithmetic.
    max_clients: usize,

    inner: Mutex<Buckets>,
}

impl TokenBucketLimiter {
    pub const DEFAULT_MAX_CLIENTS: usize = 10_000;

    pub fn new(
        global_rate: u32,
        global_burst: u32,
        client_rate: u32,
        client_burst: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            clock,
            client_rate,
            client_burst,
            max_clients: Self::DEFAULT_MAX_CLIENTS,
            inner: Mutex::new(Buckets {
                global: Bucket::new(global_burst, global_rate, now),
                clients: HashMap::new(),
            }),
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    pub fn check(&self, client_key: &str) -> Decision {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if !inner.clients.contains_key(client_key) && inner.clients.len() >= self.max_clients {
            evict_stalest(&mut inner.clients);
        }

        let Buckets { global, clients } = &mut *inner;
        let client = clients
            .entry(client_key.to_string())
            .or_insert_with(|| Bucket::new(self.client_burst, self.client_rate, now));

        global.refill(now);
        client.refill(now);

        if global.tokens >= 1.0 && client.tokens >= 1.0 {
            global.tokens -= 1.0;
            client.tokens -= 1.0;
            return Decision {
                allowed: true,
                limit: client.capacity as u64,
                remaining: client.tokens.floor().max(0.0) as u64,
                retry_after_secs: 0,
            };
        }

        // Only scopes short a token contribute to the wait; a full second is
        // the floor so the Retry-After header stays meaningful.
        let wait = global.shortfall_wait().max(client.shortfall_wait());
        Decision {
            allowed: false,
            limit: client.capacity as u64,
            remaining: client.tokens.floor().max(0.0) as u64,
            retry_after_secs: (wait.ceil() as u64).max(1),
        }
    }
}

fn evict_stalest(clients: &mut HashMap<String, Bucket>) {
    let victim = clients
        .iter()
        .min_by(|(_, a), (_, b)| a.last.total_cmp(&b.last))
        .map(|(key, _)| key.clone());

    if let Some(key) = victim {
        clients.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::time::ManualClock;

    fn limiter(
        global_rate: u32,
        global_burst: u32,
        client_rate: u32,
        client_burst: u32,
    ) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0.0));
        let limiter = TokenBucketLimiter::new(
            global_rate,
            global_burst,
            client_rate,
            client_burst,
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn burst_admits_then_denies() {
        let (limiter, _clock) = limiter(100, 100, 2, 2);

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);

        let denied = limiter.check("a");
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 2);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs >= 1);
    }

    #[test]
    fn refill_restores_admission() {
        let (limiter, clock) = limiter(100, 100, 2, 2);

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);

        clock.advance(0.5); // one token at 2/s
        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn remaining_counts_down_from_burst() {
        let (limiter, _clock) = limiter(100, 100, 3, 3);

        assert_eq!(limiter.check("a").remaining, 2);
        assert_eq!(limiter.check("a").remaining, 1);
        assert_eq!(limiter.check("a").remaining, 0);
    }

    #[test]
    fn global_scope_binds_across_clients() {
        let (limiter, _clock) = limiter(3, 3, 2, 2);

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);

        // Client b still has a token; the global bucket is dry.
        let denied = limiter.check("b");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 1);
        assert!(denied.retry_after_secs >= 1);
    }

    #[test]
    fn clients_are_isolated_from_each_other() {
        let (limiter, _clock) = limiter(100, 100, 1, 1);

        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
    }

    #[test]
    fn deny_reports_ceiled_wait() {
        // Client refills at 1/s: an empty bucket is exactly one second away.
        let (limiter, clock) = limiter(100, 100, 1, 1);

        assert!(limiter.check("a").allowed);
        assert_eq!(limiter.check("a").retry_after_secs, 1);

        // A partial refill still rounds up to a full second.
        clock.advance(0.3);
        assert_eq!(limiter.check("a").retry_after_secs, 1);
    }

    #[test]
    fn bounded_map_evicts_stalest_client() {
        let (limiter, clock) = limiter(1000, 1000, 1, 1);
        let limiter = limiter.with_max_clients(2);

        assert!(limiter.check("old").allowed);
        clock.advance(1.0);
        assert!(limiter.check("young").allowed);
        clock.advance(1.0);

        // A third key evicts "old" (stalest refill timestamp)...
        assert!(limiter.check("new").allowed);

        // ...so "old" comes back as a fresh bucket with its full burst,
        // while "young" keeps its live state.
        assert_eq!(limiter.inner.lock().clients.len(), 2);
        assert!(limiter.check("old").allowed);
    }

    #[test]
    fn clock_going_backwards_does_not_refill() {
        let (limiter, clock) = limiter(100, 100, 2, 2);

        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);

        clock.set(-10.0);
        assert!(!limiter.check("a").allowed);
    }

    proptest! {
        /// With capacity C and rate R, at most C + R*T admissions may happen
        /// for one client in any window of length T.
        #[test]
        fn admissions_bounded_by_burst_plus_refill(
            steps_ms in prop::collection::vec(0u64..2_000, 1..64)
        ) {
            let clock = Arc::new(ManualClock::new(0.0));
            // Global scope effectively unbounded so the client bound is measured.
            let limiter = TokenBucketLimiter::new(1_000_000, 1_000_000, 5, 5, clock.clone());

            let mut admits = 0u64;
            let mut window_secs = 0.0f64;
            for ms in steps_ms {
                clock.advance(ms as f64 / 1000.0);
                window_secs += ms as f64 / 1000.0;
                if limiter.check("c").allowed {
                    admits += 1;
                }
            }

            let bound = 5.0 + 5.0 * window_secs;
            prop_assert!(
                admits as f64 <= bound + 1e-6,
                "admits {} exceeds bound {}", admits, bound
            );
        }

        /// Tokens never go negative, so `remaining` is always within the
        /// configured burst.
        #[test]
        fn remaining_never_exceeds_limit(
            keys in prop::collection::vec(0u8..4, 1..64),
            steps_ms in prop::collection::vec(0u64..500, 1..64)
        ) {
            let clock = Arc::new(ManualClock::new(0.0));
            let limiter = TokenBucketLimiter::new(50, 50, 7, 7, clock.clone());

            for (key, ms) in keys.iter().zip(steps_ms) {
                clock.advance(ms as f64 / 1000.0);
                let decision = limiter.check(&format!("client-{key}"));
                prop_assert_eq!(decision.limit, 7);
                prop_assert!(decision.remaining <= 7);
            }
        }
    }
}
