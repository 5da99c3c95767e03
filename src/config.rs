use std::str::FromStr;

use crate::alloc::model::Strategy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string (sqlite for dev/test, postgres in prod).
    pub database_url: String,

    /// TCP port the HTTP listener binds to.
    pub port: u16,

    // =========================
    // Node seeding
    // =========================
    /// Number of nodes seeded at startup, ids `0..nodes`.
    pub nodes: i64,

    /// Token budget (`capacity_m`) given to every seeded node.
    pub node_budget: i64,

    // =========================
    // Placement policy
    // =========================
    /// Initial placement strategy. Runtime-mutable through the strategy
    /// endpoint; this value only seeds the shared policy handle.
    pub strategy: Strategy,

    /// Requests with `token_count` at or above this threshold are placed on
    /// the node with the most headroom regardless of the active strategy,
    /// which keeps big arrivals from failing admission while small ones
    /// fragment the pool.
    pub big_request_threshold: i64,

    // =========================
    // Admission control
    // =========================
    /// Master switch for the token-bucket limiter on the alloc endpoint.
    pub rate_limit_enabled: bool,

    /// Refill rate of the global bucket, tokens per second.
    pub rate_limit_global_per_sec: u32,

    /// Refill rate of each per-client bucket, tokens per second.
    pub rate_limit_client_per_sec: u32,

    /// Burst size of the global bucket. Defaults to the refill rate and is
    /// clamped to never exceed it.
    pub rate_limit_global_burst: u32,

    /// Burst size of each per-client bucket, same default and clamp.
    pub rate_limit_client_burst: u32,

    /// Retry-After hint (seconds) returned with `overloaded` responses.
    pub overload_retry_after_sec: u64,

    // =========================
    // Database pool
    // =========================
    /// Steady-state pool size.
    pub db_pool_size: u32,

    /// Additional connections allowed beyond the steady-state size.
    pub db_max_overflow: u32,

    /// Seconds a request waits for a pooled connection before failing.
    pub db_pool_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://quotad.db".to_string());

        let strategy = match std::env::var("ALLOC_STRATEGY") {
            Ok(raw) => match Strategy::from_str(raw.trim()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "invalid ALLOC_STRATEGY; using best");
                    Strategy::Best
                }
            },
            Err(_) => Strategy::Best,
        };

        // A zero refill rate would build buckets that never recover; the
        // enabled flag is the supported way to switch admission control off.
        let global_rate = env_parse("RATE_LIMIT_GLOBAL_PER_SEC", 100u32).max(1);
        let client_rate = env_parse("RATE_LIMIT_CLIENT_PER_SEC", 50u32).max(1);

        Self {
            database_url,
            port: env_parse("PORT", 3000),
            nodes: env_parse("NODES", 6),
            node_budget: env_parse("NODE_BUDGET", 300),
            strategy,
            big_request_threshold: env_parse("BIG_REQUEST_THRESHOLD", 200),
            rate_limit_enabled: env_flag("RATE_LIMIT_ENABLED", true),
            rate_limit_global_per_sec: global_rate,
            rate_limit_client_per_sec: client_rate,
            rate_limit_global_burst: clamp_burst(
                env_parse("RATE_LIMIT_GLOBAL_BURST", global_rate),
                global_rate,
            ),
            rate_limit_client_burst: clamp_burst(
                env_parse("RATE_LIMIT_CLIENT_BURST", client_rate),
                client_rate,
            ),
            overload_retry_after_sec: env_parse("OVERLOAD_RETRY_AFTER_SEC", 2),
            db_pool_size: env_parse("DB_POOL_SIZE", 5),
            db_max_overflow: env_parse("DB_MAX_OVERFLOW", 10),
            db_pool_timeout_secs: env_parse("DB_POOL_TIMEOUT", 30),
        }
    }
}

/// Burst may be configured smaller than the refill rate but never larger.
pub(crate) fn clamp_burst(burst: u32, rate: u32) -> u32 {
    burst.min(rate)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable env value; using default");
            default
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => raw.trim().eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_defaults_are_clamped_to_rate() {
        assert_eq!(clamp_burst(100, 100), 100);
        assert_eq!(clamp_burst(250, 100), 100);
        assert_eq!(clamp_burst(10, 100), 10);
        assert_eq!(clamp_burst(0, 100), 0);
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or("PORT", "8080", 3000u16), 8080);
        assert_eq!(parse_or("PORT", "  8080 ", 3000u16), 8080);
        assert_eq!(parse_or("PORT", "eighty", 3000u16), 3000);
        assert_eq!(parse_or("NODES", "-3", 6i64), -3);
    }
}
