pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::alloc::engine::{Allocator, PolicyHandle};
use crate::metrics::counters::Counters;
use crate::ratelimit::TokenBucketLimiter;

/// Per-process context threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,

    /// `None` when admission control is disabled by configuration.
    pub limiter: Option<Arc<TokenBucketLimiter>>,

    pub policy: PolicyHandle,
    pub counters: Counters,

    /// Retry-After hint returned with `overloaded` responses.
    pub overload_retry_after_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/alloc", post(handlers::alloc))
        .route("/free", post(handlers::free))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/strategy",
            get(handlers::get_strategy).post(handlers::set_strategy),
        )
        .with_state(state)
}
