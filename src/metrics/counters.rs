use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub alloc_placed: Arc<AtomicU64>,
    pub alloc_idempotent: Arc<AtomicU64>,
    pub alloc_overloaded: Arc<AtomicU64>,

    pub free_ok: Arc<AtomicU64>,
    pub free_not_found: Arc<AtomicU64>,

    pub rate_limited: Arc<AtomicU64>,
}
