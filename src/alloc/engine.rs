use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::alloc::model::{CandidateOrder, Strategy};
use crate::alloc::repository::{AllocationRepository, ReserveOutcome};
use crate::alloc::stats::{self, UsageStats};
use crate::error::AllocError;
use crate::logger::warn_if_slow;
use crate::metrics::counters::Counters;

/// Shared placement policy. The strategy is runtime-mutable through the
/// strategy endpoint; the big-request threshold is fixed at startup.
#[derive(Clone)]
pub struct PolicyHandle {
    strategy: Arc<RwLock<Strategy>>,
    big_request_threshold: i64,
}

impl PolicyHandle {
    pub fn new(strategy: Strategy, big_request_threshold: i64) -> Self {
        Self {
            strategy: Arc::new(RwLock::new(strategy)),
            big_request_threshold,
        }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write() = strategy;
    }

    pub fn big_request_threshold(&self) -> i64 {
        self.big_request_threshold
    }
}

/// Result of a successful placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub node_id: i64,
    pub remaining_quota: i64,
}

/// Allocation engine: applies the placement policy and maps repository
/// outcomes onto the service error taxonomy.
///
/// A reserve that loses its race is never retried here; the caller observes
/// `Overloaded` and decides, which keeps per-attempt latency bounded while
/// the rate limiter absorbs retry storms.
pub struct Allocator {
    repo: Arc<dyn AllocationRepository>,
    policy: PolicyHandle,
    counters: Counters,
}

impl Allocator {
    pub fn new(repo: Arc<dyn AllocationRepository>, policy: PolicyHandle, counters: Counters) -> Self {
        Self {
            repo,
            policy,
            counters,
        }
    }

    /// Ordering rule: `largest`, or any request at or above the big-request
    /// threshold, takes the node with the most headroom; `best` packs into
    /// the tightest node that still fits.
    fn order_for(&self, token_count: i64) -> CandidateOrder {
        if self.policy.strategy() == Strategy::Largest
            || token_count >= self.policy.big_request_threshold()
        {
            CandidateOrder::RemainingDesc
        } else {
            CandidateOrder::RemainingAsc
        }
    }

    #[instrument(skip(self), target = "engine", fields(request_id = %request_id, token_count))]
    pub async fn alloc(
        &self,
        request_id: &str,
        token_count: i64,
    ) -> Result<Placement, AllocError> {
        let order = self.order_for(token_count);

        let outcome = warn_if_slow("db_reserve", Duration::from_millis(100), async {
            self.repo.reserve(request_id, token_count, order).await
        })
        .await?;

        match outcome {
            ReserveOutcome::Placed { node_id, remaining } => {
                self.counters.alloc_placed.fetch_add(1, Ordering::Relaxed);
                Ok(Placement {
                    node_id,
                    remaining_quota: remaining,
                })
            }
            ReserveOutcome::Idempotent { node_id, remaining } => {
                self.counters.alloc_idempotent.fetch_add(1, Ordering::Relaxed);
                debug!(node_id, "request id already placed; returning prior result");
                Ok(Placement {
                    node_id,
                    remaining_quota: remaining,
                })
            }
            ReserveOutcome::NoCapacity => {
                self.counters.alloc_overloaded.fetch_add(1, Ordering::Relaxed);
                Err(AllocError::Overloaded)
            }
        }
    }

    #[instrument(skip(self), target = "engine", fields(request_id = %request_id))]
    pub async fn free(&self, request_id: &str) -> Result<i64, AllocError> {
        let released = warn_if_slow("db_release", Duration::from_millis(100), async {
            self.repo.release(request_id).await
        })
        .await?;

        match released {
            Some(node_id) => {
                self.counters.free_ok.fetch_add(1, Ordering::Relaxed);
                Ok(node_id)
            }
            None => {
                self.counters.free_not_found.fetch_add(1, Ordering::Relaxed);
                Err(AllocError::NotFound)
            }
        }
    }

    /// Instantaneous utilization snapshot over a single node read.
    pub async fn usage(&self) -> Result<UsageStats, AllocError> {
        let nodes = self.repo.fetch_nodes().await?;
        Ok(stats::usage_from_nodes(&nodes))
    }

    /// Sum of per-node remaining across the pool.
    pub async fn remaining_capacity(&self) -> Result<i64, AllocError> {
        let nodes = self.repo.fetch_nodes().await?;
        Ok(nodes.iter().map(|n| n.remaining()).sum())
    }
}
