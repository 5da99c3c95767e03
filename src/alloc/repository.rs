use anyhow::Result;
use async_trait::async_trait;

use crate::alloc::model::{Allocation, CandidateOrder, Node};

/// Outcome of one transactional reserve attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A node was selected and its quota incremented in this transaction.
    Placed { node_id: i64, remaining: i64 },

    /// The request id had already been placed (probe hit, or a concurrent
    /// writer won the insert). The prior result is returned unchanged and
    /// nothing was mutated by this attempt.
    Idempotent { node_id: i64, remaining: i64 },

    /// No node satisfied the request, or the conditional increment lost its
    /// race. Nothing was mutated.
    NoCapacity,
}

/// Persistence seam for nodes and allocations.
///
/// Implementations own all transaction control. Callers rely on exactly two
/// guarantees: the conditional quota increment is atomic, and `request_id`
/// is unique across allocations.
#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn fetch_allocation(&self, request_id: &str) -> Result<Option<Allocation>>;

    async fn fetch_node(&self, node_id: i64) -> Result<Option<Node>>;

    /// Snapshot of every node in a single statement.
    async fn fetch_nodes(&self) -> Result<Vec<Node>>;

    /// Runs the full reserve transaction: idempotency probe, candidate
    /// selection under `order` (ties broken by ascending id), conditional
    /// increment, allocation insert with conflict recovery.
    async fn reserve(
        &self,
        request_id: &str,
        token_count: i64,
        order: CandidateOrder,
    ) -> Result<ReserveOutcome>;

    /// Releases an `allocated` row: decrements its node and flips the status
    /// to `freed`. Returns the node id, or `None` when no such row exists.
    async fn release(&self, request_id: &str) -> Result<Option<i64>>;
}
