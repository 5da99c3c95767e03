use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Row, Transaction};

use crate::alloc::model::{Allocation, AllocationStatus, CandidateOrder, Node};
use crate::alloc::repository::{AllocationRepository, ReserveOutcome};
use crate::time::now_ms;

/// SQLx-backed implementation of AllocationRepository.
/// Owns transaction boundaries and row mapping; placement policy lives in
/// the engine.
pub struct SqlxAllocationRepository {
    pool: AnyPool,

    /// When true, candidate selection locks the chosen row and skips rows
    /// locked by concurrent reserve transactions. On backends without the
    /// clause the plain select stays correct: the conditional increment
    /// re-checks remaining capacity before any quota moves.
    skip_locked: bool,
}

/// Row-reservation support is a dialect capability, not a config knob.
pub fn supports_skip_locked(database_url: &str) -> bool {
    database_url.starts_with("postgres")
}

impl SqlxAllocationRepository {
    pub fn new(pool: AnyPool, skip_locked: bool) -> Self {
        Self { pool, skip_locked }
    }

    async fn select_candidate(
        &self,
        tx: &mut Transaction<'_, Any>,
        min_remaining: i64,
        order: CandidateOrder,
    ) -> Result<Option<i64>> {
        let order_sql = match order {
            CandidateOrder::RemainingAsc => "ASC",
            CandidateOrder::RemainingDesc => "DESC",
        };
        let lock_sql = if self.skip_locked {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        };
        let sql = format!(
            "SELECT id FROM nodes \
             WHERE (capacity_m - used_quota) >= ? \
             ORDER BY (capacity_m - used_quota) {order_sql}, id ASC \
             LIMIT 1{lock_sql};"
        );

        let row = sqlx::query(&sql)
            .bind(min_remaining)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    /// Conflict recovery happens outside the aborted transaction: only a
    /// fresh read observes the winning writer's committed state.
    async fn read_winner(&self, request_id: &str) -> Result<ReserveOutcome> {
        let winner = self
            .fetch_allocation(request_id)
            .await?
            .context("conflicting allocation vanished after rollback")?;
        let node = self
            .fetch_node(winner.node_id)
            .await?
            .context("winning allocation references a missing node")?;

        Ok(ReserveOutcome::Idempotent {
            node_id: node.id,
            remaining: node.remaining(),
        })
    }
}

#[async_trait]
impl AllocationRepository for SqlxAllocationRepository {
    async fn fetch_allocation(&self, request_id: &str) -> Result<Option<Allocation>> {
        let row = sqlx::query(
            r#"
SELECT request_id, node_id, token_count, status, created_ms, updated_ms
FROM allocations
WHERE request_id = ?;
"#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_allocation(&r)?)),
            None => Ok(None),
        }
    }

    async fn fetch_node(&self, node_id: i64) -> Result<Option<Node>> {
        let row = sqlx::query(
            r#"
SELECT id, capacity_m, used_quota
FROM nodes
WHERE id = ?;
"#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_node(&r)))
    }

    async fn fetch_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            r#"
SELECT id, capacity_m, used_quota
FROM nodes
ORDER BY id ASC;
"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_node).collect())
    }

    async fn reserve(
        &self,
        request_id: &str,
        token_count: i64,
        order: CandidateOrder,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        // Idempotency probe: a prior `allocated` row wins outright.
        if let Some(prior) = fetch_allocation_tx(&mut tx, request_id).await? {
            if prior.status == AllocationStatus::Allocated {
                let node = fetch_node_tx(&mut tx, prior.node_id)
                    .await?
                    .context("allocation references a missing node")?;
                tx.commit().await?;
                return Ok(ReserveOutcome::Idempotent {
                    node_id: node.id,
                    remaining: node.remaining(),
                });
            }
        }

        let Some(node_id) = self.select_candidate(&mut tx, token_count, order).await? else {
            tx.rollback().await?;
            return Ok(ReserveOutcome::NoCapacity);
        };

        // Atomic reserve: quota moves only if remaining still covers the
        // request. Zero rows changed means a concurrent transaction consumed
        // the remaining between select and update.
        let reserved = sqlx::query(
            r#"
UPDATE nodes
SET used_quota = used_quota + ?
WHERE id = ? AND (capacity_m - used_quota) >= ?;
"#,
        )
        .bind(token_count)
        .bind(node_id)
        .bind(token_count)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(ReserveOutcome::NoCapacity);
        }

        // Record the allocation. A conflict means a concurrent writer owns
        // this request id; the whole transaction, increment included, must
        // unwind before the winner's state is read back.
        let now = now_ms() as i64;
        let inserted = sqlx::query(
            r#"
INSERT INTO allocations (request_id, node_id, token_count, status, created_ms, updated_ms)
VALUES (?, ?, ?, 'allocated', ?, ?)
ON CONFLICT(request_id) DO NOTHING;
"#,
        )
        .bind(request_id)
        .bind(node_id)
        .bind(token_count)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() != 1 {
            tx.rollback().await?;
            return self.read_winner(request_id).await;
        }

        // Re-read so the reply reflects the post-update remaining.
        let node = fetch_node_tx(&mut tx, node_id)
            .await?
            .context("reserved node disappeared mid-transaction")?;
        tx.commit().await?;

        Ok(ReserveOutcome::Placed {
            node_id: node.id,
            remaining: node.remaining(),
        })
    }

    async fn release(&self, request_id: &str) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let Some(alloc) = fetch_allocation_tx(&mut tx, request_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        // The status flip is conditional so two racing releases cannot both
        // decrement the node.
        let flipped = sqlx::query(
            r#"
UPDATE allocations
SET status = 'freed', updated_ms = ?
WHERE request_id = ? AND status = 'allocated';
"#,
        )
        .bind(now_ms() as i64)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        // Unconditional decrement: the allocated row guarantees the result
        // stays within [0, capacity_m].
        sqlx::query(
            r#"
UPDATE nodes
SET used_quota = used_quota - ?
WHERE id = ?;
"#,
        )
        .bind(alloc.token_count)
        .bind(alloc.node_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(alloc.node_id))
    }
}

/* =========================
Transaction-scoped reads
========================= */

async fn fetch_allocation_tx(
    tx: &mut Transaction<'_, Any>,
    request_id: &str,
) -> Result<Option<Allocation>> {
    let row = sqlx::query(
        r#"
SELECT request_id, node_id, token_count, status, created_ms, updated_ms
FROM allocations
WHERE request_id = ?;
"#,
    )
    .bind(request_id)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(r) => Ok(Some(row_to_allocation(&r)?)),
        None => Ok(None),
    }
}

async fn fetch_node_tx(tx: &mut Transaction<'_, Any>, node_id: i64) -> Result<Option<Node>> {
    let row = sqlx::query(
        r#"
SELECT id, capacity_m, used_quota
FROM nodes
WHERE id = ?;
"#,
    )
    .bind(node_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| row_to_node(&r)))
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_node(r: &AnyRow) -> Node {
    Node {
        id: r.get::<i64, _>("id"),
        capacity_m: r.get::<i64, _>("capacity_m"),
        used_quota: r.get::<i64, _>("used_quota"),
    }
}

fn row_to_allocation(r: &AnyRow) -> Result<Allocation> {
    let status_str: String = r.get("status");
    let status = status_str
        .parse::<AllocationStatus>()
        .context("invalid allocation status")?;

    Ok(Allocation {
        request_id: r.get::<String, _>("request_id"),
        node_id: r.get::<i64, _>("node_id"),
        token_count: r.get::<i64, _>("token_count"),
        status,
        created_ms: i64_to_u64(r.get("created_ms"))?,
        updated_ms: i64_to_u64(r.get("updated_ms"))?,
    })
}

fn i64_to_u64(v: i64) -> Result<u64> {
    if v < 0 {
        return Err(anyhow::anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}
