use sqlx::AnyPool;

/// Idempotent schema creation. The check constraints are the data layer's
/// backstop for `0 <= used_quota <= capacity_m`; the allocation engine never
/// relies on tripping them.
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Nodes
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS nodes (
  id BIGINT PRIMARY KEY,
  capacity_m BIGINT NOT NULL,
  used_quota BIGINT NOT NULL DEFAULT 0,

  CONSTRAINT ck_nodes_used_quota_nonnegative CHECK (used_quota >= 0),
  CONSTRAINT ck_nodes_used_quota_not_exceed_capacity CHECK (used_quota <= capacity_m)
);
"#,
    )
    .execute(pool)
    .await?;

    // Allocations
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS allocations (
  request_id TEXT PRIMARY KEY,
  node_id BIGINT NOT NULL,
  token_count BIGINT NOT NULL,
  status TEXT NOT NULL,
  created_ms BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Accelerates reconciliation reads over outstanding allocations.
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_allocations_node_status ON allocations(node_id, status);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seeds nodes `0..count` with a uniform budget. Existing rows are left
/// untouched, so seeding a live database is a no-op.
pub async fn seed(pool: &AnyPool, count: i64, budget: i64) -> anyhow::Result<()> {
    for id in 0..count {
        sqlx::query(
            r#"
INSERT INTO nodes (id, capacity_m, used_quota)
VALUES (?, ?, 0)
ON CONFLICT(id) DO NOTHING;
"#,
        )
        .bind(id)
        .bind(budget)
        .execute(pool)
        .await?;
    }

    Ok(())
}
