pub mod schema;

use std::time::Duration;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
}

impl Db {
    /// Opens the pool. `DB_POOL_SIZE` is the steady-state size and
    /// `DB_MAX_OVERFLOW` the headroom above it, so the sqlx connection cap is
    /// their sum.
    pub async fn connect(cfg: &AppConfig) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(cfg.db_pool_size + cfg.db_max_overflow)
            .acquire_timeout(Duration::from_secs(cfg.db_pool_timeout_secs))
            .connect(&cfg.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }

    pub async fn seed(&self, nodes: i64, node_budget: i64) -> anyhow::Result<()> {
        schema::seed(&self.pool, nodes, node_budget).await
    }
}
