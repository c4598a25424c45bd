use crate::error::{AppError, AppResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

const MIG_0001: &str = include_str!("../migrations/0001_messaging_core.sql");

pub async fn create_pool(database_url: &str, max_size: usize) -> AppResult<Pool> {
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| AppError::Config(format!("invalid DATABASE_URL: {e}")))?;

    let manager = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| AppError::Config(format!("failed to build database pool: {e}")))?;

    tracing::info!(max_size, "database pool created");
    Ok(pool)
}

/// Applies the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    for (i, sql) in [MIG_0001].into_iter().enumerate() {
        client.batch_execute(sql).await?;
        tracing::info!(migration = i + 1, "messaging migration applied");
    }
    Ok(())
}
