use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult};

pub async fn create_pool(database_url: &str) -> AppResult<PgPool> {
    info!("🔌 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {:?}", e);
            AppError::Database(e)
        })?;

    info!("✅ Database connection pool created");
    Ok(pool)
}

/// Wraps a database future with a fixed deadline (spec section 5: "every
/// database call carries a deadline"). A timeout is surfaced as
/// `AppError::Timeout`, distinct from a query that completed and returned a
/// driver error.
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> AppResult<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(AppError::Database),
        Err(_) => Err(AppError::Timeout),
    }
}

pub async fn health_check(pool: &PgPool) -> AppResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

/// Applies any migrations under `./migrations` that haven't run yet.
/// Idempotent — safe to call on every startup of every pod.
pub async fn run_migrations(pool: &PgPool) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        tracing::error!(error = ?e, "failed to apply database migrations");
        AppError::Internal
    })?;
    Ok(())
}
