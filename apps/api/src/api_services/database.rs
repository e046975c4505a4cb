use fleetguard_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

pub async fn connect_and_migrate(database_url: &str) -> Result<PgPool, AppError> {
    let pool = connect(database_url).await?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    Ok(pool)
}
