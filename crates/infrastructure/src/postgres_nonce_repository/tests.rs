use chrono::{Duration, Utc};
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use fleetguard_application::NonceRepository;

use super::PostgresNonceRepository;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

async fn test_pool() -> Option<PgPool> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return None;
    };

    let pool = match PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url.as_str())
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
    };

    if let Err(error) = MIGRATOR.run(&pool).await {
        panic!("failed to run migrations for postgres nonce tests: {error}");
    }

    Some(pool)
}

#[tokio::test]
async fn nonce_is_consumed_exactly_once_while_live() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let repository = PostgresNonceRepository::new(pool);
    let nonce = Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    let expires_at = now + Duration::minutes(10);

    assert!(matches!(
        repository.consume_nonce(nonce.as_str(), expires_at, now).await,
        Ok(true)
    ));
    assert!(matches!(
        repository.consume_nonce(nonce.as_str(), expires_at, now).await,
        Ok(false)
    ));
    assert!(matches!(
        repository.is_nonce_consumed(nonce.as_str(), now).await,
        Ok(true)
    ));

    let after_expiry = expires_at + Duration::seconds(1);
    assert!(matches!(
        repository.is_nonce_consumed(nonce.as_str(), after_expiry).await,
        Ok(false)
    ));
    assert!(matches!(
        repository
            .consume_nonce(nonce.as_str(), after_expiry + Duration::minutes(10), after_expiry)
            .await,
        Ok(true)
    ));
}

#[tokio::test]
async fn concurrent_consumers_have_a_single_winner() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let repository = PostgresNonceRepository::new(pool);
    let nonce = Uuid::new_v4().simple().to_string();
    let now = Utc::now();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let repository = repository.clone();
        let nonce = nonce.clone();
        tasks.spawn(async move {
            repository
                .consume_nonce(nonce.as_str(), now + Duration::minutes(10), now)
                .await
        });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if matches!(result, Ok(Ok(true))) {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
}
