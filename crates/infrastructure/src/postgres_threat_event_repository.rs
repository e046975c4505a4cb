//! PostgreSQL-backed threat event repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use fleetguard_application::ThreatEventRepository;
use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{ThreatEvent, ThreatEventQuery, ThreatStatus};


/// PostgreSQL implementation of the threat event repository port.
#[derive(Clone)]
pub struct PostgresThreatEventRepository {
    pool: PgPool,
}

impl PostgresThreatEventRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThreatEventRepository for PostgresThreatEventRepository {
    async fn put_threat_event(&self, event: ThreatEvent) -> AppResult<()> {
        let evidence = serde_json::to_string(&event.evidence).map_err(|error| {
            AppError::Internal(format!("failed to serialize threat evidence: {error}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO threat_events (
                id,
                identity_key,
                attack_type,
                severity,
                severity_rank,
                status,
                confidence,
                detected_at,
                evidence
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::jsonb)
            "#,
        )
        .bind(event.id)
        .bind(event.identity_key.as_str())
        .bind(event.attack_type.as_str())
        .bind(event.severity.as_str())
        .bind(event.severity.rank())
        .bind(event.status.as_str())
        .bind(event.confidence)
        .bind(event.detected_at)
        .bind(evidence)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to insert threat event: {error}"))
        })?;

        Ok(())
    }

    async fn find_threat_event(&self, id: Uuid) -> AppResult<Option<ThreatEvent>> {
        let row = sqlx::query_as::<_, ThreatEventRow>(
            r#"
            SELECT
                id,
                identity_key,
                attack_type,
                severity,
                status,
                confidence,
                detected_at,
                evidence::text AS evidence
            FROM threat_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to load threat event: {error}"))
        })?;

        row.map(ThreatEventRow::into_event).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: ThreatStatus,
        next: ThreatStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE threat_events
            SET status = $3
            WHERE id = $1
              AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to update threat event status: {error}"))
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn query_threat_events(&self, query: &ThreatEventQuery) -> AppResult<Vec<ThreatEvent>> {
        let rows = sqlx::query_as::<_, ThreatEventRow>(
            r#"
            SELECT
                id,
                identity_key,
                attack_type,
                severity,
                status,
                confidence,
                detected_at,
                evidence::text AS evidence
            FROM threat_events
            WHERE ($1::text IS NULL OR identity_key = $1)
              AND ($2::text IS NULL OR attack_type = $2)
              AND ($3::smallint IS NULL OR severity_rank >= $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR detected_at >= $5)
            ORDER BY detected_at DESC, id
            LIMIT $6
            "#,
        )
        .bind(query.identity_key.as_deref())
        .bind(query.attack_type.map(|attack_type| attack_type.as_str()))
        .bind(query.min_severity.map(|severity| severity.rank()))
        .bind(query.status.map(|status| status.as_str()))
        .bind(query.since)
        .bind(i64::from(query.effective_limit()))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to list threat events: {error}"))
        })?;

        rows.into_iter().map(ThreatEventRow::into_event).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ThreatEventRow {
    id: Uuid,
    identity_key: String,
    attack_type: String,
    severity: String,
    status: String,
    confidence: f64,
    detected_at: DateTime<Utc>,
    evidence: String,
}

impl ThreatEventRow {
    fn into_event(self) -> AppResult<ThreatEvent> {
        let evidence = serde_json::from_str(self.evidence.as_str()).map_err(|error| {
            AppError::Internal(format!(
                "invalid stored evidence for threat event '{}': {error}",
                self.id
            ))
        })?;

        Ok(ThreatEvent {
            id: self.id,
            identity_key: self.identity_key,
            attack_type: self.attack_type.parse()?,
            severity: self.severity.parse()?,
            status: self.status.parse()?,
            confidence: self.confidence,
            detected_at: self.detected_at,
            evidence,
        })
    }
}
