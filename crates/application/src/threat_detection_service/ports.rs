use async_trait::async_trait;
use uuid::Uuid;

use fleetguard_core::AppResult;
use fleetguard_domain::{ThreatEvent, ThreatEventQuery, ThreatStatus};

/// Repository port for threat event persistence.
#[async_trait]
pub trait ThreatEventRepository: Send + Sync {
    /// Inserts a new threat event.
    async fn put_threat_event(&self, event: ThreatEvent) -> AppResult<()>;

    /// Finds a threat event by id.
    async fn find_threat_event(&self, id: Uuid) -> AppResult<Option<ThreatEvent>>;

    /// Moves an event from `expected` to `next` status.
    ///
    /// Compare-and-set: returns `false` without writing when the stored
    /// status is no longer `expected`.
    async fn update_status(
        &self,
        id: Uuid,
        expected: ThreatStatus,
        next: ThreatStatus,
    ) -> AppResult<bool>;

    /// Lists events matching the query, newest first.
    async fn query_threat_events(&self, query: &ThreatEventQuery) -> AppResult<Vec<ThreatEvent>>;
}
