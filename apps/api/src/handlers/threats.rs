use axum::Json;
use axum::extract::{Path, Query, State};
use fleetguard_domain::{RequestEvent, ThreatAssessment, ThreatEvent, ThreatEventQuery};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_threat_events_handler(
    State(state): State<AppState>,
    Query(query): Query<ThreatEventQuery>,
) -> ApiResult<Json<Vec<ThreatEvent>>> {
    let events = state
        .threat_detection_service
        .list_threat_events(query)
        .await?;

    Ok(Json(events))
}

pub async fn resolve_threat_event_handler(
    State(state): State<AppState>,
    Path(threat_event_id): Path<Uuid>,
) -> ApiResult<Json<ThreatEvent>> {
    let event = state
        .threat_detection_service
        .resolve_threat_event(threat_event_id)
        .await?;

    Ok(Json(event))
}

/// Scores an event reported by another service, such as a login outcome
/// from the authentication service.
pub async fn report_request_event_handler(
    State(state): State<AppState>,
    Json(event): Json<RequestEvent>,
) -> Json<ThreatAssessment> {
    Json(
        state
            .threat_detection_service
            .observe(&event, state.clock.now())
            .await,
    )
}
