use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use fleetguard_core::AppError;
use fleetguard_domain::{SignatureVerification, SignedRequest};
use tracing::{info, warn};

use crate::dto::PartnerEventAcceptedResponse;
use crate::error::ApiResult;
use crate::state::AppState;

/// Accepts a signed event from a fleet partner.
///
/// Each request is accepted at most once; its nonce is consumed on success.
pub async fn ingest_partner_event_handler(
    State(state): State<AppState>,
    Path(partner_id): Path<String>,
    Json(request): Json<SignedRequest>,
) -> ApiResult<(StatusCode, Json<PartnerEventAcceptedResponse>)> {
    let now = state.clock.now();

    match state
        .request_signing_service
        .verify_for_partner(partner_id.as_str(), &request, now)
        .await
    {
        SignatureVerification::Valid => {}
        SignatureVerification::StoreUnavailable => {
            return Err(AppError::StoreUnavailable(
                "nonce store unavailable while verifying partner event".to_owned(),
            )
            .into());
        }
        rejected => {
            warn!(
                partner_id = %partner_id,
                outcome = rejected.as_str(),
                "partner event rejected"
            );
            return Err(AppError::Unauthorized(format!(
                "request signature rejected: {}",
                rejected.as_str()
            ))
            .into());
        }
    }

    info!(partner_id = %partner_id, nonce = %request.nonce, "partner event accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(PartnerEventAcceptedResponse {
            partner_id,
            nonce: request.nonce,
            accepted_at: now,
        }),
    ))
}
