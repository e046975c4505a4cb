use axum::Json;
use axum::extract::{Path, State};

use crate::dto::IdentityRateLimitResponse;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn identity_rate_limit_handler(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
) -> ApiResult<Json<IdentityRateLimitResponse>> {
    let now = state.clock.now();
    let window = state
        .rate_limit_service
        .current_window(identity_key.as_str())
        .await?;
    let active_ban = state
        .rate_limit_service
        .active_ban(identity_key.as_str(), now)
        .await?;

    Ok(Json(IdentityRateLimitResponse {
        identity_key,
        window,
        active_ban,
    }))
}
