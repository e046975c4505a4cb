use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::{self, SecurityEndpoint};
use crate::state::AppState;

/// Endpoint name for partner event ingestion failure policies.
pub const PARTNER_EVENTS_ENDPOINT: &str = "partner_events";
/// Endpoint name for admin console failure policies.
pub const ADMIN_ENDPOINT: &str = "admin";

pub fn build_router(app_state: AppState) -> Router {
    let partner_routes = Router::new()
        .route(
            "/api/partners/{partner_id}/events",
            post(handlers::partner_events::ingest_partner_event_handler),
        )
        .route_layer(from_fn_with_state(
            app_state.clone(),
            middleware::detect_threats,
        ))
        .route_layer(from_fn_with_state(
            app_state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::Extension(SecurityEndpoint(PARTNER_EVENTS_ENDPOINT)));

    let admin_routes = Router::new()
        .route(
            "/api/admin/threats",
            get(handlers::threats::list_threat_events_handler),
        )
        .route(
            "/api/admin/threats/{threat_event_id}/resolve",
            post(handlers::threats::resolve_threat_event_handler),
        )
        .route(
            "/api/admin/request-events",
            post(handlers::threats::report_request_event_handler),
        )
        .route(
            "/api/admin/identities/{identity_key}/rate-limit",
            get(handlers::identities::identity_rate_limit_handler),
        )
        .route_layer(from_fn_with_state(
            app_state.clone(),
            middleware::require_admin,
        ))
        .route_layer(from_fn_with_state(
            app_state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::Extension(SecurityEndpoint(ADMIN_ENDPOINT)));

    Router::new()
        .route("/health", get(handlers::health::health_handler))
        .merge(partner_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
