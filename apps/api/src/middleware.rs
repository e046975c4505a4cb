use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use fleetguard_application::fingerprint;
use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{Identity, RateLimitDecision, RequestEvent, ThreatAction, Tier};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{ApiResult, ErrorResponse};
use crate::state::AppState;

/// Largest request body buffered for inspection.
const MAX_INSPECTED_BODY_BYTES: usize = 1024 * 1024;

const API_KEY_HEADER: &str = "x-api-key";
const USER_ID_HEADER: &str = "x-fleet-user-id";
const TIER_HEADER: &str = "x-fleet-tier";
const GEO_HEADER: &str = "x-fleet-geo";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Endpoint name a rate limit check is charged to.
///
/// Selects per-endpoint store failure policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityEndpoint(pub &'static str);

/// Identity and tier resolved for the current request.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub identity: Identity,
    pub tier: Tier,
    pub ip: Option<IpAddr>,
}

pub async fn rate_limit(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let caller = caller_context(&state, &request)?;
    let now = state.clock.now();

    let decision = match request.extensions().get::<SecurityEndpoint>() {
        Some(SecurityEndpoint(endpoint)) => {
            state
                .rate_limit_service
                .check_endpoint(endpoint, &caller.identity, caller.tier, now)
                .await
        }
        None => {
            state
                .rate_limit_service
                .check(&caller.identity, caller.tier, now)
                .await
        }
    };

    match decision {
        RateLimitDecision::Allow => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        RateLimitDecision::Throttle {
            retry_after_seconds,
        } => {
            debug!(
                identity_key = %caller.identity,
                retry_after_seconds,
                "request throttled"
            );
            Ok(rejection(
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded",
                Some(retry_after_seconds),
            ))
        }
        RateLimitDecision::Banned { until } => {
            let retry_after_seconds = u64::try_from((until - now).num_seconds().max(1)).unwrap_or(1);
            Ok(rejection(
                StatusCode::FORBIDDEN,
                "identity is temporarily banned",
                Some(retry_after_seconds),
            ))
        }
    }
}

/// Scores the request with the anomaly detector before the handler runs.
///
/// Buffers the body so payload signatures can be inspected, then hands the
/// same bytes to the handler.
pub async fn detect_threats(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let caller = match request.extensions().get::<CallerContext>() {
        Some(caller) => caller.clone(),
        None => caller_context(&state, &request)?,
    };

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_INSPECTED_BODY_BYTES)
        .await
        .map_err(|error| AppError::Validation(format!("failed to read request body: {error}")))?;

    let event = RequestEvent {
        identity_key: Some(caller.identity.key()),
        origin: caller.ip.and_then(origin_subnet),
        method: Some(parts.method.as_str().to_owned()),
        path: Some(parts.uri.path().to_owned()),
        query: parts.uri.query().map(str::to_owned),
        payload: (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).into_owned()),
        headers: inspectable_headers(&parts.headers),
        user_agent: header_str(&parts.headers, USER_AGENT.as_str()).map(str::to_owned),
        geo: header_str(&parts.headers, GEO_HEADER).map(str::to_owned),
        auth_outcome: None,
    };

    let assessment = state
        .threat_detection_service
        .observe(&event, state.clock.now())
        .await;

    if assessment.action == ThreatAction::Block {
        warn!(
            identity_key = %caller.identity,
            threat_event_id = ?assessment.threat_event_id,
            "request blocked by threat detection"
        );
        return Ok(rejection(StatusCode::FORBIDDEN, "request blocked", None));
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let Some(expected) = state.admin_api_token.as_deref() else {
        return Err(AppError::Forbidden("admin api is disabled".to_owned()).into());
    };

    let presented = bearer_token(request.headers())
        .ok_or_else(|| AppError::Unauthorized("admin token required".to_owned()))?;
    if !tokens_match(expected, presented) {
        return Err(AppError::Unauthorized("invalid admin token".to_owned()).into());
    }

    Ok(next.run(request).await)
}

/// Resolves who is calling.
///
/// The admin bearer token always maps to the admin tier. Gateway identity
/// headers are honored only when the deployment trusts its gateway;
/// everyone else is a basic network identity keyed by address and
/// user-agent fingerprint.
pub fn caller_context(state: &AppState, request: &Request) -> AppResult<CallerContext> {
    let headers = request.headers();
    let ip = client_ip(state, request);

    if let Some(expected) = state.admin_api_token.as_deref()
        && let Some(presented) = bearer_token(headers)
        && tokens_match(expected, presented)
    {
        return Ok(CallerContext {
            identity: Identity::api_key(presented)?,
            tier: Tier::Admin,
            ip,
        });
    }

    if state.trust_gateway_headers {
        let tier = header_str(headers, TIER_HEADER)
            .map(Tier::from_str)
            .transpose()?
            .filter(|tier| *tier != Tier::Admin);

        if let Some(api_key) = header_str(headers, API_KEY_HEADER) {
            return Ok(CallerContext {
                identity: Identity::api_key(api_key)?,
                tier: tier.unwrap_or(Tier::Premium),
                ip,
            });
        }

        if let Some(user_id) = header_str(headers, USER_ID_HEADER) {
            return Ok(CallerContext {
                identity: Identity::user(user_id)?,
                tier: tier.unwrap_or(Tier::Standard),
                ip,
            });
        }
    }

    let client_fingerprint = header_str(headers, USER_AGENT.as_str())
        .map(fingerprint)
        .unwrap_or_default();

    Ok(CallerContext {
        identity: Identity::network(
            ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            client_fingerprint,
        ),
        tier: Tier::Basic,
        ip,
    })
}

fn client_ip(state: &AppState, request: &Request) -> Option<IpAddr> {
    if state.trust_gateway_headers {
        let forwarded = header_str(request.headers(), FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next())
            .and_then(|value| IpAddr::from_str(value.trim()).ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(address)| address.ip())
}

/// Collapses an address to its /24 (IPv4) or /64 (IPv6) network.
fn origin_subnet(ip: IpAddr) -> Option<String> {
    let prefix = match ip {
        IpAddr::V4(_) => 24,
        IpAddr::V6(_) => 64,
    };

    IpNet::new(ip, prefix)
        .ok()
        .map(|network| network.trunc().to_string())
}

/// Headers handed to the detector. Credentials never qualify.
fn inspectable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    RequestEvent::INSPECTED_HEADERS
        .iter()
        .filter_map(|name| {
            header_str(headers, name).map(|value| ((*name).to_owned(), value.to_owned()))
        })
        .collect()
}

fn rejection(status: StatusCode, message: &str, retry_after_seconds: Option<u64>) -> Response {
    let mut response = (status, Json(ErrorResponse::new(message))).into_response();
    if let Some(seconds) = retry_after_seconds {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(seconds));
    }

    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Compares fixed-length digests of both tokens in constant time, so neither
/// the content nor the length of the admin token shows up in timing.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected.ct_eq(&presented).into()
}
