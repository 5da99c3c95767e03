use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::{
    Json,
    extract::{ConnectInfo, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::api::types::{
    AllocRequest, AllocResponse, FieldError, FreeRequest, FreeResponse, StrategyBody,
};
use crate::error::AllocError;
use crate::ratelimit::Decision;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn alloc(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<AllocRequest>, JsonRejection>,
) -> Response {
    // Admission control guards only this endpoint, keyed by peer address.
    if let Some(limiter) = &state.limiter {
        let decision = limiter.check(&peer.ip().to_string());
        if !decision.allowed {
            state.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            info!(
                client = %peer.ip(),
                retry_after = decision.retry_after_secs,
                "rate_limited"
            );
            return rate_limited_response(&decision);
        }
    }

    let body = match parse_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let failures = body.validate();
    if !failures.is_empty() {
        warn!(path = "/alloc", ?failures, "bad_request");
        return bad_request(failures);
    }

    match state.allocator.alloc(&body.request_id, body.token_count).await {
        Ok(placement) => {
            info!(
                request_id = %body.request_id,
                token_count = body.token_count,
                node_id = placement.node_id,
                remaining_quota = placement.remaining_quota,
                "alloc_ok"
            );
            (
                StatusCode::OK,
                Json(AllocResponse {
                    node_id: placement.node_id,
                    remaining_quota: placement.remaining_quota,
                }),
            )
                .into_response()
        }
        Err(AllocError::Overloaded) => {
            info!(
                request_id = %body.request_id,
                token_count = body.token_count,
                error = "overloaded",
                "alloc_overloaded"
            );
            overloaded_response(state.overload_retry_after_secs)
        }
        Err(err) => internal_response("/alloc", &body.request_id, &err),
    }
}

pub async fn free(
    State(state): State<AppState>,
    body: Result<Json<FreeRequest>, JsonRejection>,
) -> Response {
    let body = match parse_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let failures = body.validate();
    if !failures.is_empty() {
        warn!(path = "/free", ?failures, "bad_request");
        return bad_request(failures);
    }

    match state.allocator.free(&body.request_id).await {
        Ok(node_id) => {
            info!(request_id = %body.request_id, node_id, "free_ok");
            (StatusCode::OK, Json(FreeResponse { node_id })).into_response()
        }
        Err(AllocError::NotFound) => {
            info!(request_id = %body.request_id, error = "not_found", "free_not_found");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found" })),
            )
                .into_response()
        }
        Err(err) => internal_response("/free", &body.request_id, &err),
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.allocator.usage().await {
        Ok(stats) => {
            info!(utilization = stats.utilization, "metrics");
            if stats.utilization > 0.85 {
                warn!(utilization = stats.utilization, "utilization_high");
            }
            (StatusCode::OK, Json(stats)).into_response()
        }
        Err(err) => internal_response("/metrics", "", &err),
    }
}

pub async fn get_strategy(State(state): State<AppState>) -> Json<StrategyBody> {
    Json(StrategyBody {
        strategy: state.policy.strategy(),
    })
}

pub async fn set_strategy(
    State(state): State<AppState>,
    body: Result<Json<StrategyBody>, JsonRejection>,
) -> Response {
    let body = match parse_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    state.policy.set_strategy(body.strategy);
    info!(strategy = %body.strategy, "strategy_set");
    (
        StatusCode::OK,
        Json(StrategyBody {
            strategy: body.strategy,
        }),
    )
        .into_response()
}

/* =========================
Response shaping
========================= */

/// Body-level failures (malformed JSON, wrong types, unknown enum values)
/// surface through the same bad_request shape as field validation.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(inner)) => Ok(inner),
        Err(rejection) => {
            let reason = rejection.body_text();
            warn!(reason = %reason, "bad_request");
            Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "bad_request",
                    "detail": [{ "field": "body", "reason": reason }],
                })),
            )
                .into_response())
        }
    }
}

fn bad_request(detail: Vec<FieldError>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "detail": detail })),
    )
        .into_response()
}

fn rate_limited_response(decision: &Decision) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, header_value(decision.retry_after_secs));
    headers.insert("x-ratelimit-limit", header_value(decision.limit));
    headers.insert("x-ratelimit-remaining", header_value(decision.remaining));

    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(json!({ "error": "rate_limited" })),
    )
        .into_response()
}

fn overloaded_response(retry_after_secs: u64) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, header_value(retry_after_secs));

    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Json(json!({ "error": "overloaded" })),
    )
        .into_response()
}

fn internal_response(path: &'static str, request_id: &str, err: &AllocError) -> Response {
    error!(path, request_id, error = ?err, "internal_error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal" })),
    )
        .into_response()
}

fn header_value(v: u64) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).unwrap_or(HeaderValue::from_static("0"))
}
