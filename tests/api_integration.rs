use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use quotad::alloc::engine::{Allocator, PolicyHandle};
use quotad::alloc::model::Strategy;
use quotad::alloc::repository_sqlx::SqlxAllocationRepository;
use quotad::api::AppState;
use quotad::api::handlers;
use quotad::api::types::{AllocRequest, FreeRequest, StrategyBody};
use quotad::db::schema;
use quotad::metrics::counters::Counters;
use quotad::ratelimit::TokenBucketLimiter;
use quotad::time::ManualClock;

async fn setup_pool() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool = AnyPoolOptions::new()
        .max_connections(2)
        .connect(&conn_str)
        .await
        .unwrap();

    schema::migrate(&pool).await.unwrap();
    pool
}

async fn mk_state(
    pool: &AnyPool,
    strategy: Strategy,
    limiter: Option<Arc<TokenBucketLimiter>>,
) -> AppState {
    let repo = Arc::new(SqlxAllocationRepository::new(pool.clone(), false));
    let policy = PolicyHandle::new(strategy, 200);
    let counters = Counters::default();
    let allocator = Arc::new(Allocator::new(repo, policy.clone(), counters.clone()));

    AppState {
        allocator,
        limiter,
        policy,
        counters,
        overload_retry_after_secs: 2,
    }
}

fn peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000)))
}

async fn into_json(resp: Response) -> (StatusCode, Value) {
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn alloc_body(request_id: &str, token_count: i64) -> AllocRequest {
    AllocRequest {
        request_id: request_id.to_string(),
        token_count,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let resp = handlers::health().await.into_response();
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "status": "ok" }));
}

#[tokio::test]
async fn alloc_success_returns_node_and_remaining() {
    let pool = setup_pool().await;
    schema::seed(&pool, 6, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let resp = handlers::alloc(
        State(state),
        peer(),
        Ok(Json(alloc_body("rid-1", 30))),
    )
    .await;

    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining_quota"], 270);
    assert!(body["node_id"].is_i64());
}

#[tokio::test]
async fn alloc_validation_failures_are_listed() {
    let pool = setup_pool().await;
    schema::seed(&pool, 1, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let resp = handlers::alloc(State(state), peer(), Ok(Json(alloc_body("", 0)))).await;

    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    let detail = body["detail"].as_array().unwrap();
    assert_eq!(detail.len(), 2);
    assert_eq!(detail[0]["field"], "request_id");
    assert_eq!(detail[1]["field"], "token_count");
}

#[tokio::test]
async fn alloc_overload_maps_to_429_with_retry_hint() {
    let pool = setup_pool().await;
    schema::seed(&pool, 1, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let resp = handlers::alloc(
        State(state),
        peer(),
        Ok(Json(alloc_body("rid-big", 301))),
    )
    .await;

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "2");
    let (_, body) = into_json(resp).await;
    assert_eq!(body, serde_json::json!({ "error": "overloaded" }));
}

#[tokio::test]
async fn alloc_is_idempotent_at_the_api_surface() {
    let pool = setup_pool().await;
    schema::seed(&pool, 6, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let r1 = handlers::alloc(
        State(state.clone()),
        peer(),
        Ok(Json(alloc_body("same", 50))),
    )
    .await;
    let r2 = handlers::alloc(State(state), peer(), Ok(Json(alloc_body("same", 50)))).await;

    let (s1, b1) = into_json(r1).await;
    let (s2, b2) = into_json(r2).await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(b1, b2);
}

#[tokio::test]
async fn free_round_trip_and_not_found() {
    let pool = setup_pool().await;
    schema::seed(&pool, 2, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let resp = handlers::alloc(
        State(state.clone()),
        peer(),
        Ok(Json(alloc_body("tofree", 40))),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = handlers::free(
        State(state.clone()),
        Ok(Json(FreeRequest {
            request_id: "tofree".into(),
        })),
    )
    .await;
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["node_id"].is_i64());

    let resp = handlers::free(
        State(state),
        Ok(Json(FreeRequest {
            request_id: "missing".into(),
        })),
    )
    .await;
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, serde_json::json!({ "error": "not_found" }));
}

#[tokio::test]
async fn free_rejects_empty_request_id() {
    let pool = setup_pool().await;
    schema::seed(&pool, 1, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    let resp = handlers::free(
        State(state),
        Ok(Json(FreeRequest {
            request_id: String::new(),
        })),
    )
    .await;
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn metrics_exposes_snapshot_shape() {
    let pool = setup_pool().await;
    schema::seed(&pool, 3, 300).await.unwrap();
    let state = mk_state(&pool, Strategy::Best, None).await;

    handlers::alloc(
        State(state.clone()),
        peer(),
        Ok(Json(alloc_body("m1", 90))),
    )
    .await;

    let resp = handlers::metrics(State(state)).await;
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_capacity"], 900);
    assert_eq!(body["used_total"], 90);
    assert_eq!(body["remaining_total"], 810);
    assert_eq!(body["per_node"].as_array().unwrap().len(), 3);
    let gini = body["imbalance_gini"].as_f64().unwrap();
    assert!((0.0..1.0).contains(&gini));
}

#[tokio::test]
async fn strategy_round_trips_and_steers_placement() {
    let pool = setup_pool().await;
    for (id, used) in [(0i64, 250i64), (1, 100), (2, 0)] {
        sqlx::query("INSERT INTO nodes (id, capacity_m, used_quota) VALUES (?, 300, ?);")
            .bind(id)
            .bind(used)
            .execute(&pool)
            .await
            .unwrap();
    }
    let state = mk_state(&pool, Strategy::Best, None).await;

    let Json(current) = handlers::get_strategy(State(state.clone())).await;
    assert_eq!(current.strategy, Strategy::Best);

    let resp = handlers::set_strategy(
        State(state.clone()),
        Ok(Json(StrategyBody {
            strategy: Strategy::Largest,
        })),
    )
    .await;
    let (status, body) = into_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategy"], "largest");

    // The running engine observes the new strategy immediately.
    let resp = handlers::alloc(
        State(state.clone()),
        peer(),
        Ok(Json(alloc_body("steered", 150))),
    )
    .await;
    let (_, body) = into_json(resp).await;
    assert_eq!(body["node_id"], 2);

    let Json(current) = handlers::get_strategy(State(state)).await;
    assert_eq!(current.strategy, Strategy::Largest);
}

#[tokio::test]
async fn alloc_rate_limit_denies_with_headers() {
    let pool = setup_pool().await;
    schema::seed(&pool, 6, 300).await.unwrap();

    // Global 3/s, client 2/s, burst = rate: the third back-to-back request
    // from one client exhausts the client bucket.
    let clock = Arc::new(ManualClock::new(0.0));
    let limiter = Arc::new(TokenBucketLimiter::new(3, 3, 2, 2, clock));
    let state = mk_state(&pool, Strategy::Best, Some(limiter)).await;

    let mut statuses = Vec::new();
    let mut denied = None;
    for i in 0..4 {
        let resp = handlers::alloc(
            State(state.clone()),
            peer(),
            Ok(Json(alloc_body(&format!("rl-{i}"), 10))),
        )
        .await;
        if resp.status() == StatusCode::TOO_MANY_REQUESTS && denied.is_none() {
            denied = Some(resp);
            statuses.push(StatusCode::TOO_MANY_REQUESTS);
        } else {
            statuses.push(resp.status());
        }
    }

    assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));
    let denied = denied.expect("no request was rate limited");

    assert_eq!(denied.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(denied.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let retry_after: u64 = denied
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let (_, body) = into_json(denied).await;
    assert_eq!(body, serde_json::json!({ "error": "rate_limited" }));
    assert!(state.counters.rate_limited.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn rate_limiter_does_not_guard_free() {
    let pool = setup_pool().await;
    schema::seed(&pool, 2, 300).await.unwrap();

    // A dry limiter: every alloc would be denied.
    let clock = Arc::new(ManualClock::new(0.0));
    let limiter = Arc::new(TokenBucketLimiter::new(1, 1, 1, 1, clock));
    let state = mk_state(&pool, Strategy::Best, Some(limiter)).await;

    let resp = handlers::alloc(
        State(state.clone()),
        peer(),
        Ok(Json(alloc_body("guarded", 10))),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // The limiter is spent now, but /free stays reachable.
    let resp = handlers::free(
        State(state),
        Ok(Json(FreeRequest {
            request_id: "guarded".into(),
        })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}
