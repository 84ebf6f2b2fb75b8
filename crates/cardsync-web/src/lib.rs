//! JSON API over the sync pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cardsync_core::OperationId;
use cardsync_sync::{
    CatalogSyncRequest, HarvestRequest, MatchRequest, OperationOutcome, PgStore, Pipeline, SyncConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "cardsync-web";

const DEFAULT_INSPECTOR_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    #[serde(default, alias = "operationId")]
    operation_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectorQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/harvest", post(harvest_handler))
        .route("/api/catalog/sync", post(catalog_sync_handler))
        .route("/api/match", post(match_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/fetchers/stats", get(fetcher_stats_handler))
        .route("/api/inspector", get(inspector_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Pipeline, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// Connects to Postgres, applies migrations, starts the cron scheduler when
/// enabled and serves until interrupted.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let store = PgStore::connect(&config.database_url, 10).await?;
    store.migrate().await?;
    let pipeline = Pipeline::from_config(config, Arc::new(store))?;

    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %pipeline.config().sync_cron, "scheduler started");
    }
    serve(pipeline, port).await
}

fn outcome_response<T: Serialize>(outcome: OperationOutcome<T>) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome)).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

async fn harvest_handler(State(state): State<Arc<AppState>>, Json(request): Json<HarvestRequest>) -> Response {
    outcome_response(state.pipeline.harvest_full_set(request).await)
}

async fn catalog_sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CatalogSyncRequest>,
) -> Response {
    outcome_response(state.pipeline.sync_catalog_for_game(request).await)
}

async fn match_handler(State(state): State<Arc<AppState>>, Json(request): Json<MatchRequest>) -> Response {
    outcome_response(state.pipeline.run_match(request).await)
}

async fn logs_handler(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Response {
    let operation_id = match query.operation_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<OperationId>() {
            Ok(id) => Some(id),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("invalid operation_id: {err}")),
        },
        None => None,
    };
    outcome_response(state.pipeline.query_sync_logs(operation_id, query.limit).await)
}

async fn fetcher_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.fetcher_stats()).into_response()
}

async fn inspector_handler(State(state): State<Arc<AppState>>, Query(query): Query<InspectorQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_INSPECTOR_LIMIT).clamp(1, 200);
    Json(state.pipeline.recent_responses(limit)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cardsync_storage::{FetchPolicy, FixtureTransport};
    use cardsync_sync::{MemoryStore, UpstreamConfig, UpstreamRegistry};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn test_app(transport: Arc<FixtureTransport>) -> Router {
        let policy = FetchPolicy {
            max_retries: 0,
            base_delay_ms: 1,
            requests_per_second: 0.0,
            ..FetchPolicy::default()
        };
        let registry = UpstreamRegistry {
            pricing: UpstreamConfig {
                base_url: "https://pricing.test/v1".into(),
                policy,
            },
            catalog: UpstreamConfig {
                base_url: "https://catalog.test".into(),
                policy,
            },
            scheduled_games: Vec::new(),
        };
        let config = SyncConfig {
            page_delay_ms: 0,
            ..SyncConfig::default()
        };
        let pipeline = Pipeline::with_transport(config, registry, Arc::new(MemoryStore::new()), transport);
        app(AppState::new(pipeline))
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn harvest_reports_cards_and_prices() {
        let transport = Arc::new(FixtureTransport::new());
        transport.respond(
            "https://pricing.test/v1/cards?game=pokemon&set=base-set&limit=2&offset=0",
            200,
            json!({
                "data": [{
                    "id": "c1",
                    "name": "Charizard",
                    "number": "4/102",
                    "variants": [{"printing": "Holofoil", "conditions": [{"condition": "Near Mint", "market": 310.0}]}]
                }],
                "meta": {"hasMore": false}
            })
            .to_string(),
        );
        let app = test_app(transport);

        let resp = app
            .clone()
            .oneshot(post_json("/api/harvest", json!({"gameId": "pokemon", "setId": "base-set", "pageSize": 2})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["total_cards"], 1);
        assert_eq!(body["data"]["prices_upserted"], 1);
    }

    #[tokio::test]
    async fn validation_failures_carry_their_status() {
        let app = test_app(Arc::new(FixtureTransport::new()));
        let resp = app
            .oneshot(post_json("/api/harvest", json!({"game_id": "pokemon"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("set_id"));
        assert!(body["operation_id"].is_string());
    }

    #[tokio::test]
    async fn match_for_unknown_game_is_not_found() {
        let app = test_app(Arc::new(FixtureTransport::new()));
        let resp = app
            .oneshot(post_json("/api/match", json!({"gameId": "lorcana", "dryRun": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_are_queryable_by_operation() {
        let app = test_app(Arc::new(FixtureTransport::new()));
        let failed = body_json(
            app.clone()
                .oneshot(post_json("/api/catalog/sync", json!({"gameId": "unknown"})))
                .await
                .unwrap(),
        )
        .await;
        let op = failed["operation_id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/logs?operation_id={op}&limit=10")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let logs = body_json(resp).await;
        let entries = logs["data"].as_array().unwrap();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e["operation_id"] == op.as_str()));

        let resp = app.oneshot(get("/api/logs?operation_id=not-a-uuid")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fetcher_stats_cover_both_upstreams() {
        let app = test_app(Arc::new(FixtureTransport::new()));
        let resp = app.clone().oneshot(get("/api/fetchers/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let stats = body_json(resp).await;
        let names: Vec<&str> = stats.as_array().unwrap().iter().filter_map(|s| s["upstream"].as_str()).collect();
        assert_eq!(names, vec!["pricing", "catalog"]);

        let inspector = body_json(app.oneshot(get("/api/inspector?limit=5")).await.unwrap()).await;
        assert!(inspector.as_array().unwrap().is_empty());
    }
}
