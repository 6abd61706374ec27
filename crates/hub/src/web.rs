use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MAX_RULES;
use crate::rules::{RuleEntry, SharedRules};
use crate::state::{LiveState, LiveStateStore};

#[derive(Clone)]
pub struct AppState {
    pub store: LiveStateStore,
    pub rules: SharedRules,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/recommendations", get(api_recommendations))
        .route("/api/watchdog", get(api_watchdog))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", put(update_rule).delete(delete_rule))
        .route("/api/rules/{id}/toggle", post(toggle_rule))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("no rule with id '{id}'"))
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: i64,
    #[serde(flatten)]
    state: LiveState,
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.store.current();
    Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        state: (*st).clone(),
    })
}

async fn api_recommendations(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.store.current().recommendations.clone())
}

async fn api_watchdog(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.store.current().watchdog.clone())
}

// -- Rules ------------------------------------------------------------------

async fn list_rules(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.rules.read().await.rules().to_vec())
}

async fn create_rule(
    State(app): State<AppState>,
    Json(entry): Json<RuleEntry>,
) -> Result<Response, ApiError> {
    let rule = entry
        .compile()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("{e:#}")))?;

    let mut book = app.rules.write().await;
    if book.get(&rule.id).is_some() {
        return Err(ApiError(
            StatusCode::CONFLICT,
            format!("rule '{}' already exists", rule.id),
        ));
    }
    if book.len() >= MAX_RULES {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("rule limit of {MAX_RULES} reached"),
        ));
    }
    info!(rule = %rule.id, "rule created");
    book.upsert(rule.clone());
    Ok((StatusCode::CREATED, Json(rule)).into_response())
}

async fn update_rule(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(mut entry): Json<RuleEntry>,
) -> Result<Response, ApiError> {
    // The path names the rule; a body id, if any, is ignored.
    entry.id = id.clone();
    let rule = entry
        .compile()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("{e:#}")))?;

    let mut book = app.rules.write().await;
    if book.get(&id).is_none() {
        return Err(not_found(&id));
    }
    book.upsert(rule);
    info!(rule = %id, "rule updated");
    let updated = book.get(&id).cloned().ok_or_else(|| not_found(&id))?;
    Ok(Json(updated).into_response())
}

async fn delete_rule(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if app.rules.write().await.remove(&id) {
        info!(rule = %id, "rule deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

async fn toggle_rule(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let enabled = app
        .rules
        .write()
        .await
        .toggle(&id)
        .ok_or_else(|| not_found(&id))?;
    info!(rule = %id, enabled, "rule toggled");
    Ok(Json(json!({ "id": id, "enabled": enabled })).into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::GrowthPhase;
    use crate::config::OperationMode;
    use crate::rules::RuleBook;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use time::macros::datetime;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    const RULE: &str = r#"{
        "id": "vent",
        "name": "Vent when humid",
        "priority": 60,
        "conditions": [{"metric": "humidity", "operator": ">", "threshold": 70}],
        "actions": [{"type": "device", "device": "exhaust_fan", "state": "on"}]
    }"#;

    fn app() -> AppState {
        let now = datetime!(2026-10-18 12:00 UTC);
        AppState {
            store: LiveStateStore::new(LiveState::new(
                OperationMode::Monitor,
                GrowthPhase::Vegetative,
                now,
            )),
            rules: Arc::new(RwLock::new(RuleBook::default())),
        }
    }

    async fn call(
        app: &AppState,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let resp = router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn status_reports_empty_initial_state() {
        let app = app();
        let (status, json) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["uptime_secs"], 0);
        assert_eq!(json["mode"], "monitor");
        assert!(json["fused"].is_null());
        assert!(json["snapshot"].is_null());
    }

    #[tokio::test]
    async fn recommendations_and_watchdog_are_readable() {
        let app = app();
        let (status, json) = call(&app, "GET", "/api/recommendations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));

        let (status, json) = call(&app, "GET", "/api/watchdog", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.is_object());
    }

    #[tokio::test]
    async fn create_then_list() {
        let app = app();
        let (status, json) = call(&app, "POST", "/api/rules", Some(RULE)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["id"], "vent");
        assert_eq!(json["execution_count"], 0);

        let (_, list) = call(&app, "GET", "/api/rules", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let app = app();
        call(&app, "POST", "/api/rules", Some(RULE)).await;
        let (status, _) = call(&app, "POST", "/api/rules", Some(RULE)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn malformed_rule_is_rejected_with_reason() {
        let app = app();
        let bad = RULE.replace("humidity", "co2");
        let (status, json) = call(&app, "POST", "/api/rules", Some(&bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("unknown metric"));
        assert_eq!(app.rules.read().await.len(), 0);
    }

    #[tokio::test]
    async fn update_keeps_execution_history() {
        let app = app();
        call(&app, "POST", "/api/rules", Some(RULE)).await;
        app.rules
            .write()
            .await
            .record_execution("vent", datetime!(2026-10-18 12:05 UTC));

        let edited = RULE.replace("60", "90");
        let (status, json) = call(&app, "PUT", "/api/rules/vent", Some(&edited)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["priority"], 90);
        assert_eq!(json["execution_count"], 1);
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let app = app();
        let (status, _) = call(&app, "PUT", "/api/rules/ghost", Some(RULE)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_and_delete() {
        let app = app();
        call(&app, "POST", "/api/rules", Some(RULE)).await;

        let (status, json) = call(&app, "POST", "/api/rules/vent/toggle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["enabled"], false);

        let (status, _) = call(&app, "DELETE", "/api/rules/vent", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", "/api/rules/vent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/api/rules/vent/toggle", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
