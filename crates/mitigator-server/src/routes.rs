//! HTTP API
//!
//! `GET /version`, `POST /alert` (202 on enqueue, 406 without a JSON
//! content type) and GET/POST catalog CRUD for conditions, nodes and
//! workflows. Catalog writes persist through the store before returning.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use mitigator_core::condition::ConditionSpec;
use mitigator_core::model::{AttackNode, WorkflowSignature};
use mitigator_core::store::CatalogStore;
use mitigator_core::{Catalogs, MitigatorError};

use crate::ingress::AlertQueue;

pub struct ApiState {
    pub catalogs: Arc<Catalogs>,
    pub store: Arc<CatalogStore>,
    pub queue: AlertQueue,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/alert", post(post_alert))
        .route("/condition", get(get_condition).post(post_condition))
        .route("/node", get(get_node).post(post_node))
        .route("/workflow", get(get_workflow).post(post_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct VersionInfo {
    version: String,
    major: u32,
    minor: u32,
}

async fn version() -> Json<VersionInfo> {
    let raw = env!("CARGO_PKG_VERSION");
    let mut parts = raw.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Json(VersionInfo {
        version: format!("v{major}.{minor}"),
        major,
        minor,
    })
}

async fn post_alert(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let json_content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !json_content_type {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let doc: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    tracing::info!("received new alert over HTTP");
    if state.queue.try_push(doc) {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "alert queue full").into_response()
    }
}

#[derive(Deserialize)]
struct IdQuery {
    id: u32,
}

async fn get_condition(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<IdQuery>,
) -> Response {
    match state.catalogs.conditions.get(query.id) {
        Some(condition) => Json(ConditionSpec::from(condition.as_ref())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_condition(
    State(state): State<Arc<ApiState>>,
    Json(spec): Json<ConditionSpec>,
) -> Response {
    tracing::info!(condition = spec.id, "storing condition");
    if let Err(e) = state.catalogs.insert_condition(spec) {
        return reject(e);
    }
    match state.store.persist_conditions(&state.catalogs) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => persist_failure(e),
    }
}

async fn get_node(State(state): State<Arc<ApiState>>, Query(query): Query<IdQuery>) -> Response {
    match state.catalogs.find_node(query.id) {
        Some(node) => Json(node).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_node(State(state): State<Arc<ApiState>>, Json(node): Json<AttackNode>) -> Response {
    tracing::info!(node = node.id, "storing node");
    if let Err(e) = state.catalogs.update_node(node) {
        return reject(e);
    }
    match state.store.persist_graphs(&state.catalogs) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => persist_failure(e),
    }
}

async fn get_workflow(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<IdQuery>,
) -> Response {
    match state.catalogs.workflows.get(query.id) {
        Some(workflow) => Json(workflow.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_workflow(
    State(state): State<Arc<ApiState>>,
    Json(workflow): Json<WorkflowSignature>,
) -> Response {
    tracing::info!(workflow = workflow.id, "storing workflow");
    if let Err(e) = state.catalogs.insert_workflow(workflow) {
        return reject(e);
    }
    match state.store.persist_workflows(&state.catalogs) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => persist_failure(e),
    }
}

/// Invalid entities are rejected, not stored.
fn reject(error: MitigatorError) -> Response {
    tracing::warn!(error = %error, "rejecting catalog update");
    let status = match &error {
        MitigatorError::ConditionSyntax(_) | MitigatorError::CatalogInvariant(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

fn persist_failure(error: MitigatorError) -> Response {
    tracing::error!(error = %error, "failed to persist catalog");
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<ApiState> {
        let dir = std::env::temp_dir().join(format!(
            "mitigator-routes-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let (queue, rx) = AlertQueue::new(4);
        std::mem::forget(rx);
        Arc::new(ApiState {
            catalogs: Arc::new(Catalogs::new()),
            store: Arc::new(CatalogStore::new(
                dir.join("conditions.json"),
                dir.join("attack-graphs.json"),
                dir.join("workflows.json"),
            )),
            queue,
        })
    }

    #[tokio::test]
    async fn test_version_shape() {
        let Json(info) = version().await;
        assert!(info.version.starts_with('v'));
        assert_eq!(info.major, 1);
    }

    #[tokio::test]
    async fn test_post_alert_content_type_gate() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let response = post_alert(
            State(Arc::clone(&state)),
            headers,
            axum::body::Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        let response = post_alert(
            State(state),
            headers,
            axum::body::Bytes::from_static(b"{\"rule\": {}}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_condition_crud() {
        let state = state();
        let spec: ConditionSpec = serde_json::from_value(serde_json::json!({
            "id": 201,
            "args": {"file_path": "file_path"},
            "check": "(endswith (get parameters \"file_path\") \".py\")"
        }))
        .unwrap();

        let response = post_condition(State(Arc::clone(&state)), Json(spec)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            get_condition(State(Arc::clone(&state)), Query(IdQuery { id: 201 })).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get_condition(State(state), Query(IdQuery { id: 999 })).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_condition_rejected() {
        let state = state();
        let spec: ConditionSpec = serde_json::from_value(serde_json::json!({
            "id": 7,
            "check": "(rm -rf)"
        }))
        .unwrap();
        let response = post_condition(State(state), Json(spec)).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
