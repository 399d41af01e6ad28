//! Read-only trace query API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracehound_core::{RunStatus, Trace};
use tracehound_monitor::{with_store, StoreSummary, TraceDetail, TraceQuery};

use crate::error::AppError;
use crate::ServerState;

const DEFAULT_PAGE_SIZE: u32 = 50;

/// Response for listing traces.
#[derive(Serialize)]
pub struct TracesListResponse {
    pub traces: Vec<Trace>,
}

/// Query parameters for listing traces.
#[derive(Debug, Deserialize, Default)]
pub struct ListTracesQuery {
    pub project: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /api/traces - List traces, most recently created first.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ListTracesQuery>,
) -> Result<Json<TracesListResponse>, AppError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            RunStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let query = TraceQuery {
        project_name: params.project,
        status,
        limit: params.limit.or(Some(DEFAULT_PAGE_SIZE)),
        offset: params.offset,
    };

    let traces = with_store(&state.store, move |s| s.list_traces(&query)).await?;
    Ok(Json(TracesListResponse { traces }))
}

/// GET /api/traces/{id} - A trace with its nodes, edges and anomalies.
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceDetail>, AppError> {
    let lookup = trace_id.clone();
    with_store(&state.store, move |s| s.get_trace_detail(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("trace {trace_id} not found")))
}

/// DELETE /api/traces/{id} - Delete a trace and everything it owns.
pub async fn delete(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let target = trace_id.clone();
    let deleted = with_store(&state.store, move |s| s.delete_trace(&target)).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("trace {trace_id} not found")));
    }
    tracing::info!(trace_id = %trace_id, "Trace deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/summary - Aggregate counts across all traces.
pub async fn summary(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<StoreSummary>, AppError> {
    let summary = with_store(&state.store, |s| s.summary()).await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;
    use tracehound_core::{Node, NodePayload, ToolData};
    use tracehound_monitor::{RecorderConfig, TraceStore};

    fn state() -> Arc<ServerState> {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        Arc::new(ServerState::new(store, RecorderConfig::default()))
    }

    fn seed(state: &ServerState, id: &str, project: &str) {
        state
            .store
            .create_trace(id, project, 1_000, HashMap::new())
            .unwrap();
        let node = Node::start(
            id,
            format!("{id}-run"),
            None,
            1_000,
            NodePayload::Tool(ToolData {
                tool_name: "search".into(),
                input: json!("paris"),
                output: None,
            }),
        );
        state.store.create_node(&node).unwrap();
    }

    async fn call(state: Arc<ServerState>, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = crate::router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_list_filters_by_project_and_paginates() {
        let state = state();
        seed(&state, "t1", "alpha");
        seed(&state, "t2", "beta");
        seed(&state, "t3", "alpha");

        let (status, body) = call(state.clone(), "GET", "/api/traces?project=alpha").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["traces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["t3", "t1"]);

        let (_, body) = call(state, "GET", "/api/traces?limit=1&offset=1").await;
        let traces = body["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["id"], "t2");
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let (status, body) = call(state(), "GET", "/api/traces?status=paused").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("paused"));
    }

    #[tokio::test]
    async fn test_get_returns_detail_or_404() {
        let state = state();
        seed(&state, "t1", "alpha");

        let (status, body) = call(state.clone(), "GET", "/api/traces/t1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trace"]["id"], "t1");
        assert_eq!(body["nodes"].as_array().unwrap().len(), 1);
        assert!(body["edges"].as_array().unwrap().is_empty());
        assert!(body["anomalies"].as_array().unwrap().is_empty());

        let (status, _) = call(state, "GET", "/api/traces/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_cascades_then_404s() {
        let state = state();
        seed(&state, "t1", "alpha");

        let (status, _) = call(state.clone(), "DELETE", "/api/traces/t1").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.store.get_node_by_run_id("t1-run").unwrap().is_none());

        let (status, _) = call(state, "DELETE", "/api/traces/t1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_summary_and_health() {
        let state = state();
        seed(&state, "t1", "alpha");
        seed(&state, "t2", "alpha");

        let (status, body) = call(state.clone(), "GET", "/api/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trace_count"], 2);
        assert_eq!(body["node_count"], 2);
        assert_eq!(body["anomaly_count"], 0);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = crate::router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
