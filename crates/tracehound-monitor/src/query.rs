//! Query, update and projection types for the trace store.

use serde::{Deserialize, Serialize};
use tracehound_core::{Anomaly, Edge, Node, NodePayload, RunStatus, TokenUsage, Trace};

/// Query parameters for listing traces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    /// Filter by project name.
    pub project_name: Option<String>,
    /// Filter by status.
    pub status: Option<RunStatus>,
    /// Maximum number of traces to return.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl TraceQuery {
    pub fn project(project_name: impl Into<String>) -> Self {
        Self {
            project_name: Some(project_name.into()),
            ..Default::default()
        }
    }

    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

/// Partial update of a trace. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceUpdate {
    pub end_time: Option<i64>,
    pub status: Option<RunStatus>,
    pub total_cost: Option<f64>,
    pub node_count: Option<u32>,
}

impl TraceUpdate {
    pub fn is_empty(&self) -> bool {
        self.end_time.is_none()
            && self.status.is_none()
            && self.total_cost.is_none()
            && self.node_count.is_none()
    }

    /// Marks the trace finished with the given terminal status.
    pub fn finish(status: RunStatus, end_time: i64) -> Self {
        Self {
            end_time: Some(end_time),
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Partial update of a node. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub status: Option<RunStatus>,
    pub end_time: Option<i64>,
    pub payload: Option<NodePayload>,
    pub cost: Option<f64>,
    pub tokens: Option<TokenUsage>,
    /// Derived from `end_time - start_time` when omitted alongside an end time.
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.end_time.is_none()
            && self.payload.is_none()
            && self.cost.is_none()
            && self.tokens.is_none()
            && self.latency_ms.is_none()
            && self.error.is_none()
    }

    pub fn complete(end_time: i64) -> Self {
        Self {
            status: Some(RunStatus::Complete),
            end_time: Some(end_time),
            ..Default::default()
        }
    }

    pub fn failed(end_time: i64, error: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Error),
            end_time: Some(end_time),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_tokens(mut self, tokens: Option<TokenUsage>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_payload(mut self, payload: NodePayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A trace with everything it owns, read from one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDetail {
    pub trace: Trace,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub anomalies: Vec<Anomaly>,
}

/// Aggregate counts for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSummary {
    pub trace_count: u64,
    pub node_count: u64,
    pub anomaly_count: u64,
    pub total_cost: f64,
}
