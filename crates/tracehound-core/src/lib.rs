//! Core domain types shared across tracehound.
//!
//! This crate provides the persisted data model and the wire format used
//! between instrumented processes and the ingestion gateway:
//!
//! - [`Trace`], [`Node`], [`Edge`] and [`Anomaly`]: the execution graph
//! - [`NodePayload`]: role-specific node data, tagged by [`NodeType`]
//! - [`TraceEvent`] and [`EventKind`]: one event on the wire
//!
//! # Example
//!
//! ```rust
//! use tracehound_core::{EventKind, TraceEvent};
//!
//! let event = TraceEvent::new(
//!     "trace-1",
//!     "run-1",
//!     EventKind::ToolStart {
//!         tool_name: "search".to_string(),
//!         input: serde_json::json!("paris"),
//!     },
//! )
//! .with_parent("run-0");
//!
//! assert_eq!(event.event_type(), "tool_start");
//! ```

mod event;
mod model;

pub use event::{EventKind, TraceEvent};
pub use model::{
    Anomaly, AnomalyType, ChainData, Edge, LlmData, NewAnomaly, Node, NodePayload, NodeType,
    RetrieverData, RunStatus, Severity, TokenUsage, ToolData, Trace,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
