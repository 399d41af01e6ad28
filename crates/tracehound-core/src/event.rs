//! Wire format for events sent from an instrumented process to the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::TokenUsage;

/// One trace event. A transmitted batch is a JSON array of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub trace_id: String,
    /// Unix timestamp (milliseconds) when the hook fired.
    pub timestamp: i64,
    /// Project the trace belongs to; the gateway default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Type-specific part of a [`TraceEvent`], tagged by `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    LlmStart {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        prompts: Vec<String>,
    },
    LlmEnd {
        #[serde(default)]
        output: String,
        #[serde(default)]
        tokens: Option<TokenUsage>,
        #[serde(default)]
        cost: Option<f64>,
    },
    ToolStart {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolEnd {
        #[serde(default)]
        output: Value,
        #[serde(default)]
        cost: Option<f64>,
    },
    ChainStart {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        inputs: Value,
    },
    ChainEnd {
        #[serde(default)]
        outputs: Value,
    },
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl TraceEvent {
    /// Creates an event stamped with the current time.
    pub fn new(trace_id: impl Into<String>, run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            run_id: run_id.into(),
            parent_run_id: None,
            trace_id: trace_id.into(),
            timestamp: crate::now_ms(),
            project_name: None,
            kind,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Constructors for instrumentation adapters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn llm_start(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        model: Option<String>,
        prompts: Vec<String>,
    ) -> Self {
        Self::new(trace_id, run_id, EventKind::LlmStart { model, prompts })
    }

    pub fn llm_end(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        output: impl Into<String>,
        tokens: Option<TokenUsage>,
        cost: Option<f64>,
    ) -> Self {
        let kind = EventKind::LlmEnd {
            output: output.into(),
            tokens,
            cost,
        };
        Self::new(trace_id, run_id, kind)
    }

    pub fn tool_start(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        let kind = EventKind::ToolStart {
            tool_name: tool_name.into(),
            input,
        };
        Self::new(trace_id, run_id, kind)
    }

    pub fn tool_end(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        output: Value,
        cost: Option<f64>,
    ) -> Self {
        Self::new(trace_id, run_id, EventKind::ToolEnd { output, cost })
    }

    pub fn chain_start(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        name: Option<String>,
        inputs: Value,
    ) -> Self {
        Self::new(trace_id, run_id, EventKind::ChainStart { name, inputs })
    }

    pub fn chain_end(trace_id: impl Into<String>, run_id: impl Into<String>, outputs: Value) -> Self {
        Self::new(trace_id, run_id, EventKind::ChainEnd { outputs })
    }

    pub fn error(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        message: impl Into<String>,
        stack: Option<String>,
    ) -> Self {
        let kind = EventKind::Error {
            message: message.into(),
            stack,
        };
        Self::new(trace_id, run_id, kind)
    }

    pub fn with_parent(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The `eventType` tag as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::LlmStart { .. } => "llm_start",
            EventKind::LlmEnd { .. } => "llm_end",
            EventKind::ToolStart { .. } => "tool_start",
            EventKind::ToolEnd { .. } => "tool_end",
            EventKind::ChainStart { .. } => "chain_start",
            EventKind::ChainEnd { .. } => "chain_end",
            EventKind::Error { .. } => "error",
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(
            self.kind,
            EventKind::LlmStart { .. } | EventKind::ToolStart { .. } | EventKind::ChainStart { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let event = TraceEvent::new(
            "t1",
            "r2",
            EventKind::ToolStart {
                tool_name: "search".to_string(),
                input: json!("paris"),
            },
        )
        .with_parent("r1")
        .with_timestamp(1_700_000_000_000);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "tool_start");
        assert_eq!(value["runId"], "r2");
        assert_eq!(value["parentRunId"], "r1");
        assert_eq!(value["traceId"], "t1");
        assert_eq!(value["toolName"], "search");
        assert_eq!(value["input"], "paris");
        assert!(value.get("projectName").is_none());
    }

    #[test]
    fn test_decode_llm_end_from_adapter_json() {
        let raw = r#"{
            "eventType": "llm_end",
            "runId": "r1",
            "traceId": "t1",
            "timestamp": 1700000000500,
            "output": "Paris is the capital of France.",
            "tokens": {"prompt": 12, "completion": 8, "total": 20}
        }"#;

        let event: TraceEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type(), "llm_end");
        assert!(event.parent_run_id.is_none());
        let EventKind::LlmEnd { tokens, cost, .. } = event.kind else {
            panic!("expected llm_end");
        };
        assert_eq!(tokens, Some(TokenUsage::new(12, 8)));
        assert_eq!(cost, None);
    }

    #[test]
    fn test_constructors() {
        let start = TraceEvent::tool_start("t1", "r2", "search", json!({"q": "paris"}));
        assert!(start.is_start());
        assert_eq!(start.event_type(), "tool_start");

        let end = TraceEvent::error("t1", "r2", "timeout", None).with_project("agents");
        assert!(!end.is_start());
        assert_eq!(end.event_type(), "error");
        assert_eq!(end.project_name.as_deref(), Some("agents"));

        let llm = TraceEvent::llm_end("t1", "r3", "ok", Some(TokenUsage::new(3, 4)), None);
        let value = serde_json::to_value(&llm).unwrap();
        assert_eq!(value["tokens"]["total"], 7);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let raw = r#"{"eventType": "retry", "runId": "r1", "traceId": "t1", "timestamp": 1}"#;
        assert!(serde_json::from_str::<TraceEvent>(raw).is_err());
    }
}
