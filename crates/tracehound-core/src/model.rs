//! Persisted execution graph types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Status & Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status shared by traces and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Execution is still in progress.
    Running,
    /// Execution finished successfully.
    Complete,
    /// Execution failed.
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "complete" => Some(RunStatus::Complete),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    /// Complete and error are final; nothing may move out of them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Kind of work a node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Llm,
    Tool,
    Chain,
    Agent,
    Retriever,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Llm => "llm",
            NodeType::Tool => "tool",
            NodeType::Chain => "chain",
            NodeType::Agent => "agent",
            NodeType::Retriever => "retriever",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(NodeType::Llm),
            "tool" => Some(NodeType::Tool),
            "chain" => Some(NodeType::Chain),
            "agent" => Some(NodeType::Agent),
            "retriever" => Some(NodeType::Retriever),
            _ => None,
        }
    }
}

/// How serious a detected anomaly is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Category of anomaly. Unknown names survive a round trip as [`AnomalyType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnomalyType {
    /// The same tool was called repeatedly with identical input.
    Loop,
    /// A node cost far more than its peers of the same type.
    CostSpike,
    Other(String),
}

impl AnomalyType {
    pub fn as_str(&self) -> &str {
        match self {
            AnomalyType::Loop => "loop",
            AnomalyType::CostSpike => "cost_spike",
            AnomalyType::Other(name) => name,
        }
    }
}

impl From<String> for AnomalyType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "loop" => AnomalyType::Loop,
            "cost_spike" => AnomalyType::CostSpike,
            _ => AnomalyType::Other(s),
        }
    }
}

impl From<AnomalyType> for String {
    fn from(t: AnomalyType) -> Self {
        t.as_str().to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trace
// ─────────────────────────────────────────────────────────────────────────────

/// One top-level recorded execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Globally unique trace identifier.
    pub id: String,
    pub project_name: String,
    /// Unix timestamp (milliseconds) when the execution started.
    pub start_time: i64,
    /// Unix timestamp (milliseconds) when the execution finished.
    pub end_time: Option<i64>,
    pub status: RunStatus,
    /// Sum of all node costs in USD.
    pub total_cost: f64,
    pub node_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// Token accounting for an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt.saturating_add(completion),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmData {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolData {
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Data for chain and agent steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverData {
    pub query: String,
    #[serde(default)]
    pub documents: Option<Value>,
}

/// Role-specific node data, keyed by node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodePayload {
    Llm(LlmData),
    Tool(ToolData),
    Chain(ChainData),
    Agent(ChainData),
    Retriever(RetrieverData),
}

impl NodePayload {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodePayload::Llm(_) => NodeType::Llm,
            NodePayload::Tool(_) => NodeType::Tool,
            NodePayload::Chain(_) => NodeType::Chain,
            NodePayload::Agent(_) => NodeType::Agent,
            NodePayload::Retriever(_) => NodeType::Retriever,
        }
    }

    /// Tool name for tool nodes.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            NodePayload::Tool(t) => Some(&t.tool_name),
            _ => None,
        }
    }

    /// Tool input for tool nodes.
    pub fn tool_input(&self) -> Option<&Value> {
        match self {
            NodePayload::Tool(t) => Some(&t.input),
            _ => None,
        }
    }

    /// Model name for LLM nodes.
    pub fn model(&self) -> Option<&str> {
        match self {
            NodePayload::Llm(l) => l.model.as_deref(),
            _ => None,
        }
    }

    /// Records the result of the step in the variant's output slot.
    pub fn set_output(&mut self, output: Value) {
        match self {
            NodePayload::Llm(l) => {
                l.response = Some(match output {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            NodePayload::Tool(t) => t.output = Some(output),
            NodePayload::Chain(c) | NodePayload::Agent(c) => c.outputs = Some(output),
            NodePayload::Retriever(r) => r.documents = Some(output),
        }
    }
}

/// One recorded unit of work inside a trace (a "run").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub trace_id: String,
    /// Correlation identifier, unique across all traces.
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub payload: NodePayload,
    /// Cost in USD, set on completion.
    pub cost: Option<f64>,
    pub tokens: Option<TokenUsage>,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

impl Node {
    /// Creates a running node with a fresh identifier.
    pub fn start(
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
        parent_run_id: Option<String>,
        start_time: i64,
        payload: NodePayload,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            run_id: run_id.into(),
            parent_run_id,
            status: RunStatus::Running,
            start_time,
            end_time: None,
            payload,
            cost: None,
            tokens: None,
            latency_ms: None,
            error: None,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.payload.node_type()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Edge
// ─────────────────────────────────────────────────────────────────────────────

/// Directed flow relationship between two runs of the same trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub trace_id: String,
    pub from_run: String,
    pub to_run: String,
}

impl Edge {
    pub fn new(
        trace_id: impl Into<String>,
        from_run: impl Into<String>,
        to_run: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            from_run: from_run.into(),
            to_run: to_run.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anomaly
// ─────────────────────────────────────────────────────────────────────────────

/// A detected deviation attached to a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub trace_id: String,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub message: String,
    /// Implicated runs, in the order the detector reported them.
    pub run_ids: Vec<String>,
    pub suggestion: Option<String>,
    /// Type-specific evidence.
    pub metadata: Option<Value>,
    pub created_at: i64,
}

/// An anomaly before the store has assigned its identifier and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnomaly {
    pub trace_id: String,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub message: String,
    pub run_ids: Vec<String>,
    pub suggestion: Option<String>,
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_total_saturates() {
        assert_eq!(TokenUsage::new(120, 30).total, 150);
        assert_eq!(TokenUsage::new(u32::MAX, 1).total, u32::MAX);
    }

    #[test]
    fn test_payload_tagged_by_type() {
        let payload = NodePayload::Tool(ToolData {
            tool_name: "search".to_string(),
            input: json!({"q": "paris"}),
            output: None,
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "tool");
        assert_eq!(value["tool_name"], "search");

        let back: NodePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.node_type(), NodeType::Tool);
    }

    #[test]
    fn test_set_output_per_variant() {
        let mut llm = NodePayload::Llm(LlmData {
            model: Some("gpt-4o".to_string()),
            prompts: vec!["hi".to_string()],
            response: None,
        });
        llm.set_output(json!("hello"));
        let NodePayload::Llm(data) = &llm else { panic!("expected llm") };
        assert_eq!(data.response.as_deref(), Some("hello"));

        let mut chain = NodePayload::Agent(ChainData {
            name: None,
            inputs: json!({}),
            outputs: None,
        });
        chain.set_output(json!({"answer": 42}));
        let NodePayload::Agent(data) = &chain else { panic!("expected agent") };
        assert_eq!(data.outputs, Some(json!({"answer": 42})));
    }

    #[test]
    fn test_anomaly_type_extensible() {
        let t: AnomalyType = serde_json::from_str("\"latency_outlier\"").unwrap();
        assert_eq!(t, AnomalyType::Other("latency_outlier".to_string()));
        assert_eq!(serde_json::to_string(&AnomalyType::CostSpike).unwrap(), "\"cost_spike\"");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Complete.is_terminal());
        assert_eq!(RunStatus::parse("error"), Some(RunStatus::Error));
        assert_eq!(RunStatus::parse("success"), None);
        assert!(Severity::Critical > Severity::High);
    }
}
