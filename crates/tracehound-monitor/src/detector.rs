//! Loop and cost-spike detection, run when a node completes.
//!
//! Both heuristics are pure functions of the trace's persisted nodes at call
//! time. [`AnomalyDetector`] wraps them with the store reads and writes and
//! swallows its own failures: detection never aborts ingestion.

use std::sync::Arc;

use serde_json::{json, Value};
use tracehound_core::{Anomaly, AnomalyType, NewAnomaly, Node, NodeType, Severity};
use tracing::{debug, warn};

use crate::store::TraceStore;
use crate::with_store;

/// Prior identical calls needed, besides the current one, to call it a loop.
const LOOP_WINDOW: usize = 2;
/// Implicated set size at which a loop becomes critical.
const LOOP_CRITICAL_CALLS: usize = 5;
/// Minimum peers needed to compute a meaningful average cost.
const MIN_COST_PEERS: usize = 2;
const SPIKE_MULTIPLIER: f64 = 3.0;
const SPIKE_CRITICAL_MULTIPLIER: f64 = 5.0;

/// Runs anomaly heuristics against the store.
#[derive(Clone)]
pub struct AnomalyDetector {
    store: Arc<TraceStore>,
}

impl AnomalyDetector {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }

    /// Checks a completed node against its trace's history and persists any findings.
    ///
    /// Failures are logged and yield no anomalies.
    pub async fn check_node(&self, node: &Node) -> Vec<Anomaly> {
        let trace_id = node.trace_id.clone();
        let nodes = match with_store(&self.store, move |s| s.list_nodes_by_trace(&trace_id)).await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(run_id = %node.run_id, "Anomaly detection skipped: {}", e);
                return Vec::new();
            }
        };

        let findings: Vec<NewAnomaly> = detect_loop(node, &nodes)
            .into_iter()
            .chain(detect_cost_spike(node, &nodes))
            .collect();

        let mut recorded = Vec::with_capacity(findings.len());
        for finding in findings {
            match with_store(&self.store, move |s| s.create_anomaly(&finding)).await {
                Ok(anomaly) => recorded.push(anomaly),
                Err(e) => warn!(run_id = %node.run_id, "Failed to record anomaly: {}", e),
            }
        }
        recorded
    }
}

/// Detects a tool being called again with the same input as its two most recent calls.
pub fn detect_loop(current: &Node, trace_nodes: &[Node]) -> Option<NewAnomaly> {
    let tool_name = current.payload.tool_name()?;
    let current_input = normalize_input(current.payload.tool_input()?);

    let mut prior: Vec<&Node> = trace_nodes
        .iter()
        .filter(|n| n.run_id != current.run_id)
        .filter(|n| n.payload.tool_name() == Some(tool_name))
        .collect();
    if prior.len() < LOOP_WINDOW {
        return None;
    }

    prior.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
    let recent = &prior[prior.len() - LOOP_WINDOW..];

    let repeated = recent.iter().all(|n| {
        n.payload
            .tool_input()
            .is_some_and(|input| normalize_input(input) == current_input)
    });
    if !repeated {
        return None;
    }

    let implicated: Vec<&Node> = recent.iter().copied().chain(Some(current)).collect();
    let call_count = implicated.len();
    let cost_wasted: f64 = implicated.iter().map(|n| n.cost.unwrap_or(0.0)).sum();
    let severity = if call_count >= LOOP_CRITICAL_CALLS {
        Severity::Critical
    } else {
        Severity::High
    };

    debug!(tool = tool_name, call_count, "Loop detected");
    Some(NewAnomaly {
        trace_id: current.trace_id.clone(),
        anomaly_type: AnomalyType::Loop,
        severity,
        message: format!(
            "Loop detected: tool '{}' called {} times with identical input (${:.4} spent)",
            tool_name, call_count, cost_wasted
        ),
        run_ids: implicated.iter().map(|n| n.run_id.clone()).collect(),
        suggestion: Some(format!(
            "Add a circuit breaker that stops calling '{}' after repeated identical inputs",
            tool_name
        )),
        metadata: Some(json!({
            "toolName": tool_name,
            "callCount": call_count,
            "costWasted": cost_wasted,
        })),
    })
}

/// Detects a node costing at least three times the average of its same-type peers.
pub fn detect_cost_spike(current: &Node, trace_nodes: &[Node]) -> Option<NewAnomaly> {
    let cost = current.cost.filter(|c| *c > 0.0)?;
    let node_type = current.node_type();

    let peer_costs: Vec<f64> = trace_nodes
        .iter()
        .filter(|n| n.run_id != current.run_id && n.node_type() == node_type)
        .filter_map(|n| n.cost)
        .collect();
    if peer_costs.len() < MIN_COST_PEERS {
        return None;
    }

    let average = peer_costs.iter().sum::<f64>() / peer_costs.len() as f64;
    if average <= 0.0 || cost < average * SPIKE_MULTIPLIER {
        return None;
    }

    let severity = if cost >= average * SPIKE_CRITICAL_MULTIPLIER {
        Severity::Critical
    } else {
        Severity::High
    };
    let percent_increase = ((cost / average - 1.0) * 100.0).round() as i64;

    let suggestion = (node_type == NodeType::Llm).then(|| {
        let tokens = current.tokens.map(|t| t.total).unwrap_or(0);
        format!(
            "This LLM call used {} tokens. Consider: (1) switching to a cheaper model, \
             (2) shortening the prompt, (3) capping max tokens",
            tokens
        )
    });

    debug!(run_id = %current.run_id, percent_increase, "Cost spike detected");
    Some(NewAnomaly {
        trace_id: current.trace_id.clone(),
        anomaly_type: AnomalyType::CostSpike,
        severity,
        message: format!(
            "Cost spike: ${:.4} is {}% above the ${:.4} average for {} nodes",
            cost,
            percent_increase,
            average,
            node_type.as_str()
        ),
        run_ids: vec![current.run_id.clone()],
        suggestion,
        metadata: Some(json!({
            "nodeCost": cost,
            "averageCost": average,
            "difference": cost - average,
            "percentIncrease": percent_increase,
        })),
    })
}

/// Canonical form for comparing tool inputs: stringified, lower-cased, whitespace removed.
fn normalize_input(input: &Value) -> String {
    let raw = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracehound_core::{LlmData, NodePayload, RunStatus, TokenUsage, ToolData};

    fn tool_call(run_id: &str, start_time: i64, input: Value) -> Node {
        let mut node = Node::start(
            "trace-1",
            run_id,
            None,
            start_time,
            NodePayload::Tool(ToolData {
                tool_name: "search".to_string(),
                input,
                output: None,
            }),
        );
        node.status = RunStatus::Complete;
        node
    }

    fn llm_call(run_id: &str, start_time: i64, cost: f64) -> Node {
        let mut node = Node::start(
            "trace-1",
            run_id,
            None,
            start_time,
            NodePayload::Llm(LlmData {
                model: Some("gpt-4o".to_string()),
                prompts: vec![],
                response: None,
            }),
        );
        node.status = RunStatus::Complete;
        node.cost = Some(cost);
        node.tokens = Some(TokenUsage::new(1200, 300));
        node
    }

    #[test]
    fn test_loop_on_three_identical_calls() {
        let nodes = vec![
            tool_call("r1", 1, json!("paris")),
            tool_call("r2", 2, json!(" Paris ")),
            tool_call("r3", 3, json!("PARIS")),
        ];

        let anomaly = detect_loop(&nodes[2], &nodes).unwrap();
        assert_eq!(anomaly.anomaly_type, AnomalyType::Loop);
        assert_eq!(anomaly.severity, Severity::High);
        assert_eq!(anomaly.run_ids, vec!["r1", "r2", "r3"]);
        assert_eq!(anomaly.metadata.as_ref().unwrap()["callCount"], 3);
        assert!(anomaly.message.contains("search"));
    }

    #[test]
    fn test_no_loop_when_input_differs() {
        let nodes = vec![
            tool_call("r1", 1, json!("paris")),
            tool_call("r2", 2, json!("paris")),
            tool_call("r3", 3, json!("london")),
        ];
        assert!(detect_loop(&nodes[2], &nodes).is_none());
    }

    #[test]
    fn test_loop_only_compares_two_most_recent() {
        let nodes = vec![
            tool_call("r1", 1, json!("paris")),
            tool_call("r2", 2, json!("london")),
            tool_call("r3", 3, json!("paris")),
            tool_call("r4", 4, json!("paris")),
        ];
        assert!(detect_loop(&nodes[3], &nodes).is_none());
        assert!(detect_loop(&nodes[1], &nodes[..2]).is_none());
    }

    #[test]
    fn test_loop_normalizes_structured_input() {
        let nodes = vec![
            tool_call("r1", 1, json!({"q": "Paris"})),
            tool_call("r2", 2, json!({"q": "paris"})),
            tool_call("r3", 3, json!({"q": "PARIS"})),
        ];
        let anomaly = detect_loop(&nodes[2], &nodes).unwrap();
        assert_eq!(anomaly.run_ids.len(), 3);
    }

    #[test]
    fn test_loop_ignores_non_tool_nodes() {
        let nodes = vec![llm_call("r1", 1, 0.01), llm_call("r2", 2, 0.01), llm_call("r3", 3, 0.01)];
        assert!(detect_loop(&nodes[2], &nodes).is_none());
    }

    #[test]
    fn test_cost_spike_critical_at_five_times_mean() {
        let nodes = vec![
            llm_call("r1", 1, 0.01),
            llm_call("r2", 2, 0.01),
            llm_call("r3", 3, 0.05),
        ];

        let anomaly = detect_cost_spike(&nodes[2], &nodes).unwrap();
        assert_eq!(anomaly.anomaly_type, AnomalyType::CostSpike);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(anomaly.run_ids, vec!["r3"]);
        let metadata = anomaly.metadata.unwrap();
        assert_eq!(metadata["percentIncrease"], 400);
        assert!(anomaly.message.contains("400%"));
        assert!(anomaly.suggestion.unwrap().contains("1500 tokens"));
    }

    #[test]
    fn test_cost_spike_high_between_thresholds() {
        let nodes = vec![
            llm_call("r1", 1, 0.01),
            llm_call("r2", 2, 0.01),
            llm_call("r3", 3, 0.04),
        ];
        let anomaly = detect_cost_spike(&nodes[2], &nodes).unwrap();
        assert_eq!(anomaly.severity, Severity::High);
        assert_eq!(anomaly.metadata.unwrap()["percentIncrease"], 300);
    }

    #[test]
    fn test_no_cost_spike_below_threshold() {
        let nodes = vec![
            llm_call("r1", 1, 0.01),
            llm_call("r2", 2, 0.01),
            llm_call("r3", 3, 0.02),
        ];
        assert!(detect_cost_spike(&nodes[2], &nodes).is_none());
    }

    #[test]
    fn test_no_cost_spike_without_enough_peers() {
        let nodes = vec![llm_call("r1", 1, 0.01), llm_call("r2", 2, 0.5)];
        assert!(detect_cost_spike(&nodes[1], &nodes).is_none());
    }

    #[test]
    fn test_tool_cost_spike_has_no_suggestion() {
        let mut nodes = vec![
            tool_call("r1", 1, json!("a")),
            tool_call("r2", 2, json!("b")),
            tool_call("r3", 3, json!("c")),
        ];
        nodes[0].cost = Some(0.001);
        nodes[1].cost = Some(0.001);
        nodes[2].cost = Some(0.01);
        let anomaly = detect_cost_spike(&nodes[2], &nodes).unwrap();
        assert!(anomaly.suggestion.is_none());
    }

    #[tokio::test]
    async fn test_check_node_persists_findings() {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        store
            .create_trace("trace-1", "proj", 0, HashMap::new())
            .unwrap();
        let nodes = vec![
            tool_call("r1", 1, json!("paris")),
            tool_call("r2", 2, json!("paris")),
            tool_call("r3", 3, json!("paris")),
        ];
        for node in &nodes {
            store.create_node(node).unwrap();
        }

        let detector = AnomalyDetector::new(store.clone());
        let anomalies = detector.check_node(&nodes[2]).await;

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::High);
        let stored = store.list_anomalies_by_trace("trace-1").unwrap();
        assert_eq!(stored, anomalies);
    }

    #[tokio::test]
    async fn test_check_node_swallows_store_failures() {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        store
            .create_trace("trace-1", "proj", 0, HashMap::new())
            .unwrap();
        let nodes = vec![
            tool_call("r1", 1, json!("paris")),
            tool_call("r2", 2, json!("paris")),
            tool_call("r3", 3, json!("paris")),
        ];
        store.create_node(&nodes[0]).unwrap();
        store.create_node(&nodes[1]).unwrap();

        // r3 was never persisted, so the loop it completes cannot be recorded.
        let detector = AnomalyDetector::new(store.clone());
        assert!(detector.check_node(&nodes[2]).await.is_empty());
        assert!(store.list_anomalies_by_trace("trace-1").unwrap().is_empty());
    }
}
