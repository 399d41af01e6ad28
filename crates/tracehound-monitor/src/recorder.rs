//! Applies wire events to the trace store and runs anomaly detection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracehound_core::{
    Anomaly, ChainData, EventKind, LlmData, Node, NodePayload, RunStatus, ToolData, TraceEvent,
};
use tracing::{debug, warn};

use crate::detector::AnomalyDetector;
use crate::query::{NodeUpdate, TraceUpdate};
use crate::store::{StoreError, TraceStore};
use crate::{with_store, RecorderConfig};

/// Result of applying one decoded batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: usize,
    pub anomalies: Vec<Anomaly>,
}

/// Records trace events into a [`TraceStore`].
///
/// Start events create running nodes (and the trace itself on first sight);
/// end and error events finalize them. Every completion is checked by the
/// [`AnomalyDetector`] before `apply` returns.
pub struct TraceRecorder {
    store: Arc<TraceStore>,
    detector: AnomalyDetector,
    config: Arc<RecorderConfig>,
}

impl TraceRecorder {
    pub fn new(store: Arc<TraceStore>, config: RecorderConfig) -> Self {
        Self {
            detector: AnomalyDetector::new(store.clone()),
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    /// Applies one event, returning any anomalies its completion produced.
    pub async fn apply(&self, event: TraceEvent) -> Result<Vec<Anomaly>, StoreError> {
        let config = Arc::clone(&self.config);
        let completed =
            with_store(&self.store, move |store| record_event(store, &config, event)).await?;

        match completed {
            Some(node) => Ok(self.detector.check_node(&node).await),
            None => Ok(Vec::new()),
        }
    }

    /// Applies events in order. A failing event is logged and skipped.
    pub async fn apply_batch(&self, events: Vec<TraceEvent>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            let run_id = event.run_id.clone();
            let event_type = event.event_type();
            match self.apply(event).await {
                Ok(anomalies) => {
                    outcome.applied += 1;
                    outcome.anomalies.extend(anomalies);
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(run_id = %run_id, event_type, "Dropped trace event: {}", e);
                }
            }
        }
        outcome
    }
}

/// Returns the node if this event completed it successfully.
fn record_event(
    store: &TraceStore,
    config: &RecorderConfig,
    event: TraceEvent,
) -> Result<Option<Node>, StoreError> {
    if event.is_start() {
        ensure_trace(store, config, &event)?;
    }

    let TraceEvent {
        run_id,
        parent_run_id,
        trace_id,
        timestamp,
        kind,
        ..
    } = event;

    let payload = match kind {
        EventKind::LlmStart { model, prompts } => NodePayload::Llm(LlmData {
            model,
            prompts,
            response: None,
        }),
        EventKind::ToolStart { tool_name, input } => NodePayload::Tool(ToolData {
            tool_name,
            input,
            output: None,
        }),
        EventKind::ChainStart { name, inputs } => NodePayload::Chain(ChainData {
            name,
            inputs,
            outputs: None,
        }),
        EventKind::LlmEnd {
            output,
            tokens,
            cost,
        } => {
            let node = running_node(store, &run_id)?;
            let cost = cost.or_else(|| config.estimate_cost(node.payload.model(), tokens));
            let update = NodeUpdate::complete(timestamp)
                .with_payload(with_output(&node, Value::String(output)))
                .with_cost(cost)
                .with_tokens(tokens);
            return finish(store, &node, &update);
        }
        EventKind::ToolEnd { output, cost } => {
            let node = running_node(store, &run_id)?;
            let update = NodeUpdate::complete(timestamp)
                .with_payload(with_output(&node, output))
                .with_cost(cost);
            return finish(store, &node, &update);
        }
        EventKind::ChainEnd { outputs } => {
            let node = running_node(store, &run_id)?;
            let update = NodeUpdate::complete(timestamp).with_payload(with_output(&node, outputs));
            return finish(store, &node, &update);
        }
        EventKind::Error { message, stack } => {
            let node = running_node(store, &run_id)?;
            let error = match stack {
                Some(stack) => format!("{message}\n{stack}"),
                None => message,
            };
            return finish(store, &node, &NodeUpdate::failed(timestamp, error));
        }
    };

    let node = Node::start(trace_id, run_id, parent_run_id, timestamp, payload);
    store.create_node(&node)?;
    Ok(None)
}

fn ensure_trace(
    store: &TraceStore,
    config: &RecorderConfig,
    event: &TraceEvent,
) -> Result<(), StoreError> {
    if store.get_trace(&event.trace_id)?.is_some() {
        return Ok(());
    }
    let project = event
        .project_name
        .as_deref()
        .unwrap_or(&config.default_project);
    match store.create_trace(&event.trace_id, project, event.timestamp, HashMap::new()) {
        Ok(_) | Err(StoreError::DuplicateKey(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn running_node(store: &TraceStore, run_id: &str) -> Result<Node, StoreError> {
    store
        .get_node_by_run_id(run_id)?
        .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
}

fn with_output(node: &Node, output: Value) -> NodePayload {
    let mut payload = node.payload.clone();
    payload.set_output(output);
    payload
}

/// Finalizes the node; a root node also closes its trace.
fn finish(
    store: &TraceStore,
    node: &Node,
    update: &NodeUpdate,
) -> Result<Option<Node>, StoreError> {
    let finished = store.update_node(&node.run_id, update)?;

    if finished.parent_run_id.is_none() {
        close_trace(store, &finished);
    }

    Ok((finished.status == RunStatus::Complete).then_some(finished))
}

fn close_trace(store: &TraceStore, root: &Node) {
    let Some(end_time) = root.end_time else { return };
    let running = store
        .get_trace(&root.trace_id)
        .ok()
        .flatten()
        .is_some_and(|t| t.status == RunStatus::Running);
    if !running {
        debug!(trace_id = %root.trace_id, "Trace already closed; leaving status as is");
        return;
    }
    if let Err(e) = store.update_trace(&root.trace_id, &TraceUpdate::finish(root.status, end_time)) {
        warn!(trace_id = %root.trace_id, "Failed to close trace: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelPricing;
    use serde_json::json;
    use tracehound_core::{AnomalyType, Severity, TokenUsage};

    const T0: i64 = 1_700_000_000_000;

    fn recorder() -> TraceRecorder {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        let config = RecorderConfig::new()
            .with_default_project("agents")
            .with_pricing("gpt-4o", ModelPricing::new(0.01, 0.03));
        TraceRecorder::new(store, config)
    }

    fn event(run_id: &str, at: i64, kind: EventKind) -> TraceEvent {
        TraceEvent::new("trace-1", run_id, kind).with_timestamp(T0 + at)
    }

    fn search_start(run_id: &str, at: i64) -> TraceEvent {
        event(
            run_id,
            at,
            EventKind::ToolStart {
                tool_name: "search".to_string(),
                input: json!("paris"),
            },
        )
        .with_parent("root")
    }

    fn search_end(run_id: &str, at: i64) -> TraceEvent {
        event(
            run_id,
            at,
            EventKind::ToolEnd {
                output: json!(["Paris, France"]),
                cost: Some(0.001),
            },
        )
    }

    fn root_start() -> TraceEvent {
        event(
            "root",
            0,
            EventKind::ChainStart {
                name: Some("agent".to_string()),
                inputs: json!({"question": "Where is Paris?"}),
            },
        )
    }

    #[tokio::test]
    async fn test_tool_loop_is_detected_on_third_completion() {
        let recorder = recorder();
        recorder.apply(root_start()).await.unwrap();

        let mut found = Vec::new();
        for (i, run) in ["s1", "s2", "s3"].iter().enumerate() {
            let at = (i as i64 + 1) * 10;
            recorder.apply(search_start(run, at)).await.unwrap();
            found = recorder.apply(search_end(run, at + 5)).await.unwrap();
        }

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].anomaly_type, AnomalyType::Loop);
        assert_eq!(found[0].severity, Severity::High);
        assert_eq!(found[0].run_ids, vec!["s1", "s2", "s3"]);

        let node = recorder.store().get_node_by_run_id("s3").unwrap().unwrap();
        assert_eq!(node.status, RunStatus::Complete);
        assert_eq!(node.latency_ms, Some(5));
        let NodePayload::Tool(data) = &node.payload else { panic!("expected tool") };
        assert_eq!(data.output, Some(json!(["Paris, France"])));
    }

    #[tokio::test]
    async fn test_root_completion_closes_trace() {
        let recorder = recorder();
        recorder.apply(root_start()).await.unwrap();
        recorder.apply(search_start("s1", 10)).await.unwrap();
        recorder.apply(search_end("s1", 20)).await.unwrap();
        recorder
            .apply(event("root", 30, EventKind::ChainEnd { outputs: json!("done") }))
            .await
            .unwrap();

        let trace = recorder.store().get_trace("trace-1").unwrap().unwrap();
        assert_eq!(trace.project_name, "agents");
        assert_eq!(trace.status, RunStatus::Complete);
        assert_eq!(trace.end_time, Some(T0 + 30));
        assert_eq!(trace.node_count, 2);
        assert!((trace.total_cost - 0.001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_cost_estimated_from_pricing() {
        let recorder = recorder();
        recorder
            .apply(event(
                "llm-1",
                0,
                EventKind::LlmStart {
                    model: Some("gpt-4o".to_string()),
                    prompts: vec!["hello".to_string()],
                },
            ))
            .await
            .unwrap();
        recorder
            .apply(event(
                "llm-1",
                250,
                EventKind::LlmEnd {
                    output: "hi there".to_string(),
                    tokens: Some(TokenUsage::new(1000, 500)),
                    cost: None,
                },
            ))
            .await
            .unwrap();

        let node = recorder.store().get_node_by_run_id("llm-1").unwrap().unwrap();
        assert!((node.cost.unwrap() - 0.025).abs() < 1e-9);
        assert_eq!(node.tokens, Some(TokenUsage::new(1000, 500)));
        let NodePayload::Llm(data) = &node.payload else { panic!("expected llm") };
        assert_eq!(data.response.as_deref(), Some("hi there"));
    }

    #[tokio::test]
    async fn test_root_error_marks_trace_failed() {
        let recorder = recorder();
        recorder.apply(root_start()).await.unwrap();
        let found = recorder
            .apply(event(
                "root",
                40,
                EventKind::Error {
                    message: "rate limited".to_string(),
                    stack: Some("at call_llm".to_string()),
                },
            ))
            .await
            .unwrap();
        assert!(found.is_empty());

        let node = recorder.store().get_node_by_run_id("root").unwrap().unwrap();
        assert_eq!(node.status, RunStatus::Error);
        assert_eq!(node.error.as_deref(), Some("rate limited\nat call_llm"));

        let trace = recorder.store().get_trace("trace-1").unwrap().unwrap();
        assert_eq!(trace.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_batch_skips_failing_events() {
        let recorder = recorder();
        let outcome = recorder
            .apply_batch(vec![
                root_start(),
                search_end("never-started", 5),
                search_start("s1", 10),
                search_start("s1", 11),
                search_end("s1", 20),
            ])
            .await;

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.anomalies.is_empty());
        assert_eq!(recorder.store().list_nodes_by_trace("trace-1").unwrap().len(), 2);
    }
}
