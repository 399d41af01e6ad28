//! Trace storage and anomaly detection for tracehound.
//!
//! - [`TraceStore`]: SQLite persistence for traces, nodes, edges and anomalies
//! - [`AnomalyDetector`]: loop and cost-spike heuristics run on node completion
//! - [`TraceRecorder`]: applies wire events to the store and runs detection

mod detector;
mod query;
mod recorder;
mod store;

pub use detector::{detect_cost_spike, detect_loop, AnomalyDetector};
pub use query::{NodeUpdate, StoreSummary, TraceDetail, TraceQuery, TraceUpdate};
pub use recorder::{BatchOutcome, TraceRecorder};
pub use store::{StoreError, TraceStore};

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracehound_core::TokenUsage;

/// Runs a synchronous store operation on the blocking thread pool.
pub async fn with_store<T, F>(store: &Arc<TraceStore>, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&TraceStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Configuration for turning wire events into stored traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Project assigned to traces whose events carry no project name.
    #[serde(default = "default_project")]
    pub default_project: String,
    /// Per-model pricing used when an LLM end event reports tokens but no cost.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

fn default_project() -> String {
    "default".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            default_project: default_project(),
            pricing: HashMap::new(),
        }
    }
}

impl RecorderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_project(mut self, project: impl Into<String>) -> Self {
        self.default_project = project.into();
        self
    }

    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    /// Estimates cost from the model's pricing, if both are known.
    pub fn estimate_cost(&self, model: Option<&str>, tokens: Option<TokenUsage>) -> Option<f64> {
        let pricing = self.pricing.get(model?)?;
        let tokens = tokens?;
        Some(pricing.estimate(tokens.prompt, tokens.completion))
    }
}

/// Model pricing for cost estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per 1K input tokens in USD.
    pub input_per_1k: f64,
    /// Cost per 1K output tokens in USD.
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Estimate cost for given token counts.
    pub fn estimate(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}
