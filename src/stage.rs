//! Stage operation contract.
//!
//! A stage operation is the externally-supplied unit of work behind one graph
//! node (plan, implement, review, ...). The core treats it as a black box: it
//! streams progress notifications through a channel and finishes with exactly
//! one terminal output or error. The executor's per-workflow lock guarantees
//! an operation is never invoked twice concurrently for the same node
//! instance.

use crate::errors::StageError;
use crate::review::ReviewResult;
use crate::state::WorkflowState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A progress notification streamed by a running stage operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    /// Human-readable progress message (accumulated partial output).
    pub message: String,
    /// Completion estimate, when the stage can provide one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

impl StageProgress {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            percent: None,
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }
}

/// Terminal output of a stage operation, merged into `WorkflowState` by the
/// executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    /// Free-form outputs keyed by name (plan text, diffs, artifacts).
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    /// Review result, for review stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewResult>,
    /// Total task count, for planning stages that decompose the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<usize>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a named output value.
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    /// Attach a review result.
    pub fn with_review(mut self, review: ReviewResult) -> Self {
        self.review = Some(review);
        self
    }

    /// Declare the total task count.
    pub fn with_total_tasks(mut self, total: usize) -> Self {
        self.total_tasks = Some(total);
        self
    }
}

/// A long-running, externally-supplied unit of work for one pipeline stage.
///
/// Implementations send any number of `StageProgress` notifications through
/// the channel, then return exactly one terminal `StageOutput` or
/// `StageError`. The executor forwards each notification to observers as it
/// arrives; nothing is buffered until completion.
#[async_trait]
pub trait StageOperation: Send + Sync {
    async fn run(
        &self,
        state: &WorkflowState,
        progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError>;
}
