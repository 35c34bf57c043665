//! Typed error hierarchy for the orchestration core.
//!
//! Each subsystem gets its own enum:
//! - `StageError` — failures raised by a stage operation, split into a fixed
//!   transient allow-list and everything else (fatal)
//! - `WorkflowFailure` — the terminal failure carried by a `Failed` run outcome
//! - `GraphError` — structural validation failures at graph build time
//! - `StoreError` — checkpoint store failures
//! - `GatewayError` — approval gateway failures
//! - `OrchestratorError` — executor infrastructure failures

use crate::state::WorkflowStatus;
use thiserror::Error;

/// Errors raised by a stage operation.
///
/// Only the three variants on the transient allow-list are eligible for
/// automatic retry; everything else is fatal.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage operation timed out: {0}")]
    Timeout(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Check if this error is on the transient allow-list.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionReset(_) | Self::ConnectionRefused(_)
        )
    }
}

/// The failure carried by a `RunOutcome::Failed`.
#[derive(Debug, Error)]
pub enum WorkflowFailure {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("approval rejected: {0}")]
    Rejected(String),

    #[error("review iterations exhausted on final task {task} after {iterations} iterations")]
    ReviewExhausted { task: usize, iterations: u32 },
}

impl WorkflowFailure {
    /// Check if the underlying failure is eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Stage(e) if e.is_transient())
    }
}

/// Structural validation errors raised when building a stage graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("duplicate node '{name}'")]
    DuplicateNode { name: String },

    #[error("edge {from} -> {to} references unknown node '{unknown}'")]
    UnknownEdgeNode {
        from: String,
        to: String,
        unknown: String,
    },

    #[error("interrupt point references unknown node '{name}'")]
    UnknownInterrupt { name: String },

    #[error("observable flag references unknown node '{name}'")]
    UnknownObservable { name: String },

    #[error("entry point references unknown node '{name}'")]
    UnknownEntry { name: String },

    #[error("review loop on '{node}' targets unknown node '{target}'")]
    UnknownReviewTarget { node: String, target: String },

    #[error("review loop attached to unknown node '{node}'")]
    UnknownReviewNode { node: String },

    #[error("cycle detected in graph edges, involved nodes: {nodes:?}")]
    CycleDetected { nodes: Vec<String> },
}

/// Errors from a checkpoint store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no checkpoint for workflow '{workflow_id}'")]
    NotFound { workflow_id: String },

    #[error("workflow '{workflow_id}' is {actual}, expected {expected}")]
    UnexpectedStatus {
        workflow_id: String,
        expected: WorkflowStatus,
        actual: WorkflowStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Infrastructure errors from the graph executor, distinct from stage
/// failures which are reported through `RunOutcome::Failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("workflow '{workflow_id}' has no checkpoint and no initial state was provided")]
    MissingInitialState { workflow_id: String },

    #[error("workflow '{workflow_id}' is positioned at unknown node '{node}'")]
    UnknownPosition { workflow_id: String, node: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the approval gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("workflow '{workflow_id}' is {actual}; approval requires blocked")]
    InvalidState {
        workflow_id: String,
        actual: WorkflowStatus,
    },

    #[error("workflow '{workflow_id}' not found")]
    WorkflowNotFound { workflow_id: String },

    #[error("checkpoint store error: {0}")]
    Store(#[source] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}
