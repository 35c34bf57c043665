//! Translation of internal node transitions into the external event schema.
//!
//! The translator is a pure function from transition to event; publishing to
//! subscribers is the caller's responsibility. Only nodes explicitly flagged
//! observable produce events — bookkeeping nodes stay silent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Internal node lifecycle transitions produced by the graph executor.
#[derive(Debug, Clone)]
pub enum NodeTransition {
    /// A node is about to execute its stage operation.
    NodeStart { workflow_id: String, node: String },
    /// A stage operation emitted a progress notification.
    NodeProgress {
        workflow_id: String,
        node: String,
        message: String,
        percent: Option<u8>,
    },
    /// A node's stage operation finished successfully.
    NodeEnd { workflow_id: String, node: String },
    /// A node's stage operation failed.
    NodeError {
        workflow_id: String,
        node: String,
        error: String,
    },
    /// Execution suspended at an interrupt point, awaiting approval.
    Suspended { workflow_id: String, node: String },
}

impl NodeTransition {
    /// The node this transition originates from.
    pub fn node(&self) -> &str {
        match self {
            Self::NodeStart { node, .. }
            | Self::NodeProgress { node, .. }
            | Self::NodeEnd { node, .. }
            | Self::NodeError { node, .. }
            | Self::Suspended { node, .. } => node,
        }
    }
}

/// Kind of an externally visible event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageStarted,
    StageProgress,
    StageCompleted,
    StageFailed,
    ApprovalRequired,
}

/// Stable, externally-consumable event schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub kind: EventKind,
    pub workflow_id: String,
    /// Originating stage name.
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    /// Stage-specific payload (error message, partial output).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Maps internal transitions to external events, filtering on the set of
/// observable node names.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    observable: HashSet<String>,
}

impl EventTranslator {
    pub fn new(observable: HashSet<String>) -> Self {
        Self { observable }
    }

    /// Translate a transition, or `None` for non-observable nodes.
    ///
    /// Pure apart from reading the clock; emission is the caller's job.
    pub fn translate(&self, transition: &NodeTransition) -> Option<ExternalEvent> {
        if !self.observable.contains(transition.node()) {
            return None;
        }

        let event = match transition {
            NodeTransition::NodeStart { workflow_id, node } => ExternalEvent {
                kind: EventKind::StageStarted,
                workflow_id: workflow_id.clone(),
                stage: node.clone(),
                timestamp: Utc::now(),
                payload: None,
            },
            NodeTransition::NodeProgress {
                workflow_id,
                node,
                message,
                percent,
            } => ExternalEvent {
                kind: EventKind::StageProgress,
                workflow_id: workflow_id.clone(),
                stage: node.clone(),
                timestamp: Utc::now(),
                payload: Some(serde_json::json!({
                    "message": message,
                    "percent": percent,
                })),
            },
            NodeTransition::NodeEnd { workflow_id, node } => ExternalEvent {
                kind: EventKind::StageCompleted,
                workflow_id: workflow_id.clone(),
                stage: node.clone(),
                timestamp: Utc::now(),
                payload: None,
            },
            NodeTransition::NodeError {
                workflow_id,
                node,
                error,
            } => ExternalEvent {
                kind: EventKind::StageFailed,
                workflow_id: workflow_id.clone(),
                stage: node.clone(),
                timestamp: Utc::now(),
                payload: Some(serde_json::json!({ "error": error })),
            },
            NodeTransition::Suspended { workflow_id, node } => ExternalEvent {
                kind: EventKind::ApprovalRequired,
                workflow_id: workflow_id.clone(),
                stage: node.clone(),
                timestamp: Utc::now(),
                payload: None,
            },
        };

        Some(event)
    }
}
