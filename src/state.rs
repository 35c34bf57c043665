//! Workflow state threaded through every stage.
//!
//! `WorkflowState` is the single object the graph executor mutates between
//! node executions. Once persisted, it is sufficient to resume execution with
//! no re-derivation from external sources.

use crate::review::ReviewResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a workflow.
///
/// Exposed externally as exactly these five snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but no executor invocation yet.
    #[default]
    Pending,
    /// An executor invocation is advancing the graph.
    InProgress,
    /// Durably paused at an interrupt point, awaiting the approval gateway.
    Blocked,
    /// The graph terminated normally.
    Completed,
    /// A fatal failure was persisted.
    Failed,
}

impl WorkflowStatus {
    /// The external string form of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Check if the workflow is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether a transition to `to` is legal.
    ///
    /// `blocked -> in_progress` is the only re-entry edge; everything else is
    /// one-way.
    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Blocked)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Blocked, Self::InProgress)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The approval field checked at interrupt points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    #[default]
    Undecided,
    Approved,
    Rejected,
}

/// The state object threaded through every stage of a workflow.
///
/// Mutated exclusively by the graph executor between node executions; the
/// per-workflow lock guarantees no concurrent writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Opaque workflow identifier.
    pub workflow_id: String,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// The issue or goal this workflow is working on.
    pub issue: String,
    /// Cursor of the task under work. Advancing past the final index marks
    /// the task list consumed; approving a task with the cursor still inside
    /// the list advances rather than terminates.
    pub current_task_index: usize,
    /// Total number of tasks, set by the planning stage.
    pub total_tasks: usize,
    /// Review/retry cycles for the current task, reset on task advance.
    pub task_review_iteration: u32,
    /// Cumulative review iterations across all tasks.
    pub review_iterations_total: u32,
    /// The most recent review result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_review: Option<ReviewResult>,
    /// Decision injected by the approval gateway, re-armed to `undecided`
    /// once the interrupt point is passed.
    pub approval: ApprovalDecision,
    /// Reason recorded by a gateway rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Reason persisted when the workflow fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Free-form stage outputs (plan text, generated artifacts).
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh state with all counters zeroed.
    pub fn new(workflow_id: impl Into<String>, issue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            issue: issue.into(),
            current_task_index: 0,
            total_tasks: 0,
            task_review_iteration: 0,
            review_iterations_total: 0,
            last_review: None,
            approval: ApprovalDecision::Undecided,
            rejection_reason: None,
            failure_reason: None,
            outputs: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a fresh state with a generated workflow id.
    pub fn with_generated_id(issue: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), issue)
    }

    /// Move to `to`, checking the move against the status transition table.
    /// Staying in place is always allowed; in debug builds an illegal move
    /// panics.
    pub fn transition_to(&mut self, to: WorkflowStatus) {
        debug_assert!(
            self.status == to || self.status.can_transition_to(to),
            "illegal status transition {} -> {} for workflow {}",
            self.status,
            to,
            self.workflow_id,
        );
        self.status = to;
        self.updated_at = Utc::now();
    }

    /// Check if task slots remain for the cursor to consume.
    pub fn has_tasks_remaining(&self) -> bool {
        self.current_task_index < self.total_tasks
    }

    /// Check if the cursor sits on the final task.
    ///
    /// An empty task list counts as final so a lone implicit task cannot
    /// loop forever.
    pub fn is_final_task(&self) -> bool {
        self.total_tasks == 0 || self.current_task_index + 1 >= self.total_tasks
    }

    /// Advance the task cursor and reset the per-task review counter.
    pub fn advance_task(&mut self) {
        self.current_task_index += 1;
        self.task_review_iteration = 0;
        self.updated_at = Utc::now();
    }

    /// Record a free-form stage output.
    pub fn record_output(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.outputs.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    /// Merge a stage operation's terminal output into the state.
    pub fn apply_output(&mut self, output: crate::stage::StageOutput) {
        self.outputs.extend(output.outputs);
        if let Some(review) = output.review {
            self.last_review = Some(review);
        }
        if let Some(total) = output.total_tasks {
            self.total_tasks = total;
        }
        self.updated_at = Utc::now();
    }

    /// Summary view of the workflow's progress.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            status: self.status,
            tasks_completed: self.current_task_index.min(self.total_tasks),
            total_tasks: self.total_tasks,
            review_iterations: self.review_iterations_total,
        }
    }
}

/// Summary of a workflow's progress, derived from its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub status: WorkflowStatus,
    pub tasks_completed: usize,
    pub total_tasks: usize,
    pub review_iterations: u32,
}
