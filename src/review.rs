//! Review result parsing and task-review routing.
//!
//! Review stages produce markdown-ish text; the only part routing needs is an
//! explicit verdict marker line (`VERDICT: READY` / `VERDICT: NEEDS_WORK`),
//! an optional severity line, and bullet comments. A missing or malformed
//! marker always parses to `approved = false` — keyword scanning of free
//! prose produced false positives in practice ("approved" showing up inside
//! unrelated sentences) and is deliberately not done here.

use crate::state::WorkflowState;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static VERDICT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*verdict:\s*(ready|needs[ _-]?work)\s*$").unwrap()
});

static SEVERITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*severity:\s*(error|warning|info|note)\s*$").unwrap());

/// Severity classification for a review, ordered from most to least critical.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSeverity {
    /// Correctness or security problem that must be fixed.
    Error,
    /// Issue that should be addressed before the task is done.
    #[default]
    Warning,
    /// Style suggestion or minor improvement.
    Info,
    /// Additional context, not necessarily an issue.
    Note,
}

impl ReviewSeverity {
    /// Check if this severity blocks progress on its own.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for ReviewSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Note => "note",
        };
        write!(f, "{}", s)
    }
}

/// Output of a review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Whether the explicit ready verdict was found.
    pub approved: bool,
    /// Severity classification for the review as a whole.
    pub severity: ReviewSeverity,
    /// Reviewer comments.
    #[serde(default)]
    pub comments: Vec<String>,
}

impl ReviewResult {
    /// An approving review with no comments.
    pub fn approved() -> Self {
        Self {
            approved: true,
            severity: ReviewSeverity::Info,
            comments: Vec::new(),
        }
    }

    /// A rejecting review with the given comments.
    pub fn rejected(comments: Vec<String>) -> Self {
        Self {
            approved: false,
            severity: ReviewSeverity::Warning,
            comments,
        }
    }

    /// Override the severity classification.
    pub fn with_severity(mut self, severity: ReviewSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Parse raw review output into a `ReviewResult`.
///
/// `approved` is true only when the explicit `VERDICT: READY` marker is
/// present. No marker, a malformed marker, or `NEEDS_WORK` all parse to
/// `approved = false`; the workflow keeps moving through the router instead
/// of crashing on ambiguous output.
pub fn parse_review_output(text: &str) -> ReviewResult {
    let approved = VERDICT_REGEX
        .captures(text)
        .map(|cap| cap[1].to_ascii_lowercase() == "ready")
        .unwrap_or(false);

    let severity = SEVERITY_REGEX
        .captures(text)
        .and_then(|cap| match cap[1].to_ascii_lowercase().as_str() {
            "error" => Some(ReviewSeverity::Error),
            "warning" => Some(ReviewSeverity::Warning),
            "info" => Some(ReviewSeverity::Info),
            "note" => Some(ReviewSeverity::Note),
            _ => None,
        })
        .unwrap_or(if approved {
            ReviewSeverity::Info
        } else {
            ReviewSeverity::Warning
        });

    let comments: Vec<String> = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    ReviewResult {
        approved,
        severity,
        comments,
    }
}

/// Routing target produced by the task-review router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Re-run the current task's implementation stage.
    RetrySameStage,
    /// Move the cursor to the next task.
    AdvanceNext,
    /// End the workflow.
    Terminate,
}

/// Decide where the workflow goes after a review, evaluated in order:
///
/// 1. approved, task list consumed → `Terminate`
/// 2. approved, tasks remain → `AdvanceNext` (caller advances the cursor and
///    zeroes the iteration counter)
/// 3. not approved, iterations left → `RetrySameStage` (caller increments)
/// 4. not approved, iterations exhausted: final task → `Terminate`; otherwise
///    → `AdvanceNext` with a warning — a single stuck task must never abort
///    an otherwise healthy multi-task workflow.
///
/// Pure function: counter updates and reason recording are the caller's job.
pub fn route(state: &WorkflowState, max_iterations: u32) -> RouteDecision {
    let approved = state.last_review.as_ref().is_some_and(|r| r.approved);

    if approved {
        if state.has_tasks_remaining() {
            return RouteDecision::AdvanceNext;
        }
        return RouteDecision::Terminate;
    }

    if state.task_review_iteration < max_iterations {
        return RouteDecision::RetrySameStage;
    }

    if state.is_final_task() {
        return RouteDecision::Terminate;
    }

    tracing::warn!(
        workflow_id = %state.workflow_id,
        task = state.current_task_index,
        iterations = state.task_review_iteration,
        "review iterations exhausted, advancing past stuck task"
    );
    RouteDecision::AdvanceNext
}
