//! Resumable stage-graph orchestration core for LLM-driven development
//! workflows.
//!
//! Workflows are directed graphs of long-running stage operations (plan,
//! implement, review). The executor checkpoints state at every node boundary,
//! suspends at interrupt points until a human decision arrives through the
//! approval gateway, and survives process restarts by resuming from the last
//! checkpoint. Transient stage failures are retried with bounded backoff;
//! review rejections loop back through the task-review router.

pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod graph;
pub mod retry;
pub mod review;
pub mod stage;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use errors::{
    GatewayError, GraphError, OrchestratorError, StageError, StoreError, WorkflowFailure,
};
pub use events::{EventKind, EventTranslator, ExternalEvent, NodeTransition};
pub use gateway::ApprovalGateway;
pub use graph::{GraphBuilder, GraphExecutor, RunOutcome, StageGraph};
pub use retry::{run_with_retry, RetryPolicy};
pub use review::{parse_review_output, route, ReviewResult, ReviewSeverity, RouteDecision};
pub use stage::{StageOperation, StageOutput, StageProgress};
pub use state::{ApprovalDecision, WorkflowState, WorkflowStatus, WorkflowSummary};
