//! Human approval gateway.
//!
//! The gateway is the only component allowed to mutate a blocked workflow
//! from outside the executor. A decision is an atomic store update (validated
//! against the persisted status, not an in-memory copy) followed by an
//! executor invocation that resumes from the recorded position.

use crate::checkpoint::CheckpointStore;
use crate::errors::{GatewayError, StoreError};
use crate::graph::{GraphExecutor, RunOutcome};
use crate::state::{ApprovalDecision, WorkflowSummary};
use std::sync::Arc;
use tracing::info;

/// Applies approval decisions to blocked workflows and resumes them.
pub struct ApprovalGateway {
    executor: Arc<GraphExecutor>,
    store: Arc<dyn CheckpointStore>,
}

impl ApprovalGateway {
    pub fn new(executor: Arc<GraphExecutor>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { executor, store }
    }

    /// Approve the pending interrupt and resume execution.
    ///
    /// Fails with `InvalidState` unless the persisted status is `blocked`;
    /// a second approval of the same workflow therefore fails rather than
    /// double-resuming.
    pub async fn approve(&self, workflow_id: &str) -> Result<RunOutcome, GatewayError> {
        self.decide(workflow_id, ApprovalDecision::Approved, None)
            .await
    }

    /// Reject the pending interrupt with a reason and resume execution; the
    /// executor either takes a retry path or fails the workflow.
    pub async fn reject(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<RunOutcome, GatewayError> {
        self.decide(workflow_id, ApprovalDecision::Rejected, Some(reason))
            .await
    }

    /// Progress summary for a workflow, from its latest checkpoint.
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSummary, GatewayError> {
        let checkpoint = self
            .store
            .load(workflow_id)
            .await
            .map_err(GatewayError::Store)?
            .ok_or_else(|| GatewayError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        Ok(checkpoint.state.summary())
    }

    async fn decide(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<RunOutcome, GatewayError> {
        let checkpoint = self
            .store
            .update_approval(workflow_id, decision, reason)
            .await
            .map_err(|err| match err {
                StoreError::NotFound { workflow_id } => {
                    GatewayError::WorkflowNotFound { workflow_id }
                }
                StoreError::UnexpectedStatus {
                    workflow_id,
                    actual,
                    ..
                } => GatewayError::InvalidState {
                    workflow_id,
                    actual,
                },
                other => GatewayError::Store(other),
            })?;

        info!(
            workflow_id,
            decision = ?decision,
            node = %checkpoint.position,
            "approval decision recorded, resuming"
        );
        Ok(self.executor.run(workflow_id, None).await?)
    }
}
