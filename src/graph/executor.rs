//! Checkpointing graph executor.
//!
//! `run` drives a workflow through the stage graph one node at a time,
//! persisting a checkpoint at every node boundary. Suspension at an interrupt
//! point is an ordinary outcome, not an error: the executor writes a blocked
//! checkpoint and returns, and a later `run` call (same process or a fresh
//! one) picks up from the recorded position.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::{OrchestratorError, StageError, WorkflowFailure};
use crate::events::{EventTranslator, ExternalEvent, NodeTransition};
use crate::graph::builder::{NodeDef, StageGraph};
use crate::review::{route, RouteDecision};
use crate::stage::{StageOutput, StageProgress};
use crate::state::{ApprovalDecision, WorkflowState, WorkflowStatus};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONCURRENT_STAGES: usize = 4;
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Terminal result of one executor invocation.
#[derive(Debug)]
pub enum RunOutcome {
    /// The graph ran to its end; final state attached.
    Completed(WorkflowState),
    /// Execution suspended at an interrupt point awaiting approval.
    Blocked { paused_at: String },
    /// The workflow failed. Transient failures leave the last checkpoint
    /// resumable; fatal ones persist a failed checkpoint first.
    Failed { error: WorkflowFailure },
}

/// Drives workflows through an immutable stage graph, persisting a
/// checkpoint after every node.
///
/// A per-workflow async lock makes each workflow single-writer; distinct
/// workflows advance concurrently up to the stage permit limit.
pub struct GraphExecutor {
    graph: Arc<StageGraph>,
    store: Arc<dyn CheckpointStore>,
    translator: EventTranslator,
    event_tx: Option<mpsc::Sender<ExternalEvent>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stage_permits: Arc<Semaphore>,
}

impl GraphExecutor {
    pub fn new(graph: Arc<StageGraph>, store: Arc<dyn CheckpointStore>) -> Self {
        let translator = EventTranslator::new(graph.observable_nodes().clone());
        Self {
            graph,
            store,
            translator,
            event_tx: None,
            locks: Mutex::new(HashMap::new()),
            stage_permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_STAGES)),
        }
    }

    /// Attach a channel for externally visible events. Without one, events
    /// are translated and dropped.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ExternalEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Bound the number of stage operations running at once across all
    /// workflows.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.stage_permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Advance the workflow until it completes, suspends, or fails.
    ///
    /// `initial` seeds a workflow that has never been checkpointed; it is
    /// ignored once a checkpoint exists. The per-workflow lock is held for
    /// the whole invocation.
    pub async fn run(
        &self,
        workflow_id: &str,
        initial: Option<WorkflowState>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let lock = self.lock_for(workflow_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.advance(workflow_id, initial).await
        };
        if matches!(
            outcome,
            Ok(RunOutcome::Completed(_)) | Ok(RunOutcome::Failed { .. })
        ) {
            self.evict_lock(workflow_id, &lock).await;
        }
        outcome
    }

    async fn advance(
        &self,
        workflow_id: &str,
        initial: Option<WorkflowState>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let (mut state, mut position) = match self.store.load(workflow_id).await? {
            Some(checkpoint) => {
                if checkpoint.state.status == WorkflowStatus::Completed {
                    return Ok(RunOutcome::Completed(checkpoint.state));
                }
                if checkpoint.state.status == WorkflowStatus::Failed {
                    let reason = checkpoint
                        .state
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "workflow previously failed".to_string());
                    return Ok(RunOutcome::Failed {
                        error: WorkflowFailure::Stage(StageError::Fatal(reason)),
                    });
                }
                if checkpoint.state.status == WorkflowStatus::Blocked
                    && checkpoint.state.approval == ApprovalDecision::Undecided
                {
                    // still waiting on the gateway
                    return Ok(RunOutcome::Blocked {
                        paused_at: checkpoint.position,
                    });
                }
                (checkpoint.state, checkpoint.position)
            }
            None => {
                let mut state = initial.ok_or_else(|| OrchestratorError::MissingInitialState {
                    workflow_id: workflow_id.to_string(),
                })?;
                state.workflow_id = workflow_id.to_string();
                state.transition_to(WorkflowStatus::InProgress);
                let position = self.graph.entry().to_string();
                // checkpoint before the first node so a retry or failure
                // always has something to load
                self.store
                    .save(workflow_id, Checkpoint::new(state.clone(), &position))
                    .await?;
                info!(workflow_id, entry = %position, "workflow started");
                (state, position)
            }
        };

        // pending or blocked-with-decision; both re-enter through the table
        state.transition_to(WorkflowStatus::InProgress);

        loop {
            let node = self
                .graph
                .node(&position)
                .ok_or_else(|| OrchestratorError::UnknownPosition {
                    workflow_id: workflow_id.to_string(),
                    node: position.clone(),
                })?;

            if self.graph.is_interrupt(&position) {
                match state.approval {
                    ApprovalDecision::Undecided => {
                        state.transition_to(WorkflowStatus::Blocked);
                        self.store
                            .save(workflow_id, Checkpoint::new(state.clone(), &position))
                            .await?;
                        self.emit(NodeTransition::Suspended {
                            workflow_id: workflow_id.to_string(),
                            node: position.clone(),
                        })
                        .await;
                        info!(workflow_id, node = %position, "suspended for approval");
                        return Ok(RunOutcome::Blocked {
                            paused_at: position,
                        });
                    }
                    ApprovalDecision::Approved => {
                        // consume the decision so a later pass through the
                        // same interrupt pauses again
                        state.approval = ApprovalDecision::Undecided;
                        debug!(workflow_id, node = %position, "approval consumed");
                    }
                    ApprovalDecision::Rejected => {
                        state.approval = ApprovalDecision::Undecided;
                        let reason = state
                            .rejection_reason
                            .clone()
                            .unwrap_or_else(|| "no reason given".to_string());
                        // conditions see the rejection reason; it is cleared
                        // once a retry path is taken
                        if let Some(retry) = self.graph.conditional_next(&position, &state) {
                            info!(
                                workflow_id,
                                node = %position,
                                retry_to = retry,
                                reason = %reason,
                                "approval rejected, taking retry path"
                            );
                            state.record_output(
                                format!("{position}_rejection"),
                                serde_json::json!(reason),
                            );
                            state.rejection_reason = None;
                            position = retry.to_string();
                            self.store
                                .save(workflow_id, Checkpoint::new(state.clone(), &position))
                                .await?;
                            continue;
                        }
                        warn!(workflow_id, node = %position, reason = %reason, "approval rejected");
                        state.transition_to(WorkflowStatus::Failed);
                        state.failure_reason = Some(format!("approval rejected: {reason}"));
                        self.store
                            .save(workflow_id, Checkpoint::new(state.clone(), &position))
                            .await?;
                        return Ok(RunOutcome::Failed {
                            error: WorkflowFailure::Rejected(reason),
                        });
                    }
                }
            }

            self.emit(NodeTransition::NodeStart {
                workflow_id: workflow_id.to_string(),
                node: position.clone(),
            })
            .await;

            match self.execute_node(node, &state).await {
                Ok(output) => {
                    state.apply_output(output);
                    self.emit(NodeTransition::NodeEnd {
                        workflow_id: workflow_id.to_string(),
                        node: position.clone(),
                    })
                    .await;
                }
                Err(err) => {
                    self.emit(NodeTransition::NodeError {
                        workflow_id: workflow_id.to_string(),
                        node: position.clone(),
                        error: err.to_string(),
                    })
                    .await;
                    if err.is_transient() {
                        // last checkpoint stays resumable; the retry wrapper
                        // decides whether to try again
                        warn!(workflow_id, node = %position, error = %err, "transient stage failure");
                        return Ok(RunOutcome::Failed {
                            error: WorkflowFailure::Stage(err),
                        });
                    }
                    warn!(workflow_id, node = %position, error = %err, "fatal stage failure");
                    state.transition_to(WorkflowStatus::Failed);
                    state.failure_reason = Some(err.to_string());
                    self.store
                        .save(workflow_id, Checkpoint::new(state.clone(), &position))
                        .await?;
                    return Ok(RunOutcome::Failed {
                        error: WorkflowFailure::Stage(err),
                    });
                }
            }

            if let Some(review) = &node.review {
                match route(&state, review.max_iterations) {
                    RouteDecision::RetrySameStage => {
                        state.task_review_iteration += 1;
                        state.review_iterations_total += 1;
                        position = review.retry_to.clone();
                        debug!(
                            workflow_id,
                            task = state.current_task_index,
                            iteration = state.task_review_iteration,
                            retry_to = %position,
                            "review rejected, retrying task"
                        );
                        self.store
                            .save(workflow_id, Checkpoint::new(state.clone(), &position))
                            .await?;
                        continue;
                    }
                    RouteDecision::AdvanceNext => {
                        let approved =
                            state.last_review.as_ref().is_some_and(|r| r.approved);
                        if !approved {
                            state.record_output(
                                format!("task_{}_review_exhausted", state.current_task_index),
                                serde_json::json!(true),
                            );
                        }
                        state.advance_task();
                    }
                    RouteDecision::Terminate => {
                        let approved =
                            state.last_review.as_ref().is_some_and(|r| r.approved);
                        if approved {
                            state.transition_to(WorkflowStatus::Completed);
                            self.store
                                .save(workflow_id, Checkpoint::new(state.clone(), &position))
                                .await?;
                            info!(workflow_id, "workflow completed");
                            return Ok(RunOutcome::Completed(state));
                        }
                        let failure = WorkflowFailure::ReviewExhausted {
                            task: state.current_task_index,
                            iterations: state.task_review_iteration,
                        };
                        state.transition_to(WorkflowStatus::Failed);
                        state.failure_reason = Some(failure.to_string());
                        self.store
                            .save(workflow_id, Checkpoint::new(state.clone(), &position))
                            .await?;
                        return Ok(RunOutcome::Failed { error: failure });
                    }
                }
            }

            match self.graph.next_node(&position, &state) {
                Some(next) => {
                    position = next.to_string();
                    self.store
                        .save(workflow_id, Checkpoint::new(state.clone(), &position))
                        .await?;
                }
                None => {
                    state.transition_to(WorkflowStatus::Completed);
                    self.store
                        .save(workflow_id, Checkpoint::new(state.clone(), &position))
                        .await?;
                    info!(workflow_id, "workflow completed");
                    return Ok(RunOutcome::Completed(state));
                }
            }
        }
    }

    /// Persist a failed checkpoint for a non-terminal workflow. Used by the
    /// retry wrapper once the transient budget is exhausted.
    pub async fn mark_failed(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(workflow_id).await;
        {
            let _guard = lock.lock().await;

            let checkpoint = match self.store.load(workflow_id).await? {
                Some(c) if !c.state.status.is_terminal() => c,
                _ => {
                    drop(_guard);
                    self.evict_lock(workflow_id, &lock).await;
                    return Ok(());
                }
            };

            let mut state = checkpoint.state;
            // terminal statuses are only reachable from in_progress
            state.transition_to(WorkflowStatus::InProgress);
            state.transition_to(WorkflowStatus::Failed);
            state.failure_reason = Some(reason.to_string());
            self.store
                .save(workflow_id, Checkpoint::new(state, checkpoint.position))
                .await?;
        }
        self.evict_lock(workflow_id, &lock).await;
        Ok(())
    }

    async fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock registry entry for a terminal workflow, unless another
    /// invocation already holds a clone and may still run.
    async fn evict_lock(&self, workflow_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(workflow_id) {
            // 2 = the registry's reference plus the caller's
            if Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) <= 2 {
                locks.remove(workflow_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn lock_entries(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Run one stage operation under a concurrency permit, forwarding each
    /// progress notification as it arrives.
    async fn execute_node(
        &self,
        node: &NodeDef,
        state: &WorkflowState,
    ) -> Result<StageOutput, StageError> {
        let _permit = self
            .stage_permits
            .acquire()
            .await
            .context("stage semaphore closed")?;

        let (tx, mut rx) = mpsc::channel::<StageProgress>(PROGRESS_CHANNEL_CAPACITY);
        let fut = node.op.run(state, tx);
        tokio::pin!(fut);

        let mut rx_open = true;
        let result = loop {
            tokio::select! {
                out = &mut fut => break out,
                progress = rx.recv(), if rx_open => match progress {
                    Some(p) => self.forward_progress(state, &node.name, p).await,
                    None => rx_open = false,
                },
            }
        };

        // flush notifications the stage sent just before finishing
        while let Ok(p) = rx.try_recv() {
            self.forward_progress(state, &node.name, p).await;
        }

        result
    }

    async fn forward_progress(&self, state: &WorkflowState, node: &str, progress: StageProgress) {
        self.emit(NodeTransition::NodeProgress {
            workflow_id: state.workflow_id.clone(),
            node: node.to_string(),
            message: progress.message,
            percent: progress.percent,
        })
        .await;
    }

    /// Translate and publish a transition. A closed event channel never
    /// fails the workflow.
    async fn emit(&self, transition: NodeTransition) {
        let Some(event) = self.translator.translate(&transition) else {
            return;
        };
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
