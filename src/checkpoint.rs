//! Checkpoints and the checkpoint store contract.
//!
//! A checkpoint is an immutable, timestamped snapshot of workflow state plus
//! the paused position (the node about to execute next). The executor writes
//! one on every node boundary; later checkpoints supersede earlier ones but
//! the store retains history, so a full-graph resume is always possible.

use crate::errors::StoreError;
use crate::state::{ApprovalDecision, WorkflowState, WorkflowStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};

/// Durable snapshot of workflow state plus the graph's paused position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The full workflow state at the snapshot.
    pub state: WorkflowState,
    /// Name of the node about to execute next.
    pub position: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: WorkflowState, position: impl Into<String>) -> Self {
        Self {
            state,
            position: position.into(),
            created_at: Utc::now(),
        }
    }
}

/// Contract the orchestration core consumes from a persistence engine.
///
/// `save` supersedes (never destroys) earlier checkpoints. `update_approval`
/// is an atomic read-modify-write and the only mutation path not owned by
/// the executor; it requires the persisted status to be exactly `blocked`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new checkpoint for the workflow.
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Load the latest checkpoint, if any.
    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Atomically set the approval field on the latest checkpoint and flip
    /// the status back to `in_progress`.
    ///
    /// Fails with `UnexpectedStatus` when the workflow is not `blocked`, and
    /// with `NotFound` when it has never been checkpointed.
    async fn update_approval(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Checkpoint, StoreError>;
}

/// Shared approval update applied by store implementations under their own
/// exclusive section.
fn apply_approval(
    latest: &Checkpoint,
    workflow_id: &str,
    decision: ApprovalDecision,
    reason: Option<&str>,
) -> Result<Checkpoint, StoreError> {
    if latest.state.status != WorkflowStatus::Blocked {
        return Err(StoreError::UnexpectedStatus {
            workflow_id: workflow_id.to_string(),
            expected: WorkflowStatus::Blocked,
            actual: latest.state.status,
        });
    }

    let mut state = latest.state.clone();
    state.approval = decision;
    state.rejection_reason = match decision {
        ApprovalDecision::Rejected => Some(reason.unwrap_or("no reason given").to_string()),
        _ => None,
    };
    state.transition_to(WorkflowStatus::InProgress);

    Ok(Checkpoint::new(state, latest.position.clone()))
}

/// In-memory checkpoint store, the reference implementation used by tests.
///
/// Retains the full checkpoint history per workflow.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full checkpoint history for a workflow, oldest first.
    pub async fn history(&self, workflow_id: &str) -> Vec<Checkpoint> {
        self.inner
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .entry(workflow_id.to_string())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .get(workflow_id)
            .and_then(|history| history.last())
            .cloned())
    }

    async fn update_approval(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Checkpoint, StoreError> {
        let mut inner = self.inner.write().await;
        let history = inner
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::NotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        let latest = history.last().cloned().ok_or_else(|| StoreError::NotFound {
            workflow_id: workflow_id.to_string(),
        })?;
        let updated = apply_approval(&latest, workflow_id, decision, reason)?;
        history.push(updated.clone());
        Ok(updated)
    }
}

/// JSON-file checkpoint store: one file per workflow id under a base
/// directory, holding the full checkpoint history.
///
/// Good enough for single-process durability across restarts; the internal
/// mutex serializes read-modify-write cycles.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let sanitized: String = workflow_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            })
            .collect();
        self.base_dir.join(format!("{}.json", sanitized))
    }

    async fn read_history(&self, workflow_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let path = self.path_for(workflow_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let history: Vec<Checkpoint> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt checkpoint file {}", path.display()))?;
                Ok(history)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Other(
                anyhow::Error::new(e)
                    .context(format!("failed to read checkpoint file {}", path.display())),
            )),
        }
    }

    async fn write_history(
        &self,
        workflow_id: &str,
        history: &[Checkpoint],
    ) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create checkpoint directory {}",
                    self.base_dir.display()
                )
            })?;
        let path = self.path_for(workflow_id);
        let bytes = serde_json::to_vec_pretty(history)
            .context("failed to serialize checkpoint history")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write checkpoint file {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.read_history(workflow_id).await?;
        history.push(checkpoint);
        self.write_history(workflow_id, &history).await
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let history = self.read_history(workflow_id).await?;
        Ok(history.into_iter().next_back())
    }

    async fn update_approval(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<Checkpoint, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.read_history(workflow_id).await?;
        let latest = history.last().cloned().ok_or_else(|| StoreError::NotFound {
            workflow_id: workflow_id.to_string(),
        })?;

        let updated = apply_approval(&latest, workflow_id, decision, reason)?;
        history.push(updated.clone());
        self.write_history(workflow_id, &history).await?;
        Ok(updated)
    }
}
