//! Transient-failure retry wrapper around the graph executor.
//!
//! Retries are keyed off the stage error's transient allow-list; fatal
//! failures, rejections, and exhausted reviews pass straight through. Delays
//! follow bounded exponential backoff and the sleep happens outside the
//! executor's per-workflow lock, so the gateway can act on the workflow
//! between attempts.

use crate::errors::OrchestratorError;
use crate::graph::{GraphExecutor, RunOutcome};
use crate::state::WorkflowState;
use std::time::Duration;
use tracing::warn;

const MAX_RETRIES_CEILING: u32 = 10;
const MIN_BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_BASE_DELAY: Duration = Duration::from_secs(30);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry budget and backoff shape for transient stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy, clamping out-of-range inputs instead of rejecting
    /// them: retries to at most 10, base delay to 100ms..=30s.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES_CEILING),
            base_delay: base_delay.clamp(MIN_BASE_DELAY, MAX_BASE_DELAY),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at 60 seconds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Run a workflow, retrying transient failures up to the policy's budget.
///
/// The initial attempt is free: `max_retries = 2` allows three attempts in
/// total. Once the budget is exhausted the workflow is marked failed so its
/// checkpoint reflects the terminal state, and the last failure is returned.
pub async fn run_with_retry(
    executor: &GraphExecutor,
    workflow_id: &str,
    initial: Option<WorkflowState>,
    policy: &RetryPolicy,
) -> Result<RunOutcome, OrchestratorError> {
    let mut initial = initial;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let outcome = executor.run(workflow_id, initial.take()).await?;

        match outcome {
            RunOutcome::Failed { error } if error.is_transient() => {
                if attempt > policy.max_retries {
                    let reason =
                        format!("transient failure persisted after {attempt} attempts: {error}");
                    warn!(workflow_id, attempts = attempt, "retry budget exhausted");
                    executor.mark_failed(workflow_id, &reason).await?;
                    return Ok(RunOutcome::Failed { error });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    workflow_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
            other => return Ok(other),
        }
    }
}
