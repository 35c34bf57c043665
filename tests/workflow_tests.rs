//! End-to-end workflow scenarios driven through the public API: planning,
//! review loops, interrupt/approval cycles, transient retries, and
//! restart-resume from a file-backed checkpoint store.

use stagehand::{
    parse_review_output, run_with_retry, ApprovalGateway, CheckpointStore, EventKind,
    ExternalEvent, FileCheckpointStore, GatewayError, GraphExecutor, MemoryCheckpointStore,
    RetryPolicy, RunOutcome, StageError, StageGraph, StageOperation, StageOutput, StageProgress,
    WorkflowFailure, WorkflowState, WorkflowStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Planning stage: decomposes the issue into a fixed number of tasks.
struct PlanOp {
    total_tasks: usize,
    executions: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl StageOperation for PlanOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        _progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::new()
            .with_output("plan", serde_json::json!("1. do the thing"))
            .with_total_tasks(self.total_tasks))
    }
}

/// Implementation stage that just counts its invocations.
struct CountingOp {
    executions: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl StageOperation for CountingOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        _progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(StageOutput::new())
    }
}

/// Review stage replaying a script of raw reviewer outputs. Once the script
/// runs dry every further review rejects.
struct ScriptedReviewOp {
    script: Mutex<VecDeque<&'static str>>,
}

impl ScriptedReviewOp {
    fn new(script: &[&'static str]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
        }
    }
}

#[async_trait::async_trait]
impl StageOperation for ScriptedReviewOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        _progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        let raw = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or("VERDICT: NEEDS_WORK\n- script exhausted");
        Ok(StageOutput::new().with_review(parse_review_output(raw)))
    }
}

/// Implementation stage failing transiently a fixed number of times before
/// succeeding.
struct FlakyOp {
    remaining_failures: AtomicU32,
    executions: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl StageOperation for FlakyOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        _progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(StageError::Timeout("llm call timed out".into()))
        } else {
            Ok(StageOutput::new())
        }
    }
}

/// Stage streaming a fixed number of progress notifications.
struct ProgressOp {
    updates: usize,
}

#[async_trait::async_trait]
impl StageOperation for ProgressOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        for i in 0..self.updates {
            let percent = ((i + 1) * 100 / self.updates) as u8;
            progress
                .send(StageProgress::new(format!("step {}", i + 1)).with_percent(percent))
                .await
                .ok();
        }
        Ok(StageOutput::new())
    }
}

/// Slow stage tracking how many instances of itself run at once.
struct SlowOp {
    in_flight: Arc<AtomicU32>,
    max_in_flight: Arc<AtomicU32>,
    executions: Arc<AtomicU32>,
}

impl SlowOp {
    fn new() -> Self {
        Self {
            in_flight: counter(),
            max_in_flight: counter(),
            executions: counter(),
        }
    }
}

#[async_trait::async_trait]
impl StageOperation for SlowOp {
    async fn run(
        &self,
        _state: &WorkflowState,
        _progress: mpsc::Sender<StageProgress>,
    ) -> Result<StageOutput, StageError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(StageOutput::new())
    }
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

/// plan -> implement -> review, with the review loop jumping back to
/// implement and a conditional edge carrying the cursor to the next task.
fn review_pipeline(
    total_tasks: usize,
    script: &[&'static str],
    max_iterations: u32,
    plan_runs: Arc<AtomicU32>,
    implement_runs: Arc<AtomicU32>,
) -> Arc<StageGraph> {
    Arc::new(
        StageGraph::builder()
            .node(
                "plan",
                Arc::new(PlanOp {
                    total_tasks,
                    executions: plan_runs,
                }),
            )
            .node(
                "implement",
                Arc::new(CountingOp {
                    executions: implement_runs,
                }),
            )
            .node("review", Arc::new(ScriptedReviewOp::new(script)))
            .edge("plan", "implement")
            .edge("implement", "review")
            .edge_if(
                "review",
                "implement",
                Arc::new(|s: &WorkflowState| s.has_tasks_remaining()),
            )
            .review_loop("review", "implement", max_iterations)
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn review_loop_retries_then_advances_across_tasks() {
    let plan_runs = counter();
    let implement_runs = counter();
    // task 0 needs one fix cycle, task 1 passes first try
    let graph = review_pipeline(
        2,
        &[
            "VERDICT: NEEDS_WORK\n- missing tests",
            "VERDICT: READY",
            "VERDICT: READY",
        ],
        2,
        plan_runs.clone(),
        implement_runs.clone(),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = GraphExecutor::new(graph, store);

    let outcome = executor
        .run("wf-review", Some(WorkflowState::new("wf-review", "issue")))
        .await
        .unwrap();

    let RunOutcome::Completed(state) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(plan_runs.load(Ordering::SeqCst), 1);
    // task 0 twice (initial + retry), task 1 once
    assert_eq!(implement_runs.load(Ordering::SeqCst), 3);
    assert_eq!(state.current_task_index, 2);
    assert_eq!(state.review_iterations_total, 1);
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn exhausted_review_advances_past_stuck_task_then_fails_on_final() {
    let plan_runs = counter();
    let implement_runs = counter();
    // every review rejects; budget of one retry per task
    let graph = review_pipeline(2, &[], 1, plan_runs, implement_runs.clone());
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = GraphExecutor::new(graph, store.clone());

    let outcome = executor
        .run("wf-stuck", Some(WorkflowState::new("wf-stuck", "issue")))
        .await
        .unwrap();

    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(matches!(
        error,
        WorkflowFailure::ReviewExhausted { task: 1, iterations: 1 }
    ));

    let state = store.load("wf-stuck").await.unwrap().unwrap().state;
    assert_eq!(state.status, WorkflowStatus::Failed);
    // the stuck non-final task was advanced past, not aborted on
    assert_eq!(
        state.outputs.get("task_0_review_exhausted"),
        Some(&serde_json::json!(true))
    );
    // both tasks: initial + one retry each
    assert_eq!(implement_runs.load(Ordering::SeqCst), 4);
}

fn gated_graph(
    plan_runs: Arc<AtomicU32>,
    implement_runs: Arc<AtomicU32>,
    with_retry_path: bool,
) -> Arc<StageGraph> {
    let mut builder = StageGraph::builder()
        .node(
            "plan",
            Arc::new(PlanOp {
                total_tasks: 1,
                executions: plan_runs,
            }),
        )
        .node(
            "implement",
            Arc::new(CountingOp {
                executions: implement_runs,
            }),
        )
        .edge("plan", "implement")
        .interrupt_before("implement")
        .observable("plan")
        .observable("implement");
    if with_retry_path {
        builder = builder.edge_if(
            "implement",
            "plan",
            Arc::new(|s: &WorkflowState| s.rejection_reason.is_some()),
        );
    }
    Arc::new(builder.build().unwrap())
}

#[tokio::test]
async fn approval_resumes_at_paused_node_without_reexecution() {
    let plan_runs = counter();
    let implement_runs = counter();
    let graph = gated_graph(plan_runs.clone(), implement_runs.clone(), false);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(GraphExecutor::new(graph, store.clone()));
    let gateway = ApprovalGateway::new(executor.clone(), store.clone());

    let outcome = executor
        .run("wf-gated", Some(WorkflowState::new("wf-gated", "issue")))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Blocked { ref paused_at } if paused_at == "implement"
    ));
    assert_eq!(plan_runs.load(Ordering::SeqCst), 1);
    assert_eq!(implement_runs.load(Ordering::SeqCst), 0);

    // polling a blocked workflow without a decision is a no-op
    let outcome = executor.run("wf-gated", None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Blocked { .. }));
    assert_eq!(plan_runs.load(Ordering::SeqCst), 1);

    let outcome = gateway.approve("wf-gated").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    // resumed exactly at the paused node
    assert_eq!(plan_runs.load(Ordering::SeqCst), 1);
    assert_eq!(implement_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejection_takes_retry_path_and_blocks_again() {
    let plan_runs = counter();
    let implement_runs = counter();
    let graph = gated_graph(plan_runs.clone(), implement_runs.clone(), true);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(GraphExecutor::new(graph, store.clone()));
    let gateway = ApprovalGateway::new(executor.clone(), store.clone());

    executor
        .run("wf-redo", Some(WorkflowState::new("wf-redo", "issue")))
        .await
        .unwrap();

    let outcome = gateway.reject("wf-redo", "plan misses the edge cases").await.unwrap();
    // the retry path re-plans and pauses at the interrupt again
    assert!(matches!(
        outcome,
        RunOutcome::Blocked { ref paused_at } if paused_at == "implement"
    ));
    assert_eq!(plan_runs.load(Ordering::SeqCst), 2);
    assert_eq!(implement_runs.load(Ordering::SeqCst), 0);

    let state = store.load("wf-redo").await.unwrap().unwrap().state;
    assert_eq!(
        state.outputs.get("implement_rejection"),
        Some(&serde_json::json!("plan misses the edge cases"))
    );

    let outcome = gateway.approve("wf-redo").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(implement_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_are_filtered_to_observable_nodes() {
    let graph = Arc::new(
        StageGraph::builder()
            .node(
                "bookkeeping",
                Arc::new(CountingOp {
                    executions: counter(),
                }),
            )
            .node("implement", Arc::new(ProgressOp { updates: 3 }))
            .edge("bookkeeping", "implement")
            .observable("implement")
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let (tx, mut rx) = mpsc::channel::<ExternalEvent>(64);
    let executor = GraphExecutor::new(graph, store).with_event_channel(tx);

    let outcome = executor
        .run("wf-events", Some(WorkflowState::new("wf-events", "issue")))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    // the bookkeeping node stays silent
    assert!(events.iter().all(|e| e.stage == "implement"));
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::StageStarted,
            EventKind::StageProgress,
            EventKind::StageProgress,
            EventKind::StageProgress,
            EventKind::StageCompleted,
        ]
    );
    let payload = events[1].payload.clone().unwrap();
    assert_eq!(payload["message"], serde_json::json!("step 1"));
}

#[tokio::test]
async fn suspension_emits_approval_required_event() {
    let graph = gated_graph(counter(), counter(), false);
    let store = Arc::new(MemoryCheckpointStore::new());
    let (tx, mut rx) = mpsc::channel::<ExternalEvent>(64);
    let executor = GraphExecutor::new(graph, store).with_event_channel(tx);

    executor
        .run("wf-sus", Some(WorkflowState::new("wf-sus", "issue")))
        .await
        .unwrap();

    let mut saw_approval_required = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::ApprovalRequired {
            assert_eq!(event.stage, "implement");
            saw_approval_required = true;
        }
    }
    assert!(saw_approval_required);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_mid_graph_resumes_without_replanning() {
    let plan_runs = counter();
    let implement_runs = counter();
    let graph = Arc::new(
        StageGraph::builder()
            .node(
                "plan",
                Arc::new(PlanOp {
                    total_tasks: 1,
                    executions: plan_runs.clone(),
                }),
            )
            .node(
                "implement",
                Arc::new(FlakyOp {
                    remaining_failures: AtomicU32::new(2),
                    executions: implement_runs.clone(),
                }),
            )
            .edge("plan", "implement")
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = GraphExecutor::new(graph, store);
    let policy = RetryPolicy::new(3, Duration::from_secs(1));

    let outcome = run_with_retry(
        &executor,
        "wf-flaky",
        Some(WorkflowState::new("wf-flaky", "issue")),
        &policy,
    )
    .await
    .unwrap();

    assert!(matches!(outcome, RunOutcome::Completed(_)));
    // retries resume from the checkpoint after plan, never re-plan
    assert_eq!(plan_runs.load(Ordering::SeqCst), 1);
    assert_eq!(implement_runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn file_store_resumes_across_process_restart() {
    let dir = tempfile::tempdir().unwrap();

    // first process: run until the interrupt blocks
    {
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let executor =
            GraphExecutor::new(gated_graph(counter(), counter(), false), store);
        let outcome = executor
            .run("wf-restart", Some(WorkflowState::new("wf-restart", "issue")))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Blocked { .. }));
    }

    // second process: fresh graph, store, executor, gateway
    let plan_runs = counter();
    let implement_runs = counter();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let executor = Arc::new(GraphExecutor::new(
        gated_graph(plan_runs.clone(), implement_runs.clone(), false),
        store.clone(),
    ));
    let gateway = ApprovalGateway::new(executor, store);

    let outcome = gateway.approve("wf-restart").await.unwrap();
    let RunOutcome::Completed(state) = outcome else {
        panic!("expected completion after restart");
    };
    assert_eq!(state.status, WorkflowStatus::Completed);
    // the first process's plan output survived; only implement ran here
    assert_eq!(plan_runs.load(Ordering::SeqCst), 0);
    assert_eq!(implement_runs.load(Ordering::SeqCst), 1);
    assert!(state.outputs.contains_key("plan"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_of_one_workflow_are_serialized() {
    let op = SlowOp::new();
    let executions = op.executions.clone();
    let max_in_flight = op.max_in_flight.clone();
    let graph = Arc::new(
        StageGraph::builder()
            .node("work", Arc::new(op))
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(GraphExecutor::new(graph, store.clone()));

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .run("wf-race", Some(WorkflowState::new("wf-race", "issue")))
                .await
        })
    };
    let second = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .run("wf-race", Some(WorkflowState::new("wf-race", "issue")))
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    // whichever invocation wins the lock completes the workflow; the loser
    // observes the terminal checkpoint instead of mutating anything
    assert!(matches!(first, RunOutcome::Completed(_)));
    assert!(matches!(second, RunOutcome::Completed(_)));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    // initial checkpoint plus the completed one, no interleaved writes
    assert_eq!(store.history("wf-race").await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn max_concurrent_bounds_stage_operations_across_workflows() {
    let op = SlowOp::new();
    let executions = op.executions.clone();
    let max_in_flight = op.max_in_flight.clone();
    let graph = Arc::new(
        StageGraph::builder()
            .node("work", Arc::new(op))
            .build()
            .unwrap(),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor =
        Arc::new(GraphExecutor::new(graph, store).with_max_concurrent(1));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let id = format!("wf-{i}");
                executor
                    .run(&id, Some(WorkflowState::new(id.clone(), "issue")))
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }

    // distinct workflows all ran, but never two stages at once
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn approval_on_non_blocked_workflow_never_mutates_state() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(GraphExecutor::new(
        gated_graph(counter(), counter(), false),
        store.clone(),
    ));
    let gateway = ApprovalGateway::new(executor.clone(), store.clone());

    executor
        .run("wf-done", Some(WorkflowState::new("wf-done", "issue")))
        .await
        .unwrap();
    gateway.approve("wf-done").await.unwrap();
    let checkpoints = store.history("wf-done").await.len();

    let err = gateway.approve("wf-done").await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidState { .. }));
    let err = gateway.reject("wf-done", "too late").await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidState { .. }));
    // no superseding checkpoint was written
    assert_eq!(store.history("wf-done").await.len(), checkpoints);
}
