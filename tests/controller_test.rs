//! 控制器集成测试：生命周期、取消与检查点恢复

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive::checkpoint::{Checkpointer, InMemoryCheckpointer, SqliteCheckpointer};
use hive::executor::{ExecutorConfig, FnHandler, HandlerOutput, HandlerRegistry, PlanExecutor, StepInvocation};
use hive::planning::{DefaultOptimizer, Plan, PlanBuilder, PlanStatus, Step, StepKind, StepStatus, PARALLEL_PARAM};
use hive::{HiveError, PlanController};
use serde_json::json;
use tokio::sync::Notify;

/// 统计每个步骤的调用次数；`flaky` 步骤第一次调用失败
struct CallLog {
    calls: Mutex<HashMap<String, usize>>,
    flaky_failed: AtomicBool,
}

impl CallLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            flaky_failed: AtomicBool::new(false),
        })
    }

    fn count(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

fn flaky_executor(log: Arc<CallLog>) -> Arc<PlanExecutor> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("flaky", move |inv: StepInvocation| {
        let log = log.clone();
        async move {
            let id = inv.step_id().unwrap_or_default().to_string();
            *log.calls.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
            if id == "flaky" && !log.flaky_failed.swap(true, Ordering::SeqCst) {
                return Err("disk full".to_string());
            }
            Ok::<_, String>(HandlerOutput::new(json!({ "step": id })))
        }
    })));
    Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()))
}

fn resumable_plan() -> Plan {
    PlanBuilder::new("resumable")
        .id("plan_resume")
        .simple_step("fetch", StepKind::Analysis)
        .simple_step("flaky", StepKind::Action)
        .simple_step("report", StepKind::Validation)
        .chain(["fetch", "flaky", "report"])
        .build()
        .unwrap()
}

async fn assert_resumes_from(checkpoints: Arc<dyn Checkpointer>, second: Option<Arc<dyn Checkpointer>>) {
    let log = CallLog::new();
    let first = PlanController::new(flaky_executor(log.clone())).with_checkpointer(checkpoints.clone());

    let result = first.submit(resumable_plan()).await.unwrap();
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("disk full"));
    assert_eq!(result.metrics.skipped_steps, 1);
    assert!(checkpoints.exists("plan_resume").await.unwrap());

    let store = second.unwrap_or(checkpoints);
    let controller = PlanController::new(flaky_executor(log.clone())).with_checkpointer(store);
    let result = controller.submit(resumable_plan()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.metrics.completed_steps, 3);
    assert_eq!(log.count("fetch"), 1);
    assert_eq!(log.count("flaky"), 2);
    assert_eq!(log.count("report"), 1);
}

#[tokio::test]
async fn test_resume_from_in_memory_checkpoint() {
    assert_resumes_from(Arc::new(InMemoryCheckpointer::new()), None).await;
}

#[tokio::test]
async fn test_resume_from_sqlite_checkpoint_across_controllers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let first: Arc<dyn Checkpointer> = Arc::new(SqliteCheckpointer::open(&path).unwrap());
    let reopened: Arc<dyn Checkpointer> = Arc::new(SqliteCheckpointer::open(&path).unwrap());
    assert_resumes_from(first, Some(reopened)).await;
}

#[tokio::test]
async fn test_unreadable_checkpoint_is_reported() {
    let checkpoints = Arc::new(InMemoryCheckpointer::new());
    checkpoints.save("plan_resume", &json!("not a plan")).await.unwrap();
    let controller =
        PlanController::new(flaky_executor(CallLog::new())).with_checkpointer(checkpoints.clone());

    let err = controller.submit(resumable_plan()).await.unwrap_err();
    assert!(matches!(err, HiveError::Checkpoint(_)));
}

fn gated_executor(first_started: Arc<Notify>, step_delay: Duration) -> Arc<PlanExecutor> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("gate", move |inv: StepInvocation| {
        let signal = first_started.clone();
        async move {
            if inv.step_id() == Some("s1") {
                signal.notify_one();
            }
            tokio::time::sleep(step_delay).await;
            Ok::<_, String>(HandlerOutput::default())
        }
    })));
    Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()))
}

fn five_step_chain(id: &str) -> Plan {
    let ids = ["s1", "s2", "s3", "s4", "s5"];
    let mut builder = PlanBuilder::new("chain").id(id);
    for step in ids {
        builder = builder.simple_step(step, StepKind::Action);
    }
    builder.chain(ids).build().unwrap()
}

#[tokio::test]
async fn test_cancel_through_controller() {
    let first_started = Arc::new(Notify::new());
    let controller = Arc::new(PlanController::new(gated_executor(
        first_started.clone(),
        Duration::from_millis(50),
    )));

    let submitter = controller.clone();
    let handle = tokio::spawn(async move { submitter.submit(five_step_chain("plan_ctl_cancel")).await });

    first_started.notified().await;
    assert!(matches!(
        controller.submit(five_step_chain("plan_ctl_cancel")).await,
        Err(HiveError::AlreadyRunning(_))
    ));
    assert!(matches!(
        controller.remove("plan_ctl_cancel").await,
        Err(HiveError::AlreadyRunning(_))
    ));
    controller.cancel("plan_ctl_cancel").await.unwrap();

    let result = handle.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert_eq!(result.error.as_deref(), Some("Execution cancelled"));
    assert_eq!(result.metrics.completed_steps, 1);
    assert_eq!(result.metrics.skipped_steps, 4);

    let report = controller.status("plan_ctl_cancel").await.unwrap();
    assert_eq!(report.status, PlanStatus::Cancelled);
    assert_eq!(report.skipped_steps, 4);
    assert_eq!(report.step_statuses["s1"], StepStatus::Completed);
    assert!(matches!(
        controller.cancel("plan_ctl_cancel").await,
        Err(HiveError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_pause_and_resume_through_controller() {
    let first_started = Arc::new(Notify::new());
    let controller = Arc::new(PlanController::new(gated_executor(
        first_started.clone(),
        Duration::from_millis(20),
    )));

    let submitter = controller.clone();
    let handle = tokio::spawn(async move { submitter.submit(five_step_chain("plan_ctl_pause")).await });

    first_started.notified().await;
    controller.pause("plan_ctl_pause").await.unwrap();
    assert_eq!(
        controller.status("plan_ctl_pause").await.unwrap().status,
        PlanStatus::Paused
    );
    assert!(matches!(
        controller.pause("plan_ctl_pause").await,
        Err(HiveError::NotRunning(_))
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = controller.status("plan_ctl_pause").await.unwrap();
    assert_eq!(report.completed_steps, 1);

    controller.resume("plan_ctl_pause").await.unwrap();
    let result = handle.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.metrics.completed_steps, 5);
    assert!(matches!(
        controller.resume("plan_ctl_pause").await,
        Err(HiveError::NotPaused(_))
    ));
}

#[tokio::test]
async fn test_success_rate_reflects_outcomes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("half", move |inv: StepInvocation| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if inv.step_id() == Some("bad") {
                Err("bad input".to_string())
            } else {
                Ok::<_, String>(HandlerOutput::default())
            }
        }
    })));
    let controller = PlanController::new(Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default())));
    let plan = PlanBuilder::new("half")
        .id("plan_half")
        .simple_step("good", StepKind::Action)
        .simple_step("bad", StepKind::Action)
        .build()
        .unwrap();

    let result = controller.submit(plan).await.unwrap();
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.metrics.success_rate, 0.5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let recorded = controller.plan("plan_half").await.unwrap();
    assert_eq!(recorded.status, PlanStatus::Failed);
    assert_eq!(controller.step_results("plan_half").await.unwrap().len(), 2);
    assert_eq!(controller.plans().await, vec!["plan_half".to_string()]);
}

#[tokio::test]
async fn test_optimizer_drops_duplicate_steps_before_execution() {
    let log = CallLog::new();
    let controller = PlanController::new(flaky_executor(log.clone())).with_optimizer(Arc::new(DefaultOptimizer));
    let lookup = |id: &str| Step::new(id, "lookup", StepKind::Analysis);
    let plan = PlanBuilder::new("dedupe")
        .id("plan_dedupe")
        .step(lookup("lookup_1"))
        .step(lookup("lookup_2"))
        .simple_step("left", StepKind::Action)
        .simple_step("right", StepKind::Action)
        .depends_on("left", ["lookup_1"])
        .depends_on("right", ["lookup_2"])
        .build()
        .unwrap();

    let result = controller.submit(plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.metrics.total_steps, 3);
    assert_eq!(log.count("lookup_1"), 1);
    assert_eq!(log.count("lookup_2"), 0);

    let recorded = controller.plan("plan_dedupe").await.unwrap();
    assert_eq!(recorded.deps_of("right").to_vec(), vec!["lookup_1".to_string()]);
    assert_eq!(recorded.step("left").unwrap().parameters[PARALLEL_PARAM], json!(true));
}
