//! 计划执行集成测试：依赖顺序、跳过、重试、取消与暂停

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::executor::{
    ExecutorConfig, FnHandler, HandlerOutput, HandlerRegistry, PlanExecutor, RetryPolicy, StepHandler,
    StepInvocation, CANCELLED_MESSAGE,
};
use hive::planning::{Plan, PlanBuilder, PlanGraph, PlanStatus, StepKind, StepStatus, ValidatorChain};
use hive::HiveError;
use serde_json::json;
use tokio::sync::Notify;

/// 记录每个步骤的开始 / 结束顺序
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }

    fn position(&self, event: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {} not recorded", event))
    }

    fn contains(&self, event: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == event)
    }
}

struct RecordingHandler {
    recorder: Arc<Recorder>,
    delay: Duration,
    failing: HashSet<String>,
}

#[async_trait]
impl StepHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, invocation: StepInvocation) -> Result<HandlerOutput, String> {
        let id = invocation.step_id().unwrap_or_default().to_string();
        self.recorder.push(format!("start:{}", id));
        tokio::time::sleep(self.delay).await;
        self.recorder.push(format!("end:{}", id));
        if self.failing.contains(&id) {
            return Err(format!("step {} rejected: invalid input", id));
        }
        Ok(HandlerOutput::new(json!({ "step": id })))
    }
}

fn recording_executor(failing: &[&str]) -> (PlanExecutor, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(RecordingHandler {
        recorder: recorder.clone(),
        delay: Duration::from_millis(10),
        failing: failing.iter().map(|s| s.to_string()).collect(),
    }));
    let config = ExecutorConfig {
        max_concurrency: 4,
        ..ExecutorConfig::default()
    };
    (PlanExecutor::new(handlers, config), recorder)
}

fn validated(mut plan: Plan) -> Plan {
    ValidatorChain::standard().validate(&mut plan).unwrap();
    plan
}

#[tokio::test]
async fn test_linear_chain_runs_in_order() {
    let (executor, recorder) = recording_executor(&[]);
    let mut plan = validated(
        PlanBuilder::new("linear")
            .simple_step("a", StepKind::Analysis)
            .simple_step("b", StepKind::Decision)
            .simple_step("c", StepKind::Action)
            .chain(["a", "b", "c"])
            .build()
            .unwrap(),
    );

    let graph = PlanGraph::build(&plan).unwrap();
    assert_eq!(graph.level("a"), Some(0));
    assert_eq!(graph.level("b"), Some(1));
    assert_eq!(graph.level("c"), Some(2));

    let result = executor.execute(&mut plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.status, PlanStatus::Completed);
    assert_eq!(result.metrics.completed_steps, 3);
    assert_eq!(result.metrics.success_rate, 1.0);
    assert!(recorder.position("end:a") < recorder.position("start:b"));
    assert!(recorder.position("end:b") < recorder.position("start:c"));
    assert_eq!(result.step_results["b"].output, json!({ "step": "b" }));
}

#[tokio::test]
async fn test_diamond_joins_after_both_branches() {
    let (executor, recorder) = recording_executor(&[]);
    let mut plan = validated(
        PlanBuilder::new("diamond")
            .simple_step("a", StepKind::Analysis)
            .simple_step("b", StepKind::Action)
            .simple_step("c", StepKind::Action)
            .simple_step("d", StepKind::Validation)
            .sequential("a", "b")
            .sequential("a", "c")
            .depends_on("d", ["b", "c"])
            .build()
            .unwrap(),
    );

    let graph = PlanGraph::build(&plan).unwrap();
    assert_eq!(graph.waves.len(), 3);
    assert_eq!(graph.waves[1], vec!["b".to_string(), "c".to_string()]);

    let result = executor.execute(&mut plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.metrics.completed_steps, 4);
    let d_start = recorder.position("start:d");
    assert!(recorder.position("end:b") < d_start);
    assert!(recorder.position("end:c") < d_start);
    assert!(recorder.position("end:a") < recorder.position("start:b"));
    assert!(recorder.position("end:a") < recorder.position("start:c"));
}

#[tokio::test]
async fn test_failed_dependency_skips_dependents() {
    let (executor, recorder) = recording_executor(&["a"]);
    let mut plan = validated(
        PlanBuilder::new("failing")
            .simple_step("a", StepKind::Action)
            .simple_step("b", StepKind::Action)
            .simple_step("c", StepKind::Action)
            .simple_step("d", StepKind::Analysis)
            .chain(["a", "b", "c"])
            .build()
            .unwrap(),
    );

    let result = executor.execute(&mut plan).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("step a rejected: invalid input"));

    assert_eq!(plan.step("a").unwrap().status, StepStatus::Failed);
    assert_eq!(plan.step("b").unwrap().status, StepStatus::Skipped);
    assert_eq!(plan.step("c").unwrap().status, StepStatus::Skipped);
    assert_eq!(plan.step("d").unwrap().status, StepStatus::Completed);
    assert!(!recorder.contains("start:b"));
    assert!(!recorder.contains("start:c"));

    // 非可重试错误只调用一次
    assert_eq!(result.step_results["a"].attempts, 1);
    assert_eq!(result.step_results["b"].attempts, 0);

    let m = &result.metrics;
    assert_eq!(m.completed_steps + m.failed_steps + m.skipped_steps, m.total_steps);
    assert_eq!((m.completed_steps, m.failed_steps, m.skipped_steps), (1, 1, 2));
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried_with_backoff() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register(FnHandler::new("action_agent", move |_inv: StepInvocation| {
        let seen = seen.clone();
        async move {
            let n = {
                let mut seen = seen.lock().unwrap();
                seen.push(tokio::time::Instant::now());
                seen.len()
            };
            if n <= 2 {
                Err("connection refused".to_string())
            } else {
                Ok::<_, String>(HandlerOutput::new(json!("recovered")))
            }
        }
    }));
    let executor = PlanExecutor::new(handlers, ExecutorConfig::default());
    let mut plan = validated(
        PlanBuilder::new("flaky")
            .simple_step("net", StepKind::Action)
            .build()
            .unwrap(),
    );

    let started = tokio::time::Instant::now();
    let result = executor.execute(&mut plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.step_results["net"].attempts, 3);
    assert_eq!(result.step_results["net"].output, json!("recovered"));
    assert!(started.elapsed() >= Duration::from_secs(3));

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1] - attempts[0] >= Duration::from_secs(1));
    assert!(attempts[2] - attempts[1] >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register(FnHandler::new("action_agent", move |_inv: StepInvocation| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<HandlerOutput, _>("service temporarily unavailable".to_string())
        }
    }));
    let config = ExecutorConfig {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        ..ExecutorConfig::default()
    };
    let executor = PlanExecutor::new(handlers, config);
    let mut plan = validated(
        PlanBuilder::new("down")
            .simple_step("call", StepKind::Action)
            .build()
            .unwrap(),
    );

    let result = executor.execute(&mut plan).await.unwrap();
    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.step_results["call"].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_backoff_abandons_retry() {
    let first_call = Arc::new(Notify::new());
    let signal = first_call.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register(FnHandler::new("action_agent", move |_inv: StepInvocation| {
        let signal = signal.clone();
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                signal.notify_one();
            }
            Err::<HandlerOutput, _>("connection refused".to_string())
        }
    }));
    let executor = Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()));
    let plan = validated(
        PlanBuilder::new("backoff")
            .id("plan_backoff")
            .simple_step("net", StepKind::Action)
            .simple_step("after", StepKind::Action)
            .sequential("net", "after")
            .build()
            .unwrap(),
    );

    let started = tokio::time::Instant::now();
    let runner = executor.clone();
    let handle = tokio::spawn(async move {
        let mut plan = plan;
        let result = runner.execute(&mut plan).await;
        (plan, result)
    });

    first_call.notified().await;
    executor.cancel("plan_backoff").await.unwrap();

    let (plan, result) = handle.await.unwrap();
    let result = result.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(result.cancelled);
    assert_eq!(result.status, PlanStatus::Cancelled);

    let net = &result.step_results["net"];
    assert!(!net.success);
    assert_eq!(net.attempts, 1);
    assert!(net.error.as_deref().unwrap_or_default().contains("retry abandoned"));
    assert_eq!(plan.step("net").unwrap().status, StepStatus::Failed);
    assert_eq!(plan.step("after").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_cycle_is_rejected_by_validation() {
    let mut plan = PlanBuilder::new("cycle")
        .simple_step("a", StepKind::Action)
        .simple_step("b", StepKind::Action)
        .simple_step("c", StepKind::Action)
        .chain(["a", "b", "c", "a"])
        .build()
        .unwrap();

    let err = ValidatorChain::standard().validate(&mut plan).unwrap_err();
    match err {
        HiveError::PlanValidation(issues) => {
            assert!(issues.iter().any(|i| i.contains("circular dependencies")));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(plan.status, PlanStatus::Draft);
}

#[tokio::test]
async fn test_cancel_mid_flight_skips_remaining_steps() {
    let first_started = Arc::new(Notify::new());
    let signal = first_started.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("gate", move |inv: StepInvocation| {
        let signal = signal.clone();
        async move {
            if inv.step_id() == Some("s1") {
                signal.notify_one();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(HandlerOutput::new(json!("ok")))
        }
    })));
    let executor = Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()));

    let ids = ["s1", "s2", "s3", "s4", "s5"];
    let mut builder = PlanBuilder::new("cancel me").id("plan_cancel");
    for id in ids {
        builder = builder.simple_step(id, StepKind::Action);
    }
    let plan = validated(builder.chain(ids).build().unwrap());

    let runner = executor.clone();
    let handle = tokio::spawn(async move {
        let mut plan = plan;
        let result = runner.execute(&mut plan).await;
        (plan, result)
    });

    first_started.notified().await;
    executor.cancel("plan_cancel").await.unwrap();

    let (plan, result) = handle.await.unwrap();
    let result = result.unwrap();
    assert!(!result.success);
    assert!(result.cancelled);
    assert_eq!(result.status, PlanStatus::Cancelled);
    assert_eq!(result.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(result.metrics.completed_steps, 1);
    assert_eq!(result.metrics.skipped_steps, 4);
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(!executor.is_running("plan_cancel").await);
}

#[tokio::test]
async fn test_pause_holds_next_wave_until_resume() {
    let first_started = Arc::new(Notify::new());
    let signal = first_started.clone();
    let recorder = Arc::new(Recorder::default());
    let log = recorder.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("gate", move |inv: StepInvocation| {
        let signal = signal.clone();
        let log = log.clone();
        async move {
            let id = inv.step_id().unwrap_or_default().to_string();
            log.push(format!("start:{}", id));
            if id == "first" {
                signal.notify_one();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(HandlerOutput::default())
        }
    })));
    let executor = Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()));
    let plan = validated(
        PlanBuilder::new("pausable")
            .id("plan_pause")
            .simple_step("first", StepKind::Action)
            .simple_step("second", StepKind::Action)
            .sequential("first", "second")
            .build()
            .unwrap(),
    );

    let runner = executor.clone();
    let handle = tokio::spawn(async move {
        let mut plan = plan;
        runner.execute(&mut plan).await
    });

    first_started.notified().await;
    executor.pause("plan_pause").await.unwrap();
    assert_eq!(executor.status("plan_pause").await.unwrap().status, PlanStatus::Paused);
    assert!(matches!(executor.pause("plan_pause").await, Err(HiveError::NotRunning(_))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!recorder.contains("start:second"));

    executor.resume("plan_pause").await.unwrap();
    let result = handle.await.unwrap().unwrap();
    assert!(result.success);
    assert!(recorder.contains("start:second"));
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("busy", move |_inv: StepInvocation| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, String>(HandlerOutput::default())
        }
    })));
    let config = ExecutorConfig {
        max_concurrency: 2,
        ..ExecutorConfig::default()
    };
    let executor = PlanExecutor::new(handlers, config);

    let mut builder = PlanBuilder::new("wide");
    for i in 0..6 {
        builder = builder.simple_step(format!("w{}", i), StepKind::Analysis);
    }
    let mut plan = validated(builder.build().unwrap());

    let result = executor.execute(&mut plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.metrics.completed_steps, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_wave_dispatch_follows_priority() {
    let recorder = Arc::new(Recorder::default());
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(RecordingHandler {
        recorder: recorder.clone(),
        delay: Duration::from_millis(1),
        failing: HashSet::new(),
    }));
    let config = ExecutorConfig {
        max_concurrency: 1,
        ..ExecutorConfig::default()
    };
    let executor = PlanExecutor::new(handlers, config);

    let mut low = hive::planning::Step::new("low", "low", StepKind::Action);
    low.priority = 5;
    let mut high = hive::planning::Step::new("high", "high", StepKind::Action);
    high.priority = 1;
    let mut plan = validated(PlanBuilder::new("priority").step(low).step(high).build().unwrap());

    executor.execute(&mut plan).await.unwrap();
    assert!(recorder.position("start:high") < recorder.position("start:low"));
}

#[tokio::test]
async fn test_handler_timeout_fails_step() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(FnHandler::new("decision_agent", |_inv: StepInvocation| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, String>(HandlerOutput::default())
    }));
    let config = ExecutorConfig {
        step_timeout: Duration::from_millis(20),
        retry: RetryPolicy::none(),
        ..ExecutorConfig::default()
    };
    let executor = PlanExecutor::new(handlers, config);
    let mut plan = validated(
        PlanBuilder::new("slow")
            .simple_step("think", StepKind::Decision)
            .build()
            .unwrap(),
    );

    let result = executor.execute(&mut plan).await.unwrap();
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("Step 'think' timeout after 20ms")
    );
}

#[tokio::test]
async fn test_duplicate_execution_is_rejected() {
    let first_started = Arc::new(Notify::new());
    let signal = first_started.clone();
    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(FnHandler::new("gate", move |_inv: StepInvocation| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, String>(HandlerOutput::default())
        }
    })));
    let executor = Arc::new(PlanExecutor::new(handlers, ExecutorConfig::default()));
    let plan = validated(
        PlanBuilder::new("once")
            .id("plan_once")
            .simple_step("only", StepKind::Action)
            .build()
            .unwrap(),
    );

    let mut again = plan.clone();
    let runner = executor.clone();
    let handle = tokio::spawn(async move {
        let mut plan = plan;
        runner.execute(&mut plan).await
    });

    first_started.notified().await;
    assert!(matches!(
        executor.execute(&mut again).await,
        Err(HiveError::AlreadyRunning(_))
    ));
    assert!(handle.await.unwrap().unwrap().success);
}
