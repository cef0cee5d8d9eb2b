//! 依赖有序的计划执行器
//!
//! 1. 计算步骤层级并按层分 wave
//! 2. 每个 wave 内的步骤提交到有界工作池并发执行，wave 全部结束后才进入下一层
//! 3. 依赖失败或被跳过的步骤直接标记 skipped
//! 4. 可重试错误按指数退避重试
//! 5. wave 之间观察暂停与取消

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::error::{HiveError, Result};
use crate::core::task_scheduler::TaskScheduler;
use crate::executor::handler::{HandlerRegistry, StepInvocation};
use crate::executor::retry::RetryPolicy;
use crate::executor::state::{skipped_result, ExecutionSnapshot, ExecutionState};
use crate::observability::{Logger, TracingLogger};
use crate::planning::{
    now_millis, Plan, PlanGraph, PlanId, PlanResult, PlanStatus, Step, StepResult, StepStatus,
};

/// 取消时写入 PlanResult.error 的文本
pub const CANCELLED_MESSAGE: &str = "Execution cancelled";

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: crate::core::task_scheduler::DEFAULT_MAX_CONCURRENCY,
            step_timeout: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// 单步执行逻辑：handler 查找、超时、重试、后置条件
#[derive(Clone)]
struct StepRunner {
    handlers: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    step_timeout: Duration,
}

impl StepRunner {
    async fn run(&self, step: &Step, cancel: &CancellationToken, logger: &Arc<dyn Logger>) -> StepResult {
        let started = Instant::now();

        let Some(handler) = self.handlers.resolve(step) else {
            let err = HiveError::NoHandler {
                step_id: step.id.clone(),
                handler: step.handler_name().to_string(),
            };
            logger.error("no handler for step", &[("step_id", step.id.clone())]);
            return StepResult::failure(err.to_string(), elapsed_ms(started));
        };

        let mut attempts: u32 = 0;
        let mut result = loop {
            attempts += 1;
            let invocation = StepInvocation::from_step(step, self.step_timeout);
            let outcome = match tokio::time::timeout(self.step_timeout, handler.handle(invocation)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HiveError::HandlerTimeout {
                    step_id: step.id.clone(),
                    timeout_ms: self.step_timeout.as_millis() as u64,
                }
                .to_string()),
            };

            let error = match outcome {
                Ok(out) => {
                    let mut result = StepResult::success(out.output, 0);
                    result.metadata = out.metadata;
                    break result;
                }
                Err(e) => e,
            };

            let retries_used = attempts - 1;
            if !self.retry.should_retry(retries_used, &error) {
                if retries_used > 0 {
                    logger.warn(
                        "step failed after retries",
                        &[("step_id", step.id.clone()), ("attempts", attempts.to_string())],
                    );
                }
                break StepResult::failure(error, 0);
            }

            let delay = self.retry.delay_for(attempts);
            logger.warn(
                "retrying step after retryable error",
                &[
                    ("step_id", step.id.clone()),
                    ("error", error.clone()),
                    ("retry_attempt", attempts.to_string()),
                    ("retry_in_ms", delay.as_millis().to_string()),
                ],
            );

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                break StepResult::failure(format!("{} (retry abandoned: {})", error, CANCELLED_MESSAGE), 0);
            }
        };

        if result.success {
            if let Some(failed) = first_unmet_criterion(step, &result.output) {
                result.success = false;
                result.error = Some(format!("Expected outcome not met: {}", failed));
            }
        }

        result.attempts = attempts;
        result.duration_ms = elapsed_ms(started);
        result.completed_at = now_millis();
        result
    }
}

/// 后置条件判断：目前为占位实现，接受所有条件
fn evaluate_criterion(_criterion: &str, _output: &Value) -> bool {
    // advisory only: no evaluator is wired in yet
    true
}

fn first_unmet_criterion(step: &Step, output: &Value) -> Option<String> {
    let expected = step.expected.as_ref()?;
    expected
        .criteria
        .iter()
        .find(|c| !evaluate_criterion(c, output))
        .cloned()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// 计划执行器
pub struct PlanExecutor {
    config: ExecutorConfig,
    runner: StepRunner,
    scheduler: TaskScheduler,
    live: RwLock<HashMap<PlanId, Arc<ExecutionState>>>,
    logger: Arc<dyn Logger>,
}

impl PlanExecutor {
    pub fn new(handlers: HandlerRegistry, config: ExecutorConfig) -> Self {
        Self::with_logger(handlers, config, TracingLogger::shared())
    }

    pub fn with_logger(handlers: HandlerRegistry, config: ExecutorConfig, logger: Arc<dyn Logger>) -> Self {
        let runner = StepRunner {
            handlers: Arc::new(handlers),
            retry: config.retry.clone(),
            step_timeout: config.step_timeout,
        };
        Self {
            scheduler: TaskScheduler::new(config.max_concurrency),
            config,
            runner,
            live: RwLock::new(HashMap::new()),
            logger,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 执行计划并把步骤状态与结果写回 `plan`
    ///
    /// 步骤失败与取消都体现在 PlanResult 中；只有不变量被破坏（如未校验的环）才返回 Err。
    pub async fn execute(&self, plan: &mut Plan) -> Result<PlanResult> {
        let graph = PlanGraph::build(plan)?;
        let state = self.register(plan).await?;
        let logger = self.logger.with(&[("plan_id", plan.id.clone())]);

        let outcome = self.run_waves(plan, &graph, &state, &logger).await;
        self.live.write().await.remove(&plan.id);
        outcome
    }

    async fn register(&self, plan: &Plan) -> Result<Arc<ExecutionState>> {
        let mut live = self.live.write().await;
        if live.contains_key(&plan.id) {
            return Err(HiveError::AlreadyRunning(plan.id.clone()));
        }
        let state = Arc::new(ExecutionState::new(plan, CancellationToken::new()));
        live.insert(plan.id.clone(), state.clone());
        Ok(state)
    }

    async fn run_waves(
        &self,
        plan: &mut Plan,
        graph: &PlanGraph,
        state: &Arc<ExecutionState>,
        logger: &Arc<dyn Logger>,
    ) -> Result<PlanResult> {
        let started = Instant::now();
        plan.set_status(PlanStatus::Executing);
        plan.metrics.started_at = Some(now_millis());
        logger.info(
            "plan execution started",
            &[("steps", plan.steps.len().to_string()), ("waves", graph.waves.len().to_string())],
        );

        for (level, wave) in graph.waves.iter().enumerate() {
            if !state.wait_if_paused().await {
                break;
            }

            let mut handles = Vec::with_capacity(wave.len());
            for step_id in wave {
                let step = plan
                    .step(step_id)
                    .cloned()
                    .ok_or_else(|| HiveError::Internal(format!("step vanished from plan: {}", step_id)))?;

                if step.is_done() {
                    logger.debug("step already completed, not re-running", &[("step_id", step.id.clone())]);
                    continue;
                }

                if let Some(dep) = state.blocking_dependency(plan.deps_of(step_id)).await {
                    let reason = format!("Skipped: dependency {} did not complete", dep);
                    logger.info("step skipped", &[("step_id", step.id.clone()), ("dependency", dep)]);
                    state
                        .finish_step(step_id, StepStatus::Skipped, skipped_result(&reason))
                        .await;
                    continue;
                }

                state.mark_ready(step_id).await;
                let runner = self.runner.clone();
                let state = state.clone();
                let logger = logger.clone();
                let handle = self.scheduler.spawn(async move {
                    state.begin_step(&step.id).await;
                    let result = runner.run(&step, &state.cancel_token(), &logger).await;
                    let status = if result.success {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    };
                    state.finish_step(&step.id, status, result).await;
                });
                handles.push((step_id.clone(), handle));
            }

            let (dispatched, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
            for (joined, step_id) in join_all(handles).await.into_iter().zip(dispatched.iter()) {
                let error = match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("step task aborted: {}", e),
                };
                logger.error("step task did not finish", &[("error", error.clone())]);
                if state.step_status(step_id).await.map(|s| !s.is_terminal()).unwrap_or(false) {
                    state
                        .finish_step(step_id, StepStatus::Failed, StepResult::failure(error, 0))
                        .await;
                }
            }

            self.apply_outcomes(plan, state).await;
            logger.debug("wave settled", &[("level", level.to_string())]);
        }

        let cancelled = state.is_cancelled();
        if cancelled {
            let skipped = state.skip_remaining(CANCELLED_MESSAGE).await;
            logger.warn("plan execution cancelled", &[("skipped", skipped.len().to_string())]);
        }
        self.apply_outcomes(plan, state).await;

        Ok(self.finish(plan, state, cancelled, started, logger).await)
    }

    /// 将执行状态回写到计划步骤
    async fn apply_outcomes(&self, plan: &mut Plan, state: &ExecutionState) {
        for step in plan.steps.iter_mut() {
            if let Some((status, result)) = state.outcome(&step.id).await {
                step.status = status;
                if result.is_some() {
                    step.result = result;
                }
            }
        }
        plan.touch();
    }

    async fn finish(
        &self,
        plan: &mut Plan,
        state: &ExecutionState,
        cancelled: bool,
        started: Instant,
        logger: &Arc<dyn Logger>,
    ) -> PlanResult {
        plan.metrics.tally(&plan.steps);
        plan.metrics.total_duration_ms = elapsed_ms(started);
        plan.metrics.ended_at = Some(now_millis());

        let first_error = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .find_map(|s| s.result.as_ref().and_then(|r| r.error.clone()));

        let (status, error) = if cancelled {
            (PlanStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
        } else if plan.metrics.failed_steps > 0 {
            (PlanStatus::Failed, first_error)
        } else {
            (PlanStatus::Completed, None)
        };
        plan.set_status(status);
        state.set_status(status).await;

        logger.info(
            "plan execution finished",
            &[
                ("status", format!("{:?}", status)),
                ("completed", plan.metrics.completed_steps.to_string()),
                ("failed", plan.metrics.failed_steps.to_string()),
                ("skipped", plan.metrics.skipped_steps.to_string()),
                ("duration_ms", plan.metrics.total_duration_ms.to_string()),
            ],
        );

        PlanResult {
            plan_id: plan.id.clone(),
            success: status == PlanStatus::Completed,
            error,
            cancelled,
            status,
            step_results: plan.step_results(),
            metrics: plan.metrics.clone(),
        }
    }

    /// 在计划之外执行单个步骤（同样经过超时与重试）
    pub async fn execute_step(&self, step: &Step) -> StepResult {
        let logger = self.logger.with(&[("step_id", step.id.clone())]);
        self.runner.run(step, &CancellationToken::new(), &logger).await
    }

    async fn live_state(&self, plan_id: &str) -> Result<Arc<ExecutionState>> {
        self.live
            .read()
            .await
            .get(plan_id)
            .cloned()
            .ok_or_else(|| HiveError::NotFound(plan_id.to_string()))
    }

    pub async fn pause(&self, plan_id: &str) -> Result<()> {
        self.live_state(plan_id).await?.pause().await?;
        self.logger.info("plan paused", &[("plan_id", plan_id.to_string())]);
        Ok(())
    }

    pub async fn resume(&self, plan_id: &str) -> Result<()> {
        self.live_state(plan_id).await?.resume().await?;
        self.logger.info("plan resumed", &[("plan_id", plan_id.to_string())]);
        Ok(())
    }

    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        self.live_state(plan_id).await?.cancel().await?;
        self.logger.info("plan cancel requested", &[("plan_id", plan_id.to_string())]);
        Ok(())
    }

    pub async fn status(&self, plan_id: &str) -> Result<ExecutionSnapshot> {
        Ok(self.live_state(plan_id).await?.snapshot().await)
    }

    pub async fn is_running(&self, plan_id: &str) -> bool {
        self.live.read().await.contains_key(plan_id)
    }

    pub async fn running_plans(&self) -> Vec<PlanId> {
        self.live.read().await.keys().cloned().collect()
    }
}
