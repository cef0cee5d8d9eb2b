//! 计划生命周期控制器
//!
//! 持有 计划 ID → 记录；submit 依次：加载检查点（恢复已完成步骤）→ 校验 → 执行 → 更新指标 → 终态时保存检查点。
//! 执行中的控制调用转发给执行器，执行结束后从记录回答。
//! 终态记录最多保留 `record_retention` 条，超出时按结束时间淘汰最旧的；`remove` 可显式释放。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::checkpoint::Checkpointer;
use crate::core::error::{HiveError, Result};
use crate::executor::PlanExecutor;
use crate::observability::{Logger, TracingLogger};
use crate::planning::{
    now_millis, Plan, PlanId, PlanOptimizer, PlanResult, PlanStatus, StepId, StepResult, StepStatus, ValidatorChain,
};

/// 默认保留的终态记录数
pub const DEFAULT_RECORD_RETENTION: usize = 256;

/// 控制器侧的计划记录
#[derive(Debug, Clone)]
struct PlanRecord {
    plan: Plan,
    status: PlanStatus,
    started_at: i64,
    ended_at: Option<i64>,
    step_results: HashMap<StepId, StepResult>,
    current_step: Option<StepId>,
    last_result: Option<PlanResult>,
}

/// status 查询结果
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatusReport {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepId>,
    pub step_statuses: HashMap<StepId, StepStatus>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

pub struct PlanController {
    executor: Arc<PlanExecutor>,
    validators: ValidatorChain,
    optimizer: Option<Arc<dyn PlanOptimizer>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    records: RwLock<HashMap<PlanId, PlanRecord>>,
    record_retention: usize,
    logger: Arc<dyn Logger>,
}

impl PlanController {
    pub fn new(executor: Arc<PlanExecutor>) -> Self {
        Self {
            executor,
            validators: ValidatorChain::standard(),
            optimizer: None,
            checkpointer: None,
            records: RwLock::new(HashMap::new()),
            record_retention: DEFAULT_RECORD_RETENTION,
            logger: TracingLogger::shared(),
        }
    }

    pub fn with_validators(mut self, validators: ValidatorChain) -> Self {
        self.validators = validators;
        self
    }

    /// 校验通过后、执行前对计划做优化
    pub fn with_optimizer(mut self, optimizer: Arc<dyn PlanOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// 终态记录上限（至少 1）
    pub fn with_record_retention(mut self, max_terminal: usize) -> Self {
        self.record_retention = max_terminal.max(1);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn executor(&self) -> &Arc<PlanExecutor> {
        &self.executor
    }

    /// 提交并执行计划，直到终态才返回
    ///
    /// 同 ID 的计划仍在进行时返回 AlreadyRunning；校验失败返回全部问题。
    pub async fn submit(&self, mut plan: Plan) -> Result<PlanResult> {
        if let Some(record) = self.records.read().await.get(&plan.id) {
            if !record.status.is_terminal() {
                return Err(HiveError::AlreadyRunning(plan.id.clone()));
            }
        }

        self.restore_from_checkpoint(&mut plan).await?;
        self.validators.validate(&mut plan)?;
        if let Some(optimizer) = &self.optimizer {
            let status = plan.status;
            plan = optimizer.optimize(&plan)?;
            plan.status = status;
            self.logger.debug(
                "plan optimized",
                &[("plan_id", plan.id.clone()), ("optimizer", optimizer.name().to_string())],
            );
        }

        {
            let mut records = self.records.write().await;
            if records.get(&plan.id).map(|r| !r.status.is_terminal()).unwrap_or(false) {
                return Err(HiveError::AlreadyRunning(plan.id.clone()));
            }
            records.insert(
                plan.id.clone(),
                PlanRecord {
                    plan: plan.clone(),
                    status: PlanStatus::Executing,
                    started_at: now_millis(),
                    ended_at: None,
                    step_results: HashMap::new(),
                    current_step: None,
                    last_result: None,
                },
            );
        }
        self.logger
            .info("plan submitted", &[("plan_id", plan.id.clone()), ("goal", plan.goal.clone())]);

        let outcome = self.executor.execute(&mut plan).await;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.logger
                    .error("plan execution aborted", &[("plan_id", plan.id.clone()), ("error", e.to_string())]);
                let mut records = self.records.write().await;
                if let Some(record) = records.get_mut(&plan.id) {
                    record.status = PlanStatus::Failed;
                    record.ended_at = Some(now_millis());
                }
                self.prune_terminal(&mut records);
                return Err(e);
            }
        };

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&plan.id) {
                let ended = now_millis();
                record.plan.metrics = result.metrics.clone();
                record.plan.metrics.total_duration_ms = (ended - record.started_at).max(0) as u64;
                record.status = result.status;
                record.ended_at = Some(ended);
                record.step_results = result.step_results.clone();
                record.current_step = None;
                record.last_result = Some(result.clone());
                record.plan = Plan {
                    metrics: record.plan.metrics.clone(),
                    ..plan.clone()
                };
            }
            self.prune_terminal(&mut records);
        }

        if result.status.is_terminal() {
            self.save_checkpoint(&plan).await;
        }
        Ok(result)
    }

    /// 终态记录超出上限时淘汰结束最早的
    fn prune_terminal(&self, records: &mut HashMap<PlanId, PlanRecord>) {
        let mut terminal: Vec<(i64, PlanId)> = records
            .iter()
            .filter(|(_, r)| r.status.is_terminal())
            .map(|(id, r)| (r.ended_at.unwrap_or(r.started_at), id.clone()))
            .collect();
        if terminal.len() <= self.record_retention {
            return;
        }
        terminal.sort();
        let excess = terminal.len() - self.record_retention;
        for (_, id) in terminal.into_iter().take(excess) {
            records.remove(&id);
            self.logger.debug("plan record evicted", &[("plan_id", id)]);
        }
    }

    /// 释放已结束计划的记录；仍在执行的计划返回 AlreadyRunning
    pub async fn remove(&self, plan_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get(plan_id) {
            None => Err(HiveError::NotFound(plan_id.to_string())),
            Some(record) if !record.status.is_terminal() => Err(HiveError::AlreadyRunning(plan_id.to_string())),
            Some(_) => {
                records.remove(plan_id);
                self.logger.info("plan record removed", &[("plan_id", plan_id.to_string())]);
                Ok(())
            }
        }
    }

    /// 若存在同 ID 检查点，把其中已完成的步骤（含结果）带入本次计划
    async fn restore_from_checkpoint(&self, plan: &mut Plan) -> Result<()> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let Some(state) = checkpointer.load(&plan.id).await? else {
            return Ok(());
        };
        let saved: Plan = serde_json::from_value(state)
            .map_err(|e| HiveError::Checkpoint(format!("unreadable checkpoint for {}: {}", plan.id, e)))?;

        let mut restored = 0usize;
        for step in plan.steps.iter_mut() {
            if let Some(prev) = saved.step(&step.id).filter(|s| s.is_done()) {
                step.status = prev.status;
                step.result = prev.result.clone();
                restored += 1;
            }
        }
        self.logger.info(
            "resuming plan from checkpoint",
            &[("plan_id", plan.id.clone()), ("restored_steps", restored.to_string())],
        );
        Ok(())
    }

    async fn save_checkpoint(&self, plan: &Plan) {
        let Some(checkpointer) = &self.checkpointer else { return };
        let saved = match serde_json::to_value(plan) {
            Ok(state) => checkpointer.save(&plan.id, &state).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            self.logger
                .warn("checkpoint save failed", &[("plan_id", plan.id.clone()), ("error", e.to_string())]);
        }
    }

    pub async fn status(&self, plan_id: &str) -> Result<PlanStatusReport> {
        if let Ok(snapshot) = self.executor.status(plan_id).await {
            let records = self.records.read().await;
            let record = records.get(plan_id);
            return Ok(PlanStatusReport {
                plan_id: snapshot.plan_id,
                status: snapshot.status,
                started_at: record.map(|r| r.started_at).unwrap_or(snapshot.started_at),
                ended_at: None,
                current_step: snapshot.current_step,
                step_statuses: snapshot.step_statuses,
                completed_steps: snapshot.completed_steps,
                failed_steps: snapshot.failed_steps,
                skipped_steps: snapshot.skipped_steps,
            });
        }

        let records = self.records.read().await;
        let record = records
            .get(plan_id)
            .ok_or_else(|| HiveError::NotFound(plan_id.to_string()))?;
        let step_statuses: HashMap<StepId, StepStatus> =
            record.plan.steps.iter().map(|s| (s.id.clone(), s.status)).collect();
        let count = |wanted: StepStatus| step_statuses.values().filter(|s| **s == wanted).count();
        Ok(PlanStatusReport {
            plan_id: record.plan.id.clone(),
            status: record.status,
            started_at: record.started_at,
            ended_at: record.ended_at,
            current_step: record.current_step.clone(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            step_statuses,
        })
    }

    pub async fn pause(&self, plan_id: &str) -> Result<()> {
        if self.executor.is_running(plan_id).await {
            self.executor.pause(plan_id).await?;
            self.set_record_status(plan_id, PlanStatus::Paused).await;
            return Ok(());
        }
        Err(self.idle_error(plan_id, HiveError::NotRunning(plan_id.to_string())).await)
    }

    pub async fn resume(&self, plan_id: &str) -> Result<()> {
        if self.executor.is_running(plan_id).await {
            self.executor.resume(plan_id).await?;
            self.set_record_status(plan_id, PlanStatus::Executing).await;
            return Ok(());
        }
        Err(self.idle_error(plan_id, HiveError::NotPaused(plan_id.to_string())).await)
    }

    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        if self.executor.is_running(plan_id).await {
            return self.executor.cancel(plan_id).await;
        }
        Err(self.idle_error(plan_id, HiveError::NotRunning(plan_id.to_string())).await)
    }

    /// 计划不在执行中：有记录返回 `known`，否则 NotFound
    async fn idle_error(&self, plan_id: &str, known: HiveError) -> HiveError {
        if self.records.read().await.contains_key(plan_id) {
            known
        } else {
            HiveError::NotFound(plan_id.to_string())
        }
    }

    async fn set_record_status(&self, plan_id: &str, status: PlanStatus) {
        if let Some(record) = self.records.write().await.get_mut(plan_id) {
            if !record.status.is_terminal() {
                record.status = status;
            }
        }
    }

    /// 最近一次执行结果
    pub async fn result(&self, plan_id: &str) -> Option<PlanResult> {
        self.records
            .read()
            .await
            .get(plan_id)
            .and_then(|r| r.last_result.clone())
    }

    pub async fn step_results(&self, plan_id: &str) -> Option<HashMap<StepId, StepResult>> {
        self.records
            .read()
            .await
            .get(plan_id)
            .map(|r| r.step_results.clone())
    }

    /// 记录中的计划（执行结束后含各步骤终态）
    pub async fn plan(&self, plan_id: &str) -> Option<Plan> {
        self.records.read().await.get(plan_id).map(|r| r.plan.clone())
    }

    pub async fn plans(&self) -> Vec<PlanId> {
        let mut ids: Vec<PlanId> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
