//! 单次执行的运行时状态
//!
//! 步骤状态与结果放在读写锁后，wave 之间的跳过判断读取上一 wave 写入的结果；
//! 暂停用 watch 通道，取消用 CancellationToken，两者都只在 wave 之间（及重试间隔）被观察。

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::error::{HiveError, Result};
use crate::planning::{now_millis, Plan, PlanId, PlanStatus, StepId, StepResult, StepStatus};

#[derive(Debug)]
struct ExecutionInner {
    status: PlanStatus,
    statuses: HashMap<StepId, StepStatus>,
    results: HashMap<StepId, StepResult>,
    current_step: Option<StepId>,
    started_at: i64,
}

/// 执行快照（status 查询返回）
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub current_step: Option<StepId>,
    pub step_statuses: HashMap<StepId, StepStatus>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub started_at: i64,
}

/// 一次计划执行的共享状态
#[derive(Debug)]
pub struct ExecutionState {
    plan_id: PlanId,
    inner: RwLock<ExecutionInner>,
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ExecutionState {
    /// 以计划当前步骤状态初始化（从检查点恢复时保留已完成步骤）
    pub fn new(plan: &Plan, cancel: CancellationToken) -> Self {
        let statuses = plan.steps.iter().map(|s| (s.id.clone(), s.status)).collect();
        let results = plan
            .steps
            .iter()
            .filter_map(|s| s.result.clone().map(|r| (s.id.clone(), r)))
            .collect();
        let (pause_tx, _) = watch::channel(false);
        Self {
            plan_id: plan.id.clone(),
            inner: RwLock::new(ExecutionInner {
                status: PlanStatus::Executing,
                statuses,
                results,
                current_step: None,
                started_at: now_millis(),
            }),
            pause_tx,
            cancel,
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn status(&self) -> PlanStatus {
        self.inner.read().await.status
    }

    pub async fn set_status(&self, status: PlanStatus) {
        self.inner.write().await.status = status;
    }

    pub async fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.inner.read().await.statuses.get(step_id).copied()
    }

    /// 任一直接依赖失败或被跳过时返回该依赖
    pub async fn blocking_dependency(&self, deps: &[StepId]) -> Option<StepId> {
        let inner = self.inner.read().await;
        deps.iter()
            .find(|d| {
                matches!(
                    inner.statuses.get(d.as_str()),
                    Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                )
            })
            .cloned()
    }

    pub async fn mark_ready(&self, step_id: &str) {
        let mut inner = self.inner.write().await;
        inner.statuses.insert(step_id.to_string(), StepStatus::Ready);
    }

    /// 步骤开始执行
    pub async fn begin_step(&self, step_id: &str) {
        let mut inner = self.inner.write().await;
        inner.statuses.insert(step_id.to_string(), StepStatus::Executing);
        inner.current_step = Some(step_id.to_string());
    }

    /// 写入步骤终态与结果
    pub async fn finish_step(&self, step_id: &str, status: StepStatus, result: StepResult) {
        let mut inner = self.inner.write().await;
        inner.statuses.insert(step_id.to_string(), status);
        inner.results.insert(step_id.to_string(), result);
        if inner.current_step.as_deref() == Some(step_id) {
            inner.current_step = None;
        }
    }

    /// 将所有未到终态的步骤标记为跳过，返回被跳过的步骤
    pub async fn skip_remaining(&self, reason: &str) -> Vec<StepId> {
        let mut inner = self.inner.write().await;
        let pending: Vec<StepId> = inner
            .statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &pending {
            inner.statuses.insert(id.clone(), StepStatus::Skipped);
            inner.results.insert(id.clone(), skipped_result(reason));
        }
        pending
    }

    /// 取出步骤状态与结果，用于回写计划
    pub async fn outcome(&self, step_id: &str) -> Option<(StepStatus, Option<StepResult>)> {
        let inner = self.inner.read().await;
        inner
            .statuses
            .get(step_id)
            .map(|s| (*s, inner.results.get(step_id).cloned()))
    }

    pub async fn snapshot(&self) -> ExecutionSnapshot {
        let inner = self.inner.read().await;
        let count = |wanted: StepStatus| inner.statuses.values().filter(|s| **s == wanted).count();
        ExecutionSnapshot {
            plan_id: self.plan_id.clone(),
            status: inner.status,
            current_step: inner.current_step.clone(),
            step_statuses: inner.statuses.clone(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            started_at: inner.started_at,
        }
    }

    /// executing → paused
    pub async fn pause(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.status != PlanStatus::Executing || self.cancel.is_cancelled() {
            return Err(HiveError::NotRunning(self.plan_id.clone()));
        }
        inner.status = PlanStatus::Paused;
        self.pause_tx.send_replace(true);
        Ok(())
    }

    /// paused → executing
    pub async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.status != PlanStatus::Paused {
            return Err(HiveError::NotPaused(self.plan_id.clone()));
        }
        inner.status = PlanStatus::Executing;
        self.pause_tx.send_replace(false);
        Ok(())
    }

    /// executing | paused → 取消请求；终态在执行器收尾时写入
    pub async fn cancel(&self) -> Result<()> {
        let inner = self.inner.read().await;
        if !matches!(inner.status, PlanStatus::Executing | PlanStatus::Paused) {
            return Err(HiveError::NotRunning(self.plan_id.clone()));
        }
        self.cancel.cancel();
        Ok(())
    }

    /// 暂停期间阻塞，直到恢复或取消；返回 false 表示已取消
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.pause_tx.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}

/// 跳过步骤的结果：未调用 handler
pub fn skipped_result(reason: &str) -> StepResult {
    let mut result = StepResult::failure(reason, 0);
    result.attempts = 0;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::{Step, StepKind};
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> ExecutionState {
        let mut plan = Plan::new("state");
        plan.id = "p1".to_string();
        plan.steps.push(Step::new("a", "A", StepKind::Action));
        plan.steps.push(Step::new("b", "B", StepKind::Action));
        ExecutionState::new(&plan, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_pause_resume_transitions() {
        let state = state();
        assert!(matches!(state.resume().await, Err(HiveError::NotPaused(_))));
        state.pause().await.unwrap();
        assert_eq!(state.status().await, PlanStatus::Paused);
        assert!(matches!(state.pause().await, Err(HiveError::NotRunning(_))));
        state.resume().await.unwrap();
        assert_eq!(state.status().await, PlanStatus::Executing);
    }

    #[tokio::test]
    async fn test_wait_if_paused_unblocks_on_resume() {
        let state = Arc::new(state());
        state.pause().await.unwrap();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.resume().await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_if_paused_unblocks_on_cancel() {
        let state = Arc::new(state());
        state.pause().await.unwrap();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_if_paused().await })
        };
        state.cancel().await.unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_dependency_and_skip_remaining() {
        let state = state();
        state
            .finish_step("a", StepStatus::Failed, StepResult::failure("boom", 1))
            .await;
        assert_eq!(
            state.blocking_dependency(&["a".to_string()]).await.as_deref(),
            Some("a")
        );
        let skipped = state.skip_remaining("Execution cancelled").await;
        assert_eq!(skipped, vec!["b".to_string()]);
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.failed_steps, 1);
        assert_eq!(snapshot.skipped_steps, 1);
    }
}
