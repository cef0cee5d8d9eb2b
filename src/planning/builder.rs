//! 计划构建器
//!
//! 提供流畅的 API 来构建计划

use std::collections::HashMap;

use serde_json::Value;

use crate::core::error::{HiveError, Result};
use crate::planning::types::*;
use crate::planning::validator::ValidatorChain;

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    goal: String,
    strategy: String,
    steps: Vec<Step>,
    dependencies: HashMap<StepId, Vec<StepId>>,
    context: HashMap<String, Value>,
}

impl PlanBuilder {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            strategy: String::new(),
            steps: Vec::new(),
            dependencies: HashMap::new(),
            context: HashMap::new(),
        }
    }

    /// 指定计划 ID
    pub fn id(mut self, id: impl Into<PlanId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    /// 添加步骤
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// 以 ID + 类型快速添加步骤，名称与 ID 相同
    pub fn simple_step(self, id: impl Into<StepId>, kind: StepKind) -> Self {
        let id = id.into();
        let step = Step::new(id.clone(), id, kind);
        self.step(step)
    }

    /// `step_id` 依赖 `deps` 中的全部步骤（追加）
    pub fn depends_on<I, S>(mut self, step_id: impl Into<StepId>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        let entry = self.dependencies.entry(step_id.into()).or_default();
        for dep in deps {
            let dep = dep.into();
            if !entry.contains(&dep) {
                entry.push(dep);
            }
        }
        self
    }

    /// 顺序依赖：`to` 在 `from` 之后执行
    pub fn sequential(self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        self.depends_on(to, [from.into()])
    }

    /// 串联：按给定顺序两两建立顺序依赖
    pub fn chain<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        let ids: Vec<StepId> = ids.into_iter().map(Into::into).collect();
        for pair in ids.windows(2) {
            self = self.sequential(pair[0].clone(), pair[1].clone());
        }
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// 设置总耗时约束（毫秒）
    pub fn max_duration_ms(self, ms: i64) -> Self {
        self.context("max_duration", Value::from(ms))
    }

    /// 构建草稿计划（不校验）
    pub fn build(self) -> Result<Plan> {
        if self.goal.trim().is_empty() {
            return Err(HiveError::invalid_input("goal", "must not be empty"));
        }
        let mut plan = Plan::new(self.goal);
        plan.id = self.id;
        plan.strategy = self.strategy;
        plan.steps = self.steps;
        plan.dependencies = self.dependencies;
        plan.context = self.context;
        plan.metrics.total_steps = plan.steps.len();
        Ok(plan)
    }

    /// 构建并用标准校验器校验，成功后状态为 ready
    pub fn build_validated(self) -> Result<Plan> {
        let mut plan = self.build()?;
        ValidatorChain::standard().validate(&mut plan)?;
        Ok(plan)
    }
}
