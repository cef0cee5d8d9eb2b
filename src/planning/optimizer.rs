//! 计划优化器
//!
//! 在校验通过后、执行前对计划做纯变换，返回新的计划，原计划不变。
//! `DefaultOptimizer` 依次执行：
//! 1. 去除冗余步骤：名称、类型、描述与依赖集合都相同的步骤只保留第一个，依赖它们的步骤改为依赖保留者
//! 2. 标记可并行步骤：所在层多于一个步骤时写入 `parameters["parallel"] = true`
//! 3. 调整顺序：按 priority、预估耗时、ID 升序排列步骤

use std::collections::{BTreeSet, HashMap};

use serde_json::json;

use crate::core::error::Result;
use crate::planning::graph::compute_levels;
use crate::planning::types::{Plan, StepId, StepKind};

/// 并行标记的参数名
pub const PARALLEL_PARAM: &str = "parallel";

/// 计划优化器
pub trait PlanOptimizer: Send + Sync {
    fn name(&self) -> &str;

    /// 返回优化后的计划副本；依赖图无法分层时返回错误
    fn optimize(&self, plan: &Plan) -> Result<Plan>;
}

/// 默认优化器：去冗余 → 并行标记 → 排序
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOptimizer;

type RedundancyKey = (String, StepKind, String, BTreeSet<StepId>);

impl DefaultOptimizer {
    fn remove_redundant_steps(plan: &mut Plan) {
        let mut first_of: HashMap<RedundancyKey, StepId> = HashMap::new();
        let mut replaced: HashMap<StepId, StepId> = HashMap::new();

        for step in &plan.steps {
            let key = (
                step.name.clone(),
                step.kind,
                step.description.clone(),
                plan.deps_of(&step.id).iter().cloned().collect(),
            );
            match first_of.get(&key) {
                Some(kept) => {
                    replaced.insert(step.id.clone(), kept.clone());
                }
                None => {
                    first_of.insert(key, step.id.clone());
                }
            }
        }
        if replaced.is_empty() {
            return;
        }

        plan.steps.retain(|s| !replaced.contains_key(&s.id));
        plan.dependencies.retain(|id, _| !replaced.contains_key(id));
        for (id, deps) in plan.dependencies.iter_mut() {
            let mut seen = BTreeSet::new();
            let remapped: Vec<StepId> = deps
                .iter()
                .map(|d| replaced.get(d).cloned().unwrap_or_else(|| d.clone()))
                .filter(|d| d != id && seen.insert(d.clone()))
                .collect();
            *deps = remapped;
        }
        tracing::debug!(removed = replaced.len(), "redundant steps removed");
    }

    fn mark_parallel_steps(plan: &mut Plan) -> Result<()> {
        let levels = compute_levels(plan)?;
        let mut width: HashMap<usize, usize> = HashMap::new();
        for level in levels.values() {
            *width.entry(*level).or_insert(0) += 1;
        }
        for step in plan.steps.iter_mut() {
            let parallel = levels
                .get(&step.id)
                .and_then(|level| width.get(level))
                .map(|n| *n > 1)
                .unwrap_or(false);
            if parallel {
                step.parameters.insert(PARALLEL_PARAM.to_string(), json!(true));
            }
        }
        Ok(())
    }

    fn optimize_ordering(plan: &mut Plan) {
        plan.steps.sort_by(|a, b| {
            (a.priority, a.estimated_duration_ms, &a.id).cmp(&(b.priority, b.estimated_duration_ms, &b.id))
        });
    }
}

impl PlanOptimizer for DefaultOptimizer {
    fn name(&self) -> &str {
        "default"
    }

    fn optimize(&self, plan: &Plan) -> Result<Plan> {
        let mut optimized = plan.clone();
        Self::remove_redundant_steps(&mut optimized);
        Self::mark_parallel_steps(&mut optimized)?;
        Self::optimize_ordering(&mut optimized);
        optimized.touch();
        Ok(optimized)
    }
}
