//! 计划依赖图
//!
//! 层级：无依赖的步骤为 0 层，其余为 `1 + max(依赖的层级)`；同层步骤组成一个 wave。

use std::collections::{HashMap, HashSet};

use crate::core::error::{HiveError, Result};
use crate::planning::types::{Plan, StepId};

/// 计划依赖图：步骤层级与按层分组
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 步骤 ID -> 层级
    pub levels: HashMap<StepId, usize>,
    /// 每层的步骤，层内按 priority 升序、插入顺序稳定
    pub waves: Vec<Vec<StepId>>,
}

impl PlanGraph {
    /// 构建依赖图；未知依赖或环视为不变量被破坏（应已被校验器拦下）
    pub fn build(plan: &Plan) -> Result<Self> {
        let levels = compute_levels(plan)?;
        let depth = levels.values().copied().max().map(|m| m + 1).unwrap_or(0);

        let mut waves: Vec<Vec<(i32, usize, StepId)>> = vec![Vec::new(); depth];
        for (index, step) in plan.steps.iter().enumerate() {
            if let Some(level) = levels.get(&step.id) {
                waves[*level].push((step.priority, index, step.id.clone()));
            }
        }

        let waves = waves
            .into_iter()
            .map(|mut wave| {
                wave.sort_by_key(|(priority, index, _)| (*priority, *index));
                wave.into_iter().map(|(_, _, id)| id).collect()
            })
            .collect();

        Ok(Self { levels, waves })
    }

    pub fn level(&self, id: &str) -> Option<usize> {
        self.levels.get(id).copied()
    }
}

/// 记忆化 DFS 计算所有步骤层级
pub fn compute_levels(plan: &Plan) -> Result<HashMap<StepId, usize>> {
    let known: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    let mut levels: HashMap<StepId, usize> = HashMap::with_capacity(plan.steps.len());
    let mut visiting: HashSet<StepId> = HashSet::new();

    for step in &plan.steps {
        level_of(plan, &step.id, &known, &mut levels, &mut visiting)?;
    }
    Ok(levels)
}

fn level_of(
    plan: &Plan,
    id: &str,
    known: &HashSet<&str>,
    levels: &mut HashMap<StepId, usize>,
    visiting: &mut HashSet<StepId>,
) -> Result<usize> {
    if let Some(level) = levels.get(id) {
        return Ok(*level);
    }
    if !known.contains(id) {
        return Err(HiveError::Internal(format!("unknown step in dependency graph: {}", id)));
    }
    if !visiting.insert(id.to_string()) {
        return Err(HiveError::Internal(format!("dependency cycle through step {}", id)));
    }

    let mut level = 0;
    for dep in plan.deps_of(id) {
        let dep_level = level_of(plan, dep, known, levels, visiting)?;
        level = level.max(dep_level + 1);
    }

    visiting.remove(id);
    levels.insert(id.to_string(), level);
    Ok(level)
}
