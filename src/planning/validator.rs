//! 计划校验器
//!
//! 校验器是对计划的纯函数判断，返回发现的全部问题；空列表即通过。
//! `ValidatorChain` 依声明顺序运行全部校验器并汇总问题，校验通过是 draft → ready 的前提。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::error::{HiveError, Result};
use crate::planning::types::{Plan, PlanStatus};

/// 计划校验器
pub trait PlanValidator: Send + Sync {
    fn name(&self) -> &str;

    /// 返回所有问题；为空表示通过
    fn validate(&self, plan: &Plan) -> Vec<String>;
}

/// 依赖校验：未知步骤引用与环
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyValidator;

impl DependencyValidator {
    /// DFS + 递归栈；返回闭合第一个环的步骤 ID
    pub fn find_cycle(plan: &Plan) -> Option<String> {
        fn visit<'a>(
            plan: &'a Plan,
            node: &'a str,
            visited: &mut HashSet<&'a str>,
            on_stack: &mut HashSet<&'a str>,
        ) -> Option<String> {
            visited.insert(node);
            on_stack.insert(node);
            for dep in plan.deps_of(node) {
                if on_stack.contains(dep.as_str()) {
                    return Some(dep.clone());
                }
                if !visited.contains(dep.as_str()) {
                    if let Some(closing) = visit(plan, dep, visited, on_stack) {
                        return Some(closing);
                    }
                }
            }
            on_stack.remove(node);
            None
        }

        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for step in &plan.steps {
            if !visited.contains(step.id.as_str()) {
                if let Some(closing) = visit(plan, &step.id, &mut visited, &mut on_stack) {
                    return Some(closing);
                }
            }
        }
        None
    }
}

impl PlanValidator for DependencyValidator {
    fn name(&self) -> &str {
        "dependency"
    }

    fn validate(&self, plan: &Plan) -> Vec<String> {
        let mut issues = Vec::new();
        let known: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();

        let mut seen = HashSet::new();
        for step in &plan.steps {
            if !seen.insert(step.id.as_str()) {
                issues.push(format!("Duplicate step id: {}", step.id));
            }
        }

        let mut keys: Vec<&String> = plan.dependencies.keys().collect();
        keys.sort();
        for step_id in keys {
            if !known.contains(step_id.as_str()) {
                issues.push(format!("Dependency references non-existent step: {}", step_id));
            }
            for dep in plan.deps_of(step_id) {
                if !known.contains(dep.as_str()) {
                    issues.push(format!("Step {} depends on non-existent step: {}", step_id, dep));
                }
            }
        }

        // 未知引用没有出边，不影响找环
        if let Some(closing) = Self::find_cycle(plan) {
            issues.push(format!("Plan has circular dependencies (cycle closed at step {})", closing));
        }

        issues
    }
}

/// 资源校验：预估耗时总和不超过 context.max_duration（毫秒）
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceValidator;

impl PlanValidator for ResourceValidator {
    fn name(&self) -> &str {
        "resource"
    }

    fn validate(&self, plan: &Plan) -> Vec<String> {
        let Some(max) = plan.context.get("max_duration").and_then(|v| v.as_i64()) else {
            return Vec::new();
        };
        let total: i64 = plan
            .steps
            .iter()
            .map(|s| s.estimated_duration_ms.max(0))
            .sum();
        if total > max {
            vec![format!("Plan duration ({}ms) exceeds maximum ({}ms)", total, max)]
        } else {
            Vec::new()
        }
    }
}

/// 时间校验：每个步骤的预估耗时非负
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeValidator;

impl PlanValidator for TimeValidator {
    fn name(&self) -> &str {
        "time"
    }

    fn validate(&self, plan: &Plan) -> Vec<String> {
        plan.steps
            .iter()
            .filter(|s| s.estimated_duration_ms < 0)
            .map(|s| format!("Step {} has invalid duration: {}ms", s.id, s.estimated_duration_ms))
            .collect()
    }
}

/// 按声明顺序运行的校验器集合
#[derive(Clone)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn PlanValidator>>,
}

impl ValidatorChain {
    pub fn empty() -> Self {
        Self { validators: Vec::new() }
    }

    /// 依赖 → 资源 → 时间
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(DependencyValidator))
            .with(Arc::new(ResourceValidator))
            .with(Arc::new(TimeValidator))
    }

    pub fn with(mut self, validator: Arc<dyn PlanValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// 收集所有校验器的问题，按校验器名分组
    pub fn issues(&self, plan: &Plan) -> HashMap<String, Vec<String>> {
        self.validators
            .iter()
            .map(|v| (v.name().to_string(), v.validate(plan)))
            .filter(|(_, issues)| !issues.is_empty())
            .collect()
    }

    /// 校验计划；通过时 draft 变为 ready，失败返回全部问题（按声明顺序）
    pub fn validate(&self, plan: &mut Plan) -> Result<()> {
        if plan.id.trim().is_empty() {
            return Err(HiveError::invalid_input("plan.id", "must not be empty"));
        }
        let issues: Vec<String> = self
            .validators
            .iter()
            .flat_map(|v| v.validate(plan))
            .collect();
        if !issues.is_empty() {
            tracing::warn!(plan_id = %plan.id, issues = issues.len(), "plan validation failed");
            return Err(HiveError::PlanValidation(issues));
        }
        if plan.status == PlanStatus::Draft {
            plan.set_status(PlanStatus::Ready);
        }
        Ok(())
    }
}

impl Default for ValidatorChain {
    fn default() -> Self {
        Self::standard()
    }
}
