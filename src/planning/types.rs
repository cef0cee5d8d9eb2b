//! 计划类型定义
//!
//! 定义计划、步骤、依赖关系、执行结果等核心数据类型。
//! 所有类型都可经 serde 序列化为 JSON，用于检查点与宿主程序的输入输出。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type PlanId = String;
pub type StepId = String;

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// 已创建，尚未校验
    #[default]
    Draft,
    /// 校验通过，等待执行
    Ready,
    /// 正在执行
    Executing,
    /// 已暂停（仅在执行期间出现）
    Paused,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足
    #[default]
    Pending,
    /// 依赖已满足，准备执行
    Ready,
    /// 正在执行
    Executing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 跳过（依赖失败或计划被取消）
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// 步骤类型：决定默认 handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Analysis,
    Decision,
    Action,
    Validation,
    Optimization,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::Analysis,
        StepKind::Decision,
        StepKind::Action,
        StepKind::Validation,
        StepKind::Optimization,
    ];

    /// 按类型选择 handler 时使用的注册名
    pub fn handler_name(&self) -> &'static str {
        match self {
            StepKind::Analysis => "analysis_agent",
            StepKind::Decision => "decision_agent",
            StepKind::Action => "action_agent",
            StepKind::Validation => "validation_agent",
            StepKind::Optimization => "optimization_agent",
        }
    }
}

/// 步骤完成后的预期结果（后置条件）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// 单个步骤的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 耗时（毫秒），包含重试等待
    pub duration_ms: u64,
    pub completed_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// handler 实际调用次数
    #[serde(default)]
    pub attempts: u32,
}

impl StepResult {
    pub fn success(output: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms,
            completed_at: now_millis(),
            metadata: HashMap::new(),
            attempts: 1,
        }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            duration_ms,
            completed_at: now_millis(),
            metadata: HashMap::new(),
            attempts: 1,
        }
    }
}

/// 计划中的步骤节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: StepKind,
    /// 显式 handler 名，优先于按类型选择
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectedOutcome>,
    /// 同一层内的排序键，越小越先
    #[serde(default)]
    pub priority: i32,
    /// 预估耗时（毫秒）
    #[serde(default)]
    pub estimated_duration_ms: i64,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            handler: None,
            parameters: HashMap::new(),
            expected: None,
            priority: 0,
            estimated_duration_ms: 0,
            status: StepStatus::Pending,
            result: None,
        }
    }

    /// 实际使用的 handler 名
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or_else(|| self.kind.handler_name())
    }

    /// 已成功完成（用于从检查点恢复时跳过）
    pub fn is_done(&self) -> bool {
        self.status == StepStatus::Completed && self.result.as_ref().map(|r| r.success).unwrap_or(false)
    }
}

/// 计划执行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub success_rate: f64,
}

impl PlanMetrics {
    /// 按步骤终态重新统计计数与成功率
    pub fn tally(&mut self, steps: &[Step]) {
        self.total_steps = steps.len();
        self.completed_steps = steps.iter().filter(|s| s.status == StepStatus::Completed).count();
        self.failed_steps = steps.iter().filter(|s| s.status == StepStatus::Failed).count();
        self.skipped_steps = steps.iter().filter(|s| s.status == StepStatus::Skipped).count();
        self.success_rate = if self.total_steps == 0 {
            0.0
        } else {
            self.completed_steps as f64 / self.total_steps as f64
        };
    }
}

/// 计划定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub goal: String,
    #[serde(default)]
    pub strategy: String,
    /// 插入顺序；执行顺序由依赖推导
    #[serde(default)]
    pub steps: Vec<Step>,
    /// 步骤 ID -> 其依赖的步骤 ID
    #[serde(default)]
    pub dependencies: HashMap<StepId, Vec<StepId>>,
    /// 约束与用户上下文（如 max_duration，单位毫秒）
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub metrics: PlanMetrics,
    #[serde(default = "now_millis")]
    pub created_at: i64,
    #[serde(default = "now_millis")]
    pub updated_at: i64,
}

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            strategy: String::new(),
            steps: Vec::new(),
            dependencies: HashMap::new(),
            context: HashMap::new(),
            status: PlanStatus::Draft,
            metrics: PlanMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// 某步骤的直接依赖
    pub fn deps_of(&self, id: &str) -> &[StepId] {
        self.dependencies.get(id).map(|d| d.as_slice()).unwrap_or(&[])
    }

    pub fn set_status(&mut self, status: PlanStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// 所有步骤的结果（仅含已写入结果的步骤）
    pub fn step_results(&self) -> HashMap<StepId, StepResult> {
        self.steps
            .iter()
            .filter_map(|s| s.result.clone().map(|r| (s.id.clone(), r)))
            .collect()
    }
}

/// 一次执行的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_id: PlanId,
    pub success: bool,
    /// 第一个错误（按步骤插入顺序）或取消原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub status: PlanStatus,
    #[serde(default)]
    pub step_results: HashMap<StepId, StepResult>,
    pub metrics: PlanMetrics,
}
