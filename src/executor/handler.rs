//! 步骤处理器注册表
//!
//! 所有处理器实现 StepHandler trait，由 HandlerRegistry 按名注册与查找。
//! 步骤未显式指定 handler 时按类型名查找（如 `analysis_agent`）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::planning::{Step, StepKind};

/// 交给处理器的一次调用
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// 步骤名
    pub task: String,
    /// 步骤描述
    pub instruction: String,
    /// `step` / `step_id` / `parameters` / `description`
    pub context: HashMap<String, Value>,
    /// 单次调用的截止时长
    pub timeout: Duration,
}

impl StepInvocation {
    pub fn from_step(step: &Step, timeout: Duration) -> Self {
        let mut context = HashMap::new();
        context.insert(
            "step".to_string(),
            serde_json::to_value(step).unwrap_or(Value::Null),
        );
        context.insert("step_id".to_string(), Value::String(step.id.clone()));
        context.insert(
            "parameters".to_string(),
            Value::Object(step.parameters.clone().into_iter().collect()),
        );
        context.insert("description".to_string(), Value::String(step.description.clone()));
        Self {
            task: step.name.clone(),
            instruction: step.description.clone(),
            context,
            timeout,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        self.context.get("step_id").and_then(|v| v.as_str())
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.context.get("parameters").and_then(|p| p.get(key))
    }
}

/// 处理器输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub output: Value,
    pub metadata: HashMap<String, Value>,
}

impl HandlerOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 步骤处理器：失败时返回错误文本，由重试策略按内容判断是否可重试
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, invocation: StepInvocation) -> Result<HandlerOutput, String>;
}

/// 处理器注册表：按名称存储 Arc<dyn StepHandler>
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以处理器自身名称注册
    pub fn register(&mut self, handler: impl StepHandler + 'static) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    /// 以指定名称注册（同一处理器可服务多个名称）
    pub fn register_as(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// 为所有步骤类型注册同一个处理器
    pub fn register_for_all_kinds(&mut self, handler: Arc<dyn StepHandler>) {
        for kind in StepKind::ALL {
            self.register_as(kind.handler_name(), handler.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// 显式 handler 优先，否则按类型名
    pub fn resolve(&self, step: &Step) -> Option<Arc<dyn StepHandler>> {
        self.get(step.handler_name())
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 闭包处理器
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, String>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, invocation: StepInvocation) -> Result<HandlerOutput, String> {
        (self.f)(invocation).await
    }
}

/// Echo 处理器：回显任务名与参数
pub struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, invocation: StepInvocation) -> Result<HandlerOutput, String> {
        let parameters = invocation
            .context
            .get("parameters")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(HandlerOutput::new(serde_json::json!({
            "task": invocation.task,
            "instruction": invocation.instruction,
            "parameters": parameters,
        })))
    }
}
