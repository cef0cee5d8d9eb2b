//! 计划执行器
//!
//! - `handler`：步骤处理器 trait 与注册表
//! - `retry`：可重试判断与指数退避
//! - `state`：单次执行的共享状态（暂停 / 取消 / 步骤结果）
//! - `engine`：按依赖层级分 wave 的有界并发执行

pub mod engine;
pub mod handler;
pub mod retry;
pub mod state;

pub use engine::{ExecutorConfig, PlanExecutor, CANCELLED_MESSAGE};
pub use handler::{EchoHandler, FnHandler, HandlerOutput, HandlerRegistry, StepHandler, StepInvocation};
pub use retry::RetryPolicy;
pub use state::{ExecutionSnapshot, ExecutionState};
