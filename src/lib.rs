//! Hive - Rust 智能体执行核心
//!
//! 模块划分：
//! - **planning**: 计划 / 步骤数据模型、构建器、依赖图与校验器
//! - **executor**: 依赖有序的 wave 执行、有界并发、重试与暂停 / 取消
//! - **memory**: 工作记忆 + 持久记忆，整合、衰减、遗忘与向量检索
//! - **checkpoint**: 计划状态的检查点（内存 / SQLite）
//! - **core**: 错误类型、生命周期控制器、工作池、优雅关闭
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化与 Logger 协作者

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod executor;
pub mod memory;
pub mod observability;
pub mod planning;

pub use crate::core::{HiveError, PlanController, Result};
pub use executor::{ExecutorConfig, HandlerRegistry, PlanExecutor, StepHandler};
pub use memory::{HierarchicalMemory, MemoryConfig};
pub use planning::{Plan, PlanBuilder, PlanResult, Step, StepKind};
