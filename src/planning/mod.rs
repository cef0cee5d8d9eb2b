//! 计划模型
//!
//! 计划 = 目标 + 步骤 + 依赖（DAG）。本模块提供数据类型、依赖图层级计算、
//! 校验器、优化器与构建器；执行见 `executor`。

pub mod builder;
pub mod graph;
pub mod optimizer;
pub mod types;
pub mod validator;

pub use builder::PlanBuilder;
pub use graph::{compute_levels, PlanGraph};
pub use optimizer::{DefaultOptimizer, PlanOptimizer, PARALLEL_PARAM};
pub use types::*;
pub use validator::{DependencyValidator, PlanValidator, ResourceValidator, TimeValidator, ValidatorChain};
