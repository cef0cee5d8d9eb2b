//! 核心层：错误类型、计划生命周期控制、步骤工作池、优雅关闭

pub mod controller;
pub mod error;
pub mod shutdown;
pub mod task_scheduler;

pub use controller::{PlanController, PlanStatusReport, DEFAULT_RECORD_RETENTION};
pub use error::{HiveError, Result};
pub use shutdown::{BackgroundWorker, ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
