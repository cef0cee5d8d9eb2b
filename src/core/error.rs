//! 执行核心错误类型
//!
//! 控制器 API 误用、计划校验失败、记忆未命中等都统一为 HiveError；
//! 步骤级失败不走这里，而是以字符串写入 StepResult.error（报告而非抛出）。

use thiserror::Error;

/// 执行核心可能返回给调用方的错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    /// 校验器报告的全部问题
    #[error("Plan validation failed: {}", .0.join("; "))]
    PlanValidation(Vec<String>),

    #[error("Plan already running: {0}")]
    AlreadyRunning(String),

    #[error("Plan not found: {0}")]
    NotFound(String),

    #[error("Plan is not running: {0}")]
    NotRunning(String),

    #[error("Plan is not paused: {0}")]
    NotPaused(String),

    #[error("No handler registered for step '{step_id}' (handler: {handler})")]
    NoHandler { step_id: String, handler: String },

    #[error("Step '{step_id}' timeout after {timeout_ms}ms")]
    HandlerTimeout { step_id: String, timeout_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    /// 记忆未命中：哨兵错误，调用方据此分支
    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Shutdown deadline exceeded after {0}ms")]
    ShutdownTimeout(u64),

    /// 内部不变量被破坏（例如绕过校验的依赖缺失）
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl HiveError {
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 是否为「未找到」类哨兵错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MemoryNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_all_issues() {
        let err = HiveError::PlanValidation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Plan validation failed: a; b");
    }

    #[test]
    fn test_not_found_sentinels() {
        assert!(HiveError::MemoryNotFound("m1".to_string()).is_not_found());
        assert!(HiveError::NotFound("p1".to_string()).is_not_found());
        assert!(!HiveError::Cancelled.is_not_found());
    }

    #[test]
    fn test_invalid_input_display() {
        let err = HiveError::invalid_input("plan.id", "must not be empty");
        assert_eq!(err.to_string(), "Invalid input for 'plan.id': must not be empty");
    }
}
