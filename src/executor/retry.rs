//! 重试策略：按错误文本判定可重试，指数退避

use std::time::Duration;

/// 指数退避上限，避免异常配置导致溢出
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// 步骤重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次调用之外的最多重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    /// 小写子串；错误文本（小写后）包含任一即可重试
    pub retryable_patterns: Vec<String>,
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, error: &str) -> bool {
        let lowered = error.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|p| !p.is_empty() && lowered.contains(p.as_str()))
    }

    /// 第 n 次重试前的等待：base · factor^(n-1)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// 已用重试次数下是否还应再试
    pub fn should_retry(&self, retries_used: u32, error: &str) -> bool {
        retries_used < self.max_retries && self.is_retryable(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            retryable_patterns: vec![
                "timeout".to_string(),
                "temporary".to_string(),
                "unavailable".to_string(),
                "connection".to_string(),
            ],
        }
    }
}
