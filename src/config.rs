//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__EXECUTOR__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::{Checkpointer, InMemoryCheckpointer, SqliteCheckpointer};
use crate::core::error::Result;
use crate::executor::{ExecutorConfig, RetryPolicy};
use crate::memory::MemoryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub executor: ExecutorSection,
    pub memory: MemorySection,
    pub checkpoint: CheckpointSection,
}

/// [executor] 段：并发上限、单步超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 单步超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_step_timeout_secs() -> u64 {
    30 * 60
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            step_timeout_secs: default_step_timeout_secs(),
            retry: RetrySection::default(),
        }
    }
}

impl ExecutorSection {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.max_concurrency.max(1),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            retry: self.retry.to_policy(),
        }
    }
}

/// [executor.retry] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 错误信息包含其中任一子串（不区分大小写）即视为可重试
    #[serde(default = "default_retryable_patterns")]
    pub retryable_patterns: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retryable_patterns() -> Vec<String> {
    vec![
        "timeout".into(),
        "temporary".into(),
        "unavailable".into(),
        "connection".into(),
    ]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            retryable_patterns: default_retryable_patterns(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: if self.backoff_factor < 1.0 { 1.0 } else { self.backoff_factor },
            retryable_patterns: self
                .retryable_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }
}

/// [memory] 段：工作记忆容量、整合周期与衰减参数
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_working_capacity")]
    pub working_capacity: usize,
    #[serde(default = "default_consolidation_interval_secs")]
    pub consolidation_interval_secs: u64,
    /// importance ≥ 该值的工作记忆参与整合
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: f64,
    /// 工作记忆 importance 低于该值被遗忘；持久记忆使用其一半
    #[serde(default = "default_forget_threshold")]
    pub forget_threshold: f64,
    /// 每小时衰减率
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// 持久记忆被访问超过该次数时复制到工作记忆
    #[serde(default = "default_promotion_access_threshold")]
    pub promotion_access_threshold: u64,
    #[serde(default = "default_background_consolidation")]
    pub background_consolidation: bool,
}

fn default_working_capacity() -> usize {
    100
}

fn default_consolidation_interval_secs() -> u64 {
    300
}

fn default_consolidation_threshold() -> f64 {
    0.7
}

fn default_forget_threshold() -> f64 {
    0.3
}

fn default_decay_rate() -> f64 {
    0.1
}

fn default_promotion_access_threshold() -> u64 {
    10
}

fn default_background_consolidation() -> bool {
    true
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_capacity: default_working_capacity(),
            consolidation_interval_secs: default_consolidation_interval_secs(),
            consolidation_threshold: default_consolidation_threshold(),
            forget_threshold: default_forget_threshold(),
            decay_rate: default_decay_rate(),
            promotion_access_threshold: default_promotion_access_threshold(),
            background_consolidation: default_background_consolidation(),
        }
    }
}

impl MemorySection {
    pub fn to_memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            working_capacity: self.working_capacity.max(1),
            consolidation_interval: Duration::from_secs(self.consolidation_interval_secs.max(1)),
            consolidation_threshold: self.consolidation_threshold.clamp(0.0, 1.0),
            forget_threshold: self.forget_threshold.clamp(0.0, 1.0),
            decay_rate: self.decay_rate.max(0.0),
            promotion_access_threshold: self.promotion_access_threshold,
            background_consolidation: self.background_consolidation,
        }
    }
}

/// 检查点后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    None,
    Memory,
    Sqlite,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/checkpoints.db")
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::None,
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl CheckpointSection {
    /// 按配置构建检查点后端；None 表示不保存
    pub fn build(&self) -> Result<Option<Arc<dyn Checkpointer>>> {
        match self.backend {
            CheckpointBackend::None => Ok(None),
            CheckpointBackend::Memory => Ok(Some(Arc::new(InMemoryCheckpointer::new()))),
            CheckpointBackend::Sqlite => {
                if let Some(parent) = self.sqlite_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                }
                Ok(Some(Arc::new(SqliteCheckpointer::open(&self.sqlite_path)?)))
            }
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> std::result::Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
