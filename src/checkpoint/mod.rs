//! 检查点：计划状态的外部持久化
//!
//! 控制器在计划进入终态时保存，在 submit 时若存在同 ID 检查点则加载并跳过已完成步骤。
//! 状态对本模块是不透明的 JSON。

mod sqlite;

pub use sqlite::SqliteCheckpointer;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::error::Result;

/// 检查点后端
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool>;

    async fn save(&self, id: &str, state: &Value) -> Result<()>;

    /// 不存在时返回 None
    async fn load(&self, id: &str) -> Result<Option<Value>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// 进程内检查点（测试与单进程宿主）
#[derive(Debug, Default)]
pub struct InMemoryCheckpointer {
    states: RwLock<HashMap<String, Value>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.states.read().await.contains_key(id))
    }

    async fn save(&self, id: &str, state: &Value) -> Result<()> {
        self.states.write().await.insert(id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.states.write().await.remove(id);
        Ok(())
    }
}
