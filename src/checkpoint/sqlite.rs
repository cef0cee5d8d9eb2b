//! SQLite 检查点（rusqlite）
//!
//! 同步连接放在 Mutex 后，所有语句在 spawn_blocking 中执行，避免阻塞异步运行时。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::checkpoint::Checkpointer;
use crate::core::error::{HiveError, Result};

#[derive(Debug, Clone)]
pub struct SqliteCheckpointer {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointer {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| HiveError::Checkpoint("sqlite connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| HiveError::Checkpoint(format!("sqlite task failed: {}", e)))?
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn exists(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM checkpoints WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn save(&self, id: &str, state: &Value) -> Result<()> {
        let id = id.to_string();
        let text = serde_json::to_string(state)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (id, state, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                params![id, text, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<Value>> {
        let id = id.to_string();
        let text: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT state FROM checkpoints WHERE id = ?1", params![id], |row| row.get(0))
                    .optional()?)
            })
            .await?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}
