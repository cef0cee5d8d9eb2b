//! 向量存储与嵌入协作者
//!
//! 持久记忆在插入时把带 embedding 的条目镜像到向量存储；`search` 有 Embedder 时先嵌入查询再检索。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::error::{HiveError, Result};
use crate::memory::entry::normalize;

/// 一条向量检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

/// 向量存储
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, id: &str, embedding: &[f32], metadata: HashMap<String, Value>) -> Result<()>;

    /// 按相似度降序返回最多 k 条
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorMatch>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// 文本嵌入
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Debug, Clone)]
struct StoredVector {
    embedding: Vec<f32>,
    metadata: HashMap<String, Value>,
}

/// 进程内向量存储：线性扫描 + 余弦相似度
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    /// 首次写入时确定维度
    dimension: RwLock<Option<usize>>,
    vectors: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: RwLock::new(Some(dimension)),
            vectors: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.vectors.read().await.contains_key(id)
    }

    /// 写入时附带的元数据
    pub async fn metadata(&self, id: &str) -> Option<HashMap<String, Value>> {
        self.vectors.read().await.get(id).map(|v| v.metadata.clone())
    }

    async fn check_dimension(&self, len: usize) -> Result<()> {
        let mut dimension = self.dimension.write().await;
        match *dimension {
            Some(d) if d != len => Err(HiveError::VectorStore(format!(
                "dimension mismatch: expected {}, got {}",
                d, len
            ))),
            Some(_) => Ok(()),
            None => {
                *dimension = Some(len);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, id: &str, embedding: &[f32], metadata: HashMap<String, Value>) -> Result<()> {
        if embedding.is_empty() {
            return Err(HiveError::VectorStore("empty embedding".to_string()));
        }
        self.check_dimension(embedding.len()).await?;
        let mut embedding = embedding.to_vec();
        normalize(&mut embedding);
        self.vectors
            .write()
            .await
            .insert(id.to_string(), StoredVector { embedding, metadata });
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorMatch>> {
        if let Some(d) = *self.dimension.read().await {
            if d != embedding.len() {
                return Err(HiveError::VectorStore(format!(
                    "dimension mismatch: expected {}, got {}",
                    d,
                    embedding.len()
                )));
            }
        }
        let vectors = self.vectors.read().await;
        let mut scored: Vec<VectorMatch> = vectors
            .iter()
            .map(|(id, v)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(embedding, &v.embedding),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.vectors.write().await.remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.vectors.write().await.clear();
        Ok(())
    }
}
