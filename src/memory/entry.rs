//! 记忆条目与存储选项

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::planning::now_millis;

pub type MemoryId = String;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// 记忆类型：working 进入工作记忆，其余进入持久记忆
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Working,
    Persistent,
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryKind {
    pub fn is_working(&self) -> bool {
        matches!(self, MemoryKind::Working)
    }
}

/// 记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub kind: MemoryKind,
    pub content: Value,
    /// 存入时已归一化
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub last_access: i64,
    pub access_count: u64,
    /// [0, 1]
    pub importance: f64,
    /// [0, 1]，最近一次衰减因子
    pub decay: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// 关联条目 ID（双向维护）
    #[serde(default)]
    pub related: BTreeSet<MemoryId>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl MemoryEntry {
    pub fn new(id: impl Into<MemoryId>, kind: MemoryKind, content: Value) -> Self {
        let now = now_millis();
        let importance = estimate_importance(&content);
        Self {
            id: id.into(),
            kind,
            content,
            embedding: None,
            created_at: now,
            last_access: now,
            access_count: 0,
            importance,
            decay: 1.0,
            tags: BTreeSet::new(),
            related: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// 记录一次访问：更新时间、计数，importance × 1.1（上限 1）
    pub fn touch(&mut self, now: i64) {
        self.last_access = now.max(self.last_access);
        self.access_count += 1;
        self.importance = clamp_unit(self.importance * 1.1);
    }

    pub fn hours_since_access(&self, now: i64) -> f64 {
        ((now - self.last_access).max(0) as f64) / MILLIS_PER_HOUR
    }

    /// 工作记忆淘汰分数，越低越先被淘汰
    pub fn retention_score(&self, now: i64) -> f64 {
        10.0 * self.importance + self.access_count as f64 - self.hours_since_access(now)
    }

    /// 按每小时衰减率衰减 importance
    pub fn apply_decay(&mut self, rate_per_hour: f64, now: i64) {
        let factor = clamp_unit(1.0 - rate_per_hour * self.hours_since_access(now));
        self.decay = factor;
        self.importance = clamp_unit(self.importance * factor);
    }

    /// 内容的文本形式（字符串直接返回，其余序列化为 JSON）
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 存储选项
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// 未指定时按内容估算
    pub importance: Option<f64>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: HashMap<String, Value>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// 未给出 importance 时按内容估算：JSON 长度 / 1000，对象 ×1.2，数组与长字符串 ×1.1
pub fn estimate_importance(content: &Value) -> f64 {
    let size = serde_json::to_string(content).map(|s| s.len()).unwrap_or(0);
    let base = clamp_unit(size as f64 / 1000.0);
    let weighted = match content {
        Value::Object(_) => base * 1.2,
        Value::Array(_) => base * 1.1,
        Value::String(s) if s.chars().count() > 100 => base * 1.1,
        _ => base,
    };
    clamp_unit(weighted)
}

/// L2 归一化；零向量保持不变
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
