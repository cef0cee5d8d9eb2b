//! 分层记忆：工作记忆 + 持久记忆 + 后台整合
//!
//! - 锁顺序固定为 工作记忆 → 持久记忆；向量存储调用都在释放两把锁之后进行
//! - 后台任务按 `consolidation_interval` 周期执行 整合 → 衰减 → 遗忘
//! - 查找未命中返回 `HiveError::MemoryNotFound`；向量存储错误只记录日志

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::error::{HiveError, Result};
use crate::core::shutdown::BackgroundWorker;
use crate::memory::consolidation::{self, ConsolidationReport};
use crate::memory::entry::{clamp_unit, estimate_importance, normalize, MemoryEntry, MemoryId, MemoryKind, StoreOptions};
use crate::memory::persistent::PersistentTier;
use crate::memory::vector::{Embedder, VectorStore};
use crate::memory::working::WorkingTier;
use crate::observability::{Logger, TracingLogger};
use crate::planning::now_millis;

/// 分层记忆配置
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub working_capacity: usize,
    pub consolidation_interval: Duration,
    pub consolidation_threshold: f64,
    pub forget_threshold: f64,
    /// 每小时衰减率；持久记忆使用其 0.1 倍
    pub decay_rate: f64,
    pub promotion_access_threshold: u64,
    pub background_consolidation: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_capacity: 100,
            consolidation_interval: Duration::from_secs(300),
            consolidation_threshold: 0.7,
            forget_threshold: 0.3,
            decay_rate: 0.1,
            promotion_access_threshold: 10,
            background_consolidation: true,
        }
    }
}

/// 记忆统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub total_entries: usize,
    pub working_count: usize,
    pub persistent_count: usize,
    pub by_kind: HashMap<MemoryKind, usize>,
    pub last_consolidation: Option<i64>,
    pub consolidation_count: u64,
    pub forgotten_count: u64,
}

struct MemoryCore {
    config: MemoryConfig,
    working: RwLock<WorkingTier>,
    persistent: RwLock<PersistentTier>,
    vector_store: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    logger: Arc<dyn Logger>,
    consolidation_count: AtomicU64,
    forgotten_count: AtomicU64,
    /// 0 表示尚未整合
    last_consolidation: AtomicI64,
}

impl MemoryCore {
    async fn mirror(&self, entries: Vec<(MemoryId, Vec<f32>, HashMap<String, Value>)>) {
        let Some(store) = &self.vector_store else { return };
        for (id, embedding, metadata) in entries {
            if let Err(e) = store.add(&id, &embedding, metadata).await {
                self.logger.warn(
                    "vector store add failed",
                    &[("entry_id", id.clone()), ("error", e.to_string())],
                );
            }
        }
    }

    async fn unmirror(&self, ids: &[MemoryId]) {
        let Some(store) = &self.vector_store else { return };
        for id in ids {
            if let Err(e) = store.delete(id).await {
                self.logger.warn(
                    "vector store delete failed",
                    &[("entry_id", id.clone()), ("error", e.to_string())],
                );
            }
        }
    }

    async fn consolidate(&self) -> ConsolidationReport {
        let now = now_millis();
        let mut report = ConsolidationReport::default();
        let mut to_mirror = Vec::new();

        {
            let mut working = self.working.write().await;
            let mut persistent = self.persistent.write().await;

            let candidates: Vec<MemoryEntry> = working
                .iter()
                .filter(|e| consolidation::is_candidate(e, self.config.consolidation_threshold))
                .cloned()
                .collect();
            report.candidates = candidates.len();

            let mut taken: HashSet<MemoryId> = HashSet::new();
            for group in consolidation::group_candidates(candidates) {
                let entry = if let [single] = group.as_slice() {
                    let mut entry = single.clone();
                    if entry.kind.is_working() {
                        entry.kind = MemoryKind::Persistent;
                    }
                    working.remove(&entry.id);
                    report.moved.push(entry.id.clone());
                    entry
                } else {
                    let id = loop {
                        let candidate = consolidation::merged_id(now, &taken);
                        taken.insert(candidate.clone());
                        if !persistent.contains(&candidate) && !working.contains(&candidate) {
                            break candidate;
                        }
                    };
                    let merged = consolidation::merge_group(&group, id, now);
                    for original in &group {
                        working.remove(&original.id);
                        report.absorbed.push(original.id.clone());
                    }
                    report.merged.push(merged.id.clone());
                    merged
                };

                if let Some(embedding) = &entry.embedding {
                    to_mirror.push((entry.id.clone(), embedding.clone(), entry.metadata.clone()));
                }
                persistent.insert(entry);
            }
        }

        self.mirror(to_mirror).await;
        self.consolidation_count.fetch_add(1, Ordering::Relaxed);
        self.last_consolidation.store(now, Ordering::Relaxed);
        if report.candidates > 0 {
            self.logger.info(
                "memory consolidated",
                &[
                    ("candidates", report.candidates.to_string()),
                    ("merged", report.merged.len().to_string()),
                    ("moved", report.moved.len().to_string()),
                ],
            );
        }
        report
    }

    async fn forget(&self, threshold: f64) -> Vec<MemoryId> {
        let now = now_millis();
        let rate = self.config.decay_rate;
        let threshold = clamp_unit(threshold);

        let (forgotten, orphaned) = {
            let mut working = self.working.write().await;
            let mut persistent = self.persistent.write().await;

            for entry in working.iter_mut() {
                entry.apply_decay(rate, now);
            }
            for entry in persistent.iter_mut() {
                entry.apply_decay(rate * 0.1, now);
            }

            let mut forgotten = working.remove_where(|e| e.importance < threshold);
            forgotten.extend(persistent.remove_where(|e| e.importance < threshold * 0.5 && e.access_count < 2));

            let orphaned: Vec<MemoryId> = forgotten
                .iter()
                .filter(|id| !working.contains(id) && !persistent.contains(id))
                .cloned()
                .collect();
            (forgotten, orphaned)
        };

        self.unmirror(&orphaned).await;
        self.forgotten_count.fetch_add(forgotten.len() as u64, Ordering::Relaxed);
        if !forgotten.is_empty() {
            self.logger.debug("memories forgotten", &[("count", forgotten.len().to_string())]);
        }
        forgotten
    }

    async fn run_cycle(&self) {
        self.consolidate().await;
        self.forget(self.config.forget_threshold).await;
    }
}

/// 分层记忆构建器
pub struct MemoryBuilder {
    config: MemoryConfig,
    vector_store: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    logger: Arc<dyn Logger>,
}

impl MemoryBuilder {
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// 构建并在当前 tokio 运行时中启动后台整合（配置关闭或不在运行时内则不启动）
    pub fn build(self) -> HierarchicalMemory {
        let core = Arc::new(MemoryCore {
            working: RwLock::new(WorkingTier::new(self.config.working_capacity)),
            persistent: RwLock::new(PersistentTier::new()),
            vector_store: self.vector_store,
            embedder: self.embedder,
            logger: self.logger.with(&[("component", "hierarchical_memory".to_string())]),
            consolidation_count: AtomicU64::new(0),
            forgotten_count: AtomicU64::new(0),
            last_consolidation: AtomicI64::new(0),
            config: self.config,
        });

        let worker = if core.config.background_consolidation && tokio::runtime::Handle::try_current().is_ok() {
            let task_core = core.clone();
            BackgroundWorker::spawn("memory-consolidation", &CancellationToken::new(), move |token| async move {
                let period = task_core.config.consolidation_interval.max(Duration::from_millis(1));
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => task_core.run_cycle().await,
                    }
                }
            })
        } else {
            BackgroundWorker::idle("memory-consolidation")
        };

        HierarchicalMemory { core, worker }
    }
}

/// 分层记忆
pub struct HierarchicalMemory {
    core: Arc<MemoryCore>,
    worker: BackgroundWorker,
}

impl HierarchicalMemory {
    pub fn builder(config: MemoryConfig) -> MemoryBuilder {
        MemoryBuilder {
            config,
            vector_store: None,
            embedder: None,
            logger: TracingLogger::shared(),
        }
    }

    pub fn new(config: MemoryConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.core.config
    }

    pub fn has_background_task(&self) -> bool {
        self.worker.is_running()
    }

    /// 存入工作记忆
    pub async fn store(&self, id: impl Into<MemoryId>, content: Value, opts: StoreOptions) -> Result<()> {
        self.store_typed(id, content, MemoryKind::Working, opts).await
    }

    /// 按类型存储：working 进入工作记忆，其余进入持久记忆
    pub async fn store_typed(
        &self,
        id: impl Into<MemoryId>,
        content: Value,
        kind: MemoryKind,
        opts: StoreOptions,
    ) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(HiveError::invalid_input("memory.id", "must not be empty"));
        }

        let now = now_millis();
        let importance = opts
            .importance
            .map(clamp_unit)
            .unwrap_or_else(|| estimate_importance(&content));
        let mut entry = MemoryEntry::new(id, kind, content);
        entry.created_at = now;
        entry.last_access = now;
        entry.importance = importance;
        entry.tags = opts.tags.into_iter().collect();
        entry.metadata = opts.metadata;
        entry.embedding = opts.embedding.filter(|e| !e.is_empty()).map(|mut e| {
            normalize(&mut e);
            e
        });

        // 同一 id 只存在于一个层级；替换掉的持久条目同时撤下向量镜像
        let mirror = if kind.is_working() {
            None
        } else {
            entry
                .embedding
                .clone()
                .map(|embedding| (entry.id.clone(), embedding, entry.metadata.clone()))
        };
        let entry_id = entry.id.clone();
        let (evicted, replaced_persistent) = {
            let mut working = self.core.working.write().await;
            let mut persistent = self.core.persistent.write().await;
            if kind.is_working() {
                let replaced = persistent.remove(&entry_id).is_some();
                (working.insert(entry, now), replaced)
            } else {
                working.remove(&entry_id);
                let replaced = persistent.contains(&entry_id);
                persistent.insert(entry);
                (None, replaced)
            }
        };

        if let Some(evicted) = evicted {
            self.core
                .logger
                .debug("working memory evicted entry", &[("entry_id", evicted.id)]);
        }
        match mirror {
            Some(mirror) => self.core.mirror(vec![mirror]).await,
            None if replaced_persistent => self.core.unmirror(&[entry_id]).await,
            None => {}
        }
        Ok(())
    }

    /// 读取内容：先工作记忆，后持久记忆；持久记忆访问次数超过阈值时复制到工作记忆
    pub async fn get(&self, id: &str) -> Result<Value> {
        Ok(self.get_entry(id).await?.content)
    }

    /// 同 `get`，返回完整条目
    pub async fn get_entry(&self, id: &str) -> Result<MemoryEntry> {
        let now = now_millis();
        {
            let mut working = self.core.working.write().await;
            if let Some(entry) = working.get_mut(id) {
                entry.touch(now);
                return Ok(entry.clone());
            }
        }

        let (found, promote) = {
            let mut persistent = self.core.persistent.write().await;
            match persistent.get_mut(id) {
                Some(entry) => {
                    entry.touch(now);
                    let promote = entry.access_count > self.core.config.promotion_access_threshold;
                    (entry.clone(), promote)
                }
                None => return Err(HiveError::MemoryNotFound(id.to_string())),
            }
        };

        if promote {
            let evicted = self.core.working.write().await.insert(found.clone(), now);
            self.core.logger.debug("memory promoted to working tier", &[("entry_id", id.to_string())]);
            if let Some(evicted) = evicted {
                self.core
                    .logger
                    .debug("working memory evicted entry", &[("entry_id", evicted.id)]);
            }
        }
        Ok(found)
    }

    /// 只读查看，不更新访问信息
    pub async fn peek(&self, id: &str) -> Option<MemoryEntry> {
        if let Some(entry) = self.core.working.read().await.get(id) {
            return Some(entry.clone());
        }
        self.core.persistent.read().await.get(id).cloned()
    }

    /// 检索：有向量存储与 Embedder 时走向量检索，否则（或出错时）做区分大小写的子串匹配
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<MemoryEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        if let (Some(store), Some(embedder)) = (&self.core.vector_store, &self.core.embedder) {
            let hits = match embedder.embed(query).await {
                Ok(mut embedding) => {
                    normalize(&mut embedding);
                    store.search(&embedding, k).await
                }
                Err(e) => Err(e),
            };
            match hits {
                Ok(hits) => {
                    let scored = hits.into_iter().map(|h| (h.id, h.score)).collect::<Vec<_>>();
                    return Ok(self.resolve_scored(scored, k).await);
                }
                Err(e) => {
                    self.core.logger.warn(
                        "vector search failed, falling back to substring scan",
                        &[("error", e.to_string())],
                    );
                }
            }
        }

        Ok(self.substring_scan(query, k).await)
    }

    async fn substring_scan(&self, query: &str, k: usize) -> Vec<MemoryEntry> {
        let mut results: Vec<MemoryEntry> = {
            let working = self.core.working.read().await;
            working
                .iter()
                .filter(|e| e.content_text().contains(query))
                .take(k)
                .cloned()
                .collect()
        };
        if results.len() < k {
            let persistent = self.core.persistent.read().await;
            let mut matches: Vec<&MemoryEntry> = persistent
                .iter()
                .filter(|e| e.content_text().contains(query))
                .filter(|e| !results.iter().any(|r| r.id == e.id))
                .collect();
            matches.sort_by(|a, b| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let remaining = k - results.len();
            results.extend(matches.into_iter().take(remaining).cloned());
        }
        results
    }

    async fn resolve_scored(&self, scored: Vec<(MemoryId, f32)>, k: usize) -> Vec<MemoryEntry> {
        let working = self.core.working.read().await;
        let persistent = self.core.persistent.read().await;
        scored
            .into_iter()
            .filter_map(|(id, score)| {
                let mut entry = working.get(&id).or_else(|| persistent.get(&id))?.clone();
                entry.metadata.insert("similarity_score".to_string(), json!(score));
                Some(entry)
            })
            .take(k)
            .collect()
    }

    /// 直接按向量检索，只保留相似度 ≥ threshold 的结果
    pub async fn vector_search(&self, embedding: &[f32], k: usize, threshold: f32) -> Result<Vec<MemoryEntry>> {
        let store = self
            .core
            .vector_store
            .as_ref()
            .ok_or_else(|| HiveError::VectorStore("vector store not configured".to_string()))?;

        let mut query = embedding.to_vec();
        normalize(&mut query);
        let hits = match store.search(&query, k.saturating_mul(2)).await {
            Ok(hits) => hits,
            Err(e) => {
                self.core
                    .logger
                    .warn("vector search failed", &[("error", e.to_string())]);
                return Ok(Vec::new());
            }
        };
        let scored = hits
            .into_iter()
            .filter(|h| h.score >= threshold)
            .map(|h| (h.id, h.score))
            .collect();
        Ok(self.resolve_scored(scored, k).await)
    }

    /// 按类型列出：先工作记忆，不足再从持久记忆补齐
    pub async fn get_by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryEntry> {
        let mut entries = self.core.working.read().await.by_kind(kind, limit);
        if entries.len() < limit {
            let more = self.core.persistent.read().await.by_kind(kind, limit);
            for entry in more {
                if entries.len() >= limit {
                    break;
                }
                if !entries.iter().any(|e| e.id == entry.id) {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    /// 建立双向关联，并在 metadata 中记录 `association_<对方 ID>` = strength
    pub async fn associate(&self, a: &str, b: &str, strength: f64) -> Result<()> {
        if a == b {
            return Err(HiveError::invalid_input("associate", "cannot associate an entry with itself"));
        }

        let mut working = self.core.working.write().await;
        let mut persistent = self.core.persistent.write().await;

        for id in [a, b] {
            if !working.contains(id) && !persistent.contains(id) {
                return Err(HiveError::MemoryNotFound(id.to_string()));
            }
        }

        for (this, other) in [(a, b), (b, a)] {
            if let Some(entry) = working.get_mut(this) {
                link(entry, other, strength);
            }
            if let Some(entry) = persistent.get_mut(this) {
                link(entry, other, strength);
            }
        }
        Ok(())
    }

    /// 返回至多 k 个关联条目
    pub async fn get_associated(&self, id: &str, k: usize) -> Result<Vec<MemoryEntry>> {
        let working = self.core.working.read().await;
        let persistent = self.core.persistent.read().await;
        let source = working
            .get(id)
            .or_else(|| persistent.get(id))
            .ok_or_else(|| HiveError::MemoryNotFound(id.to_string()))?;

        Ok(source
            .related
            .iter()
            .filter_map(|rid| working.get(rid).or_else(|| persistent.get(rid)))
            .take(k)
            .cloned()
            .collect())
    }

    /// 立即执行一轮整合
    pub async fn consolidate(&self) -> ConsolidationReport {
        self.core.consolidate().await
    }

    /// 衰减并按配置阈值遗忘
    pub async fn forget(&self) -> Vec<MemoryId> {
        self.core.forget(self.core.config.forget_threshold).await
    }

    /// 衰减并按给定阈值遗忘（持久记忆使用其一半）
    pub async fn forget_below(&self, threshold: f64) -> Vec<MemoryId> {
        self.core.forget(threshold).await
    }

    /// 后台任务的一轮：整合 → 衰减 → 遗忘
    pub async fn run_maintenance(&self) {
        self.core.run_cycle().await;
    }

    pub async fn stats(&self) -> MemoryStats {
        let working = self.core.working.read().await;
        let persistent = self.core.persistent.read().await;

        let mut by_kind = persistent.count_by_kind();
        for entry in working.iter() {
            *by_kind.entry(entry.kind).or_insert(0) += 1;
        }

        let last = self.core.last_consolidation.load(Ordering::Relaxed);
        MemoryStats {
            total_entries: working.len() + persistent.len(),
            working_count: working.len(),
            persistent_count: persistent.len(),
            by_kind,
            last_consolidation: (last > 0).then_some(last),
            consolidation_count: self.core.consolidation_count.load(Ordering::Relaxed),
            forgotten_count: self.core.forgotten_count.load(Ordering::Relaxed),
        }
    }

    /// 工作记忆快照（插入顺序）
    pub async fn working_entries(&self) -> Vec<MemoryEntry> {
        self.core.working.read().await.iter().cloned().collect()
    }

    /// 持久记忆快照（按 ID 排序）
    pub async fn persistent_entries(&self) -> Vec<MemoryEntry> {
        let mut entries: Vec<MemoryEntry> = self.core.persistent.read().await.iter().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// 清空两层记忆与向量存储
    pub async fn clear(&self) {
        {
            let mut working = self.core.working.write().await;
            let mut persistent = self.core.persistent.write().await;
            working.clear();
            persistent.clear();
        }
        if let Some(store) = &self.core.vector_store {
            if let Err(e) = store.clear().await {
                self.core
                    .logger
                    .warn("vector store clear failed", &[("error", e.to_string())]);
            }
        }
    }

    /// 停止后台整合任务，在 deadline 内等待退出；可重复调用
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.worker.shutdown(deadline).await
    }
}

fn link(entry: &mut MemoryEntry, other: &str, strength: f64) {
    entry.related.insert(other.to_string());
    entry
        .metadata
        .insert(format!("association_{}", other), json!(strength));
}
