//! 记忆整合：从工作记忆挑选候选、按相关性分组、合并
//!
//! 两个条目相关当且仅当：一方的 related 含另一方 ID 或二者 related 有交集、
//! 共享至少一个标签、或创建时间相差不超过 5 分钟。

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::memory::entry::{clamp_unit, MemoryEntry, MemoryId, MemoryKind};

/// 创建时间相差不超过该值视为相关
pub const RELATED_WINDOW_MS: i64 = 5 * 60 * 1000;

/// 访问次数超过该值即成为候选
pub const CANDIDATE_ACCESS_COUNT: u64 = 5;

/// 一轮整合的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationReport {
    pub candidates: usize,
    /// 新生成的合并条目 ID
    pub merged: Vec<MemoryId>,
    /// 原样迁入持久记忆的条目 ID
    pub moved: Vec<MemoryId>,
    /// 被合并（从工作记忆移除）的原始条目 ID
    pub absorbed: Vec<MemoryId>,
}

pub fn is_candidate(entry: &MemoryEntry, importance_threshold: f64) -> bool {
    entry.importance >= importance_threshold || entry.access_count > CANDIDATE_ACCESS_COUNT
}

pub fn are_related(a: &MemoryEntry, b: &MemoryEntry) -> bool {
    a.related.contains(&b.id)
        || b.related.contains(&a.id)
        || !a.related.is_disjoint(&b.related)
        || !a.tags.is_disjoint(&b.tags)
        || (a.created_at - b.created_at).abs() <= RELATED_WINDOW_MS
}

/// 按 importance 降序取种子，把与种子相关的剩余候选并入同组
pub fn group_candidates(mut candidates: Vec<MemoryEntry>) -> Vec<Vec<MemoryEntry>> {
    candidates.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut groups = Vec::new();
    let mut remaining = candidates;
    while !remaining.is_empty() {
        let seed = remaining.remove(0);
        let (members, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|e| are_related(&seed, e));
        let mut group = Vec::with_capacity(members.len() + 1);
        group.push(seed);
        group.extend(members);
        groups.push(group);
        remaining = rest;
    }
    groups
}

/// 合并一组条目为一个持久条目
pub fn merge_group(group: &[MemoryEntry], id: MemoryId, now: i64) -> MemoryEntry {
    let count = group.len().max(1) as f64;
    let importance = clamp_unit(group.iter().map(|e| e.importance).sum::<f64>() / count);
    let content = Value::Array(group.iter().map(|e| e.content.clone()).collect());

    let mut merged = MemoryEntry::new(id, MemoryKind::Persistent, content);
    merged.created_at = now;
    merged.last_access = now;
    merged.importance = importance;
    merged.access_count = group.iter().map(|e| e.access_count).sum();
    merged.tags = group.iter().flat_map(|e| e.tags.iter().cloned()).collect();
    merged.related = group.iter().map(|e| e.id.clone()).collect();
    merged
        .metadata
        .insert("consolidated_count".to_string(), json!(group.len()));
    merged
}

/// `consolidated_<now>`，重复时追加序号
pub fn merged_id(now: i64, taken: &HashSet<MemoryId>) -> MemoryId {
    let base = format!("consolidated_{}", now);
    if !taken.contains(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, importance: f64, created_at: i64) -> MemoryEntry {
        let mut e = MemoryEntry::new(id, MemoryKind::Working, json!(id));
        e.importance = importance;
        e.created_at = created_at;
        e
    }

    #[test]
    fn test_candidate_rules() {
        let mut e = entry("a", 0.5, 0);
        assert!(!is_candidate(&e, 0.7));
        e.access_count = 6;
        assert!(is_candidate(&e, 0.7));
        assert!(is_candidate(&entry("b", 0.7, 0), 0.7));
    }

    #[test]
    fn test_relatedness() {
        let hour = 3_600_000;
        let a = entry("a", 0.9, 0);
        let mut b = entry("b", 0.9, hour);
        assert!(!are_related(&a, &b));
        b.tags.insert("rust".to_string());
        let mut a2 = a.clone();
        a2.tags.insert("rust".to_string());
        assert!(are_related(&a2, &b));

        let mut c = entry("c", 0.9, 2 * hour);
        c.related.insert("a".to_string());
        assert!(are_related(&a, &c));

        let near = entry("near", 0.9, RELATED_WINDOW_MS);
        assert!(are_related(&a, &near));
    }

    #[test]
    fn test_grouping_is_seeded_by_importance() {
        let hour = 3_600_000;
        let groups = group_candidates(vec![
            entry("low", 0.7, 0),
            entry("far", 0.8, 10 * hour),
            entry("top", 0.95, 60_000),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].id, "top");
        assert_eq!(groups[0][1].id, "low");
        assert_eq!(groups[1][0].id, "far");
    }

    #[test]
    fn test_merge_group() {
        let mut a = entry("a", 0.8, 0);
        a.access_count = 2;
        a.tags.insert("x".to_string());
        let mut b = entry("b", 1.0, 0);
        b.access_count = 3;
        b.tags.insert("y".to_string());

        let merged = merge_group(&[a, b], "consolidated_1".to_string(), 42);
        assert_eq!(merged.kind, MemoryKind::Persistent);
        assert_eq!(merged.content, json!(["a", "b"]));
        assert!((merged.importance - 0.9).abs() < 1e-9);
        assert_eq!(merged.access_count, 5);
        assert_eq!(merged.tags.len(), 2);
        assert!(merged.related.contains("a") && merged.related.contains("b"));
        assert!(merged.embedding.is_none());
    }

    #[test]
    fn test_merged_id_avoids_collisions() {
        let mut taken = HashSet::new();
        assert_eq!(merged_id(7, &taken), "consolidated_7");
        taken.insert("consolidated_7".to_string());
        taken.insert("consolidated_7_1".to_string());
        assert_eq!(merged_id(7, &taken), "consolidated_7_2");
    }
}
