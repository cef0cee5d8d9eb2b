//! 工作记忆：容量有限，保持插入顺序
//!
//! 满容量插入新条目时淘汰 `10·importance + access_count − 距上次访问小时数` 最小的条目，
//! 分数相同时淘汰最早插入的。

use std::collections::HashMap;

use crate::memory::entry::{MemoryEntry, MemoryId, MemoryKind};

#[derive(Debug)]
pub struct WorkingTier {
    capacity: usize,
    entries: HashMap<MemoryId, MemoryEntry>,
    order: Vec<MemoryId>,
}

impl WorkingTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// 插入或原地更新；返回被淘汰的条目
    pub fn insert(&mut self, entry: MemoryEntry, now: i64) -> Option<MemoryEntry> {
        if let Some(existing) = self.entries.get_mut(&entry.id) {
            *existing = entry;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict(now)
        } else {
            None
        };
        self.order.push(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
        evicted
    }

    fn evict(&mut self, now: i64) -> Option<MemoryEntry> {
        let mut victim: Option<(usize, f64)> = None;
        for (pos, id) in self.order.iter().enumerate() {
            let Some(entry) = self.entries.get(id) else { continue };
            let score = entry.retention_score(now);
            match victim {
                Some((_, lowest)) if score >= lowest => {}
                _ => victim = Some((pos, score)),
            }
        }
        let (pos, _) = victim?;
        let id = self.order.remove(pos);
        self.entries.remove(&id)
    }

    pub fn get(&self, id: &str) -> Option<&MemoryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MemoryEntry> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|o| o != id);
        Some(entry)
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryEntry> {
        self.entries.values_mut()
    }

    pub fn by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryEntry> {
        self.iter().filter(|e| e.kind == kind).take(limit).cloned().collect()
    }

    /// 删除满足条件的条目，返回其 ID（按插入顺序）
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<MemoryId>
    where
        F: FnMut(&MemoryEntry) -> bool,
    {
        let doomed: Vec<MemoryId> = self.iter().filter(|e| pred(e)).map(|e| e.id.clone()).collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, importance: f64, access: u64, last_access: i64) -> MemoryEntry {
        let mut e = MemoryEntry::new(id, MemoryKind::Working, json!(id));
        e.importance = importance;
        e.access_count = access;
        e.last_access = last_access;
        e
    }

    #[test]
    fn test_evicts_lowest_score() {
        let now = 1_000_000;
        let mut tier = WorkingTier::new(2);
        tier.insert(entry("a", 0.9, 0, now), now);
        tier.insert(entry("b", 0.1, 0, now), now);
        let evicted = tier.insert(entry("c", 0.5, 0, now), now).unwrap();
        assert_eq!(evicted.id, "b");
        assert_eq!(tier.len(), 2);
        let ids: Vec<_> = tier.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_tie_evicts_earliest_inserted() {
        let now = 1_000_000;
        let mut tier = WorkingTier::new(2);
        tier.insert(entry("first", 0.5, 0, now), now);
        tier.insert(entry("second", 0.5, 0, now), now);
        let evicted = tier.insert(entry("third", 0.5, 0, now), now).unwrap();
        assert_eq!(evicted.id, "first");
    }

    #[test]
    fn test_stale_entries_score_lower() {
        let now = 10 * 3_600_000;
        let mut tier = WorkingTier::new(2);
        tier.insert(entry("fresh", 0.5, 0, now), now);
        tier.insert(entry("stale", 0.5, 3, 0), now);
        let evicted = tier.insert(entry("new", 0.5, 0, now), now).unwrap();
        assert_eq!(evicted.id, "stale");
    }

    #[test]
    fn test_update_in_place_keeps_order_and_size() {
        let now = 0;
        let mut tier = WorkingTier::new(2);
        tier.insert(entry("a", 0.1, 0, now), now);
        tier.insert(entry("b", 0.1, 0, now), now);
        assert!(tier.insert(entry("a", 0.9, 0, now), now).is_none());
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("a").unwrap().importance, 0.9);
        assert_eq!(tier.iter().next().unwrap().id, "a");
    }

    #[test]
    fn test_remove_where() {
        let mut tier = WorkingTier::new(10);
        tier.insert(entry("a", 0.1, 0, 0), 0);
        tier.insert(entry("b", 0.8, 0, 0), 0);
        tier.insert(entry("c", 0.2, 0, 0), 0);
        let removed = tier.remove_where(|e| e.importance < 0.3);
        assert_eq!(removed, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(tier.len(), 1);
    }
}
