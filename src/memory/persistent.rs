//! 持久记忆：无容量上限，按类型建二级索引

use std::collections::HashMap;

use crate::memory::entry::{MemoryEntry, MemoryId, MemoryKind};

#[derive(Debug, Default)]
pub struct PersistentTier {
    entries: HashMap<MemoryId, MemoryEntry>,
    /// 类型 -> 条目 ID（插入顺序）
    by_kind: HashMap<MemoryKind, Vec<MemoryId>>,
}

impl PersistentTier {
    pub fn new() -> Self {
        Self::default()
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

    /// 插入或覆盖；类型变化时同步索引
    pub fn insert(&mut self, entry: MemoryEntry) {
        if let Some(old) = self.entries.get(&entry.id) {
            if old.kind != entry.kind {
                let old_kind = old.kind;
                self.unindex(old_kind, &entry.id);
                self.by_kind.entry(entry.kind).or_default().push(entry.id.clone());
            }
        } else {
            self.by_kind.entry(entry.kind).or_default().push(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn unindex(&mut self, kind: MemoryKind, id: &str) {
        if let Some(ids) = self.by_kind.get_mut(&kind) {
            ids.retain(|i| i != id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&MemoryEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MemoryEntry> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(id)?;
        self.unindex(entry.kind, id);
        Some(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryEntry> {
        self.entries.values_mut()
    }

    pub fn by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryEntry> {
        self.by_kind
            .get(&kind)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_by_kind(&self) -> HashMap<MemoryKind, usize> {
        self.by_kind
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(kind, ids)| (*kind, ids.len()))
            .collect()
    }

    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<MemoryId>
    where
        F: FnMut(&MemoryEntry) -> bool,
    {
        let mut doomed: Vec<MemoryId> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.id.clone())
            .collect();
        doomed.sort();
        for id in &doomed {
            self.remove(id);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_kind.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_index_tracks_updates() {
        let mut tier = PersistentTier::new();
        tier.insert(MemoryEntry::new("a", MemoryKind::Semantic, json!(1)));
        tier.insert(MemoryEntry::new("b", MemoryKind::Semantic, json!(2)));
        tier.insert(MemoryEntry::new("c", MemoryKind::Episodic, json!(3)));
        assert_eq!(tier.by_kind(MemoryKind::Semantic, 10).len(), 2);
        assert_eq!(tier.by_kind(MemoryKind::Semantic, 1)[0].id, "a");

        tier.insert(MemoryEntry::new("a", MemoryKind::Procedural, json!(1)));
        assert_eq!(tier.by_kind(MemoryKind::Semantic, 10).len(), 1);
        assert_eq!(tier.by_kind(MemoryKind::Procedural, 10).len(), 1);
        assert_eq!(tier.len(), 3);

        tier.remove("c");
        assert!(tier.by_kind(MemoryKind::Episodic, 10).is_empty());
        assert!(!tier.count_by_kind().contains_key(&MemoryKind::Episodic));
    }
}
