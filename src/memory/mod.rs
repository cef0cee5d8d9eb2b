//! 分层记忆：容量有限的工作记忆 + 持久记忆，后台整合、衰减与遗忘，可选向量检索

pub mod consolidation;
pub mod entry;
pub mod hierarchical;
pub mod persistent;
pub mod vector;
pub mod working;

pub use consolidation::ConsolidationReport;
pub use entry::{MemoryEntry, MemoryId, MemoryKind, StoreOptions};
pub use hierarchical::{HierarchicalMemory, MemoryBuilder, MemoryConfig, MemoryStats};
pub use persistent::PersistentTier;
pub use vector::{cosine_similarity, Embedder, InMemoryVectorStore, VectorMatch, VectorStore};
pub use working::WorkingTier;
