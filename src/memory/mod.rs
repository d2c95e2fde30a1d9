//! 记忆层：活跃上下文 + 归档知识库的两层分页
//!
//! 活跃层受字节预算约束并进入下一次 prompt；归档层无界、可检索。
//! 换页策略与检索顺序均为确定性（逻辑时钟 + 全序打破平局）。

pub mod archival;
pub mod hierarchical;

pub use archival::{ArchivalStore, FileArchival, InMemoryArchival};
pub use hierarchical::{HierarchicalMemory, MemoryItem, MemoryStats};
