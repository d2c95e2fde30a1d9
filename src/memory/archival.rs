//! 归档存储契约与实现
//!
//! 分层记忆的外层：换出的 MemoryItem 序列化后按 id 存放，支持 put/get/remove/search。
//! search 为大小写不敏感的子串匹配，结果按 id 排序，固定输入下结果可复现。
//! 实现：InMemoryArchival（测试/无持久化）与 FileArchival（每条一个 JSON 文件）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::core::AgentError;

/// 归档 KV 契约；键空间与活跃层共享同一 id 空间
pub trait ArchivalStore: Send + Sync {
    fn put(&self, id: &str, bytes: &[u8]) -> Result<(), AgentError>;

    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, AgentError>;

    /// 删除；返回是否存在过
    fn remove(&self, id: &str) -> Result<bool, AgentError>;

    /// 子串检索，最多 k 条，按 id 升序
    fn search(&self, query: &str, k: usize) -> Result<Vec<String>, AgentError>;

    fn ids(&self) -> Result<Vec<String>, AgentError>;

    fn len(&self) -> Result<usize, AgentError> {
        Ok(self.ids()?.len())
    }

    fn is_empty(&self) -> Result<bool, AgentError> {
        Ok(self.len()? == 0)
    }
}

/// 内存实现（BTreeMap，迭代序即 id 升序）
#[derive(Default)]
pub struct InMemoryArchival {
    store: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryArchival {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArchivalStore for InMemoryArchival {
    fn put(&self, id: &str, bytes: &[u8]) -> Result<(), AgentError> {
        self.store
            .write()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, AgentError> {
        Ok(self.store.read().unwrap().get(id).cloned())
    }

    fn remove(&self, id: &str) -> Result<bool, AgentError> {
        Ok(self.store.write().unwrap().remove(id).is_some())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<String>, AgentError> {
        let needle = query.to_lowercase();
        let store = self.store.read().unwrap();
        Ok(store
            .iter()
            .filter(|(_, bytes)| String::from_utf8_lossy(bytes).to_lowercase().contains(&needle))
            .take(k)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn ids(&self) -> Result<Vec<String>, AgentError> {
        Ok(self.store.read().unwrap().keys().cloned().collect())
    }
}

/// 文件实现：目录下每条一个 `<id>.json`；文件名排序即 id 排序
pub struct FileArchival {
    dir: PathBuf,
}

impl FileArchival {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| AgentError::tool(format!("archival dir create failed: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn sorted_ids(&self) -> Result<Vec<String>, AgentError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| AgentError::tool(format!("archival dir read failed: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::tool(format!("archival dir entry: {e}")))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl ArchivalStore for FileArchival {
    fn put(&self, id: &str, bytes: &[u8]) -> Result<(), AgentError> {
        std::fs::write(self.path_for(id), bytes)
            .map_err(|e| AgentError::tool(format!("archival write '{id}' failed: {e}")))
    }

    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, AgentError> {
        match std::fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::tool(format!("archival read '{id}' failed: {e}"))),
        }
    }

    fn remove(&self, id: &str) -> Result<bool, AgentError> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::tool(format!("archival remove '{id}' failed: {e}"))),
        }
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<String>, AgentError> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for id in self.sorted_ids()? {
            if hits.len() >= k {
                break;
            }
            if let Some(bytes) = self.get(&id)? {
                if String::from_utf8_lossy(&bytes).to_lowercase().contains(&needle) {
                    hits.push(id);
                }
            }
        }
        Ok(hits)
    }

    fn ids(&self) -> Result<Vec<String>, AgentError> {
        self.sorted_ids()
    }
}
