//! 分层记忆管理器
//!
//! 两层虚拟上下文：活跃层（进入下一次 prompt 的有序条目，受字节预算约束）
//! 与归档层（无界、可检索）。超出预算时按复合分数换出：
//! score = w_lru * 归一化陈旧度 + w_pri * (1 - priority/10)，
//! 分数高者先换出；平分时先看更旧的 last_access，再按 id 字典序 —— 全序，行为可复现。
//! 陈旧度使用逻辑访问时钟而非墙钟。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::archival::ArchivalStore;

/// 记忆条目；一个 id 同一时刻只会出现在一层
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    /// 0..=10，越大越不容易被换出
    pub priority: u8,
    /// 最后访问时的逻辑时钟值
    pub last_access: u64,
    pub estimated_size: usize,
    pub tags: Vec<String>,
}

/// 统计快照
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemoryStats {
    pub active_items: usize,
    pub active_bytes: usize,
    pub budget: usize,
    pub archival_items: usize,
    pub page_ins: u64,
    pub page_outs: u64,
}

/// 分层记忆管理器：单 worker 持有；归档层可在 worker 间共享
pub struct HierarchicalMemory {
    /// 插入序即 read_active 的输出序
    active: Vec<MemoryItem>,
    archival: Arc<dyn ArchivalStore>,
    budget: usize,
    clock: u64,
    page_ins: u64,
    page_outs: u64,
    w_lru: f64,
    w_pri: f64,
}

impl HierarchicalMemory {
    pub fn new(budget: usize, archival: Arc<dyn ArchivalStore>) -> Self {
        Self {
            active: Vec::new(),
            archival,
            budget,
            clock: 0,
            page_ins: 0,
            page_outs: 0,
            w_lru: 0.5,
            w_pri: 0.5,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn active_bytes(&self) -> usize {
        self.active.iter().map(|i| i.estimated_size).sum()
    }

    /// 活跃层条目（插入序，供 prompt 拼装）
    pub fn read_active(&self) -> &[MemoryItem] {
        &self.active
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|i| i.id.clone()).collect()
    }

    /// 读取并刷新活跃条目的访问时间
    pub fn touch(&mut self, id: &str) -> Option<&MemoryItem> {
        let tick = self.tick();
        let item = self.active.iter_mut().find(|i| i.id == id)?;
        item.last_access = tick;
        Some(item)
    }

    /// 写入活跃层；同 id 覆盖旧值（任一层）。预算不够时先换出受害者。
    /// 单条超过整个预算的内容直接拒绝。
    pub fn add_to_active(
        &mut self,
        id: impl Into<String>,
        content: impl Into<String>,
        priority: u8,
        tags: Vec<String>,
    ) -> Result<(), AgentError> {
        let id = id.into();
        let content = content.into();
        let size = content.len();
        if size > self.budget {
            return Err(AgentError::tool(format!(
                "memory item '{}' ({} bytes) exceeds active budget ({} bytes)",
                id, size, self.budget
            )));
        }

        // 同 id 在任一层都先移除，保证 id 唯一归属
        self.active.retain(|i| i.id != id);
        self.archival.remove(&id)?;

        self.evict_until_fits(size, &id)?;

        let last_access = self.tick();
        self.active.push(MemoryItem {
            id,
            content,
            priority: priority.min(10),
            last_access,
            estimated_size: size,
            tags,
        });

        debug_assert!(self.active_bytes() <= self.budget);
        Ok(())
    }

    /// 指定条目活跃层 -> 归档层，内容原样保留
    pub fn page_out(&mut self, ids: &[String]) -> Result<usize, AgentError> {
        let mut moved = 0;
        for id in ids {
            let Some(pos) = self.active.iter().position(|i| &i.id == id) else {
                continue;
            };
            let item = self.active.remove(pos);
            let bytes = serde_json::to_vec(&item)
                .map_err(|e| AgentError::tool(format!("memory item serialize failed: {e}")))?;
            self.archival.put(&item.id, &bytes)?;
            self.page_outs += 1;
            moved += 1;
            tracing::debug!(id = %item.id, size = item.estimated_size, "paged out");
        }
        Ok(moved)
    }

    /// 指定条目归档层 -> 活跃层；访问时间刷新为当前时钟
    pub fn page_in_by_id(&mut self, ids: &[String]) -> Result<usize, AgentError> {
        let mut moved = 0;
        for id in ids {
            let Some(bytes) = self.archival.get(id)? else {
                tracing::warn!(id = %id, "page-in requested for unknown archival id");
                continue;
            };
            let mut item: MemoryItem = serde_json::from_slice(&bytes)
                .map_err(|e| AgentError::tool(format!("memory item deserialize failed: {e}")))?;

            self.evict_until_fits(item.estimated_size, id)?;

            self.archival.remove(id)?;
            item.last_access = self.tick();
            self.active.push(item);
            self.page_ins += 1;
            moved += 1;
        }
        debug_assert!(self.active_bytes() <= self.budget);
        Ok(moved)
    }

    /// 检索归档层并把命中条目换入，返回换入的 id 列表
    pub fn search_and_page_in(&mut self, query: &str, k: usize) -> Result<Vec<String>, AgentError> {
        let hits = self.archival.search(query, k)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        self.page_in_by_id(&hits)?;
        Ok(hits)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            active_items: self.active.len(),
            active_bytes: self.active_bytes(),
            budget: self.budget,
            archival_items: self.archival.len().unwrap_or(0),
            page_ins: self.page_ins,
            page_outs: self.page_outs,
        }
    }

    /// 换出受害者直到 incoming_size 放得下；incoming id 不会成为自己的受害者
    fn evict_until_fits(&mut self, incoming_size: usize, incoming_id: &str) -> Result<(), AgentError> {
        while self.active_bytes() + incoming_size > self.budget {
            let Some(victim_id) = self.pick_victim(incoming_id) else {
                // 没有可换出的条目却仍放不下：预算检查在入口处已拒绝超大条目
                return Err(AgentError::tool(format!(
                    "cannot fit {} bytes into active context",
                    incoming_size
                )));
            };
            self.page_out(&[victim_id])?;
        }
        Ok(())
    }

    /// 复合分数最高者为受害者；全序打破平局
    fn pick_victim(&self, exclude_id: &str) -> Option<String> {
        let candidates: Vec<&MemoryItem> =
            self.active.iter().filter(|i| i.id != exclude_id).collect();
        let oldest = candidates.iter().map(|i| i.last_access).min()?;
        let span = (self.clock.saturating_sub(oldest)).max(1) as f64;

        candidates
            .into_iter()
            .max_by(|a, b| {
                let score_a = self.victim_score(a, span);
                let score_b = self.victim_score(b, span);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // 平分：先换更旧的（last_access 小者优先成为受害者）
                    .then(b.last_access.cmp(&a.last_access))
                    // 仍平分：id 字典序小者优先
                    .then(b.id.cmp(&a.id))
            })
            .map(|i| i.id.clone())
    }

    fn victim_score(&self, item: &MemoryItem, span: f64) -> f64 {
        let recency = (self.clock.saturating_sub(item.last_access)) as f64 / span;
        self.w_lru * recency + self.w_pri * (1.0 - f64::from(item.priority) / 10.0)
    }
}
