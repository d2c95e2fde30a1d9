//! 工具结果缓存
//!
//! 仅缓存幂等的观察型工具结果（屏幕分析等）。键为 (tool, 规范化参数) 的指纹；
//! 条目带 tag 集合，变更型动作执行前按失效规则清掉相交 tag 的条目 ——
//! 核心正确性约束：任何可能改变屏幕的动作之后，旧的观察缓存不得存活。
//! 淘汰为严格 LRU（有界条目数）；过期条目在访问时惰性清除，put 时做小样本扫除。

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::actions::ActionRecord;

/// put 时检查是否过期的抽样条数
const SWEEP_SAMPLE: usize = 8;

/// 缓存键：(tool, canonical_args) 的 SHA-256 前缀
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 递归按键排序的规范化 JSON，保证参数顺序不影响指纹
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// 计算 (tool, args) 的缓存键
pub fn fingerprint(tool: &str, args: &Value) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    CacheKey(hex::encode(hasher.finalize())[..16].to_string())
}

/// 计数器快照（测试与可观测性断言用）
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    tags: BTreeSet<String>,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
    /// LRU 序：最后一次访问时的单调 tick
    tick: u64,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
    expirations: u64,
}

/// 工具结果缓存：get/put/invalidate 互斥串行，可安全地在 worker 间共享（Arc<ToolCache>）
#[derive(Debug)]
pub struct ToolCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    default_ttl: Duration,
}

impl ToolCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        let expired = inner.entries.get(key).map(|e| e.expired(now));
        match expired {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            Some(false) => {
                let mut value = None;
                if let Some(entry) = inner.entries.get_mut(key) {
                    entry.hit_count += 1;
                    entry.tick = tick;
                    value = Some(entry.value.clone());
                }
                inner.hits += 1;
                value
            }
        }
    }

    pub fn put<I, S>(&self, key: CacheKey, value: Value, tags: I, ttl: Option<Duration>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        // 小样本扫除过期条目
        let sampled: Vec<CacheKey> = inner
            .entries
            .iter()
            .take(SWEEP_SAMPLE)
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in sampled {
            inner.entries.remove(&k);
            inner.expirations += 1;
        }

        // 满时淘汰最久未访问者
        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
                inner.evictions += 1;
            }
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                tags: tags.into_iter().map(Into::into).collect(),
                created_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                hit_count: 0,
                tick,
            },
        );
    }

    /// 删除 tag 集合相交的全部条目，返回删除数
    pub fn invalidate(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| tags.iter().any(|t| e.tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            inner.entries.remove(k);
        }
        inner.invalidations += doomed.len() as u64;
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            invalidations: inner.invalidations,
            expirations: inner.expirations,
            entries: inner.entries.len(),
        }
    }
}

/// 失效规则：变更型动作种类 -> 必须清除的 tag 集合。
/// 默认规则：任何输入动作（含 Scroll）都使感知类条目失效。
#[derive(Debug, Clone)]
pub struct InvalidationRules {
    rules: HashMap<&'static str, Vec<String>>,
}

impl InvalidationRules {
    /// 感知类条目的默认 tag
    pub fn perception_tags() -> Vec<String> {
        vec!["screen".to_string(), "ocr".to_string(), "screen_analyzer".to_string()]
    }

    pub fn tags_for(&self, action: &ActionRecord) -> &[String] {
        self.rules
            .get(action.kind_name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_rule(&mut self, kind: &'static str, tags: Vec<String>) {
        self.rules.insert(kind, tags);
    }
}

impl Default for InvalidationRules {
    fn default() -> Self {
        let mut rules = HashMap::new();
        for kind in ["launch_app", "click", "type_text", "press_key", "hotkey", "scroll"] {
            rules.insert(kind, Self::perception_tags());
        }
        Self { rules }
    }
}
