//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRONE__*` 覆盖（双下划线表示嵌套，
//! 如 `DRONE__AGENT__MAX_STEPS=20`）。各段默认值与对外契约一致。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::actions::StaticAllowlist;
use crate::plan::RunOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
    pub cache: CacheSection,
    pub actions: ActionsSection,
}

/// [app] 段：应用名与任务存储目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 任务目录根；每个任务一个子目录（audit.log / checkpoints/ / archival/）
    pub storage_root: Option<PathBuf>,
}

/// [llm] 段：模型名与采样参数（后端由调用方注入，这里只携带参数）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "qwen2.5-vl".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// [agent] 段：步数/重试/校验等执行参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub max_retries: u32,
    pub max_milestone_attempts: u32,
    pub failure_threshold: u32,
    pub checkpoint_every: usize,
    pub enable_planner: bool,
    pub enable_verification: bool,
    pub step_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 15,
            max_retries: 3,
            max_milestone_attempts: 2,
            failure_threshold: 5,
            checkpoint_every: 5,
            enable_planner: true,
            enable_verification: true,
            step_timeout_secs: 30,
        }
    }
}

/// [memory] 段：活跃上下文预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub active_budget_bytes: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            active_budget_bytes: 16 * 1024,
        }
    }
}

/// [cache] 段：工具结果缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 128,
            ttl_secs: 300,
        }
    }
}

/// [actions] 段：应用允许列表（name -> 启动命令）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ActionsSection {
    pub allowlist: BTreeMap<String, String>,
}

impl ActionsSection {
    /// 配置为空时使用保守默认集
    pub fn to_allowlist(&self) -> StaticAllowlist {
        if self.allowlist.is_empty() {
            StaticAllowlist::desktop_defaults()
        } else {
            StaticAllowlist::from_pairs(self.allowlist.clone())
        }
    }
}

impl AppConfig {
    /// 映射为运行选项
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_steps_per_milestone: self.agent.max_steps,
            max_retries: self.agent.max_retries,
            max_milestone_attempts: self.agent.max_milestone_attempts,
            active_context_budget: self.memory.active_budget_bytes,
            checkpoint_every: self.agent.checkpoint_every,
            enable_planner: self.agent.enable_planner,
            enable_verification: self.agent.enable_verification,
            failure_threshold: self.agent.failure_threshold,
            step_timeout: Duration::from_secs(self.agent.step_timeout_secs),
            jitter_seed: None,
            storage_dir: None,
        }
    }

    /// 按 [cache] 段构建共享缓存
    pub fn build_cache(&self) -> crate::cache::ToolCache {
        crate::cache::ToolCache::new(
            self.cache.max_entries,
            Duration::from_secs(self.cache.ttl_secs),
        )
    }
}

/// 从 config 目录加载配置，环境变量 DRONE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRONE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRONE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_contract_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 15);
        assert_eq!(cfg.agent.max_retries, 3);
        assert_eq!(cfg.agent.max_milestone_attempts, 2);
        assert_eq!(cfg.agent.checkpoint_every, 5);
        assert!(cfg.agent.enable_planner);
        assert!(cfg.agent.enable_verification);
        assert_eq!(cfg.cache.ttl_secs, 300);
    }

    #[test]
    fn test_run_options_mapping() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_steps = 7;
        cfg.memory.active_budget_bytes = 2048;

        let opts = cfg.run_options();
        assert_eq!(opts.max_steps_per_milestone, 7);
        assert_eq!(opts.active_context_budget, 2048);
        assert_eq!(opts.step_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_allowlist_falls_back_to_defaults() {
        let section = ActionsSection::default();
        let allowlist = section.to_allowlist();
        use crate::actions::AppAllowlist;
        assert!(allowlist.resolve("notepad").is_some());
    }
}
