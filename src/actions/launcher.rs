//! 应用允许列表
//!
//! LaunchApp 只能启动允许列表内的应用；列表由协作方提供（配置或平台发现），
//! 核心只消费 resolve(name) -> command 契约。名字之外的启动即 PolicyViolation。

use std::collections::BTreeMap;

/// 允许列表契约：按名解析启动命令
pub trait AppAllowlist: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;

    /// 已知应用名（排序稳定，供提示与错误信息使用）
    fn names(&self) -> Vec<String>;
}

/// 静态表实现：配置或测试直接给 (name, command) 对
#[derive(Debug, Clone, Default)]
pub struct StaticAllowlist {
    apps: BTreeMap<String, String>,
}

impl StaticAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            apps: pairs
                .into_iter()
                .map(|(k, v)| (k.into().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// 常见桌面应用的保守默认集（文本编辑器 / 计算器 / 文件管理器 / 终端）
    pub fn desktop_defaults() -> Self {
        Self::from_pairs([
            ("notepad", "gedit"),
            ("gedit", "gedit"),
            ("calculator", "gnome-calculator"),
            ("calc", "gnome-calculator"),
            ("files", "nautilus"),
            ("terminal", "gnome-terminal"),
            ("firefox", "firefox"),
        ])
    }

    pub fn insert(&mut self, name: impl Into<String>, command: impl Into<String>) {
        self.apps.insert(name.into().to_lowercase(), command.into());
    }
}

impl AppAllowlist for StaticAllowlist {
    fn resolve(&self, name: &str) -> Option<String> {
        self.apps.get(&name.trim().to_lowercase()).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }
}
