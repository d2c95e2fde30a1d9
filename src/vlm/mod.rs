//! 屏幕感知层：capture / analyze 契约与脚本化实现
//!
//! 执行核心不关心截图与视觉模型的实现，只消费两个窄契约：
//! capture() -> image 与 analyze(image, query) -> text。失败统一为 PerceptionFailure（可重试）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;

/// 不透明截图：核心只透传，分析由感知后端负责
#[derive(Debug, Clone)]
pub struct ScreenImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// 感知后端契约
#[async_trait]
pub trait Perception: Send + Sync {
    async fn capture(&self) -> Result<ScreenImage, AgentError>;

    async fn analyze(&self, image: &ScreenImage, query: &str) -> Result<String, AgentError>;
}

/// 脚本化感知后端：analyze 依次弹出预置文本，capture 返回固定尺寸空图；
/// fail_next_captures(n) 使接下来 n 次 capture 失败（重试路径测试用）
pub struct ScriptedPerception {
    analyses: Mutex<VecDeque<String>>,
    default_analysis: String,
    width: u32,
    height: u32,
    fail_captures: AtomicU32,
    analyze_calls: AtomicU32,
}

impl ScriptedPerception {
    pub fn new() -> Self {
        Self {
            analyses: Mutex::new(VecDeque::new()),
            default_analysis: "a desktop with an empty focused window".to_string(),
            width: 1280,
            height: 800,
            fail_captures: AtomicU32::new(0),
            analyze_calls: AtomicU32::new(0),
        }
    }

    pub fn with_analyses<I, S>(analyses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let p = Self::new();
        {
            let mut q = p.analyses.lock().unwrap();
            for a in analyses {
                q.push_back(a.into());
            }
        }
        p
    }

    /// 接下来 n 次 capture 返回 PerceptionFailure
    pub fn fail_next_captures(&self, n: u32) {
        self.fail_captures.store(n, Ordering::SeqCst);
    }

    /// analyze 被真正调用的次数（缓存命中不会计入）
    pub fn analyze_calls(&self) -> u32 {
        self.analyze_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedPerception {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Perception for ScriptedPerception {
    async fn capture(&self) -> Result<ScreenImage, AgentError> {
        let remaining = self.fail_captures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_captures.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::perception("scripted capture failure"));
        }
        Ok(ScreenImage {
            width: self.width,
            height: self.height,
            data: Vec::new(),
        })
    }

    async fn analyze(&self, _image: &ScreenImage, query: &str) -> Result<String, AgentError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        match self.analyses.lock().unwrap().pop_front() {
            Some(text) => Ok(text),
            None => Ok(format!("{} (query: {})", self.default_analysis, query)),
        }
    }
}
