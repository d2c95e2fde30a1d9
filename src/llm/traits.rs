//! 模型后端抽象
//!
//! 执行核心只消费 generate(prompt) -> text 契约；具体后端（OpenAI 兼容 / 本地模型 / Mock）
//! 由调用方注入。LlmError 按变体映射到 ModelFailure 的瞬态判定。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{AgentError, ErrorKind};

/// 模型调用失败的类型化错误；瞬态与否由 From<LlmError> 判定
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// 单次生成的参数（规划器用低温度）
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

impl GenerateOptions {
    /// 规划用：低温度、结构化输出
    pub fn planning() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

/// 模型后端契约：generate(prompt) -> text
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmError>;
}

/// 瞬态判定：超时 / 连接失败 / 限流 / 5xx 可重试；其余 4xx 与响应不可解析不重试
impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        let retryable = match &e {
            LlmError::Timeout | LlmError::Connection(_) | LlmError::RateLimited { .. } => true,
            LlmError::Status { status, .. } => *status >= 500 || *status == 429,
            LlmError::InvalidResponse(_) => false,
        };
        let err = AgentError::new(ErrorKind::ModelFailure, e.to_string());
        if retryable {
            err
        } else {
            err.not_retryable()
        }
    }
}
