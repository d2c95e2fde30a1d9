//! 错误分类与恢复倾向
//!
//! 封闭的 ErrorKind 集合，每类错误带默认的 retryable 倾向；
//! 引擎按 kind 路由（本地重试 / 上浮协调器 / 直接终止），不做消息文本再解析。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别（封闭集合，新增类别是编译期变更）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 工具调用返回失败
    ToolFailure,
    /// 输入动作未生效（点击/输入等）
    ActionFailure,
    /// 截屏或屏幕分析不可用/不可解析
    PerceptionFailure,
    /// LLM 调用失败（网络、5xx、超时）
    ModelFailure,
    /// 规划器无法产出可用的分解（上浮，不重试）
    PlanningFailure,
    /// 动作后校验拒绝了新状态
    VerificationFailure,
    /// 观察到协作式取消（终止）
    CancelRequested,
    /// 步数 / 尝试次数 / 时间预算耗尽（终止）
    BudgetExhausted,
    /// 试图执行允许集合之外的动作（终止）
    PolicyViolation,
}

impl ErrorKind {
    /// 默认恢复倾向；ModelFailure 的瞬态判定见 `llm` 模块的 From<LlmError>
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ToolFailure
                | ErrorKind::ActionFailure
                | ErrorKind::PerceptionFailure
                | ErrorKind::ModelFailure
                | ErrorKind::VerificationFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ToolFailure => "tool_failure",
            ErrorKind::ActionFailure => "action_failure",
            ErrorKind::PerceptionFailure => "perception_failure",
            ErrorKind::ModelFailure => "model_failure",
            ErrorKind::PlanningFailure => "planning_failure",
            ErrorKind::VerificationFailure => "verification_failure",
            ErrorKind::CancelRequested => "cancel_requested",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::PolicyViolation => "policy_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带类别与上下文的错误记录；整个执行核心的失败值类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            context: BTreeMap::new(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolFailure, message)
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionFailure, message)
    }

    pub fn perception(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PerceptionFailure, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelFailure, message)
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlanningFailure, message)
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VerificationFailure, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::CancelRequested, "cancel requested")
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExhausted, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyViolation, message)
    }

    /// 覆盖默认恢复倾向（如非瞬态的 4xx ModelFailure）
    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
