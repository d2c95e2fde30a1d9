//! 脚本化模型后端（测试与离线 dry-run 用，无需 API）
//!
//! 按入队顺序依次弹出预置回复（或预置错误），并记录收到的 prompt；
//! 脚本耗尽后回落到 default_reply，避免测试悬挂。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{GenerateOptions, LlmError, ModelBackend};

/// 脚本化模型：replies 先进先出，空时返回 default_reply
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    default_reply: String,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            default_reply: "done".to_string(),
        }
    }

    /// 依次回复给定文本
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        {
            let mut script = model.script.lock().unwrap();
            for r in replies {
                script.push_back(Ok(r.into()));
            }
        }
        model
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// 入队一条成功回复
    pub fn enqueue_ok(&self, reply: impl Into<String>) {
        self.script.lock().unwrap().push_back(Ok(reply.into()));
    }

    /// 入队一条失败（如 503，用于重试路径测试）
    pub fn enqueue_err(&self, err: LlmError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// 已收到的全部 prompt（断言上下文拼装用）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// 已消费的调用次数
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModel {
    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.default_reply.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_order_and_fallback() {
        let model = ScriptedModel::with_replies(["first", "second"]);
        let opts = GenerateOptions::default();

        assert_eq!(model.generate("p1", &opts).await.unwrap(), "first");
        assert_eq!(model.generate("p2", &opts).await.unwrap(), "second");
        // 脚本耗尽后回落
        assert_eq!(model.generate("p3", &opts).await.unwrap(), "done");
        assert_eq!(model.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let model = ScriptedModel::new();
        model.enqueue_err(LlmError::Status { status: 503, message: "unavailable".into() });
        model.enqueue_ok("recovered");

        let opts = GenerateOptions::default();
        assert!(model.generate("p", &opts).await.is_err());
        assert_eq!(model.generate("p", &opts).await.unwrap(), "recovered");
    }
}
