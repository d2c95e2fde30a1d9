//! 动作后端契约与脚本化实现
//!
//! 执行核心只消费 execute(action) -> { success, payload } 契约；
//! 真实后端（enigo / xdotool / 平台 API）由调用方注入。
//! 脚本化实现记录全部已执行动作，并可预约接下来 n 次失败（恢复路径测试用）。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::actions::types::{ActionOutcome, ActionRecord};
use crate::core::AgentError;

/// 动作后端契约
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn execute(&self, action: &ActionRecord) -> Result<ActionOutcome, AgentError>;
}

/// 脚本化动作后端：成功执行并记账；fail_next(n) 使接下来 n 次执行返回 ActionFailure
pub struct ScriptedActionBackend {
    executed: Mutex<Vec<ActionRecord>>,
    fail_remaining: AtomicU32,
}

impl ScriptedActionBackend {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
        }
    }

    /// 预约接下来 n 次执行失败
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// 已真正到达后端的动作序列
    pub fn executed(&self) -> Vec<ActionRecord> {
        self.executed.lock().unwrap().clone()
    }
}

impl Default for ScriptedActionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionBackend for ScriptedActionBackend {
    async fn execute(&self, action: &ActionRecord) -> Result<ActionOutcome, AgentError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::action(format!(
                "scripted failure for {}",
                action.kind_name()
            )));
        }

        self.executed.lock().unwrap().push(action.clone());
        Ok(ActionOutcome::ok(
            action.clone(),
            json!({ "executed": action.kind_name() }),
        ))
    }
}
