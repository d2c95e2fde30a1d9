//! Worker 状态
//!
//! 每次里程碑执行持有一份独立的 AgentState：任务、里程碑概要、上下文、
//! 已走步骤与失败计数。单一 worker 独占可变访问，不跨线程共享。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::audit::StepRecord;
use crate::core::AgentError;

/// 用户任务：一次调用创建，之后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// 附加的不透明上下文（文件路径、偏好等）
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// 里程碑概要：worker 只需要 id、描述与成功标准
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneBrief {
    pub id: String,
    pub description: String,
    pub success_criteria: String,
}

/// 单次 worker 执行的全部状态
#[derive(Debug)]
pub struct AgentState {
    pub task: Task,
    pub milestone: Option<MilestoneBrief>,
    pub context: BTreeMap<String, String>,
    pub history: Vec<StepRecord>,
    pub step_index: usize,
    pub max_steps: usize,
    pub consecutive_failures: u32,
    pub result: Option<String>,
    pub terminal_error: Option<AgentError>,
}

impl AgentState {
    /// 无规划的平铺执行：直接面向任务
    pub fn for_task(task: Task, max_steps: usize) -> Self {
        let context = task.context.clone();
        Self {
            task,
            milestone: None,
            context,
            history: Vec::new(),
            step_index: 0,
            max_steps,
            consecutive_failures: 0,
            result: None,
            terminal_error: None,
        }
    }

    /// 面向某个里程碑的 worker 状态（历史全新，上下文继承任务）
    pub fn for_milestone(task: Task, milestone: MilestoneBrief, max_steps: usize) -> Self {
        let mut state = Self::for_task(task, max_steps);
        state.milestone = Some(milestone);
        state
    }

    pub fn milestone_id(&self) -> Option<&str> {
        self.milestone.as_ref().map(|m| m.id.as_str())
    }

    /// 当前聚焦的目标文本：里程碑描述，退化时为任务描述
    pub fn goal(&self) -> &str {
        self.milestone
            .as_ref()
            .map(|m| m.description.as_str())
            .unwrap_or(&self.task.description)
    }

    /// 最近 n 条历史（prompt 拼装用）
    pub fn recent_history(&self, n: usize) -> &[StepRecord] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_milestone_inherits_context() {
        let task = Task::new("write a letter").with_context("text", "Dear Ada");
        let brief = MilestoneBrief {
            id: "milestone_1".into(),
            description: "open the editor".into(),
            success_criteria: "editor visible".into(),
        };
        let state = AgentState::for_milestone(task, brief, 15);

        assert_eq!(state.context.get("text").map(String::as_str), Some("Dear Ada"));
        assert_eq!(state.goal(), "open the editor");
        assert_eq!(state.milestone_id(), Some("milestone_1"));
        assert_eq!(state.max_steps, 15);
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_goal_falls_back_to_task() {
        let state = AgentState::for_task(Task::new("just do it"), 10);
        assert_eq!(state.goal(), "just do it");
        assert!(state.milestone_id().is_none());
    }
}
