//! 里程碑与任务计划
//!
//! 里程碑是协调器重规划的粒度：带显式成功标准与依赖，只有依赖全部完成才可启动；
//! attempts 由协调器在每次派发时累加，永不超过 max_attempts。

use serde::{Deserialize, Serialize};

use crate::agent::MilestoneBrief;
use crate::core::AgentError;

/// 里程碑状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// 等待依赖或排队
    Pending,
    /// 已派发给 worker
    InProgress,
    /// 成功
    Completed,
    /// 失败（可能等待重规划）
    Failed,
    /// 重规划后废弃
    Skipped,
}

/// 里程碑：由规划器创建，仅协调器改写，随任务一起销毁
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub description: String,
    pub success_criteria: String,
    pub status: MilestoneStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl Milestone {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        success_criteria: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            success_criteria: success_criteria.into(),
            status: MilestoneStatus::Pending,
            dependencies: Vec::new(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            error: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// 依赖全部完成才可启动
    pub fn can_start(&self, completed: &[String]) -> bool {
        self.status == MilestoneStatus::Pending
            && self.dependencies.iter().all(|d| completed.contains(d))
    }

    /// 派发：attempts 递增并进入 InProgress
    pub fn mark_in_progress(&mut self) {
        self.status = MilestoneStatus::InProgress;
        self.attempts += 1;
        debug_assert!(self.attempts <= self.max_attempts);
    }

    pub fn mark_completed(&mut self) {
        self.status = MilestoneStatus::Completed;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: AgentError) {
        self.status = MilestoneStatus::Failed;
        self.error = Some(error);
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// worker 需要的只读概要
    pub fn brief(&self) -> MilestoneBrief {
        MilestoneBrief {
            id: self.id.clone(),
            description: self.description.clone(),
            success_criteria: self.success_criteria.clone(),
        }
    }
}

/// 任务计划：有序里程碑 + 已完成集合 + 单调的 id 计数器（重规划不复用 id）
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub task: String,
    pub milestones: Vec<Milestone>,
    completed_ids: Vec<String>,
    next_id: u32,
}

impl TaskPlan {
    pub fn new(task: impl Into<String>, milestones: Vec<Milestone>) -> Self {
        let next_id = milestones.len() as u32 + 1;
        Self {
            task: task.into(),
            milestones,
            completed_ids: Vec::new(),
            next_id,
        }
    }

    /// 生成一个任务内从未用过的里程碑 id
    pub fn fresh_id(&mut self) -> String {
        let id = format!("milestone_{}", self.next_id);
        self.next_id += 1;
        id
    }

    pub fn completed_ids(&self) -> &[String] {
        &self.completed_ids
    }

    /// 下一个可启动的里程碑下标（按计划顺序走依赖序）
    pub fn next_ready(&self) -> Option<usize> {
        self.milestones
            .iter()
            .position(|m| m.can_start(&self.completed_ids))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Milestone> {
        self.milestones.iter_mut().find(|m| m.id == id)
    }

    pub fn mark_completed(&mut self, id: &str) {
        if let Some(m) = self.milestones.iter_mut().find(|m| m.id == id) {
            m.mark_completed();
            self.completed_ids.push(id.to_string());
        }
    }

    /// 全部完成（Skipped 不计入必要集）
    pub fn is_complete(&self) -> bool {
        self.milestones
            .iter()
            .all(|m| matches!(m.status, MilestoneStatus::Completed | MilestoneStatus::Skipped))
    }

    /// 重规划：失败里程碑由 replacement 原位接替（保留 id 与 attempts 计数），
    /// 其余未完成里程碑标记 Skipped 并追加新计划（全部新 id）。
    pub fn apply_replan(&mut self, failed_id: &str, replacements: Vec<Milestone>) {
        for m in self.milestones.iter_mut() {
            if matches!(m.status, MilestoneStatus::Pending) && m.id != failed_id {
                m.status = MilestoneStatus::Skipped;
            }
        }

        let mut replacements = replacements.into_iter();
        if let Some(first) = replacements.next() {
            if let Some(failed) = self.milestones.iter_mut().find(|m| m.id == failed_id) {
                // 原位接替：描述/标准更新，id 与 attempts 保留
                failed.description = first.description;
                failed.success_criteria = first.success_criteria;
                failed.status = MilestoneStatus::Pending;
                failed.error = None;
            }
        }
        self.milestones.extend(replacements);
    }
}
