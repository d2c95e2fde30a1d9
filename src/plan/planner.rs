//! 规划器
//!
//! 用低温度 prompt 把任务分解为带成功标准的有序里程碑（MILESTONE n: ... / SUCCESS: ... 行格式）。
//! 解析不出任何里程碑即 PlanningFailure（终止，不重试）。
//! 重规划时携带失败里程碑、错误与最近的审计片段。

use std::sync::Arc;

use crate::agent::Task;
use crate::audit::StepRecord;
use crate::core::AgentError;
use crate::llm::{GenerateOptions, ModelBackend};
use crate::plan::milestone::Milestone;

const PLANNER_SYSTEM: &str = "You are a strategic planner for desktop automation tasks. \
Break tasks into 1-5 measurable milestones. Each milestone has explicit success criteria \
and builds on the previous ones. Output strictly in this format:\n\
MILESTONE 1: <description>\nSUCCESS: <how to verify>\n\
MILESTONE 2: <description>\nSUCCESS: <how to verify>\n";

/// 规划器：持有模型后端；create_plan / replan 产出 (描述, 成功标准) 列表
pub struct Planner {
    model: Arc<dyn ModelBackend>,
    options: GenerateOptions,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelBackend>) -> Self {
        Self {
            model,
            options: GenerateOptions::planning(),
        }
    }

    /// 初始分解。模型错误按瞬态规则上浮（协调器决定是否重试调用）；
    /// 可解析为空则为 PlanningFailure。
    pub async fn create_plan(&self, task: &Task) -> Result<Vec<(String, String)>, AgentError> {
        let context = if task.context.is_empty() {
            "none".to_string()
        } else {
            task.context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let prompt = format!(
            "{PLANNER_SYSTEM}\nTask: {}\nContext: {}\n\nMilestones:",
            task.description, context
        );

        let response = self
            .model
            .generate(&prompt, &self.options)
            .await
            .map_err(AgentError::from)?;

        let milestones = parse_milestones(&response);
        if milestones.is_empty() {
            return Err(AgentError::planning(format!(
                "planner produced no parseable milestones from: {}",
                response.chars().take(200).collect::<String>()
            )));
        }
        tracing::info!(count = milestones.len(), "plan created");
        Ok(milestones)
    }

    /// 失败后的重规划：带失败里程碑、错误与最近审计片段，产出接替计划
    pub async fn replan(
        &self,
        task: &Task,
        failed: &Milestone,
        completed: &[String],
        recent_audit: &[StepRecord],
    ) -> Result<Vec<(String, String)>, AgentError> {
        let audit_lines: Vec<String> = recent_audit
            .iter()
            .map(|r| {
                format!(
                    "- step {}: action={} ok={}",
                    r.step_index,
                    r.action.as_ref().map(|a| a.action.kind_name()).unwrap_or("(none)"),
                    r.action.as_ref().map(|a| a.success).unwrap_or(false)
                )
            })
            .collect();
        let error = failed
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let prompt = format!(
            "{PLANNER_SYSTEM}\nOriginal task: {}\n\
             Failed milestone: {} (after {} attempts)\nError: {}\n\
             Completed milestones: {}\nRecent steps:\n{}\n\n\
             Produce an updated milestone list starting from the failed position:",
            task.description,
            failed.description,
            failed.attempts,
            error,
            if completed.is_empty() { "none".to_string() } else { completed.join(", ") },
            audit_lines.join("\n"),
        );

        let response = self
            .model
            .generate(&prompt, &self.options)
            .await
            .map_err(AgentError::from)?;

        let milestones = parse_milestones(&response);
        if milestones.is_empty() {
            return Err(AgentError::planning("replan produced no parseable milestones"));
        }
        tracing::info!(count = milestones.len(), failed = %failed.id, "replanned");
        Ok(milestones)
    }
}

/// 解析 MILESTONE n: ... / SUCCESS: ... 行格式；SUCCESS 缺省时给兜底标准
pub fn parse_milestones(response: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in response.lines() {
        let line = line.trim();
        let upper = line.to_uppercase();
        if upper.starts_with("MILESTONE") {
            if let Some(done) = current.take() {
                out.push(done);
            }
            let description = line
                .splitn(2, ':')
                .nth(1)
                .map(str::trim)
                .unwrap_or("")
                .to_string();
            if !description.is_empty() {
                current = Some((description, String::new()));
            }
        } else if upper.starts_with("SUCCESS") {
            if let Some((_, criteria)) = current.as_mut() {
                if let Some(text) = line.splitn(2, ':').nth(1) {
                    *criteria = text.trim().to_string();
                }
            }
        }
    }
    if let Some(done) = current.take() {
        out.push(done);
    }

    for (description, criteria) in out.iter_mut() {
        if criteria.is_empty() {
            *criteria = format!("'{description}' is visibly achieved");
        }
    }
    out
}
