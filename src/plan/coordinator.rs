//! 规划/执行协调器
//!
//! 任务入口：规划器产出里程碑 -> 按依赖序逐个派发给步进图引擎 ->
//! 失败时在 attempts 限额内带失败上下文重规划 -> 全部完成 / 限额耗尽 / 取消时终止。
//! 记忆与缓存跨里程碑共享，历史每里程碑全新。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::actions::{ActionBackend, AppAllowlist};
use crate::agent::{AgentState, EngineConfig, StepEngine, Task};
use crate::audit::{AuditLog, StepRecord};
use crate::cache::ToolCache;
use crate::core::{AgentError, BackoffPolicy, Clock, ErrorKind, SystemClock};
use crate::llm::ModelBackend;
use crate::memory::{ArchivalStore, HierarchicalMemory};
use crate::observability::Metrics;
use crate::plan::milestone::{Milestone, MilestoneStatus, TaskPlan};
use crate::plan::planner::Planner;
use crate::vlm::Perception;

/// 重规划 prompt 携带的审计片段长度
const REPLAN_AUDIT_WINDOW: usize = 5;
/// 里程碑结果写入记忆的优先级（高于步骤摘要）
const MILESTONE_MEMORY_PRIORITY: u8 = 7;

/// 运行选项（默认值与对外契约一致）
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_steps_per_milestone: usize,
    pub max_retries: u32,
    pub max_milestone_attempts: u32,
    /// 活跃上下文字节预算
    pub active_context_budget: usize,
    pub checkpoint_every: usize,
    pub enable_planner: bool,
    pub enable_verification: bool,
    /// 连续失败终止阈值
    pub failure_threshold: u32,
    pub step_timeout: Duration,
    /// 固定抖动种子（确定性运行用）
    pub jitter_seed: Option<u64>,
    /// 任务目录（audit.log / checkpoints/）；None 时仅内存
    pub storage_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps_per_milestone: 15,
            max_retries: 3,
            max_milestone_attempts: 2,
            active_context_budget: 16 * 1024,
            checkpoint_every: 5,
            enable_planner: true,
            enable_verification: true,
            failure_threshold: 5,
            step_timeout: Duration::from_secs(30),
            jitter_seed: None,
            storage_dir: None,
        }
    }
}

/// 注入的协作方集合；时钟也是协作方（确定性测试注入 ManualClock）
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn ModelBackend>,
    pub perception: Arc<dyn Perception>,
    pub actions: Arc<dyn ActionBackend>,
    pub allowlist: Arc<dyn AppAllowlist>,
    pub archival: Arc<dyn ArchivalStore>,
    /// worker 间共享的工具结果缓存；get/put/invalidate 线性化
    pub cache: Arc<ToolCache>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        model: Arc<dyn ModelBackend>,
        perception: Arc<dyn Perception>,
        actions: Arc<dyn ActionBackend>,
        allowlist: Arc<dyn AppAllowlist>,
        archival: Arc<dyn ArchivalStore>,
    ) -> Self {
        Self {
            model,
            perception,
            actions,
            allowlist,
            archival,
            cache: Arc::new(ToolCache::new(128, Duration::from_secs(300))),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ToolCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// 任务终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Cancelled,
}

/// 每次里程碑派发的结果条目
#[derive(Debug, Clone, serde::Serialize)]
pub struct MilestoneOutcome {
    pub id: String,
    pub description: String,
    pub status: MilestoneStatus,
    pub attempts: u32,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

/// run_task 的返回值
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub milestones: Vec<MilestoneOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_error: Option<AgentError>,
    /// 复现决策所需的审计尾部（已脱敏）
    pub audit_tail: Vec<StepRecord>,
}

/// 外部取消句柄：cancel() 置位后在下一个节点边界生效
#[derive(Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// 协调器：持有协作方与选项，每次 run 走完整个任务生命周期
pub struct Coordinator {
    collab: Collaborators,
    options: RunOptions,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(collab: Collaborators, options: RunOptions) -> Self {
        Self {
            collab,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// 取消句柄；可在 run 之前或运行中任意时刻取出
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retries: self.options.max_retries,
            failure_threshold: self.options.failure_threshold,
            enable_verification: self.options.enable_verification,
            step_timeout: self.options.step_timeout,
            observe_query: None,
            history_window: 5,
            jitter_seed: self.options.jitter_seed,
        }
    }

    fn build_audit(&self) -> Result<AuditLog, AgentError> {
        let log = AuditLog::new(self.options.checkpoint_every).with_clock(self.collab.clock.clone());
        match &self.options.storage_dir {
            Some(dir) => log.with_dir(dir),
            None => Ok(log),
        }
    }

    /// 阻塞到终止：完成 / 失败 / 取消
    pub async fn run(&self, task: Task) -> TaskResult {
        let mut audit = match self.build_audit() {
            Ok(a) => a,
            Err(e) => return failed_result(e, Vec::new(), &AuditLog::new(1)),
        };
        let mut memory = HierarchicalMemory::new(
            self.options.active_context_budget,
            self.collab.archival.clone(),
        );
        let engine = StepEngine::new(
            self.collab.model.clone(),
            self.collab.perception.clone(),
            self.collab.actions.clone(),
            self.collab.allowlist.clone(),
            self.collab.cache.clone(),
            self.engine_config(),
        );

        if !self.options.enable_planner {
            return self.run_flat(task, engine, &mut memory, &mut audit).await;
        }

        let planner = Planner::new(self.collab.model.clone());
        let mut outcomes: Vec<MilestoneOutcome> = Vec::new();

        // 初始规划；瞬态模型错误按退避重试，规划失败直接终止
        let parsed = match self.plan_with_retry(&planner, &task).await {
            Ok(p) => p,
            Err(e) => return failed_result(e, outcomes, &audit),
        };
        let milestones: Vec<Milestone> = parsed
            .into_iter()
            .enumerate()
            .map(|(i, (description, criteria))| {
                Milestone::new(
                    format!("milestone_{}", i + 1),
                    description,
                    criteria,
                    self.options.max_milestone_attempts,
                )
            })
            .collect();
        let mut plan = TaskPlan::new(task.description.clone(), milestones);

        loop {
            if self.cancel.is_cancelled() {
                return cancelled_result(outcomes, &audit);
            }

            let Some(idx) = plan.next_ready() else {
                break;
            };
            let (brief, milestone_id) = {
                let milestone = &mut plan.milestones[idx];
                milestone.mark_in_progress();
                tracing::info!(
                    milestone = %milestone.id,
                    attempt = milestone.attempts,
                    "dispatching milestone"
                );
                (milestone.brief(), milestone.id.clone())
            };

            let mut state = AgentState::for_milestone(
                task.clone(),
                brief,
                self.options.max_steps_per_milestone,
            );
            let run_result = engine
                .run(&mut state, &mut memory, &mut audit, &self.cancel)
                .await;

            match run_result {
                Ok(result) => {
                    plan.mark_completed(&milestone_id);
                    let milestone = plan.get_mut(&milestone_id).expect("milestone exists");
                    outcomes.push(outcome_of(milestone, &state, Some(result.clone()), None));

                    let mem_id = format!("{milestone_id}-result");
                    let summary = format!("milestone '{}' done: {}", milestone.description, result);
                    if let Err(e) = memory.add_to_active(
                        mem_id,
                        summary,
                        MILESTONE_MEMORY_PRIORITY,
                        vec!["milestone".into()],
                    ) {
                        tracing::warn!(error = %e, "milestone result not added to memory");
                    }
                }
                Err(err) if err.kind == ErrorKind::CancelRequested => {
                    let milestone = plan.get_mut(&milestone_id).expect("milestone exists");
                    milestone.mark_failed(err.clone());
                    outcomes.push(outcome_of(milestone, &state, None, Some(err)));
                    return cancelled_result(outcomes, &audit);
                }
                Err(err) => {
                    let can_retry;
                    {
                        let milestone = plan.get_mut(&milestone_id).expect("milestone exists");
                        milestone.mark_failed(err.clone());
                        outcomes.push(outcome_of(milestone, &state, None, Some(err.clone())));
                        can_retry = milestone.can_retry();
                    }

                    if !(replan_eligible(&err) && can_retry) {
                        return failed_result(err, outcomes, &audit);
                    }

                    Metrics::global().plan.record_replan();
                    let replacements = {
                        let failed = plan.get_mut(&milestone_id).expect("milestone exists");
                        let failed_snapshot = failed.clone();
                        match self
                            .replan_with_retry(&planner, &task, &failed_snapshot, &plan, &audit)
                            .await
                        {
                            Ok(r) => r,
                            Err(e) => return failed_result(e, outcomes, &audit),
                        }
                    };
                    let replacements: Vec<Milestone> = {
                        let mut out = Vec::new();
                        for (i, (description, criteria)) in replacements.into_iter().enumerate() {
                            let id = if i == 0 { String::new() } else { plan.fresh_id() };
                            out.push(Milestone::new(
                                id,
                                description,
                                criteria,
                                self.options.max_milestone_attempts,
                            ));
                        }
                        out
                    };
                    plan.apply_replan(&milestone_id, replacements);
                }
            }
        }

        if plan.is_complete() {
            let result = outcomes
                .iter()
                .filter(|o| o.status == MilestoneStatus::Completed)
                .filter_map(|o| o.result.clone())
                .collect::<Vec<_>>()
                .join("; ");
            TaskResult {
                status: TaskStatus::Completed,
                result: Some(result),
                milestones: outcomes,
                terminal_error: None,
                audit_tail: audit_tail(&audit),
            }
        } else {
            // 依赖环或全部被 Skipped 而无可派发项
            failed_result(
                AgentError::planning("no dispatchable milestone remains"),
                outcomes,
                &audit,
            )
        }
    }

    /// 无规划的平铺执行：单个 worker 直接面向任务
    async fn run_flat(
        &self,
        task: Task,
        engine: StepEngine,
        memory: &mut HierarchicalMemory,
        audit: &mut AuditLog,
    ) -> TaskResult {
        let mut state =
            AgentState::for_task(task, self.options.max_steps_per_milestone);
        let run_result = engine.run(&mut state, memory, audit, &self.cancel).await;

        let outcome = MilestoneOutcome {
            id: "task".to_string(),
            description: state.task.description.clone(),
            status: match &run_result {
                Ok(_) => MilestoneStatus::Completed,
                Err(_) => MilestoneStatus::Failed,
            },
            attempts: 1,
            steps: state.step_index,
            result: state.result.clone(),
            error: state.terminal_error.clone(),
        };

        match run_result {
            Ok(result) => TaskResult {
                status: TaskStatus::Completed,
                result: Some(result),
                milestones: vec![outcome],
                terminal_error: None,
                audit_tail: audit_tail(audit),
            },
            Err(err) if err.kind == ErrorKind::CancelRequested => {
                cancelled_result(vec![outcome], audit)
            }
            Err(err) => failed_result(err, vec![outcome], audit),
        }
    }

    /// 初始规划调用；仅瞬态模型错误重试
    async fn plan_with_retry(
        &self,
        planner: &Planner,
        task: &Task,
    ) -> Result<Vec<(String, String)>, AgentError> {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::cancelled());
            }
            match planner.create_plan(task).await {
                Ok(p) => return Ok(p),
                Err(e) if e.retryable && attempt < self.options.max_retries => {
                    let delay = backoff.delay(attempt);
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "planning retry after backoff");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn replan_with_retry(
        &self,
        planner: &Planner,
        task: &Task,
        failed: &Milestone,
        plan: &TaskPlan,
        audit: &AuditLog,
    ) -> Result<Vec<(String, String)>, AgentError> {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::cancelled());
            }
            match planner
                .replan(task, failed, plan.completed_ids(), audit.recent(REPLAN_AUDIT_WINDOW))
                .await
            {
                Ok(p) => return Ok(p),
                Err(e) if e.retryable && attempt < self.options.max_retries => {
                    let delay = backoff.delay(attempt);
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "replanning retry after backoff");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(16),
            0.2,
            self.options.max_retries,
        );
        match self.options.jitter_seed {
            Some(seed) => policy.with_seed(seed),
            None => policy,
        }
    }
}

/// 里程碑级重试资格：步级可重试的类别 + 步数预算耗尽（重规划正是为它准备的）
fn replan_eligible(err: &AgentError) -> bool {
    match err.kind {
        ErrorKind::ActionFailure
        | ErrorKind::ToolFailure
        | ErrorKind::PerceptionFailure
        | ErrorKind::VerificationFailure
        | ErrorKind::BudgetExhausted => true,
        ErrorKind::ModelFailure => err.retryable,
        ErrorKind::PlanningFailure | ErrorKind::PolicyViolation | ErrorKind::CancelRequested => {
            false
        }
    }
}

fn outcome_of(
    milestone: &Milestone,
    state: &AgentState,
    result: Option<String>,
    error: Option<AgentError>,
) -> MilestoneOutcome {
    MilestoneOutcome {
        id: milestone.id.clone(),
        description: milestone.description.clone(),
        status: milestone.status,
        attempts: milestone.attempts,
        steps: state.step_index,
        result,
        error,
    }
}

fn audit_tail(audit: &AuditLog) -> Vec<StepRecord> {
    audit.recent(20).iter().map(crate::audit::redact_record).collect()
}

fn failed_result(
    error: AgentError,
    outcomes: Vec<MilestoneOutcome>,
    audit: &AuditLog,
) -> TaskResult {
    TaskResult {
        status: TaskStatus::Failed,
        result: None,
        milestones: outcomes,
        terminal_error: Some(error),
        audit_tail: audit_tail(audit),
    }
}

fn cancelled_result(outcomes: Vec<MilestoneOutcome>, audit: &AuditLog) -> TaskResult {
    TaskResult {
        status: TaskStatus::Cancelled,
        result: None,
        milestones: outcomes,
        terminal_error: Some(AgentError::cancelled()),
        audit_tail: audit_tail(audit),
    }
}

/// 便捷入口：构造协调器并阻塞运行（取消需先构造 Coordinator 拿句柄）
pub async fn run_task(collab: Collaborators, task: Task, options: RunOptions) -> TaskResult {
    Coordinator::new(collab, options).run(task).await
}
