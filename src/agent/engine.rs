//! 步进图引擎
//!
//! 每个 worker 跑一条 Observe -> Reason -> Act -> Verify -> Decide 的状态机：
//! 可重试错误进入 Recover（指数退避 + 恢复上下文注入下一次 prompt），
//! 不可重试错误直接终止并上浮协调器。取消只在节点边界检查，
//! 进行中的协作方调用不被强行打断；终止前一定先提交检查点。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::actions::{
    ActionBackend, ActionOutcome, ActionRecord, AppAllowlist, IntentParser,
};
use crate::audit::{AuditLog, StepRecord};
use crate::cache::{fingerprint, InvalidationRules, ToolCache};
use crate::core::{AgentError, BackoffPolicy};
use crate::llm::{GenerateOptions, ModelBackend};
use crate::memory::HierarchicalMemory;
use crate::observability::Metrics;
use crate::vlm::Perception;

use super::state::AgentState;

/// 恢复上下文取最近几条审计记录
const RECOVERY_WINDOW: usize = 3;
/// 步骤摘要写入活跃记忆的优先级
const STEP_MEMORY_PRIORITY: u8 = 5;

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 单节点内最大重试次数
    pub max_retries: u32,
    /// 连续失败达到该值即终止（BudgetExhausted）
    pub failure_threshold: u32,
    pub enable_verification: bool,
    /// 每次协作方调用的截止时长
    pub step_timeout: Duration,
    /// Observe 节点的常驻分析查询；None 时观察仅含截屏摘要
    pub observe_query: Option<String>,
    /// prompt 中携带的最近历史条数
    pub history_window: usize,
    /// 固定抖动种子（确定性运行用）
    pub jitter_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            failure_threshold: 5,
            enable_verification: true,
            step_timeout: Duration::from_secs(30),
            observe_query: None,
            history_window: 5,
            jitter_seed: None,
        }
    }
}

/// Recover 节点的决策
enum RecoveryPlan {
    Retry { delay: Duration },
    Abort(AgentError),
}

/// 步进图引擎：协作方全部显式注入，无进程级可变状态
pub struct StepEngine {
    model: Arc<dyn ModelBackend>,
    perception: Arc<dyn Perception>,
    actions: Arc<dyn ActionBackend>,
    allowlist: Arc<dyn AppAllowlist>,
    cache: Arc<ToolCache>,
    rules: InvalidationRules,
    parser: IntentParser,
    config: EngineConfig,
}

impl StepEngine {
    pub fn new(
        model: Arc<dyn ModelBackend>,
        perception: Arc<dyn Perception>,
        actions: Arc<dyn ActionBackend>,
        allowlist: Arc<dyn AppAllowlist>,
        cache: Arc<ToolCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            perception,
            actions,
            allowlist,
            cache,
            rules: InvalidationRules::default(),
            parser: IntentParser::new(),
            config,
        }
    }

    pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    /// 执行一次 worker 调用直至终止；Ok 为结果摘要，Err 为终止错误。
    /// state 同时记下 result / terminal_error 与完整历史。
    pub async fn run(
        &self,
        state: &mut AgentState,
        memory: &mut HierarchicalMemory,
        audit: &mut AuditLog,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let result = self.run_inner(state, memory, audit, cancel).await;
        match &result {
            Ok(r) => state.result = Some(r.clone()),
            Err(e) => state.terminal_error = Some(e.clone()),
        }
        result
    }

    async fn run_inner(
        &self,
        state: &mut AgentState,
        memory: &mut HierarchicalMemory,
        audit: &mut AuditLog,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut backoff = BackoffPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(16),
            0.2,
            self.config.max_retries,
        );
        if let Some(seed) = self.config.jitter_seed {
            backoff = backoff.with_seed(seed);
        }
        let mut noaction_streak = 0u32;
        // 新派发：step_index 从 0 起，审计单调性按派发计
        audit.begin_worker();

        loop {
            // 节点边界：每轮入口
            if cancel.is_cancelled() {
                return self.exit_cancelled(state, memory, audit, None);
            }
            if state.step_index >= state.max_steps {
                return self.exit_terminal(
                    state,
                    memory,
                    audit,
                    AgentError::budget(format!("step limit {} reached", state.max_steps)),
                );
            }

            // ---- Observe ----
            let last_action_note = state
                .history
                .last()
                .and_then(|r| r.action.as_ref())
                .map(|o| {
                    format!(
                        "; last action {} {}",
                        o.action.kind_name(),
                        if o.success { "ok" } else { "failed" }
                    )
                })
                .unwrap_or_default();
            let mut attempt = 0u32;
            let mut recovery_note: Option<String> = None;
            let observation = loop {
                match self.observe(&last_action_note).await {
                    Ok(o) => break o,
                    Err(e) => match self.plan_recovery(&e, attempt, state.consecutive_failures, &mut backoff) {
                        RecoveryPlan::Retry { delay } => {
                            attempt += 1;
                            state.consecutive_failures += 1;
                            recovery_note =
                                Some(audit.recovery_context(&e, RECOVERY_WINDOW).to_prompt_section());
                            tracing::warn!(node = "observe", error = %e, attempt, "retrying after backoff");
                            tokio::time::sleep(delay).await;
                            if cancel.is_cancelled() {
                                return self.exit_cancelled(state, memory, audit, None);
                            }
                        }
                        RecoveryPlan::Abort(err) => {
                            return self.exit_terminal(state, memory, audit, err)
                        }
                    },
                }
            };

            if cancel.is_cancelled() {
                return self.exit_cancelled(state, memory, audit, None);
            }

            // ---- Reason ----
            let mut attempt = 0u32;
            let reasoning = loop {
                let prompt = self.build_prompt(state, memory, recovery_note.as_deref());
                match self.generate(&prompt, &GenerateOptions::default()).await {
                    Ok(text) => break text,
                    Err(e) => match self.plan_recovery(&e, attempt, state.consecutive_failures, &mut backoff) {
                        RecoveryPlan::Retry { delay } => {
                            attempt += 1;
                            state.consecutive_failures += 1;
                            recovery_note =
                                Some(audit.recovery_context(&e, RECOVERY_WINDOW).to_prompt_section());
                            tracing::warn!(node = "reason", error = %e, attempt, "retrying after backoff");
                            tokio::time::sleep(delay).await;
                            if cancel.is_cancelled() {
                                return self.exit_cancelled(state, memory, audit, None);
                            }
                        }
                        RecoveryPlan::Abort(err) => {
                            return self.exit_terminal(state, memory, audit, err)
                        }
                    },
                }
            };

            // 节点边界：Reason 与 Act 之间。此处取消产生无动作的截断记录。
            if cancel.is_cancelled() {
                return self.exit_cancelled(state, memory, audit, Some((observation, reasoning)));
            }

            // ---- Act ----
            // 连续两步 NoAction 后强制一次屏幕分析，打破空转循环
            let (action, confidence) = if noaction_streak >= 2 {
                (ActionRecord::AnalyzeScreen { query: reasoning.clone() }, 1.0)
            } else {
                match self.parser.parse(
                    &reasoning,
                    &state.context,
                    &state.task.description,
                    self.allowlist.as_ref(),
                ) {
                    Ok(parsed) => (parsed.action, parsed.confidence),
                    Err(err) => {
                        // PolicyViolation：不执行、不失效缓存，记录后直接终止
                        self.commit_step(
                            state,
                            memory,
                            audit,
                            observation,
                            reasoning,
                            None,
                            1.0,
                            Some(err.clone()),
                        )?;
                        return self.exit_terminal(state, memory, audit, err);
                    }
                }
            };

            if matches!(action, ActionRecord::TaskComplete) {
                let outcome = ActionOutcome::ok(ActionRecord::TaskComplete, json!({}));
                self.commit_step(
                    state,
                    memory,
                    audit,
                    observation,
                    reasoning.clone(),
                    Some(outcome),
                    confidence,
                    None,
                )?;
                self.commit_checkpoint(state, memory, audit)?;
                let summary = format!("completed after {} steps", state.step_index);
                tracing::info!(goal = state.goal(), steps = state.step_index, "worker completed");
                return Ok(summary);
            }

            noaction_streak = if matches!(action, ActionRecord::NoAction { .. }) {
                noaction_streak + 1
            } else {
                0
            };

            let mut attempt = 0u32;
            let outcome = loop {
                match self.execute_action(&action).await {
                    Ok(o) => break o,
                    Err(e) => match self.plan_recovery(&e, attempt, state.consecutive_failures, &mut backoff) {
                        RecoveryPlan::Retry { delay } => {
                            attempt += 1;
                            state.consecutive_failures += 1;
                            tracing::warn!(node = "act", action = action.kind_name(), error = %e, attempt, "retrying after backoff");
                            tokio::time::sleep(delay).await;
                            if cancel.is_cancelled() {
                                return self.exit_cancelled(state, memory, audit, None);
                            }
                        }
                        RecoveryPlan::Abort(err) => {
                            // 终止前把已走到的步骤记入审计
                            self.commit_step(
                                state,
                                memory,
                                audit,
                                observation,
                                reasoning,
                                None,
                                confidence,
                                Some(err.clone()),
                            )?;
                            return self.exit_terminal(state, memory, audit, err);
                        }
                    },
                }
            };

            if cancel.is_cancelled() {
                return self.exit_cancelled(state, memory, audit, None);
            }

            // ---- Verify ----
            let mut step_error: Option<AgentError> = None;
            if self.config.enable_verification && outcome.success && outcome.action.is_mutating() {
                match self.verify(&outcome, state).await {
                    Ok(true) => {}
                    Ok(false) => {
                        step_error = Some(AgentError::verification(format!(
                            "post-action state rejected for {}",
                            outcome.action.kind_name()
                        )));
                    }
                    Err(e) => {
                        step_error = Some(AgentError::verification(format!(
                            "verification unavailable: {e}"
                        )));
                    }
                }
            }

            // ---- Decide ----
            let step_ok = outcome.success && step_error.is_none();
            self.commit_step(
                state,
                memory,
                audit,
                observation,
                reasoning,
                Some(outcome),
                confidence,
                step_error,
            )?;

            if step_ok {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    return self.exit_terminal(
                        state,
                        memory,
                        audit,
                        AgentError::budget(format!(
                            "{} consecutive failures (threshold {})",
                            state.consecutive_failures, self.config.failure_threshold
                        )),
                    );
                }
            }
        }
    }

    /// Observe：截屏摘要 + 上一步动作结果；配置了常驻查询时附带（缓存的）屏幕分析
    async fn observe(&self, last_action_note: &str) -> Result<String, AgentError> {
        let image = tokio::time::timeout(self.config.step_timeout, self.perception.capture())
            .await
            .map_err(|_| AgentError::perception("screen capture timed out"))??;

        let mut observation = format!(
            "screen {}x{} captured{}",
            image.width, image.height, last_action_note
        );
        if let Some(query) = &self.config.observe_query {
            let analysis = self.analyze_cached(query).await?;
            observation.push_str("; ");
            observation.push_str(&analysis);
        }
        Ok(observation)
    }

    /// 模型调用（带截止时长与指标记账）
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, AgentError> {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(self.config.step_timeout, self.model.generate(prompt, options))
            .await
            .map_err(|_| AgentError::model("model call timed out"))?
            .map_err(AgentError::from);
        Metrics::global().model.record_call(result.is_ok(), start.elapsed());
        result
    }

    /// 屏幕分析：唯一走缓存的观察工具。键为 (screen_analyzer, {query})，tag 为感知类。
    async fn analyze_cached(&self, query: &str) -> Result<String, AgentError> {
        let args = json!({ "query": query });
        let key = fingerprint("screen_analyzer", &args);

        if let Some(value) = self.cache.get(&key) {
            if let Value::String(text) = value {
                tracing::debug!(query, "screen analysis served from cache");
                return Ok(text);
            }
        }

        let image = tokio::time::timeout(self.config.step_timeout, self.perception.capture())
            .await
            .map_err(|_| AgentError::perception("screen capture timed out"))??;
        let text = tokio::time::timeout(
            self.config.step_timeout,
            self.perception.analyze(&image, query),
        )
        .await
        .map_err(|_| AgentError::perception("screen analysis timed out"))??;

        self.cache.put(
            key,
            Value::String(text.clone()),
            ["screen", "screen_analyzer"],
            None,
        );
        Ok(text)
    }

    /// 执行动作。变更型动作在执行前按规则清缓存（Act -> Observe 边上的同步失效）。
    async fn execute_action(&self, action: &ActionRecord) -> Result<ActionOutcome, AgentError> {
        match action {
            ActionRecord::NoAction { reason } => Ok(ActionOutcome::ok(
                action.clone(),
                json!({ "reason": reason }),
            )),
            ActionRecord::AnalyzeScreen { query } => {
                let analysis = self.analyze_cached(query).await?;
                Ok(ActionOutcome::ok(action.clone(), json!({ "analysis": analysis })))
            }
            ActionRecord::TaskComplete => Ok(ActionOutcome::ok(action.clone(), json!({}))),
            _ => {
                if action.is_mutating() {
                    let dropped = self.cache.invalidate(self.rules.tags_for(action));
                    if dropped > 0 {
                        tracing::debug!(action = action.kind_name(), dropped, "cache invalidated");
                    }
                }
                let start = std::time::Instant::now();
                let result = tokio::time::timeout(self.config.step_timeout, self.actions.execute(action))
                    .await
                    .map_err(|_| {
                        AgentError::action(format!("{} timed out", action.kind_name()))
                    })?;
                Metrics::global()
                    .actions
                    .record_execution(result.as_ref().map(|o| o.success).unwrap_or(false), start.elapsed());
                result
            }
        }
    }

    /// Verify：让模型对「动作是否朝目标生效」做 YES/NO 判定
    async fn verify(&self, outcome: &ActionOutcome, state: &AgentState) -> Result<bool, AgentError> {
        let prompt = format!(
            "Goal: {}\nAction just executed: {} (payload: {})\n\
             Did this action take effect toward the goal? Answer YES or NO with a short reason.",
            state.goal(),
            outcome.action.kind_name(),
            outcome.payload
        );
        let reply = self.generate(&prompt, &GenerateOptions::default()).await?;
        let upper = reply.trim().to_uppercase();
        Ok(upper.starts_with("YES") || upper.starts_with("OK"))
    }

    /// Recover 决策：不可重试 / 重试耗尽 -> 终止；连续失败达阈值 -> BudgetExhausted
    fn plan_recovery(
        &self,
        err: &AgentError,
        attempt: u32,
        consecutive_failures: u32,
        backoff: &mut BackoffPolicy,
    ) -> RecoveryPlan {
        if !err.retryable {
            return RecoveryPlan::Abort(err.clone());
        }
        if consecutive_failures + 1 >= self.config.failure_threshold {
            return RecoveryPlan::Abort(AgentError::budget(format!(
                "{} consecutive failures (threshold {})",
                consecutive_failures + 1,
                self.config.failure_threshold
            )));
        }
        if attempt >= self.config.max_retries {
            return RecoveryPlan::Abort(err.clone());
        }
        RecoveryPlan::Retry { delay: backoff.delay(attempt) }
    }

    /// 拼装 Reason 的 prompt：任务 + 里程碑 + 上下文 + 最近历史 + 活跃记忆 + 恢复上下文
    fn build_prompt(
        &self,
        state: &AgentState,
        memory: &HierarchicalMemory,
        recovery: Option<&str>,
    ) -> String {
        let mut s = String::new();
        s.push_str(&format!("## Task\n{}\n\n", state.task.description));

        if let Some(m) = &state.milestone {
            s.push_str(&format!(
                "## Current Milestone ({})\n{}\nSuccess criteria: {}\n\n",
                m.id, m.description, m.success_criteria
            ));
        }

        if !state.context.is_empty() {
            s.push_str("## Context\n");
            for (k, v) in &state.context {
                s.push_str(&format!("- {k}: {v}\n"));
            }
            s.push('\n');
        }

        let recent = state.recent_history(self.config.history_window);
        if !recent.is_empty() {
            s.push_str("## Recent Steps\n");
            for rec in recent {
                let action = rec
                    .action
                    .as_ref()
                    .map(|a| format!("{} ok={}", a.action.kind_name(), a.success))
                    .unwrap_or_else(|| "(no action)".to_string());
                s.push_str(&format!("- step {}: {} | {}\n", rec.step_index, action, rec.observation));
            }
            s.push('\n');
        }

        let items = memory.read_active();
        if !items.is_empty() {
            s.push_str("## Working Memory\n");
            for item in items {
                let preview: String = item.content.chars().take(200).collect();
                s.push_str(&format!("- [{}] {}\n", item.id, preview));
            }
            s.push('\n');
        }

        if let Some(r) = recovery {
            s.push_str(r);
            s.push('\n');
        }

        s.push_str(
            "Decide the single next input action and state it imperatively, e.g. \
             open notepad / type \"...\" / press enter / click at (x, y) / analyze the screen / done.\n",
        );
        s
    }

    /// 提交一步：审计追加、历史入栈、步骤摘要写入记忆、步进、按节奏落检查点
    #[allow(clippy::too_many_arguments)]
    fn commit_step(
        &self,
        state: &mut AgentState,
        memory: &mut HierarchicalMemory,
        audit: &mut AuditLog,
        observation: String,
        reasoning: String,
        action: Option<ActionOutcome>,
        confidence: f64,
        error: Option<AgentError>,
    ) -> Result<(), AgentError> {
        let record = StepRecord {
            step_index: state.step_index,
            milestone_id: state.milestone_id().map(str::to_string),
            observation,
            reasoning,
            action,
            confidence,
            timestamp_ms: audit.now_ms(),
            error,
        };
        audit.append(record.clone())?;

        let summary = format!(
            "step {}: {} -> {}",
            record.step_index,
            record
                .action
                .as_ref()
                .map(|a| a.action.kind_name())
                .unwrap_or("(none)"),
            record
                .action
                .as_ref()
                .map(|a| if a.success { "ok" } else { "failed" })
                .unwrap_or("-")
        );
        let mem_id = format!(
            "{}-step-{}",
            state.milestone_id().unwrap_or("task"),
            record.step_index
        );
        if let Err(e) = memory.add_to_active(mem_id, summary, STEP_MEMORY_PRIORITY, vec!["history".into()]) {
            tracing::warn!(error = %e, "step summary not added to memory");
        }

        state.history.push(record);
        state.step_index += 1;

        // 周期检查点在下一次 Act 之前提交
        if audit.should_checkpoint(state.step_index) {
            self.commit_checkpoint(state, memory, audit)?;
        }
        Ok(())
    }

    fn commit_checkpoint(
        &self,
        state: &AgentState,
        memory: &HierarchicalMemory,
        audit: &mut AuditLog,
    ) -> Result<(), AgentError> {
        audit.checkpoint(
            &state.task.description,
            state.milestone_id(),
            state.step_index,
            memory.active_ids(),
            state.consecutive_failures,
        )?;
        Ok(())
    }

    /// 取消终止：可带一条无动作的截断记录；检查点先于终止提交
    fn exit_cancelled(
        &self,
        state: &mut AgentState,
        memory: &HierarchicalMemory,
        audit: &mut AuditLog,
        partial: Option<(String, String)>,
    ) -> Result<String, AgentError> {
        let err = AgentError::cancelled();
        if let Some((observation, reasoning)) = partial {
            let record = StepRecord {
                step_index: state.step_index,
                milestone_id: state.milestone_id().map(str::to_string),
                observation,
                reasoning,
                action: None,
                confidence: 0.0,
                timestamp_ms: audit.now_ms(),
                error: Some(err.clone()),
            };
            if let Err(e) = audit.append(record.clone()) {
                tracing::warn!(error = %e, "partial record not appended on cancel");
            } else {
                state.history.push(record);
                state.step_index += 1;
            }
        }
        if let Err(e) = self.commit_checkpoint(state, memory, audit) {
            tracing::warn!(error = %e, "checkpoint failed during cancel");
        }
        tracing::info!(goal = state.goal(), step = state.step_index, "worker cancelled");
        Err(err)
    }

    /// 非取消的终止：检查点先行，错误上浮
    fn exit_terminal(
        &self,
        state: &mut AgentState,
        memory: &HierarchicalMemory,
        audit: &mut AuditLog,
        err: AgentError,
    ) -> Result<String, AgentError> {
        if let Err(e) = self.commit_checkpoint(state, memory, audit) {
            tracing::warn!(error = %e, "checkpoint failed during terminal transition");
        }
        tracing::warn!(goal = state.goal(), kind = %err.kind, error = %err, "worker terminated");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ScriptedActionBackend, StaticAllowlist};
    use crate::agent::state::Task;
    use crate::core::ErrorKind;
    use crate::llm::{LlmError, ScriptedModel};
    use crate::memory::InMemoryArchival;
    use crate::vlm::ScriptedPerception;

    struct Harness {
        model: Arc<ScriptedModel>,
        backend: Arc<ScriptedActionBackend>,
        cache: Arc<ToolCache>,
        engine: StepEngine,
        memory: HierarchicalMemory,
        audit: AuditLog,
    }

    fn harness(model: ScriptedModel, config: EngineConfig) -> Harness {
        let model = Arc::new(model);
        let backend = Arc::new(ScriptedActionBackend::new());
        let cache = Arc::new(ToolCache::new(64, Duration::from_secs(300)));
        let engine = StepEngine::new(
            model.clone(),
            Arc::new(ScriptedPerception::new()),
            backend.clone(),
            Arc::new(StaticAllowlist::desktop_defaults()),
            cache.clone(),
            config,
        );
        Harness {
            model,
            backend,
            cache,
            engine,
            memory: HierarchicalMemory::new(16 * 1024, Arc::new(InMemoryArchival::new())),
            audit: AuditLog::new(5),
        }
    }

    fn no_verify() -> EngineConfig {
        EngineConfig {
            enable_verification: false,
            jitter_seed: Some(1),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_type_then_complete() {
        let model = ScriptedModel::with_replies([r#"Type "Hello World""#, "done"]);
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("Type 'Hello World' in the focused window"), 15);

        let result = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(state.history.len(), 2);
        let first = state.history[0].action.as_ref().unwrap();
        assert_eq!(first.action, ActionRecord::TypeText { text: "Hello World".into() });
        assert!(first.success);
        let second = state.history[1].action.as_ref().unwrap();
        assert_eq!(second.action, ActionRecord::TaskComplete);

        // TaskComplete 不会到达动作后端
        assert_eq!(h.backend.executed(), vec![ActionRecord::TypeText { text: "Hello World".into() }]);
        assert!(state.result.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_model_failure_retried_with_backoff() {
        let model = ScriptedModel::new();
        model.enqueue_err(LlmError::Status { status: 503, message: "unavailable".into() });
        model.enqueue_err(LlmError::Status { status: 503, message: "unavailable".into() });
        model.enqueue_ok("done");
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("finish quickly"), 15);

        let result = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        // 两次 503 后第三次成功：只有一条完成记录
        assert_eq!(h.model.calls(), 3);
        assert_eq!(state.history.len(), 1);
        assert_eq!(
            state.history[0].action.as_ref().unwrap().action,
            ActionRecord::TaskComplete
        );
    }

    #[tokio::test]
    async fn test_non_transient_model_failure_terminates() {
        let model = ScriptedModel::new();
        model.enqueue_err(LlmError::Status { status: 400, message: "bad request".into() });
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("anything"), 15);

        let err = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ModelFailure);
        assert!(!err.retryable);
        // 终止前提交了检查点
        assert!(h.audit.latest_checkpoint().is_some());
    }

    #[tokio::test]
    async fn test_two_noactions_force_screen_analysis() {
        let model = ScriptedModel::with_replies([
            "pondering the meaning of pixels",
            "still pondering",
            "third thought with no verb",
            "done",
        ]);
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new(""), 15);

        h.engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<&str> = state
            .history
            .iter()
            .filter_map(|r| r.action.as_ref())
            .map(|a| a.action.kind_name())
            .collect();
        assert_eq!(kinds, vec!["no_action", "no_action", "analyze_screen", "task_complete"]);
    }

    #[tokio::test]
    async fn test_policy_violation_terminates_without_execution() {
        let model = ScriptedModel::with_replies(["open photoshop"]);
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("edit a photo"), 15);

        let err = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::PolicyViolation);
        // 未执行任何动作，也未触发缓存失效
        assert!(h.backend.executed().is_empty());
        assert_eq!(h.cache.stats().invalidations, 0);
        // 违规步骤进入审计（无动作）
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].action.is_none());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_commits_last_record_and_checkpoint() {
        let model = ScriptedModel::new().with_default_reply("analyze the screen");
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("never finishes"), 2);

        let err = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BudgetExhausted);
        assert_eq!(state.history.len(), 2);
        assert_eq!(h.audit.records().len(), 2);
        assert!(h.audit.latest_checkpoint().is_some());
        // step_index 不超过 max_steps
        assert!(state.step_index <= state.max_steps);
    }

    #[tokio::test]
    async fn test_verification_failure_counts_toward_threshold() {
        let model = ScriptedModel::with_replies([r#"type "hi""#, "NO - nothing changed"]);
        let config = EngineConfig {
            failure_threshold: 1,
            jitter_seed: Some(1),
            ..EngineConfig::default()
        };
        let mut h = harness(model, config);
        let mut state = AgentState::for_task(Task::new("write"), 15);

        let err = h
            .engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BudgetExhausted);
        let step = &state.history[0];
        assert_eq!(
            step.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::VerificationFailure)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_failure_retried_then_succeeds() {
        let model = ScriptedModel::with_replies([r#"type "hi""#, "done"]);
        let mut h = harness(model, no_verify());
        h.backend.fail_next(2);
        let mut state = AgentState::for_task(Task::new("write hi"), 15);

        h.engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap();

        // 两次失败后第三次落地
        assert_eq!(h.backend.executed(), vec![ActionRecord::TypeText { text: "hi".into() }]);
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_step_summaries_enter_working_memory() {
        let model = ScriptedModel::with_replies(["analyze the screen", "done"]);
        let mut h = harness(model, no_verify());
        let mut state = AgentState::for_task(Task::new("look around"), 15);

        h.engine
            .run(&mut state, &mut h.memory, &mut h.audit, &CancellationToken::new())
            .await
            .unwrap();

        let ids = h.memory.active_ids();
        assert!(ids.iter().any(|id| id == "task-step-0"));
        assert!(ids.iter().any(|id| id == "task-step-1"));
    }
}
