//! 任务级集成测试：规划-执行管线的端到端场景

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use drone::actions::{ActionRecord, ScriptedActionBackend, StaticAllowlist};
use drone::agent::Task;
use drone::cache::ToolCache;
use drone::core::{ErrorKind, ManualClock};
use drone::llm::{GenerateOptions, LlmError, ModelBackend, ScriptedModel};
use drone::memory::InMemoryArchival;
use drone::plan::{
    Collaborators, Coordinator, MilestoneStatus, RunOptions, TaskStatus,
};
use drone::vlm::ScriptedPerception;

struct Fixture {
    model: Arc<ScriptedModel>,
    backend: Arc<ScriptedActionBackend>,
    cache: Arc<ToolCache>,
    collab: Collaborators,
}

fn fixture(replies: Vec<&str>) -> Fixture {
    let model = Arc::new(ScriptedModel::with_replies(replies));
    let backend = Arc::new(ScriptedActionBackend::new());
    let cache = Arc::new(ToolCache::new(64, Duration::from_secs(300)));
    let collab = Collaborators::new(
        model.clone(),
        Arc::new(ScriptedPerception::new()),
        backend.clone(),
        Arc::new(StaticAllowlist::desktop_defaults()),
        Arc::new(InMemoryArchival::new()),
    )
    .with_cache(cache.clone())
    .with_clock(ManualClock::shared(1_000));
    Fixture {
        model,
        backend,
        cache,
        collab,
    }
}

fn flat_options() -> RunOptions {
    RunOptions {
        enable_planner: false,
        enable_verification: false,
        jitter_seed: Some(7),
        ..RunOptions::default()
    }
}

fn planned_options() -> RunOptions {
    RunOptions {
        enable_verification: false,
        jitter_seed: Some(7),
        ..RunOptions::default()
    }
}

fn action_kinds(result: &drone::plan::TaskResult) -> Vec<String> {
    result
        .audit_tail
        .iter()
        .filter_map(|r| r.action.as_ref())
        .map(|a| a.action.kind_name().to_string())
        .collect()
}

#[tokio::test]
async fn test_happy_path_flat_run() {
    let f = fixture(vec![r#"Type "Hello World""#, "done"]);
    let coordinator = Coordinator::new(f.collab.clone(), flat_options());

    let result = coordinator
        .run(Task::new("Type 'Hello World' in the focused window"))
        .await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert!(result.terminal_error.is_none());
    assert_eq!(result.audit_tail.len(), 2);

    let first = result.audit_tail[0].action.as_ref().unwrap();
    assert_eq!(first.action, ActionRecord::TypeText { text: "Hello World".into() });
    assert!(first.success);
    let second = result.audit_tail[1].action.as_ref().unwrap();
    assert_eq!(second.action, ActionRecord::TaskComplete);

    assert_eq!(
        f.backend.executed(),
        vec![ActionRecord::TypeText { text: "Hello World".into() }]
    );
}

#[tokio::test]
async fn test_cache_invalidated_by_click_between_analyses() {
    // analyze -> click -> 同一查询再 analyze：第二次必须 miss
    let f = fixture(vec![
        "analyze the screen: what is visible",
        "click at (10, 20)",
        "analyze the screen: what is visible",
        "done",
    ]);
    let coordinator = Coordinator::new(f.collab.clone(), flat_options());

    let result = coordinator.run(Task::new("inspect the screen")).await;
    assert_eq!(result.status, TaskStatus::Completed);

    let stats = f.cache.stats();
    assert_eq!(stats.misses, 2, "second analyze must be a miss: {stats:?}");
    assert_eq!(stats.hits, 0);
    assert!(stats.invalidations >= 1);
}

#[tokio::test]
async fn test_identical_analyses_without_mutation_hit_cache() {
    let f = fixture(vec![
        "analyze the screen: what is visible",
        "analyze the screen: what is visible",
        "done",
    ]);
    let coordinator = Coordinator::new(f.collab.clone(), flat_options());

    let result = coordinator.run(Task::new("inspect twice")).await;
    assert_eq!(result.status, TaskStatus::Completed);

    let stats = f.cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_planner_failure_retried() {
    let f = fixture(vec![]);
    f.model.enqueue_err(LlmError::Status { status: 503, message: "unavailable".into() });
    f.model.enqueue_ok("MILESTONE 1: Finish up\nSUCCESS: Finished");
    f.model.enqueue_ok("done");

    let coordinator = Coordinator::new(f.collab.clone(), planned_options());
    let result = coordinator.run(Task::new("small task")).await;

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.milestones.len(), 1);
    assert_eq!(result.milestones[0].id, "milestone_1");
}

/// 在第 N 次调用返回后触发取消的模型包装（模拟 Reason 与 Act 之间收到取消）
struct CancellingModel {
    inner: ScriptedModel,
    cancel_after_call: usize,
    calls: Mutex<usize>,
    handle: Mutex<Option<drone::plan::CancelHandle>>,
}

impl CancellingModel {
    fn new(inner: ScriptedModel, cancel_after_call: usize) -> Self {
        Self {
            inner,
            cancel_after_call,
            calls: Mutex::new(0),
            handle: Mutex::new(None),
        }
    }

    fn set_handle(&self, handle: drone::plan::CancelHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }
}

#[async_trait]
impl ModelBackend for CancellingModel {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmError> {
        let reply = self.inner.generate(prompt, options).await;
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls == self.cancel_after_call {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                handle.cancel();
            }
        }
        reply
    }
}

#[tokio::test]
async fn test_cancellation_between_reason_and_act() {
    let storage = tempfile::tempdir().unwrap();
    let mut options = flat_options();
    options.storage_dir = Some(storage.path().to_path_buf());

    let backend = Arc::new(ScriptedActionBackend::new());
    let model = Arc::new(CancellingModel::new(
        ScriptedModel::with_replies(vec!["click at (10, 20)"]),
        1,
    ));
    let collab = Collaborators::new(
        model.clone(),
        Arc::new(ScriptedPerception::new()),
        backend.clone(),
        Arc::new(StaticAllowlist::desktop_defaults()),
        Arc::new(InMemoryArchival::new()),
    )
    .with_clock(ManualClock::shared(0));

    let coordinator = Coordinator::new(collab, options);
    model.set_handle(coordinator.cancel_handle());

    let result = coordinator.run(Task::new("click something")).await;

    assert_eq!(result.status, TaskStatus::Cancelled);
    // 未执行任何变更动作
    assert!(backend.executed().is_empty());
    // 截断记录没有动作
    let last = result.audit_tail.last().unwrap();
    assert!(last.action.is_none());
    assert_eq!(
        last.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::CancelRequested)
    );
}

#[tokio::test(start_paused = true)]
async fn test_replan_on_milestone_failure_then_exhaustion() {
    let f = fixture(vec![
        // 初始计划：两个里程碑
        "MILESTONE 1: Click the button\nSUCCESS: Button pressed\nMILESTONE 2: Close the app\nSUCCESS: App closed",
        // worker 派发 1 的推理
        "click at (10, 20)",
        // 重规划
        "MILESTONE 1: Click the other button\nSUCCESS: Button pressed",
        // worker 派发 2 的推理
        "click at (30, 40)",
    ]);
    // 两次派发各 1+3 次执行全部失败
    f.backend.fail_next(8);

    let coordinator = Coordinator::new(f.collab.clone(), planned_options());
    let result = coordinator.run(Task::new("press the button")).await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.terminal_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ActionFailure)
    );

    // 同一里程碑的两次派发，attempts 递增
    let m1_outcomes: Vec<_> = result
        .milestones
        .iter()
        .filter(|o| o.id == "milestone_1")
        .collect();
    assert_eq!(m1_outcomes.len(), 2);
    assert_eq!(m1_outcomes[0].attempts, 1);
    assert_eq!(m1_outcomes[1].attempts, 2);
    assert_eq!(m1_outcomes[1].status, MilestoneStatus::Failed);
    // 重规划后的描述替换了原里程碑
    assert_eq!(m1_outcomes[1].description, "Click the other button");
}

#[tokio::test]
async fn test_flat_and_single_milestone_runs_match_modulo_wrapper() {
    let flat = fixture(vec!["analyze the screen", "done"]);
    let flat_result = Coordinator::new(flat.collab.clone(), flat_options())
        .run(Task::new("inspect"))
        .await;

    let planned = fixture(vec![
        "MILESTONE 1: inspect\nSUCCESS: inspected",
        "analyze the screen",
        "done",
    ]);
    let planned_result = Coordinator::new(planned.collab.clone(), planned_options())
        .run(Task::new("inspect"))
        .await;

    assert_eq!(flat_result.status, TaskStatus::Completed);
    assert_eq!(planned_result.status, TaskStatus::Completed);

    // 动作序列一致（milestone 包装字段除外）
    assert_eq!(action_kinds(&flat_result), action_kinds(&planned_result));
    let pairs = flat_result.audit_tail.iter().zip(planned_result.audit_tail.iter());
    for (a, b) in pairs {
        assert_eq!(a.step_index, b.step_index);
        assert_eq!(a.observation, b.observation);
        assert_eq!(a.milestone_id, None);
        assert!(b.milestone_id.is_some());
    }
}

#[tokio::test]
async fn test_persisted_layout_audit_and_checkpoints() {
    let storage = tempfile::tempdir().unwrap();
    let f = fixture(vec![r#"Type "note""#, "done"]);
    let mut options = flat_options();
    options.storage_dir = Some(storage.path().to_path_buf());

    let result = Coordinator::new(f.collab.clone(), options)
        .run(Task::new("write a note"))
        .await;
    assert_eq!(result.status, TaskStatus::Completed);

    let audit_log = std::fs::read_to_string(storage.path().join("audit.log")).unwrap();
    assert_eq!(audit_log.lines().count(), 2);
    // 每行都是合法 JSON
    for line in audit_log.lines() {
        let _: serde_json::Value = serde_json::from_str(line).unwrap();
    }

    let checkpoints: Vec<_> = std::fs::read_dir(storage.path().join("checkpoints"))
        .unwrap()
        .collect();
    assert!(!checkpoints.is_empty());
}

#[tokio::test]
async fn test_policy_violation_fails_task() {
    let f = fixture(vec!["open photoshop"]);
    let result = Coordinator::new(f.collab.clone(), flat_options())
        .run(Task::new("edit photos"))
        .await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.terminal_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PolicyViolation)
    );
    assert!(f.backend.executed().is_empty());
    assert_eq!(f.cache.stats().invalidations, 0);
}

#[tokio::test]
async fn test_planning_failure_is_terminal() {
    let f = fixture(vec!["I refuse to make a plan."]);
    let result = Coordinator::new(f.collab.clone(), planned_options())
        .run(Task::new("impossible"))
        .await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(
        result.terminal_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PlanningFailure)
    );
    assert!(result.milestones.is_empty());
}
