//! Drone - 桌面自动化智能体执行核心
//!
//! 入口：dry-run 用的离线后端（脚本化模型/感知/动作），把命令行里的任务
//! 跑过完整的规划-执行管线并打印 TaskResult。真实 GUI / 模型后端由
//! 库调用方通过 Collaborators 注入。

use std::sync::Arc;

use anyhow::Context;

use drone::actions::ScriptedActionBackend;
use drone::agent::Task;
use drone::config::load_config;
use drone::llm::ScriptedModel;
use drone::memory::InMemoryArchival;
use drone::plan::{run_task, Collaborators};
use drone::vlm::ScriptedPerception;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drone::observability::init();

    let cfg = load_config(None).unwrap_or_default();
    let mut options = cfg.run_options();
    // 离线 dry-run：脚本化模型不会给出校验回答
    options.enable_verification = false;

    let description: String = {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.is_empty() {
            "Type \"Hello World\" in the focused window".to_string()
        } else {
            args.join(" ")
        }
    };

    let model = ScriptedModel::with_replies(vec![
        "MILESTONE 1: Carry out the requested input\nSUCCESS: The requested input is visible"
            .to_string(),
        "analyze the screen to locate the target window".to_string(),
        format!("Type \"{}\"", description.replace('"', "'")),
        "done".to_string(),
    ]);

    let collab = Collaborators::new(
        Arc::new(model),
        Arc::new(ScriptedPerception::new()),
        Arc::new(ScriptedActionBackend::new()),
        Arc::new(cfg.actions.to_allowlist()),
        Arc::new(InMemoryArchival::new()),
    )
    .with_cache(Arc::new(cfg.build_cache()));

    let result = run_task(collab, Task::new(description), options).await;

    let rendered =
        serde_json::to_string_pretty(&result).context("TaskResult serialization failed")?;
    println!("{rendered}");
    Ok(())
}
