//! Drone - 桌面自动化智能体执行核心
//!
//! 模块划分：
//! - **core**: 错误分类、重试退避、时钟
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **llm**: 模型后端契约与脚本化实现
//! - **vlm**: 屏幕感知契约（capture / analyze）与脚本化实现
//! - **actions**: 封闭动作集合、意图解析、允许列表、动作后端
//! - **cache**: 工具结果缓存（TTL + LRU + tag 失效）
//! - **memory**: 活跃上下文 / 归档知识库的两层分页
//! - **audit**: 审计与检查点日志、敏感信息脱敏
//! - **agent**: AgentState 与 Observe/Reason/Act/Verify/Decide 步进图引擎
//! - **plan**: 里程碑分解、重规划与任务级协调（run_task 入口）

pub mod actions;
pub mod agent;
pub mod audit;
pub mod cache;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod vlm;
