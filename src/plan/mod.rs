//! 规划层：里程碑分解、重规划与任务级协调

pub mod coordinator;
pub mod milestone;
pub mod planner;

pub use coordinator::{
    run_task, CancelHandle, Collaborators, Coordinator, MilestoneOutcome, RunOptions, TaskResult,
    TaskStatus,
};
pub use milestone::{Milestone, MilestoneStatus, TaskPlan};
pub use planner::Planner;
