//! Worker 层：每里程碑一份 AgentState，由步进图引擎驱动到终止

pub mod engine;
pub mod state;

pub use engine::{EngineConfig, StepEngine};
pub use state::{AgentState, MilestoneBrief, Task};
