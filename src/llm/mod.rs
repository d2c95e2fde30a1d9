//! 模型层：ModelBackend 契约与脚本化实现

pub mod mock;
pub mod traits;

pub use mock::ScriptedModel;
pub use traits::{GenerateOptions, LlmError, ModelBackend};
