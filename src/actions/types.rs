//! 动作类型定义
//!
//! 封闭的输入动作集合（和类型编码）：引擎穷尽匹配，新增动作种类是编译期变更。
//! 变更屏幕状态的动作（is_mutating）在执行前触发缓存失效。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 鼠标按键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// 封闭的动作集合；执行后的成功标志与后端载荷见 [ActionOutcome]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRecord {
    /// 启动允许列表内的应用
    LaunchApp { name: String },
    /// 坐标缺失时 x/y 为 None（低置信解析结果）
    Click {
        x: Option<i32>,
        y: Option<i32>,
        button: MouseButton,
    },
    TypeText { text: String },
    PressKey { key: String },
    Hotkey { keys: Vec<String> },
    Scroll { dy: i32 },
    Wait { seconds: f64 },
    /// 屏幕分析（唯一走缓存的观察型动作）
    AnalyzeScreen { query: String },
    NoAction { reason: String },
    TaskComplete,
}

impl ActionRecord {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActionRecord::LaunchApp { .. } => "launch_app",
            ActionRecord::Click { .. } => "click",
            ActionRecord::TypeText { .. } => "type_text",
            ActionRecord::PressKey { .. } => "press_key",
            ActionRecord::Hotkey { .. } => "hotkey",
            ActionRecord::Scroll { .. } => "scroll",
            ActionRecord::Wait { .. } => "wait",
            ActionRecord::AnalyzeScreen { .. } => "analyze_screen",
            ActionRecord::NoAction { .. } => "no_action",
            ActionRecord::TaskComplete => "task_complete",
        }
    }

    /// 可能改变屏幕状态的动作；执行前必须按失效规则清缓存
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ActionRecord::LaunchApp { .. }
                | ActionRecord::Click { .. }
                | ActionRecord::TypeText { .. }
                | ActionRecord::PressKey { .. }
                | ActionRecord::Hotkey { .. }
                | ActionRecord::Scroll { .. }
        )
    }
}

/// 执行后的动作：原始动作 + 成功标志 + 后端载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: ActionRecord,
    pub success: bool,
    pub payload: Value,
}

impl ActionOutcome {
    pub fn ok(action: ActionRecord, payload: Value) -> Self {
        Self {
            action,
            success: true,
            payload,
        }
    }

    pub fn failed(action: ActionRecord, payload: Value) -> Self {
        Self {
            action,
            success: false,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_set_is_exactly_the_input_actions() {
        assert!(ActionRecord::LaunchApp { name: "gedit".into() }.is_mutating());
        assert!(ActionRecord::Click { x: Some(1), y: Some(2), button: MouseButton::Left }.is_mutating());
        assert!(ActionRecord::TypeText { text: "hi".into() }.is_mutating());
        assert!(ActionRecord::PressKey { key: "enter".into() }.is_mutating());
        assert!(ActionRecord::Hotkey { keys: vec!["ctrl".into(), "s".into()] }.is_mutating());
        assert!(ActionRecord::Scroll { dy: -3 }.is_mutating());

        assert!(!ActionRecord::Wait { seconds: 1.0 }.is_mutating());
        assert!(!ActionRecord::AnalyzeScreen { query: "q".into() }.is_mutating());
        assert!(!ActionRecord::NoAction { reason: "r".into() }.is_mutating());
        assert!(!ActionRecord::TaskComplete.is_mutating());
    }

    #[test]
    fn test_serde_tagging() {
        let a = ActionRecord::TypeText { text: "Hello".into() };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["kind"], "type_text");
        assert_eq!(json["text"], "Hello");

        let back: ActionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, a);
    }
}
