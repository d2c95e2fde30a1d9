//! 意图解析器
//!
//! 将模型推理文本确定性地映射为 ActionRecord，规则按优先级排列：
//! launch > type > press > click > analyze > complete > no_action。
//! LaunchApp 的目标必须在允许列表内，否则直接产出 PolicyViolation（终止错误）。

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::actions::launcher::AppAllowlist;
use crate::actions::types::{ActionRecord, MouseButton};
use crate::core::AgentError;

static LAUNCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:launch|open|start)\s+(?:the\s+|a\s+|an\s+)?([A-Za-z0-9_.-]+)").unwrap()
});

/// 「enter」单独出现时多半是按键（press enter），只有 enter text / input 才算输入意图
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:type|typing|write|enter\s+(?:the\s+)?text|input)\b").unwrap()
});

static DOUBLE_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());
static SINGLE_QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([^']+)'").unwrap());

static PRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:press|hit)\s+(?:the\s+)?([A-Za-z0-9]+)(?:\s+key)?").unwrap()
});

static COORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?\s*(\d{1,5})\s*,\s*(\d{1,5})\s*\)?").unwrap());

static ANALYZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:analyze|analyse|look|check)\b").unwrap());

static COMPLETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:done|finished|complete|completed)\b").unwrap());

static CLICK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bclick\b").unwrap());

/// 归一化按键表（固定集合：回车、Tab、Esc、方向键、功能键等）
fn normalize_key(raw: &str) -> Option<String> {
    let key = raw.to_lowercase();
    let normalized = match key.as_str() {
        "enter" | "return" => "enter",
        "tab" => "tab",
        "escape" | "esc" => "escape",
        "space" | "spacebar" => "space",
        "backspace" => "backspace",
        "delete" | "del" => "delete",
        "up" | "down" | "left" | "right" => key.as_str(),
        _ => {
            // F1..F12
            if let Some(n) = key.strip_prefix('f') {
                if matches!(n.parse::<u8>(), Ok(1..=12)) {
                    return Some(key);
                }
            }
            return None;
        }
    };
    Some(normalized.to_string())
}

/// 提取引号内文本（先双引号后单引号）
fn extract_quoted(text: &str) -> Option<String> {
    DOUBLE_QUOTED_RE
        .captures(text)
        .or_else(|| SINGLE_QUOTED_RE.captures(text))
        .map(|c| c[1].to_string())
}

/// 解析结果：动作、置信度与来源说明
#[derive(Debug, Clone)]
pub struct ParsedIntent {
    pub action: ActionRecord,
    pub confidence: f64,
    pub note: String,
}

impl ParsedIntent {
    fn new(action: ActionRecord, confidence: f64, note: impl Into<String>) -> Self {
        Self {
            action,
            confidence,
            note: note.into(),
        }
    }
}

/// 确定性意图解析器（无内部状态，规则即全部行为）
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentParser;

impl IntentParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(
        &self,
        reasoning: &str,
        context: &BTreeMap<String, String>,
        task_description: &str,
        allowlist: &dyn AppAllowlist,
    ) -> Result<ParsedIntent, AgentError> {
        let reasoning = reasoning.trim();
        if reasoning.is_empty() {
            return Ok(ParsedIntent::new(
                ActionRecord::NoAction { reason: "empty reasoning".into() },
                1.0,
                "empty input",
            ));
        }

        // 1. launch|open|start <app>：名字必须在允许列表内
        if let Some(caps) = LAUNCH_RE.captures(reasoning) {
            let name = caps[1].to_lowercase();
            return if allowlist.resolve(&name).is_some() {
                Ok(ParsedIntent::new(
                    ActionRecord::LaunchApp { name },
                    0.9,
                    "explicit launch marker",
                ))
            } else {
                Err(AgentError::policy(format!(
                    "app '{}' is not in the allowlist (known: {})",
                    name,
                    allowlist.names().join(", ")
                ))
                .with_context("app", name))
            };
        }

        // 2. type|write|enter text + 引号内容；回落 context["text"]，再回落任务描述
        if TYPE_RE.is_match(reasoning) {
            if let Some(text) = extract_quoted(reasoning) {
                return Ok(ParsedIntent::new(
                    ActionRecord::TypeText { text },
                    0.9,
                    "quoted text in reasoning",
                ));
            }
            if let Some(text) = context.get("text") {
                return Ok(ParsedIntent::new(
                    ActionRecord::TypeText { text: text.clone() },
                    0.7,
                    "text from context",
                ));
            }
            if !task_description.trim().is_empty() {
                return Ok(ParsedIntent::new(
                    ActionRecord::TypeText { text: task_description.trim().to_string() },
                    0.6,
                    "fallback to task description",
                ));
            }
            return Ok(ParsedIntent::new(
                ActionRecord::NoAction { reason: "no text to type".into() },
                1.0,
                "typing intent without text",
            ));
        }

        // 3. press|hit <key>：仅接受固定按键表内的键，否则继续后续规则
        if let Some(caps) = PRESS_RE.captures(reasoning) {
            if let Some(key) = normalize_key(&caps[1]) {
                return Ok(ParsedIntent::new(
                    ActionRecord::PressKey { key },
                    0.85,
                    "key press marker",
                ));
            }
        }

        // 4. click：能取出 (x, y) 则带坐标，否则空参数低置信
        if CLICK_RE.is_match(reasoning) {
            if let Some(caps) = COORD_RE.captures(reasoning) {
                let x: i32 = caps[1].parse().unwrap_or(0);
                let y: i32 = caps[2].parse().unwrap_or(0);
                return Ok(ParsedIntent::new(
                    ActionRecord::Click { x: Some(x), y: Some(y), button: MouseButton::Left },
                    0.9,
                    "click with coordinates",
                ));
            }
            return Ok(ParsedIntent::new(
                ActionRecord::Click { x: None, y: None, button: MouseButton::Left },
                0.4,
                "click without coordinates",
            ));
        }

        // 5. analyze|look|check
        if ANALYZE_RE.is_match(reasoning) {
            return Ok(ParsedIntent::new(
                ActionRecord::AnalyzeScreen { query: reasoning.to_string() },
                0.8,
                "screen analysis marker",
            ));
        }

        // 6. done|finished|complete
        if COMPLETE_RE.is_match(reasoning) {
            return Ok(ParsedIntent::new(ActionRecord::TaskComplete, 0.9, "completion marker"));
        }

        // 7. 兜底
        Ok(ParsedIntent::new(
            ActionRecord::NoAction { reason: "no actionable command detected".into() },
            1.0,
            "fallback",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::launcher::StaticAllowlist;

    fn parse(reasoning: &str) -> ParsedIntent {
        parse_with(reasoning, &BTreeMap::new(), "")
    }

    fn parse_with(reasoning: &str, ctx: &BTreeMap<String, String>, task: &str) -> ParsedIntent {
        IntentParser::new()
            .parse(reasoning, ctx, task, &StaticAllowlist::desktop_defaults())
            .unwrap()
    }

    #[test]
    fn test_launch_allowed_app() {
        let intent = parse("I will open notepad to write the letter");
        assert_eq!(intent.action, ActionRecord::LaunchApp { name: "notepad".into() });
    }

    #[test]
    fn test_launch_skips_articles() {
        let intent = parse("start the calculator now");
        assert_eq!(intent.action, ActionRecord::LaunchApp { name: "calculator".into() });
    }

    #[test]
    fn test_launch_unknown_app_is_policy_violation() {
        let err = IntentParser::new()
            .parse(
                "launch photoshop",
                &BTreeMap::new(),
                "",
                &StaticAllowlist::desktop_defaults(),
            )
            .unwrap_err();
        assert_eq!(err.kind, crate::core::ErrorKind::PolicyViolation);
        assert!(!err.retryable);
    }

    #[test]
    fn test_type_quoted_text() {
        let intent = parse(r#"Type "Hello World" into the focused window"#);
        assert_eq!(intent.action, ActionRecord::TypeText { text: "Hello World".into() });
        assert!(intent.confidence >= 0.9);
    }

    #[test]
    fn test_type_single_quoted() {
        let intent = parse("write 'short note' in the editor");
        assert_eq!(intent.action, ActionRecord::TypeText { text: "short note".into() });
    }

    #[test]
    fn test_type_falls_back_to_context() {
        let mut ctx = BTreeMap::new();
        ctx.insert("text".to_string(), "from context".to_string());
        let intent = parse_with("type the message now", &ctx, "some task");
        assert_eq!(intent.action, ActionRecord::TypeText { text: "from context".into() });
    }

    #[test]
    fn test_type_falls_back_to_task() {
        let intent = parse_with("type the message now", &BTreeMap::new(), "Dear Ada, hello");
        assert_eq!(intent.action, ActionRecord::TypeText { text: "Dear Ada, hello".into() });
    }

    #[test]
    fn test_type_without_any_text_is_no_action() {
        let intent = parse_with("type the message now", &BTreeMap::new(), "");
        assert_eq!(intent.action, ActionRecord::NoAction { reason: "no text to type".into() });
    }

    #[test]
    fn test_press_key_normalization() {
        assert_eq!(parse("press Enter").action, ActionRecord::PressKey { key: "enter".into() });
        assert_eq!(parse("hit the Return key").action, ActionRecord::PressKey { key: "enter".into() });
        assert_eq!(parse("press esc").action, ActionRecord::PressKey { key: "escape".into() });
        assert_eq!(parse("press F5").action, ActionRecord::PressKey { key: "f5".into() });
        assert_eq!(parse("press down").action, ActionRecord::PressKey { key: "down".into() });
    }

    #[test]
    fn test_press_unknown_key_falls_through() {
        // 「press submit」不在按键表内，落到兜底 NoAction
        let intent = parse("press submit");
        assert!(matches!(intent.action, ActionRecord::NoAction { .. }));
    }

    #[test]
    fn test_click_with_coordinates() {
        let intent = parse("click at (10, 20) on the button");
        assert_eq!(
            intent.action,
            ActionRecord::Click { x: Some(10), y: Some(20), button: MouseButton::Left }
        );
    }

    #[test]
    fn test_click_without_coordinates_is_low_confidence() {
        let intent = parse("click the save button");
        assert_eq!(intent.action, ActionRecord::Click { x: None, y: None, button: MouseButton::Left });
        assert!(intent.confidence < 0.5);
    }

    #[test]
    fn test_analyze_screen() {
        let intent = parse("analyze the screen: what is visible");
        assert_eq!(
            intent.action,
            ActionRecord::AnalyzeScreen { query: "analyze the screen: what is visible".into() }
        );
    }

    #[test]
    fn test_check_is_analysis_not_completion() {
        // check 在 complete 之前判定，避免「check if complete」误判为完成
        let intent = parse("check if the task is complete");
        assert!(matches!(intent.action, ActionRecord::AnalyzeScreen { .. }));
    }

    #[test]
    fn test_completion_markers() {
        assert_eq!(parse("done").action, ActionRecord::TaskComplete);
        assert_eq!(parse("the letter is finished").action, ActionRecord::TaskComplete);
        assert_eq!(parse("task complete").action, ActionRecord::TaskComplete);
    }

    #[test]
    fn test_fallback_no_action() {
        let intent = parse("hmm, thinking about the weather");
        assert_eq!(
            intent.action,
            ActionRecord::NoAction { reason: "no actionable command detected".into() }
        );
    }

    #[test]
    fn test_press_enter_is_not_typing() {
        // 单独的 enter 是按键而不是输入意图
        let intent = parse("press enter to confirm");
        assert_eq!(intent.action, ActionRecord::PressKey { key: "enter".into() });
    }

    #[test]
    fn test_quoted_type_wins_over_press() {
        let intent = parse(r#"type "hello" and press enter"#);
        assert_eq!(intent.action, ActionRecord::TypeText { text: "hello".into() });
    }
}
