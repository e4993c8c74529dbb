//! Prompt templates and rendering.

use std::collections::HashMap;

/// Sentinel that should never appear in real templates.
const ESCAPE_SENTINEL: &str = "\x00LBRACE\x00";
/// Sentinel for escaped closing brace.
const ESCAPE_SENTINEL_CLOSE: &str = "\x00RBRACE\x00";

/// System prompt shared by the built-in LLM roles.
pub const SYSTEM_PROMPT: &str = "你是一名严谨的中文校对编辑，只输出 JSON，不要输出任何解释性文字。";

/// Detection prompt for the `basic` role.
///
/// Offsets are UTF-16 code units, which is what the model sees when it
/// counts characters of ordinary Chinese text.
pub const DETECT_TEMPLATE: &str = r#"请检查下面文本中的错误，类型包括：{types}。

要求：
1. 只报告确定的错误，不要改写风格。
2. start 和 end 为错误片段在原文中的字符下标（从 0 开始，end 不包含）。
3. text 必须与原文中该位置的片段完全一致。
4. suggestion 为替换后的文本；删除时为空字符串。

输出格式（JSON 数组）：
[{{"start": 0, "end": 2, "text": "原文片段", "suggestion": "修改建议", "type": "spelling", "explanation": "原因", "confidence": 0.9}}]
没有错误时输出 []。

原文：
{input}"#;

/// Review prompt for the `reviewer` role.
pub const REVIEW_TEMPLATE: &str = r#"下面是对一段文本的候选修改，请逐条复核。

原文：
{input}

候选修改：
{candidates}

对每条候选给出决定：accept（接受）、reject（拒绝）或 modify（修改）。
modify 时给出修正后的 start、end、text、suggestion。

输出格式（JSON 数组）：
[{{"index": 1, "decision": "accept"}}, {{"index": 2, "decision": "modify", "start": 4, "end": 6, "text": "高行", "suggestion": "高兴", "explanation": "原因"}}]"#;

/// Build a prompt string with variable substitution.
///
/// Replaces `{key}` placeholders with values from `vars`. The special
/// `{input}` placeholder is replaced by `input`.
///
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}`.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use proofread_pipeline::prompt::render;
///
/// let mut vars = HashMap::new();
/// vars.insert("types".to_string(), "spelling".to_string());
/// let out = render("检查{types}: {input} {{\"a\": 1}}", "原文", &vars);
/// assert_eq!(out, r#"检查spelling: 原文 {"a": 1}"#);
/// ```
pub fn render(template: &str, input: &str, vars: &HashMap<String, String>) -> String {
    // Pass 1: protect escaped braces
    let mut rendered = template.replace("{{", ESCAPE_SENTINEL);
    rendered = rendered.replace("}}", ESCAPE_SENTINEL_CLOSE);

    // Pass 2: substitute placeholders. Variables go first so a value that
    // happens to contain "{input}" is not expanded.
    for (key, value) in vars {
        let placeholder = format!("{{{}}}", key);
        rendered = rendered.replace(&placeholder, value);
    }
    rendered = rendered.replace("{input}", input);

    // Pass 3: restore escaped braces
    rendered = rendered.replace(ESCAPE_SENTINEL, "{");
    rendered = rendered.replace(ESCAPE_SENTINEL_CLOSE, "}");
    rendered
}

/// Create a numbered list from items (1-indexed).
pub fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}
