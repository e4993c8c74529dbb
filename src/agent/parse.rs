//! Defensive JSON extraction from model replies.
//!
//! Models wrap their answer in reasoning blocks, markdown fences, or prose,
//! and Chinese-language models regularly emit full-width punctuation where
//! JSON syntax is expected. [`parse_reply`] tries progressively more
//! forgiving strategies and reports which one worked.

use serde_json::Value;

/// A JSON value extracted from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub value: Value,
    /// `"direct"`, `"fenced"`, or `"bracketed"`.
    pub strategy: &'static str,
    pub repaired: bool,
    pub auto_completed: bool,
}

/// Strip `<think>...</think>` and `<thinking>...</thinking>` blocks.
///
/// An unclosed block swallows the rest of the text.
///
/// ```
/// use proofread_pipeline::agent::parse::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>嗯</think>[]"), "[]");
/// assert_eq!(strip_think_tags("<think>no closing tag"), "");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let once = strip_tag_variant(text, "<think>", "</think>");
    strip_tag_variant(&once, "<thinking>", "</thinking>")
}

fn strip_tag_variant(text: &str, open: &str, close: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find(open) {
        match result[start..].find(close) {
            Some(end_offset) => {
                let end = start + end_offset + close.len();
                result.replace_range(start..end, "");
            }
            None => {
                result.truncate(start);
                break;
            }
        }
    }
    result
}

/// Content of the first complete markdown code block, any language.
pub fn extract_code_block(text: &str) -> Option<&str> {
    let fence = text.find("```")?;
    let after = fence + 3;
    let line_end = text[after..].find('\n')? + after + 1;
    let close = text[line_end..].find("```")? + line_end;
    Some(text[line_end..close].trim())
}

/// Last top-level `open ... close` region, string-aware.
pub fn find_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut best = None;
    let mut scan_from = 0;
    while let Some(offset) = text[scan_from..].find(open) {
        let start = scan_from + offset;
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        let mut found = None;
        for (i, ch) in text[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                _ if in_string => {}
                c if c == open => depth += 1,
                c if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        found = Some(start + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        match found {
            Some(end) => {
                best = Some(&text[start..=end]);
                scan_from = end + close.len_utf8();
            }
            None => break,
        }
    }
    best
}

/// Replace full-width JSON punctuation outside string literals and drop
/// trailing commas. Returns `None` if nothing changed.
///
/// A string opened with `“` closes at `”`. Inside an ASCII-quoted string,
/// full-width characters are content and are left alone.
pub fn repair_json(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut opened_full_width = false;
    let mut escaped = false;
    let mut changed = false;

    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '”' if opened_full_width => {
                    in_string = false;
                    out.push('"');
                    changed = true;
                }
                _ => out.push(ch),
            }
            continue;
        }
        let mapped = match ch {
            '，' => ',',
            '：' => ':',
            '［' => '[',
            '］' => ']',
            '｛' => '{',
            '｝' => '}',
            '“' | '”' => '"',
            other => other,
        };
        if mapped != ch {
            changed = true;
        }
        if mapped == '"' {
            in_string = true;
            opened_full_width = ch != '"';
        }
        out.push(mapped);
    }

    let without_commas = remove_trailing_commas(&out);
    if without_commas.len() != out.len() {
        changed = true;
    }
    changed.then_some(without_commas)
}

fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Close unclosed strings, arrays, and objects in truncated output.
///
/// Incomplete trailing members (a dangling key, colon, or comma) are
/// dropped before closing. Returns `None` if the input does not start like
/// JSON or cannot be completed.
///
/// ```
/// use proofread_pipeline::agent::parse::auto_complete_json;
///
/// let done = auto_complete_json(r#"[{"start": 4, "text": "高行"}, {"start": 9, "te"#).unwrap();
/// let v: serde_json::Value = serde_json::from_str(&done).unwrap();
/// assert_eq!(v[0]["text"], "高行");
/// ```
pub fn auto_complete_json(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }

    let mut result = String::with_capacity(trimmed.len() + 8);
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in trimmed.chars() {
        result.push(ch);
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if escaped {
        result.pop();
    }
    if in_string {
        result.push('"');
    }

    // Peel incomplete trailing members until the tail is closable.
    for _ in 0..4 {
        let t = result.trim_end();
        if let Some(rest) = t.strip_suffix(',') {
            result = rest.to_string();
        } else if let Some(rest) = t.strip_suffix(':') {
            result = drop_last_string(rest.trim_end())?;
        } else if stack.last() == Some(&'}') && t.ends_with('"') && ends_with_orphan_key(t) {
            result = drop_last_string(t)?;
        } else {
            break;
        }
    }

    while let Some(closer) = stack.pop() {
        result.push(closer);
    }
    serde_json::from_str::<Value>(&result).ok().map(|_| result)
}

/// `{"a": 1, "b"`: a quoted string preceded by `,` or `{` with no colon.
fn ends_with_orphan_key(t: &str) -> bool {
    let inner = &t[..t.len() - 1];
    match inner.rfind('"') {
        Some(open) => {
            let before = inner[..open].trim_end();
            before.ends_with(',') || before.ends_with('{')
        }
        None => false,
    }
}

/// Remove a trailing quoted string and the comma before it.
fn drop_last_string(t: &str) -> Option<String> {
    let inner = t.strip_suffix('"')?;
    let open = inner.rfind('"')?;
    let before = inner[..open].trim_end();
    Some(before.strip_suffix(',').unwrap_or(before).to_string())
}

fn try_value(candidate: &str) -> Option<(Value, bool, bool)> {
    if let Ok(v) = serde_json::from_str(candidate) {
        return Some((v, false, false));
    }
    let repaired = repair_json(candidate);
    if let Some(ref r) = repaired {
        if let Ok(v) = serde_json::from_str(r) {
            return Some((v, true, false));
        }
    }
    let base = repaired.as_deref().unwrap_or(candidate);
    let completed = auto_complete_json(base)?;
    let v = serde_json::from_str(&completed).ok()?;
    Some((v, repaired.is_some(), true))
}

/// Extract a JSON value from a model reply.
///
/// Strategies, in order: the whole reply, the first fenced code block, the
/// last bracketed array, the last bracketed object, then the text from the
/// first `[` or `{` to the end (truncated output). Each candidate is tried
/// as-is, after repair, and after auto-completion.
pub fn parse_reply(reply: &str) -> Result<ParsedReply, String> {
    let cleaned = strip_think_tags(reply);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err("empty response".into());
    }

    let mut candidates: Vec<(&'static str, &str)> = vec![("direct", cleaned)];
    if let Some(block) = extract_code_block(cleaned) {
        candidates.push(("fenced", block));
    }
    if let Some(arr) = find_bracketed(cleaned, '[', ']') {
        candidates.push(("bracketed", arr));
    }
    if let Some(obj) = find_bracketed(cleaned, '{', '}') {
        candidates.push(("bracketed", obj));
    }
    if let Some(pos) = cleaned.find(['[', '{']) {
        candidates.push(("bracketed", &cleaned[pos..]));
    }

    for (strategy, candidate) in candidates {
        if let Some((value, repaired, auto_completed)) = try_value(candidate) {
            if value.is_array() || value.is_object() {
                return Ok(ParsedReply {
                    value,
                    strategy,
                    repaired,
                    auto_completed,
                });
            }
        }
    }

    let preview: String = cleaned.chars().take(120).collect();
    Err(format!("no JSON found in model reply: {preview}"))
}

/// The list of entries inside a reply value.
///
/// Accepts a bare array or an object wrapping one under a common key.
pub fn entry_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => ["errors", "items", "candidates", "decisions", "results"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Complete top-level object elements of a JSON array that is still being
/// streamed.
///
/// Scans from the first `[` and returns every `{...}` element at depth one
/// that has closed and parses, so partial results can be shown before the
/// array is finished.
pub fn complete_array_elements(partial: &str) -> Vec<Value> {
    let cleaned = strip_think_tags(partial);
    let Some(start) = cleaned.find('[') else {
        return Vec::new();
    };
    let body = &cleaned[start..];

    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut elem_start = None;
    for (i, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '[' | '{' => {
                depth += 1;
                if ch == '{' && depth == 2 {
                    elem_start = Some(i);
                }
            }
            ']' | '}' => {
                if ch == '}' && depth == 2 {
                    if let Some(s) = elem_start.take() {
                        let slice = &body[s..=i];
                        let parsed = serde_json::from_str::<Value>(slice).ok().or_else(|| {
                            repair_json(slice).and_then(|r| serde_json::from_str(&r).ok())
                        });
                        out.extend(parsed);
                    }
                }
                depth -= 1;
                if depth <= 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_array() {
        let p = parse_reply(r#"[{"start": 4, "end": 6, "explanation": "错别字"}]"#).unwrap();
        assert_eq!(p.strategy, "direct");
        assert!(!p.repaired && !p.auto_completed);
        assert_eq!(p.value[0]["explanation"], "错别字");
    }

    #[test]
    fn test_think_and_fence() {
        let reply = "<think>先看第四个字</think>结果如下：\n```json\n[{\"text\": \"高行\"}]\n```\n以上。";
        let p = parse_reply(reply).unwrap();
        assert_eq!(p.strategy, "fenced");
        assert_eq!(p.value[0]["text"], "高行");
    }

    #[test]
    fn test_prose_wrapped_object() {
        let p = parse_reply(r#"好的，{"errors": [{"text": "以经"}]} 请查收"#).unwrap();
        assert_eq!(p.strategy, "bracketed");
        assert_eq!(entry_list(&p.value), vec![json!({"text": "以经"})]);
    }

    #[test]
    fn test_full_width_punctuation_repaired() {
        let reply = "[｛“start”：4，“end”：6，“explanation”：“错别字”｝]";
        let p = parse_reply(reply).unwrap();
        assert!(p.repaired);
        assert_eq!(p.value[0]["start"], 4);
        assert_eq!(p.value[0]["end"], 6);
    }

    #[test]
    fn test_full_width_inside_ascii_string_kept() {
        let fixed = repair_json(r#"[{"explanation": "“高行”，冒号：保留",}]"#).unwrap();
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v[0]["explanation"], "“高行”，冒号：保留");
    }

    #[test]
    fn test_truncated_output_completed() {
        let p = parse_reply(r#"[{"start": 4, "end": 6, "text": "高行"}, {"start": 9, "text": "以"#)
            .unwrap();
        assert!(p.auto_completed);
        assert_eq!(p.value.as_array().unwrap().len(), 2);
        assert_eq!(p.value[1]["text"], "以");
    }

    #[test]
    fn test_dangling_key_dropped() {
        let done = auto_complete_json(r#"{"a": 1, "b":"#).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&done).unwrap(), json!({"a": 1}));
        let done = auto_complete_json(r#"{"a": 1, "b""#).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&done).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_no_json() {
        assert!(parse_reply("没有发现错误").is_err());
        assert!(parse_reply("   ").is_err());
    }

    #[test]
    fn test_complete_array_elements_progressive() {
        let full = r#"[{"text": "高行", "note": "含}括号"}, {"text": "以经"}]"#;
        let cut = full.find("以经").unwrap();
        let early = complete_array_elements(&full[..cut]);
        assert_eq!(early.len(), 1);
        assert_eq!(early[0]["note"], "含}括号");
        assert_eq!(complete_array_elements(full).len(), 2);
        assert!(complete_array_elements("思考中").is_empty());
    }
}
