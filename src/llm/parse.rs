//! 宽容 JSON 解析：模型输出不保证合法
//!
//! 解析阶梯，逐级降级：
//! 1. 直接解析
//! 2. 提取 ```json 围栏代码块
//! 3. 截取首个括号到末个括号的片段
//! 4. 语法修复（去尾逗号、补未闭合字符串、补平衡括号）
//! 5. 从松散文本重建键值对
//!
//! 全部失败时返回 None，由调用方决定兜底行为。

use regex::Regex;
use serde_json::{Map, Value};

/// 宽容解析入口
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            return Some(v);
        }
        if let Some(v) = repair_and_parse(block.trim()) {
            return Some(v);
        }
    }

    if let Some(fragment) = extract_bracket_fragment(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(fragment) {
            return Some(v);
        }
        if let Some(v) = repair_and_parse(fragment) {
            return Some(v);
        }
    }

    reconstruct_pairs(trimmed)
}

/// 提取 ```json ... ``` 或 ``` ... ``` 围栏内容
fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = if let Some(pos) = text.find("```json") {
        pos + 7
    } else if let Some(pos) = text.find("```") {
        pos + 3
    } else {
        return None;
    };
    let rest = &text[start..];
    match rest.find("```") {
        Some(end) => Some(&rest[..end]),
        None => Some(rest),
    }
}

/// 截取首个 '{' 或 '[' 到对应末括号的片段
fn extract_bracket_fragment(text: &str) -> Option<&str> {
    let obj_start = text.find('{');
    let arr_start = text.find('[');
    let (start, close) = match (obj_start, arr_start) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };
    let end = text.rfind(close).unwrap_or(text.len() - 1);
    if end > start {
        Some(&text[start..=end])
    } else {
        Some(&text[start..])
    }
}

/// 语法修复后再解析
fn repair_and_parse(fragment: &str) -> Option<Value> {
    let repaired = repair_syntax(fragment);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// 常见语法错误修复：未闭合字符串 → 尾逗号 → 括号平衡
fn repair_syntax(fragment: &str) -> String {
    let mut s = fragment.trim().to_string();

    // 扫描一遍：统计字符串开闭与括号栈
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if in_string {
        s.push('"');
    }

    // 尾逗号：`, }` / `, ]` 以及补括号前的悬空逗号
    let trailing_comma = Regex::new(r",\s*([}\]])").unwrap();
    s = trailing_comma.replace_all(&s, "$1").into_owned();
    while s.trim_end().ends_with(',') {
        let end = s.trim_end().len() - 1;
        s.truncate(end);
    }

    // 补齐缺失的右括号（逆序）
    for close in stack.into_iter().rev() {
        s.push(close);
    }
    s
}

/// 兜底：从松散文本重建 "key": value 对
fn reconstruct_pairs(text: &str) -> Option<Value> {
    let pair = Regex::new(
        r#""([A-Za-z_][A-Za-z0-9_ ]*)"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?|true|false|null)"#,
    )
    .unwrap();

    let mut map = Map::new();
    for caps in pair.captures_iter(text) {
        let key = caps[1].to_string();
        if let Ok(value) = serde_json::from_str::<Value>(&caps[2]) {
            map.insert(key, value);
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}
