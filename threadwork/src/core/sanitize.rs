//! Cleanup of model-facing payloads.
//!
//! Providers reject requests carrying raw control characters, and models
//! sometimes emit tool arguments that are almost JSON. Both are fixed here
//! without touching the persisted transcript.

use serde_json::Value;

use crate::core::context::floor_char_boundary;
use crate::core::types::{Content, Message};

/// Tool outputs longer than this are cut when a retry sanitizes aggressively.
pub const AGGRESSIVE_OUTPUT_BYTES: usize = 20_000;

/// Drop control characters other than tab, newline and carriage return.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Copy of `view` safe to resend after a rejected request.
///
/// With `aggressive`, large tool outputs are truncated as well.
pub fn sanitize_view(view: &[Message], aggressive: bool) -> Vec<Message> {
    view.iter()
        .map(|message| {
            let mut message = message.clone();
            match &mut message.content {
                Content::Text { text } => *text = strip_control_chars(text),
                Content::ToolCalls { text, calls } => {
                    *text = strip_control_chars(text);
                    for call in calls {
                        sanitize_value(&mut call.arguments);
                    }
                }
                Content::ToolResult { result } => {
                    let mut output = strip_control_chars(&result.output);
                    if aggressive && output.len() > AGGRESSIVE_OUTPUT_BYTES {
                        output.truncate(floor_char_boundary(&output, AGGRESSIVE_OUTPUT_BYTES));
                        output.push_str("\n\n[content truncated due to size]");
                    }
                    result.size = output.len();
                    result.output = output;
                }
            }
            message
        })
        .collect()
}

fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = strip_control_chars(s),
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => map.values_mut().for_each(sanitize_value),
        _ => {}
    }
}

/// Turn near-JSON tool arguments into an object.
///
/// Returns `None` when `raw` is already an object or cannot be repaired.
/// Handles `null`, JSON carried as a string, code fences, single-quoted
/// keys, trailing commas, raw newlines inside strings and invalid
/// backslash escapes.
pub fn repair_arguments(raw: &Value) -> Option<Value> {
    let text = match raw {
        Value::Object(_) => return None,
        Value::Null => return Some(Value::Object(Default::default())),
        Value::String(text) => text,
        _ => return None,
    };
    let text = strip_fence(text.trim());
    if text.is_empty() {
        return Some(Value::Object(Default::default()));
    }
    if let Some(object) = parse_object(text) {
        return Some(object);
    }
    let fixed = fix_escapes(&remove_trailing_commas(&quote_keys(text)));
    parse_object(&fixed)
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// `'key':` becomes `"key":` outside double-quoted strings.
fn quote_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some((idx, c)) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '\'' => {
                let rest = &text[idx + 1..];
                match rest.find('\'') {
                    Some(end) if rest[end + 1..].trim_start().starts_with(':') => {
                        out.push('"');
                        out.push_str(&rest[..end]);
                        out.push('"');
                        for _ in 0..=rest[..end].chars().count() {
                            chars.next();
                        }
                    }
                    _ => out.push(c),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Drop commas directly before `}` or `]`, outside strings.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ','
            && text[idx + 1..]
                .trim_start()
                .starts_with(['}', ']'])
        {
            continue;
        }
        out.push(c);
    }
    out
}

/// Inside strings, escape raw newlines and backslashes that do not start a
/// valid JSON escape.
fn fix_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => match chars.peek() {
                Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                _ => out.push_str("\\\\"),
            },
            _ => out.push(c),
        }
    }
    out
}
