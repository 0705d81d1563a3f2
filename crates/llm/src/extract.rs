//! Lenient extraction of JSON from free-form LLM replies.
//!
//! Models wrap structured output in fenced code blocks, prepend prose, or
//! emit bare JSON. Strategies, in order:
//!
//! 1. fenced ```json ... ``` block
//! 2. outermost balanced `{...}` object (string/escape aware)
//! 3. outermost balanced `[...]` array
//! 4. the whole trimmed text

use serde_json::Value;

/// Extract the first JSON value found in `text` and deserialise it into `T`.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    extract_json_value(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Extract the first JSON object or array found in `text`.
pub fn extract_json_value(text: &str) -> Option<Value> {
    if let Some(block) = fenced_block(text) {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            return Some(v);
        }
    }

    let trimmed = text.trim();
    for open in ['{', '['] {
        let mut from = 0;
        while let Some(found) = trimmed[from..].find(open) {
            let start = from + found;
            match balanced_span(&trimmed[start..], open) {
                Some(candidate) => {
                    if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                        return Some(v);
                    }
                    from = start + open.len_utf8();
                }
                // No closing delimiter anywhere after this start.
                None => from = start + open.len_utf8(),
            }
        }
    }

    serde_json::from_str::<Value>(trimmed).ok()
}

/// The body of the first ```json fenced block, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let body = &text[start + "```json".len()..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// The balanced span starting at byte 0 of `text`, which must begin with
/// `open`.
///
/// Tracks string literals and backslash escapes so delimiters inside strings
/// do not unbalance the scan.
fn balanced_span(text: &str, open: char) -> Option<&str> {
    let close = match open {
        '{' => '}',
        '[' => ']',
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[..offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
