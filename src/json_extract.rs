//! Extraction of a JSON value from model free text. Model output shape
//! cannot be fully trusted even under a strict contract, so the ordered
//! fallback is: direct parse, fenced ```json block, balanced-brace scan.

use serde_json::Value;

/// Extract the first JSON object (or array) found in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    if let Some(v) = extract_fenced(trimmed) {
        return Some(v);
    }

    extract_balanced(trimmed, '{', '}').or_else(|| extract_balanced(trimmed, '[', ']'))
}

/// Pull the body out of the first ``` fence (optionally tagged `json`).
fn extract_fenced(text: &str) -> Option<Value> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the optional language tag up to the end of the fence line
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    serde_json::from_str(body.trim()).ok()
}

/// Scan for the first balanced `open..close` span and parse it.
/// String literals and escapes are respected so braces inside strings
/// don't break the depth count.
fn extract_balanced(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + i + c.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
