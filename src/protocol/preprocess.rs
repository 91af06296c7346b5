//! Frame text cleanup ahead of JSON parsing
//!
//! Timing feed frames are not always clean JSON:
//! - Control characters leak into driver names from the timing console
//! - Some relays wrap the body in a JSONP callback, `cb({...});` or `({...});`
//! - A UTF-8 byte order mark occasionally prefixes the first frame
//!
//! This module fixes the text without interpreting it.

use super::ParseFailure;

/// Clean a raw frame so it can be handed to a JSON parser.
///
/// Returns [`ParseFailure::Empty`] when nothing but whitespace remains.
pub fn preprocess_frame(raw: &str) -> Result<String, ParseFailure> {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\u{feff}' => continue,
            '\n' | '\r' | '\t' => cleaned.push(ch),
            c if c.is_control() => continue,
            c => cleaned.push(c),
        }
    }

    let body = unwrap_callback(cleaned.trim());
    if body.is_empty() {
        return Err(ParseFailure::Empty);
    }

    Ok(body.to_string())
}

/// Strip a JSONP wrapper if present.
fn unwrap_callback(text: &str) -> &str {
    if text.starts_with('{') || text.starts_with('[') {
        return text;
    }

    let trimmed = text.strip_suffix(';').unwrap_or(text).trim_end();
    let (Some(open), true) = (trimmed.find('('), trimmed.ends_with(')')) else {
        return text;
    };

    let callee = &trimmed[..open];
    if !callee.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$') {
        return text;
    }

    trimmed[open + 1..trimmed.len() - 1].trim()
}
