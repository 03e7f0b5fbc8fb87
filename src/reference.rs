//! Property reference templating.
//!
//! A property reference names a token (for example `"#ref-1"`). When the
//! referenced node has its keys, every target value holding the token is
//! rewritten: a value equal to the token is replaced whole, a longer string
//! has the token spliced out.

use serde_json::Value;

use crate::model::value_to_text;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The target is exactly the token; it takes the source value as-is,
    /// keeping the source's JSON type.
    WholeValue,
    /// The target is a string containing the token somewhere inside it.
    Substring,
}

/// How `target` would be rewritten, or `None` when it cannot hold `token`.
pub fn reference_mode(target: &Value, token: &str) -> Option<ReferenceMode> {
    match target {
        Value::String(s) if s == token => Some(ReferenceMode::WholeValue),
        Value::String(_) => Some(ReferenceMode::Substring),
        _ => None,
    }
}

pub fn replace_whole(source: &Value) -> Value {
    source.clone()
}

/// Replaces the first occurrence of `token` in `target` with the text form of
/// `source`. Strings without the token come back unchanged.
pub fn splice_first(target: &str, token: &str, source: &Value) -> String {
    target.replacen(token, &value_to_text(source), 1)
}

/// Resolved target value, or `None` when `target` is not something a token
/// can live in.
pub fn resolve(target: &Value, token: &str, source: &Value) -> Option<Value> {
    match reference_mode(target, token)? {
        ReferenceMode::WholeValue => Some(replace_whole(source)),
        ReferenceMode::Substring => {
            let text = target.as_str()?;
            Some(Value::String(splice_first(text, token, source)))
        }
    }
}
