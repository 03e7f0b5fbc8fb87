//! Identifier keys, loose value comparison and nested property paths.

use std::fmt;

use serde_json::{Map, Number, Value};

/// Ordered identifier tuple of an entity. Composite keys hold one value per
/// identifier property.
#[derive(Clone, Debug, PartialEq)]
pub struct IdKey(Vec<Value>);

impl IdKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single<V: Into<Value>>(value: V) -> Self {
        Self(vec![value.into()])
    }

    /// Identifier read from `props` when every property in `id_props` is
    /// present and non-null.
    pub fn from_row(props: &Map<String, Value>, id_props: &[String]) -> Option<Self> {
        if id_props.is_empty() {
            return None;
        }
        let mut values = Vec::with_capacity(id_props.len());
        for prop in id_props {
            match props.get(prop) {
                None | Some(Value::Null) => return None,
                Some(value) => values.push(value.clone()),
            }
        }
        Some(Self(values))
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Canonical string used for identity lookups.
    pub fn index_key(&self) -> String {
        self.0
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(value_to_text).collect();
        f.write_str(&parts.join(","))
    }
}

/// Text form of a value as it appears when spliced into a string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Exact comparison of two JSON numbers. Integers compare as integers so
/// values beyond the `f64` mantissa stay distinct.
fn numbers_equal(x: &Number, y: &Number) -> bool {
    let integer = |n: &Number| {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    };
    match (integer(x), integer(y)) {
        (Some(a), Some(b)) => a == b,
        _ => x.as_f64() == y.as_f64(),
    }
}

/// Loose equality used when deciding whether a property changed.
///
/// Missing and `null` are equal to each other and to nothing else. Scalars of
/// different JSON types compare numerically when both sides have a numeric
/// reading (`5 == "5"`, `true == 1`). Two numbers compare exactly. Objects
/// and arrays compare structurally.
pub fn loosely_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        _ if is_nullish(a) || is_nullish(b) => is_nullish(a) && is_nullish(b),
        (Some(a), Some(b)) => match (a, b) {
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
            (Value::Array(_), _) | (_, Value::Array(_)) => a == b,
            (Value::Object(_), _) | (_, Value::Object(_)) => a == b,
            _ => match (numeric(a), numeric(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        },
        _ => false,
    }
}

/// Reads a nested value. An empty path never matches.
pub fn get_path<'a>(props: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = props.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Writes a nested value, creating intermediate objects as needed. Returns
/// `false` when an intermediate segment holds a non-container value.
pub fn set_path(props: &mut Map<String, Value>, path: &[String], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = props;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => return false,
        };
    }
    current.insert(last.clone(), value);
    true
}

/// Splits a dotted path (`"meta.label"`) into segments.
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loose_equality_matches_nullish_and_numeric_strings() {
        assert!(loosely_equal(None, Some(&Value::Null)));
        assert!(loosely_equal(Some(&json!(5)), Some(&json!("5"))));
        assert!(loosely_equal(Some(&json!(true)), Some(&json!(1))));
        assert!(!loosely_equal(Some(&json!(0)), None));
        assert!(!loosely_equal(Some(&json!("a")), Some(&json!("b"))));
        assert!(loosely_equal(
            Some(&json!({"a": [1, 2]})),
            Some(&json!({"a": [1, 2]}))
        ));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = json!(9_007_199_254_740_993_i64);
        assert!(!loosely_equal(Some(&big), Some(&json!(9_007_199_254_740_992_i64))));
        assert!(loosely_equal(Some(&big), Some(&json!(9_007_199_254_740_993_u64))));
        assert!(!loosely_equal(Some(&json!(u64::MAX)), Some(&json!(-1))));
        assert!(loosely_equal(Some(&json!(2)), Some(&json!(2.0))));
        assert!(!loosely_equal(Some(&json!(0.1)), Some(&json!(0.2))));
    }

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let mut props = Map::new();
        assert!(set_path(&mut props, &parse_path("meta.label"), json!("x")));
        assert_eq!(get_path(&props, &parse_path("meta.label")), Some(&json!("x")));
        props.insert("flat".into(), json!(1));
        assert!(!set_path(&mut props, &parse_path("flat.inner"), json!(2)));
    }

    #[test]
    fn test_id_key_display_joins_composite_values() {
        let key = IdKey::new(vec![json!(1), json!("b")]);
        assert_eq!(key.to_string(), "1,b");
        assert_ne!(key.index_key(), IdKey::single(1).index_key());
    }
}
