//! Dotted-path access into untyped JSON documents.
//!
//! `get_path` never fails: any absent segment, or a segment that lands on a
//! scalar, yields `None`. Numeric segments index into arrays.

use serde_json::{Map, Value};

/// Split a dotted path into its non-empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Read the value at `path`. An empty path resolves to nothing.
pub fn get_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut parts = segments(path).peekable();
    parts.peek()?;

    let mut current = document;
    for segment in parts {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects where a segment is
/// missing or holds a scalar. Existing arrays are descended when the segment
/// is an in-range index. An empty path is a no-op.
pub fn set_path(document: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = segments(path).collect();
    if parts.is_empty() {
        return;
    }
    set_segments(document, &parts, value);
}

fn set_segments(node: &mut Value, parts: &[&str], value: Value) {
    let Some((head, rest)) = parts.split_first() else {
        *node = value;
        return;
    };

    if let Value::Array(items) = node {
        if let Some(slot) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            set_segments(slot, rest, value);
            return;
        }
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let slot = map.entry(head.to_string()).or_insert(Value::Null);
        set_segments(slot, rest, value);
    }
}
