//! `{{placeholder}}` expansion for binding paths, literals, and artifact names.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::document::get_path;

/// Variables visible to template expansion.
pub type Scope = Map<String, Value>;

static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();

fn placeholder() -> Option<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([\w.-]+)\s*\}\}").ok())
        .as_ref()
}

/// Replace every `{{identifier}}` in `template` with the stringified scope
/// value. Absent and null values expand to the empty string.
///
/// Identifiers are looked up as a flat key first, then as a dotted path whose
/// first segment names a scope variable (`{{item.name}}`).
pub fn expand(template: &str, scope: &Scope) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    if !template.contains("{{") {
        return template.to_string();
    }
    re.replace_all(template, |caps: &Captures| {
        lookup(scope, &caps[1]).map(stringify).unwrap_or_default()
    })
    .into_owned()
}

/// Expand a JSON value: strings are templated, everything else is cloned.
pub fn expand_value(value: &Value, scope: &Scope) -> Value {
    match value {
        Value::String(s) => Value::String(expand(s, scope)),
        other => other.clone(),
    }
}

fn lookup<'a>(scope: &'a Scope, key: &str) -> Option<&'a Value> {
    if let Some(value) = scope.get(key) {
        return Some(value);
    }
    let (head, rest) = key.split_once('.')?;
    get_path(scope.get(head)?, rest)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
