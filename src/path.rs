//! Dotted-path addressing into the stored tree.
//!
//! A path such as `"a.b.c"` is split on `.` and walked one mapping at a time.
//! Segments are always plain object keys: `"items.0"` looks up the key `"0"`,
//! it never indexes into an array.

use serde_json::{Map, Value};

use crate::error::StoreError;

/// The whole document: a JSON object at the top level.
pub type Tree = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DottedPath<'a> {
    raw: &'a str,
    segments: Vec<&'a str>,
}

impl<'a> DottedPath<'a> {
    pub fn parse(raw: &'a str) -> crate::Result<Self> {
        if raw.is_empty() {
            return Err(StoreError::Key("Please send a valid key.".to_string()));
        }
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::Key(format!(
                "Key '{}' contains an empty path segment",
                raw
            )));
        }
        Ok(Self { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        self.raw
    }

    pub fn segments(&self) -> &[&'a str] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

/// Walk `path` through nested objects. Any missing key, or any non-object
/// met before the last segment, resolves to `None`.
pub fn resolve<'t>(tree: &'t Tree, path: &DottedPath<'_>) -> Option<&'t Value> {
    let (first, rest) = path.segments.split_first()?;
    let mut current = tree.get(*first)?;
    for segment in rest {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

/// Set the value at `path`, creating intermediate objects as needed.
/// Intermediate `null`s are replaced by objects; any other non-object in the
/// way is a key error and leaves the tree untouched.
///
/// Returns the value previously stored at the leaf.
pub fn assign(tree: &mut Tree, path: &DottedPath<'_>, value: Value) -> crate::Result<Option<Value>> {
    // Check before mutating so a failed assignment does not leave behind
    // half-created parents.
    ensure_assignable(tree, path)?;

    let (leaf, parents) = path
        .segments
        .split_last()
        .ok_or_else(|| StoreError::Key("Please send a valid key.".to_string()))?;

    let mut current = tree;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert(Value::Null);
        if slot.is_null() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Key(format!(
                    "Cannot write '{}': '{}' holds {}",
                    path.raw,
                    segment,
                    kind_of(other)
                )))
            }
        };
    }
    Ok(current.insert((*leaf).to_string(), value))
}

/// Fails with a key error when `path` would have to pass through a value
/// that is neither an object nor `null`.
pub(crate) fn ensure_assignable(tree: &Tree, path: &DottedPath<'_>) -> crate::Result<()> {
    let parents = &path.segments[..path.segments.len().saturating_sub(1)];
    let mut current = tree;
    for segment in parents {
        match current.get(*segment) {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(map)) => current = map,
            Some(other) => {
                return Err(StoreError::Key(format!(
                    "Cannot write '{}': '{}' holds {}",
                    path.raw,
                    segment,
                    kind_of(other)
                )))
            }
        }
    }
    Ok(())
}

/// Truthiness as the store has always judged it: `null`, `false`, `0`, and
/// `""` are falsy; every object and array, even an empty one, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
