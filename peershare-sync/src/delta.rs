//! Structural diff / patch over JSON state.
//!
//! Paths are dot-joined segments from the root (`""` is the root itself);
//! array elements are addressed by decimal index. Object keys containing a
//! `.` are not addressable and are diffed as part of their parent.
//!
//! ```text
//! snapshot ──calculate_delta(new)──► [DeltaChange] ──compress_changes──► wire
//!                                                                         │
//! base ◄──────────apply_delta──────── [DeltaChange] ◄─decompress_changes──┘
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of a single structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// One structural change at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl DeltaChange {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            kind: ChangeKind::Add,
            path: path.into(),
            value: Some(value),
            old_value: None,
        }
    }

    pub fn update(path: impl Into<String>, value: Value, old_value: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            path: path.into(),
            value: Some(value),
            old_value: Some(old_value),
        }
    }

    pub fn delete(path: impl Into<String>, old_value: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            path: path.into(),
            value: None,
            old_value: Some(old_value),
        }
    }

    /// Whether this change replaces the whole state.
    pub fn is_root_add(&self) -> bool {
        self.kind == ChangeKind::Add && self.path.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("Malformed change list: {0}")]
    Malformed(String),
}

/// Tracks the last transmitted snapshot and diffs new states against it.
#[derive(Debug, Default)]
pub struct DeltaEngine {
    snapshot: Option<Value>,
}

impl DeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes turning the previous snapshot into `new_state`. The first
    /// call yields a single root add. `new_state` becomes the snapshot.
    pub fn calculate_delta(&mut self, new_state: &Value) -> Vec<DeltaChange> {
        let changes = match &self.snapshot {
            None => vec![DeltaChange::add("", new_state.clone())],
            Some(previous) => {
                let mut out = Vec::new();
                diff_into(previous, new_state, "", &mut out);
                out
            }
        };
        self.snapshot = Some(new_state.clone());
        changes
    }

    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// Replace the snapshot without emitting changes (full broadcasts,
    /// cold-start caching).
    pub fn set_snapshot(&mut self, state: Value) {
        self.snapshot = Some(state);
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_owned()
    } else {
        format!("{parent}.{segment}")
    }
}

/// Keys that survive a round trip through a dotted path. Objects holding
/// any other key are diffed as a whole.
fn is_addressable(key: &str) -> bool {
    !key.is_empty() && !key.contains('.')
}

fn diff_into(old: &Value, new: &Value, path: &str, out: &mut Vec<DeltaChange>) {
    if values_equal(old, new) {
        return;
    }
    match (old, new) {
        (Value::Object(before), Value::Object(after))
            if after.keys().chain(before.keys()).all(|k| is_addressable(k)) =>
        {
            for (key, value) in after {
                let path = child_path(path, key);
                match before.get(key) {
                    Some(previous) => diff_into(previous, value, &path, out),
                    None => out.push(DeltaChange::add(path, value.clone())),
                }
            }
            for (key, previous) in before {
                if !after.contains_key(key) {
                    out.push(DeltaChange::delete(child_path(path, key), previous.clone()));
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let common = before.len().min(after.len());
            for i in 0..common {
                diff_into(&before[i], &after[i], &child_path(path, &i.to_string()), out);
            }
            for (i, value) in after.iter().enumerate().skip(common) {
                out.push(DeltaChange::add(child_path(path, &i.to_string()), value.clone()));
            }
            // Highest index first so replay truncates
            for i in (common..before.len()).rev() {
                out.push(DeltaChange::delete(
                    child_path(path, &i.to_string()),
                    before[i].clone(),
                ));
            }
        }
        _ => out.push(DeltaChange::update(path, new.clone(), old.clone())),
    }
}

/// Replay `changes` over a copy of `base`.
pub fn apply_delta(base: &Value, changes: &[DeltaChange]) -> Value {
    let mut state = base.clone();
    for change in changes {
        apply_change(&mut state, change);
    }
    state
}

fn apply_change(state: &mut Value, change: &DeltaChange) {
    if change.path.is_empty() {
        *state = match change.kind {
            ChangeKind::Delete => Value::Null,
            _ => change.value.clone().unwrap_or(Value::Null),
        };
        return;
    }

    let segments: Vec<&str> = change.path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    match change.kind {
        ChangeKind::Add | ChangeKind::Update => {
            let mut current = state;
            for segment in parents {
                current = child_or_insert(current, segment);
            }
            *child_or_insert(current, last) = change.value.clone().unwrap_or(Value::Null);
        }
        ChangeKind::Delete => {
            let mut current = state;
            for segment in parents {
                match child_existing(current, segment) {
                    Some(next) => current = next,
                    None => return,
                }
            }
            match current {
                Value::Object(map) => {
                    map.remove(*last);
                }
                Value::Array(items) => {
                    if let Ok(i) = last.parse::<usize>() {
                        if i < items.len() {
                            items.remove(i);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Step into `segment`, creating the container or slot when missing.
fn child_or_insert<'a>(current: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = segment.parse::<usize>().ok().filter(|_| current.is_array());
    if index.is_none() && !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match (current, index) {
        (Value::Array(items), Some(i)) => {
            if items.len() <= i {
                items.resize(i + 1, Value::Null);
            }
            &mut items[i]
        }
        (Value::Object(map), _) => map.entry(segment.to_owned()).or_insert(Value::Null),
        // containers normalized above
        (other, _) => other,
    }
}

fn child_existing<'a>(current: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum CompactKind {
    #[serde(rename = "a")]
    Add,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

/// Wire form of a change: `{t, p, v}` without the old value.
#[derive(Debug, Serialize, Deserialize)]
struct CompactChange {
    t: CompactKind,
    p: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<Value>,
}

/// Collapse to the last change per path (kept at that change's position)
/// and encode the compact wire form.
pub fn compress_changes(changes: &[DeltaChange]) -> Value {
    let mut last_index: HashMap<&str, usize> = HashMap::with_capacity(changes.len());
    for (i, change) in changes.iter().enumerate() {
        last_index.insert(change.path.as_str(), i);
    }

    let compact: Vec<Value> = changes
        .iter()
        .enumerate()
        .filter(|(i, change)| last_index.get(change.path.as_str()) == Some(i))
        .map(|(_, change)| {
            let t = match change.kind {
                ChangeKind::Add => CompactKind::Add,
                ChangeKind::Update => CompactKind::Update,
                ChangeKind::Delete => CompactKind::Delete,
            };
            let v = match change.kind {
                ChangeKind::Delete => None,
                _ => change.value.clone(),
            };
            serde_json::to_value(CompactChange {
                t,
                p: change.path.clone(),
                v,
            })
            .unwrap_or(Value::Null)
        })
        .collect();
    Value::Array(compact)
}

/// Inverse of [`compress_changes`]. Old values are not carried on the wire.
pub fn decompress_changes(compact: &Value) -> Result<Vec<DeltaChange>, DeltaError> {
    let items: Vec<CompactChange> =
        serde_json::from_value(compact.clone()).map_err(|e| DeltaError::Malformed(e.to_string()))?;

    Ok(items
        .into_iter()
        .map(|item| DeltaChange {
            kind: match item.t {
                CompactKind::Add => ChangeKind::Add,
                CompactKind::Update => ChangeKind::Update,
                CompactKind::Delete => ChangeKind::Delete,
            },
            path: item.p,
            value: item.v,
            old_value: None,
        })
        .collect())
}

/// Structural equality. Integers compare exactly; a float compares by
/// numeric value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => {
            matches!((x.as_f64(), y.as_f64()), (Some(p), Some(q)) if p == q)
        }
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}
