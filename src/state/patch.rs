//! Structural patches between two serialized state values.
//!
//! Paths are JSON pointers (RFC 6901). Forward patches turn the previous
//! value into the next one; inverse patches undo them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. } => path,
        }
    }
}

/// Forward/inverse pair produced by one state transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    #[serde(rename = "forwardPatches")]
    pub forward: Vec<PatchOp>,
    #[serde(rename = "inversePatches")]
    pub inverse: Vec<PatchOp>,
}

impl PatchSet {
    pub fn between(prev: &Value, next: &Value) -> Self {
        Self {
            forward: diff(prev, next),
            inverse: diff(next, prev),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn child_path(parent: &str, token: &str) -> String {
    format!("{parent}/{}", escape_token(token))
}

/// Minimal operations turning `prev` into `next`.
pub fn diff(prev: &Value, next: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(&mut ops, "", prev, next);
    ops
}

fn diff_into(ops: &mut Vec<PatchOp>, path: &str, prev: &Value, next: &Value) {
    if prev == next {
        return;
    }
    match (prev, next) {
        (Value::Object(before), Value::Object(after)) => {
            for key in before.keys().filter(|key| !after.contains_key(*key)) {
                ops.push(PatchOp::Remove {
                    path: child_path(path, key),
                });
            }
            for (key, value) in after {
                let child = child_path(path, key);
                match before.get(key) {
                    Some(old) => diff_into(ops, &child, old, value),
                    None => ops.push(PatchOp::Add {
                        path: child,
                        value: value.clone(),
                    }),
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let shared = before.len().min(after.len());
            for index in 0..shared {
                diff_into(
                    ops,
                    &child_path(path, &index.to_string()),
                    &before[index],
                    &after[index],
                );
            }
            for (index, value) in after.iter().enumerate().skip(shared) {
                ops.push(PatchOp::Add {
                    path: child_path(path, &index.to_string()),
                    value: value.clone(),
                });
            }
            for index in (shared..before.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: child_path(path, &index.to_string()),
                });
            }
        }
        _ => ops.push(PatchOp::Replace {
            path: path.to_string(),
            value: next.clone(),
        }),
    }
}

fn split_pointer(path: &str) -> Result<(Vec<String>, String)> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(Error::illegal_state(format!("invalid patch path: {path}")));
    };
    let mut tokens: Vec<String> = rest.split('/').map(unescape_token).collect();
    let last = tokens.pop().unwrap_or_default();
    Ok((tokens, last))
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String], path: &str) -> Result<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => token
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index)),
            _ => None,
        }
        .ok_or_else(|| Error::illegal_state(format!("patch path not found: {path}")))?;
    }
    Ok(current)
}

fn array_index(token: &str, len: usize, allow_end: bool, path: &str) -> Result<usize> {
    let index = if allow_end && token == "-" {
        len
    } else {
        token
            .parse::<usize>()
            .map_err(|_| Error::illegal_state(format!("invalid array index in {path}")))?
    };
    let bound = if allow_end { len } else { len.saturating_sub(1) };
    if index > bound || (!allow_end && len == 0) {
        return Err(Error::illegal_state(format!("array index out of range: {path}")));
    }
    Ok(index)
}

/// Applies `ops` in order. On error `doc` may be partially patched.
pub fn apply(doc: &mut Value, ops: &[PatchOp]) -> Result<()> {
    for op in ops {
        apply_one(doc, op)?;
    }
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOp) -> Result<()> {
    let path = op.path();
    if path.is_empty() {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(Error::illegal_state("cannot remove the document root")),
        };
    }

    let (parents, last) = split_pointer(path)?;
    let target = resolve_mut(doc, &parents, path)?;
    match (target, op) {
        (Value::Object(map), PatchOp::Add { value, .. }) => {
            map.insert(last, value.clone());
        }
        (Value::Object(map), PatchOp::Replace { value, .. }) => {
            let slot = map
                .get_mut(&last)
                .ok_or_else(|| Error::illegal_state(format!("patch path not found: {path}")))?;
            *slot = value.clone();
        }
        (Value::Object(map), PatchOp::Remove { .. }) => {
            map.remove(&last)
                .ok_or_else(|| Error::illegal_state(format!("patch path not found: {path}")))?;
        }
        (Value::Array(items), PatchOp::Add { value, .. }) => {
            let index = array_index(&last, items.len(), true, path)?;
            items.insert(index, value.clone());
        }
        (Value::Array(items), PatchOp::Replace { value, .. }) => {
            let index = array_index(&last, items.len(), false, path)?;
            items[index] = value.clone();
        }
        (Value::Array(items), PatchOp::Remove { .. }) => {
            let index = array_index(&last, items.len(), false, path)?;
            items.remove(index);
        }
        _ => {
            return Err(Error::illegal_state(format!(
                "patch parent is not a container: {path}"
            )))
        }
    }
    Ok(())
}
