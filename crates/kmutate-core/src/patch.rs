//! JSON patch operations (RFC 6902) and their application
//!
//! A [`Patch`] is an ordered list of [`PatchOperation`]s. Order matters: later
//! operations address the document as left by earlier ones, so array removals
//! are emitted from the highest index down.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::fmt;

use crate::error::{CoreError, Result};

/// A single structural edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert a value (object member or array element)
    Add { path: String, value: JsonValue },

    /// Remove an existing value
    Remove { path: String },

    /// Replace an existing value
    Replace { path: String, value: JsonValue },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: JsonValue) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<String>, value: JsonValue) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    /// JSON pointer this operation targets
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }

    /// Wire name of the operation
    pub fn op(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Replace { .. } => "replace",
        }
    }
}

/// Ordered sequence of patch operations
///
/// Serializes to the `application/json-patch+json` wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(pub Vec<PatchOperation>);

impl Patch {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, op: PatchOperation) {
        self.0.push(op);
    }

    /// An empty patch means "nothing to change"
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchOperation> {
        self.0.iter()
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.0
    }

    pub fn into_operations(self) -> Vec<PatchOperation> {
        self.0
    }

    /// Apply every operation in order, mutating `doc`
    ///
    /// On error the document may be partially patched; use [`Patch::apply`]
    /// when the original must be preserved.
    pub fn apply_to(&self, doc: &mut JsonValue) -> Result<()> {
        for op in &self.0 {
            apply_operation(doc, op)?;
        }
        Ok(())
    }

    /// Apply to a copy of `doc` and return the result
    pub fn apply(&self, doc: &JsonValue) -> Result<JsonValue> {
        let mut patched = doc.clone();
        self.apply_to(&mut patched)?;
        Ok(patched)
    }

    /// Wire body as a JSON value
    pub fn to_value(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    /// Indented wire body, for logs
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Compact wire JSON; `{:#}` for the indented form
impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = if f.alternate() {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        f.write_str(&body.map_err(|_| fmt::Error)?)
    }
}

impl From<Vec<PatchOperation>> for Patch {
    fn from(ops: Vec<PatchOperation>) -> Self {
        Self(ops)
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOperation;
    type IntoIter = std::slice::Iter<'a, PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Patch {
    type Item = PatchOperation;
    type IntoIter = std::vec::IntoIter<PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Escape a single reference token (`~` → `~0`, `/` → `~1`)
pub fn escape_token(token: &str) -> Cow<'_, str> {
    if token.contains(['~', '/']) {
        Cow::Owned(token.replace('~', "~0").replace('/', "~1"))
    } else {
        Cow::Borrowed(token)
    }
}

/// Append an escaped token to a pointer
pub fn join_pointer(parent: &str, token: &str) -> String {
    format!("{}/{}", parent, escape_token(token))
}

/// Split a JSON pointer into unescaped reference tokens
///
/// The empty pointer addresses the whole document and yields no tokens.
pub fn parse_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }

    let Some(rest) = path.strip_prefix('/') else {
        return Err(CoreError::InvalidPointer {
            path: path.to_string(),
            reason: "must be empty or start with '/'".to_string(),
        });
    };

    rest.split('/')
        .map(|raw| unescape_token(raw, path))
        .collect()
}

fn unescape_token(raw: &str, path: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => {
                return Err(CoreError::InvalidPointer {
                    path: path.to_string(),
                    reason: format!("bad escape sequence in token '{}'", raw),
                });
            }
        }
    }

    Ok(out)
}

/// Array index token: decimal digits, no leading zeros
fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if token.len() > 1 && token.starts_with('0') {
        return None;
    }
    token.parse().ok()
}

fn target_error(op: &PatchOperation, reason: impl Into<String>) -> CoreError {
    CoreError::PatchTarget {
        op: op.op(),
        path: op.path().to_string(),
        reason: reason.into(),
    }
}

/// Walk `tokens` from `doc`, returning the addressed value
fn resolve_mut<'a>(
    doc: &'a mut JsonValue,
    tokens: &[String],
    op: &PatchOperation,
) -> Result<&'a mut JsonValue> {
    let mut current = doc;

    for token in tokens {
        current = match current {
            JsonValue::Object(map) => map.get_mut(token),
            JsonValue::Array(items) => match parse_index(token) {
                Some(index) => items.get_mut(index),
                None => None,
            },
            _ => None,
        }
        .ok_or_else(|| target_error(op, format!("path segment '{}' does not exist", token)))?;
    }

    Ok(current)
}

fn apply_operation(doc: &mut JsonValue, op: &PatchOperation) -> Result<()> {
    let tokens = parse_pointer(op.path())?;

    let Some((last, parents)) = tokens.split_last() else {
        // Root pointer
        return match op {
            PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOperation::Remove { .. } => Err(target_error(op, "cannot remove the document root")),
        };
    };

    let parent = resolve_mut(doc, parents, op)?;

    match (op, parent) {
        (PatchOperation::Add { value, .. }, JsonValue::Object(map)) => {
            map.insert(last.clone(), value.clone());
        }
        (PatchOperation::Add { value, .. }, JsonValue::Array(items)) => {
            let index = if last == "-" {
                items.len()
            } else {
                parse_index(last)
                    .filter(|i| *i <= items.len())
                    .ok_or_else(|| target_error(op, format!("index '{}' out of bounds", last)))?
            };
            items.insert(index, value.clone());
        }
        (PatchOperation::Remove { .. }, JsonValue::Object(map)) => {
            map.remove(last)
                .ok_or_else(|| target_error(op, format!("member '{}' does not exist", last)))?;
        }
        (PatchOperation::Remove { .. }, JsonValue::Array(items)) => {
            let index = parse_index(last)
                .filter(|i| *i < items.len())
                .ok_or_else(|| target_error(op, format!("index '{}' out of bounds", last)))?;
            items.remove(index);
        }
        (PatchOperation::Replace { value, .. }, JsonValue::Object(map)) => {
            let slot = map
                .get_mut(last)
                .ok_or_else(|| target_error(op, format!("member '{}' does not exist", last)))?;
            *slot = value.clone();
        }
        (PatchOperation::Replace { value, .. }, JsonValue::Array(items)) => {
            let slot = parse_index(last)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| target_error(op, format!("index '{}' out of bounds", last)))?;
            *slot = value.clone();
        }
        (_, _) => return Err(target_error(op, "parent is not an object or array")),
    }

    Ok(())
}
