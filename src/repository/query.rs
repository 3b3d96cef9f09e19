//! Query evaluation and content canonicalization.

use serde_json::Value;

use crate::{
    model::{Change, ChangeContent, Entry, EntryContent, EntryType, Query, QueryType},
    Error,
};

/// Canonical text form: line endings normalized to LF with a trailing LF.
pub(crate) fn normalize_text(text: &str) -> String {
    let mut normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

/// Canonical JSON form: stable key order, pretty printed, trailing LF.
pub(crate) fn normalize_json(value: &Value) -> Result<String, Error> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}

/// Parses blob bytes into entry content of the given type. JSON entries
/// accept YAML documents too, since `.yaml`/`.yml` paths are structured.
pub(crate) fn parse_content(
    path: &str,
    entry_type: EntryType,
    bytes: &[u8],
) -> Result<EntryContent, Error> {
    match entry_type {
        EntryType::Directory => Ok(EntryContent::Directory),
        EntryType::Text => {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Storage(format!("{} is not valid UTF-8", path)))?;
            Ok(EntryContent::Text(text))
        }
        EntryType::Json => {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Storage(format!("{} is not valid UTF-8", path)))?;
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_) => serde_yaml::from_str(&text).map_err(|e| {
                    Error::QueryExecution(format!("{} is not a structured document: {}", path, e))
                })?,
            };
            Ok(EntryContent::Json(value))
        }
    }
}

fn require_json(entry: &Entry) -> Result<&Value, Error> {
    match &entry.content {
        EntryContent::Json(value) => Ok(value),
        EntryContent::Directory => Err(Error::EntryNoContent(entry.path.clone())),
        EntryContent::Text(_) => Err(Error::QueryExecution(format!(
            "JSON path queries cannot run on a text entry: {}",
            entry.path
        ))),
    }
}

/// Applies a query's projection to an already-loaded entry.
pub(crate) fn apply_query(mut entry: Entry, query: &Query) -> Result<Entry, Error> {
    match &query.r#type {
        QueryType::Identity => Ok(entry),
        QueryType::IdentityText => {
            let text = match &entry.content {
                EntryContent::Text(text) => text.clone(),
                EntryContent::Json(value) => normalize_json(value)?,
                EntryContent::Directory => {
                    return Err(Error::EntryNoContent(entry.path.clone()))
                }
            };
            entry.content = EntryContent::Text(text);
            Ok(entry)
        }
        QueryType::IdentityJson => {
            let value = match &entry.content {
                EntryContent::Json(value) => value.clone(),
                EntryContent::Text(text) => serde_json::from_str(text).map_err(|e| {
                    Error::QueryExecution(format!("{} is not JSON: {}", entry.path, e))
                })?,
                EntryContent::Directory => {
                    return Err(Error::EntryNoContent(entry.path.clone()))
                }
            };
            entry.content = EntryContent::Json(value);
            Ok(entry)
        }
        QueryType::JsonPath(exprs) => {
            let mut value = require_json(&entry)?.clone();
            for expr in exprs {
                value = eval_json_path(&value, expr)?;
            }
            entry.content = EntryContent::Json(value);
            Ok(entry)
        }
    }
}

/// Whether a JSON path expression selects a single node. Indefinite
/// expressions (wildcards, recursive descent, filters, slices, unions)
/// always produce an array.
fn is_definite(expr: &str) -> bool {
    !(expr.contains("..")
        || expr.contains('*')
        || expr.contains("?(")
        || expr.contains(':')
        || expr.contains(','))
}

/// Evaluates one JSON path expression against a document.
pub(crate) fn eval_json_path(value: &Value, expr: &str) -> Result<Value, Error> {
    let expr = expr.trim();
    let rooted;
    let expr = if expr.starts_with('$') {
        expr
    } else {
        rooted = format!("$.{}", expr);
        &rooted
    };
    let nodes = jsonpath_lib::select(value, expr)
        .map_err(|e| Error::QueryExecution(format!("invalid JSON path {}: {}", expr, e)))?;
    if is_definite(expr) {
        nodes
            .first()
            .map(|node| (*node).clone())
            .ok_or_else(|| Error::QueryExecution(format!("JSON path selected nothing: {}", expr)))
    } else {
        Ok(Value::Array(nodes.into_iter().cloned().collect()))
    }
}

/// Right-biased deep merge: objects merge recursively, anything else is
/// replaced by the overlay.
pub(crate) fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}

/// Renders the change that turns `old` into `new` at one path. Returns
/// `None` when the two sides are identical (or both absent).
pub(crate) fn entry_diff(
    path: &str,
    old: Option<&EntryContent>,
    new: Option<&EntryContent>,
) -> Result<Option<Change>, Error> {
    let change = match (old, new) {
        (None, None) => None,
        (Some(_), None) => Some(ChangeContent::Remove),
        (None, Some(EntryContent::Json(value))) => Some(ChangeContent::UpsertJson(value.clone())),
        (None, Some(EntryContent::Text(text))) => Some(ChangeContent::UpsertText(text.clone())),
        (None, Some(EntryContent::Directory)) => None,
        (Some(a), Some(b)) if a == b => None,
        (Some(EntryContent::Json(a)), Some(EntryContent::Json(b))) => {
            let patch = json_patch::diff(a, b);
            Some(ChangeContent::ApplyJsonPatch(serde_json::to_value(patch)?))
        }
        (Some(EntryContent::Text(a)), Some(EntryContent::Text(b))) => {
            Some(ChangeContent::ApplyTextPatch(
                diffy::create_patch(a, b).to_string(),
            ))
        }
        // The entry changed type; render the new side wholesale.
        (Some(_), Some(EntryContent::Json(value))) => {
            Some(ChangeContent::UpsertJson(value.clone()))
        }
        (Some(_), Some(EntryContent::Text(text))) => Some(ChangeContent::UpsertText(text.clone())),
        (Some(_), Some(EntryContent::Directory)) => None,
    };
    Ok(change.map(|content| Change {
        path: path.to_string(),
        content,
    }))
}
