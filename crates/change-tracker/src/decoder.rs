//! Change entry decoding
//!
//! Turns a framed JSON value into a `FeedItem`. Only `seq` and `id` are
//! required; the rest of the entry is optional on the wire.

use changes_core::prelude::*;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct RawChange {
    #[serde(default)]
    seq: Option<Value>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    changes: Vec<RawRevision>,
    #[serde(default)]
    deleted: Option<bool>,
    #[serde(default)]
    doc: Option<Value>,
    #[serde(default)]
    last_seq: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawRevision {
    #[serde(default)]
    rev: Option<String>,
}

/// Decode one framed value
///
/// A rejected value is reported as `TrackerError::Decode`; callers skip it
/// and keep the attempt alive.
pub fn decode_item(value: Value) -> Result<FeedItem> {
    if !value.is_object() {
        return Err(TrackerError::decode(format!(
            "expected a change object, got {}",
            kind_of(&value)
        )));
    }

    let raw: RawChange = serde_json::from_value(value)
        .map_err(|e| TrackerError::decode(format!("invalid change entry: {}", e)))?;

    if raw.id.is_none() {
        if let Some(last_seq) = raw.last_seq {
            return Ok(FeedItem::LastSequence(Sequence::new(last_seq)));
        }
    }

    let seq = match raw.seq {
        Some(Value::Null) | None => return Err(TrackerError::decode("change entry has no seq")),
        Some(seq) => Sequence::new(seq),
    };

    let doc_id = match raw.id {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Err(TrackerError::decode(format!(
                "change entry at seq {} has no id",
                seq
            )))
        }
    };

    let mut record = ChangeRecord::new(seq, doc_id)
        .with_revisions(raw.changes.into_iter().filter_map(|c| c.rev))
        .with_deleted(raw.deleted.unwrap_or(false));
    if let Some(doc) = raw.doc.filter(Value::is_object) {
        record = record.with_doc(doc);
    }

    Ok(FeedItem::Change(record))
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
