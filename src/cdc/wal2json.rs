//! wal2json format-version 2 parser.
//!
//! In v2 the plugin emits one JSON object per change:
//!
//! ```text
//! {"action":"B","xid":761}
//! {"action":"I","schema":"public","table":"a","columns":[
//!     {"name":"id","type":"integer","value":1},
//!     {"name":"note","type":"text","value":"x"}]}
//! {"action":"U","schema":"public","table":"a",
//!  "columns":[...],"identity":[{"name":"id","type":"integer","value":1}]}
//! {"action":"C","timestamp":"2026-02-17 10:00:00.000001+00"}
//! ```
//!
//! Values arrive as JSON scalars; they are normalized to their textual
//! form here and quoted/cast by the transformer.

use serde_json::Value;

use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;

use super::record::{ChangeAction, ChangeRecord, ColumnValue};

fn decode_err(lsn: Lsn, detail: impl Into<String>) -> ShuttleError {
    ShuttleError::Decode {
        plugin: "wal2json".to_string(),
        lsn: lsn.to_string(),
        detail: detail.into(),
    }
}

pub fn parse(lsn: Lsn, xid: Option<i64>, data: &str) -> Result<Option<ChangeRecord>> {
    let v: Value =
        serde_json::from_str(data).map_err(|e| decode_err(lsn, format!("invalid json: {e}")))?;
    let action = v
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| decode_err(lsn, "missing action"))?;

    let xid = v.get("xid").and_then(Value::as_i64).or(xid);

    let mut rec = match action {
        "B" => ChangeRecord::bare(lsn, xid, ChangeAction::Begin),
        "C" => {
            let mut rec = ChangeRecord::bare(lsn, xid, ChangeAction::Commit);
            rec.commit_timestamp = v
                .get("timestamp")
                .and_then(Value::as_str)
                .map(Into::into);
            rec
        }
        "I" => ChangeRecord::bare(lsn, xid, ChangeAction::Insert),
        "U" => ChangeRecord::bare(lsn, xid, ChangeAction::Update),
        "D" => ChangeRecord::bare(lsn, xid, ChangeAction::Delete),
        "T" => ChangeRecord::bare(lsn, xid, ChangeAction::Truncate),
        "M" => ChangeRecord::bare(lsn, xid, ChangeAction::Message),
        other => return Err(decode_err(lsn, format!("unknown action {other:?}"))),
    };

    if matches!(
        rec.action,
        ChangeAction::Insert | ChangeAction::Update | ChangeAction::Delete | ChangeAction::Truncate
    ) {
        rec.schema = v.get("schema").and_then(Value::as_str).map(Into::into);
        rec.table = v.get("table").and_then(Value::as_str).map(Into::into);
        if rec.schema.is_none() || rec.table.is_none() {
            return Err(decode_err(lsn, format!("{action} without relation")));
        }
        rec.columns = tuple(&v, "columns", lsn)?;
        rec.identity = tuple(&v, "identity", lsn)?;
    }

    Ok(Some(rec))
}

fn tuple(v: &Value, key: &str, lsn: Lsn) -> Result<Vec<ColumnValue>> {
    let Some(items) = v.get(key) else {
        return Ok(Vec::new());
    };
    let items = items
        .as_array()
        .ok_or_else(|| decode_err(lsn, format!("{key} is not an array")))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| decode_err(lsn, format!("{key} entry without name")))?;
        let type_name = item.get("type").and_then(Value::as_str).unwrap_or("text");
        let value = match item.get("value") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            // json/jsonb columns arrive as structured values
            Some(other) => Some(other.to_string()),
        };
        out.push(ColumnValue {
            name: name.to_string(),
            type_name: type_name.to_string(),
            value,
            unchanged_toast: false,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn() -> Lsn {
        "0/15D3A68".parse().unwrap()
    }

    #[test]
    fn test_parse_begin_commit() {
        let b = parse(lsn(), None, r#"{"action":"B","xid":761}"#)
            .unwrap()
            .unwrap();
        assert_eq!(b.action, ChangeAction::Begin);
        assert_eq!(b.xid, Some(761));

        let c = parse(
            lsn(),
            Some(761),
            r#"{"action":"C","timestamp":"2026-02-17 10:00:00.000001+00"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(c.action, ChangeAction::Commit);
        assert_eq!(
            c.commit_timestamp.as_deref(),
            Some("2026-02-17 10:00:00.000001+00")
        );
    }

    #[test]
    fn test_parse_insert() {
        let rec = parse(
            lsn(),
            None,
            r#"{"action":"I","schema":"public","table":"a","columns":[
                {"name":"id","type":"integer","value":1},
                {"name":"note","type":"text","value":"O'Brien"},
                {"name":"flag","type":"boolean","value":true},
                {"name":"gone","type":"text","value":null}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.action, ChangeAction::Insert);
        assert_eq!(rec.qualified_table().as_deref(), Some("public.a"));
        assert_eq!(rec.columns.len(), 4);
        assert_eq!(rec.columns[0].value.as_deref(), Some("1"));
        assert_eq!(rec.columns[1].value.as_deref(), Some("O'Brien"));
        assert_eq!(rec.columns[2].value.as_deref(), Some("true"));
        assert_eq!(rec.columns[3].value, None);
    }

    #[test]
    fn test_parse_update_with_identity() {
        let rec = parse(
            lsn(),
            None,
            r#"{"action":"U","schema":"public","table":"a",
                "columns":[{"name":"id","type":"integer","value":2},
                           {"name":"note","type":"text","value":"new"}],
                "identity":[{"name":"id","type":"integer","value":1}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.action, ChangeAction::Update);
        assert_eq!(rec.identity.len(), 1);
        assert_eq!(rec.identity[0].value.as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_delete_and_truncate() {
        let d = parse(
            lsn(),
            None,
            r#"{"action":"D","schema":"public","table":"a",
                "identity":[{"name":"id","type":"integer","value":9}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(d.action, ChangeAction::Delete);
        assert!(d.columns.is_empty());

        let t = parse(lsn(), None, r#"{"action":"T","schema":"public","table":"a"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(t.action, ChangeAction::Truncate);
    }

    #[test]
    fn test_json_column_value_kept_structured() {
        let rec = parse(
            lsn(),
            None,
            r#"{"action":"I","schema":"s","table":"t","columns":[
                {"name":"payload","type":"jsonb","value":{"a":[1,2]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.columns[0].value.as_deref(), Some(r#"{"a":[1,2]}"#));
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let err = parse(lsn(), None, "not json at all").unwrap_err();
        assert!(matches!(err, ShuttleError::Decode { .. }));

        let err = parse(lsn(), None, r#"{"action":"Z"}"#).unwrap_err();
        assert!(matches!(err, ShuttleError::Decode { .. }));

        // DML without a relation is unusable
        let err = parse(lsn(), None, r#"{"action":"I"}"#).unwrap_err();
        assert!(matches!(err, ShuttleError::Decode { .. }));
    }
}
