//! test_decoding textual format parser.
//!
//! The in-core `test_decoding` plugin prints one line per change:
//!
//! ```text
//! BEGIN 761
//! table public.data: INSERT: id[integer]:1 note[text]:'O''Brien'
//! table public.data: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 note[text]:'x'
//! table public.data: DELETE: id[integer]:2
//! table public.data: TRUNCATE: (no-flush)
//! COMMIT 761 (at 2026-02-17 10:00:00.000001+00)
//! ```
//!
//! Identifiers may be double-quoted with `""` doubling, type names may
//! contain spaces and brackets (`timestamp with time zone`, `text[]`),
//! and values are either single-quoted literals with `''` doubling or
//! bare tokens (`1`, `true`, `null`, `unchanged-toast-datum`).

use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;

use super::record::{ChangeAction, ChangeRecord, ColumnValue};

fn decode_err(lsn: Lsn, detail: impl Into<String>) -> ShuttleError {
    ShuttleError::Decode {
        plugin: "test_decoding".to_string(),
        lsn: lsn.to_string(),
        detail: detail.into(),
    }
}

pub fn parse(lsn: Lsn, xid: Option<i64>, data: &str) -> Result<Option<ChangeRecord>> {
    let line = data.trim_end();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix("BEGIN") {
        let xid = rest.trim().parse::<i64>().ok().or(xid);
        return Ok(Some(ChangeRecord::bare(lsn, xid, ChangeAction::Begin)));
    }

    if let Some(rest) = line.strip_prefix("COMMIT") {
        let rest = rest.trim();
        let mut words = rest.splitn(2, ' ');
        let xid = words.next().and_then(|w| w.parse::<i64>().ok()).or(xid);
        let mut rec = ChangeRecord::bare(lsn, xid, ChangeAction::Commit);
        if let Some(at) = rest.find("(at ") {
            if let Some(end) = rest[at..].find(')') {
                rec.commit_timestamp = Some(rest[at + 4..at + end].to_string());
            }
        }
        return Ok(Some(rec));
    }

    if line.starts_with("message:") {
        return Ok(Some(ChangeRecord::bare(lsn, xid, ChangeAction::Message)));
    }

    let Some(rest) = line.strip_prefix("table ") else {
        return Err(decode_err(lsn, format!("unrecognized line: {line:?}")));
    };

    let (schema, rest) = take_ident(rest).ok_or_else(|| decode_err(lsn, "bad schema name"))?;
    let rest = rest
        .strip_prefix('.')
        .ok_or_else(|| decode_err(lsn, "missing '.' after schema"))?;
    let (table, rest) = take_ident(rest).ok_or_else(|| decode_err(lsn, "bad table name"))?;
    let rest = rest
        .strip_prefix(": ")
        .ok_or_else(|| decode_err(lsn, "missing ':' after relation"))?;

    let (op, rest) = rest
        .split_once(':')
        .ok_or_else(|| decode_err(lsn, "missing operation"))?;
    let action = match op {
        "INSERT" => ChangeAction::Insert,
        "UPDATE" => ChangeAction::Update,
        "DELETE" => ChangeAction::Delete,
        "TRUNCATE" => ChangeAction::Truncate,
        other => return Err(decode_err(lsn, format!("unknown operation {other:?}"))),
    };

    let mut rec = ChangeRecord::bare(lsn, xid, action);
    rec.schema = Some(schema);
    rec.table = Some(table);

    match action {
        ChangeAction::Truncate => {}
        ChangeAction::Delete => {
            let (cols, old) = parse_columns(rest, lsn)?;
            // a DELETE's tuple *is* the replica identity
            rec.identity = if old.is_empty() { cols } else { old };
        }
        _ => {
            let (cols, old) = parse_columns(rest, lsn)?;
            rec.columns = cols;
            rec.identity = old;
        }
    }

    Ok(Some(rec))
}

/// Parse a possibly-quoted identifier. Returns the unescaped name and the
/// remaining input.
fn take_ident(s: &str) -> Option<(String, &str)> {
    let mut chars = s.char_indices();
    let (_, first) = chars.next()?;
    if first == '"' {
        let mut name = String::new();
        let mut iter = s[1..].char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            if c == '"' {
                if let Some((_, '"')) = iter.peek() {
                    name.push('"');
                    iter.next();
                } else {
                    return Some((name, &s[1 + i + 1..]));
                }
            } else {
                name.push(c);
            }
        }
        None
    } else {
        let end = s
            .find(|c: char| c == '.' || c == ':' || c.is_whitespace())
            .unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        Some((s[..end].to_string(), &s[end..]))
    }
}

/// Parse `name[type]:value ...` tokens, honoring `old-key:`/`new-tuple:`
/// bucket markers. Returns `(new_tuple, old_key)`.
fn parse_columns(input: &str, lsn: Lsn) -> Result<(Vec<ColumnValue>, Vec<ColumnValue>)> {
    let mut new_tuple: Vec<ColumnValue> = Vec::new();
    let mut old_key: Vec<ColumnValue> = Vec::new();
    let mut into_old = false;

    let mut rest = input.trim_start();
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("old-key:") {
            into_old = true;
            rest = r.trim_start();
            continue;
        }
        if let Some(r) = rest.strip_prefix("new-tuple:") {
            into_old = false;
            rest = r.trim_start();
            continue;
        }
        // TRUNCATE options and similar parenthesized notes end the list
        if rest.starts_with('(') {
            break;
        }

        let (name, r) =
            take_col_name(rest).ok_or_else(|| decode_err(lsn, format!("bad column at {rest:?}")))?;
        let r = r
            .strip_prefix('[')
            .ok_or_else(|| decode_err(lsn, format!("missing type for column {name}")))?;
        let (type_name, r) =
            take_type(r).ok_or_else(|| decode_err(lsn, format!("unterminated type for {name}")))?;
        let r = r
            .strip_prefix(':')
            .ok_or_else(|| decode_err(lsn, format!("missing value for column {name}")))?;
        let (value, unchanged, r) =
            take_value(r).ok_or_else(|| decode_err(lsn, format!("bad value for column {name}")))?;

        let column = ColumnValue {
            name,
            type_name,
            value,
            unchanged_toast: unchanged,
        };
        if into_old {
            old_key.push(column);
        } else {
            new_tuple.push(column);
        }
        rest = r.trim_start();
    }

    Ok((new_tuple, old_key))
}

fn take_col_name(s: &str) -> Option<(String, &str)> {
    if s.starts_with('"') {
        let (name, rest) = take_ident(s)?;
        Some((name, rest))
    } else {
        let end = s.find('[')?;
        if end == 0 {
            return None;
        }
        Some((s[..end].to_string(), &s[end..]))
    }
}

/// Read a bracketed type name, counting nested brackets (`integer[]`).
/// Input starts just past the opening bracket.
fn take_type(s: &str) -> Option<(String, &str)> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some((s[..i].to_string(), &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// Read one value token: a quoted literal with `''` doubling, or a bare
/// token ending at whitespace. Returns `(value, unchanged_toast, rest)`.
fn take_value(s: &str) -> Option<(Option<String>, bool, &str)> {
    if let Some(inner) = s.strip_prefix('\'') {
        let mut value = String::new();
        let mut iter = inner.char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            if c == '\'' {
                if let Some((_, '\'')) = iter.peek() {
                    value.push('\'');
                    iter.next();
                } else {
                    return Some((Some(value), false, &inner[i + 1..]));
                }
            } else {
                value.push(c);
            }
        }
        None
    } else {
        let end = s
            .find(|c: char| c.is_whitespace())
            .unwrap_or(s.len());
        let token = &s[..end];
        let rest = &s[end..];
        match token {
            "null" => Some((None, false, rest)),
            "unchanged-toast-datum" => Some((None, true, rest)),
            "" => None,
            _ => Some((Some(token.to_string()), false, rest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn() -> Lsn {
        "0/20".parse().unwrap()
    }

    #[test]
    fn test_begin_and_commit() {
        let b = parse(lsn(), None, "BEGIN 761").unwrap().unwrap();
        assert_eq!(b.action, ChangeAction::Begin);
        assert_eq!(b.xid, Some(761));

        let c = parse(lsn(), None, "COMMIT 761 (at 2026-02-17 10:00:00.000001+00)")
            .unwrap()
            .unwrap();
        assert_eq!(c.action, ChangeAction::Commit);
        assert_eq!(c.xid, Some(761));
        assert_eq!(
            c.commit_timestamp.as_deref(),
            Some("2026-02-17 10:00:00.000001+00")
        );
    }

    #[test]
    fn test_insert_with_quoted_literal() {
        let rec = parse(
            lsn(),
            None,
            "table public.data: INSERT: id[integer]:1 note[text]:'O''Brien'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.action, ChangeAction::Insert);
        assert_eq!(rec.qualified_table().as_deref(), Some("public.data"));
        assert_eq!(rec.columns.len(), 2);
        assert_eq!(rec.columns[0].value.as_deref(), Some("1"));
        assert_eq!(rec.columns[1].value.as_deref(), Some("O'Brien"));
    }

    #[test]
    fn test_update_without_key_change() {
        let rec = parse(
            lsn(),
            None,
            "table public.data: UPDATE: id[integer]:2 note[text]:'x'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.action, ChangeAction::Update);
        assert!(rec.identity.is_empty());
        assert_eq!(rec.columns.len(), 2);
    }

    #[test]
    fn test_update_with_old_key() {
        let rec = parse(
            lsn(),
            None,
            "table public.data: UPDATE: old-key: id[integer]:1 \
             new-tuple: id[integer]:2 note[text]:'x'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.identity.len(), 1);
        assert_eq!(rec.identity[0].value.as_deref(), Some("1"));
        assert_eq!(rec.columns.len(), 2);
        assert_eq!(rec.columns[0].value.as_deref(), Some("2"));
    }

    #[test]
    fn test_delete_tuple_becomes_identity() {
        let rec = parse(lsn(), None, "table public.data: DELETE: id[integer]:3")
            .unwrap()
            .unwrap();
        assert_eq!(rec.action, ChangeAction::Delete);
        assert!(rec.columns.is_empty());
        assert_eq!(rec.identity.len(), 1);
    }

    #[test]
    fn test_truncate_with_options() {
        let rec = parse(lsn(), None, "table public.data: TRUNCATE: (no-flush)")
            .unwrap()
            .unwrap();
        assert_eq!(rec.action, ChangeAction::Truncate);
    }

    #[test]
    fn test_multiword_and_array_types() {
        let rec = parse(
            lsn(),
            None,
            "table public.t: INSERT: ts[timestamp with time zone]:'2026-02-17 10:00:00+00' \
             tags[text[]]:'{a,b}' price[numeric(10,2)]:1.50",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.columns[0].type_name, "timestamp with time zone");
        assert_eq!(rec.columns[1].type_name, "text[]");
        assert_eq!(rec.columns[1].value.as_deref(), Some("{a,b}"));
        assert_eq!(rec.columns[2].type_name, "numeric(10,2)");
    }

    #[test]
    fn test_quoted_identifiers() {
        let rec = parse(
            lsn(),
            None,
            "table public.\"Mixed Case\": INSERT: \"Weird \"\"Col\"\"\"[text]:'v'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.table.as_deref(), Some("Mixed Case"));
        assert_eq!(rec.columns[0].name, "Weird \"Col\"");
    }

    #[test]
    fn test_null_and_unchanged_toast() {
        let rec = parse(
            lsn(),
            None,
            "table public.t: UPDATE: id[integer]:1 blob[text]:unchanged-toast-datum gone[text]:null",
        )
        .unwrap()
        .unwrap();
        assert_eq!(rec.columns[1].unchanged_toast, true);
        assert_eq!(rec.columns[1].value, None);
        assert_eq!(rec.columns[2].unchanged_toast, false);
        assert_eq!(rec.columns[2].value, None);
    }

    #[test]
    fn test_message_lines_pass_through() {
        let rec = parse(lsn(), None, "message: transactional: true prefix: app, sz: 4 content:ping")
            .unwrap()
            .unwrap();
        assert_eq!(rec.action, ChangeAction::Message);
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        assert!(matches!(
            parse(lsn(), None, "something unexpected"),
            Err(ShuttleError::Decode { .. })
        ));
        assert!(matches!(
            parse(lsn(), None, "table public.t: MERGE: x[int]:1"),
            Err(ShuttleError::Decode { .. })
        ));
        assert!(matches!(
            parse(lsn(), None, "table public.t: INSERT: brokencolumn"),
            Err(ShuttleError::Decode { .. })
        ));
    }
}
