//! The Change Record: the plugin-independent shape of one decoded change.
//!
//! Both supported output plugins (`wal2json` v2 and `test_decoding`)
//! produce the same record shape through a tagged dispatcher; everything
//! downstream of [`parse`] is plugin-agnostic.
//!
//! Within a transaction, records appear strictly between its BEGIN and
//! COMMIT, and commit LSNs are monotonically non-decreasing across the
//! stream; the transformer relies on both.

use crate::config::Plugin;
use crate::error::Result;
use crate::lsn::Lsn;

use super::{test_decoding, wal2json};

/// What a change does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Truncate,
    /// A logical decoding message (`pg_logical_emit_message`); carried for
    /// the log, never applied.
    Message,
}

/// One column of a decoded tuple, with its value still in the plugin's
/// textual form. `value == None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub name: String,
    pub type_name: String,
    pub value: Option<String>,
    /// TOASTed value the plugin did not re-emit because it is unchanged;
    /// skipped in generated SET lists.
    pub unchanged_toast: bool,
}

impl ColumnValue {
    pub fn new(name: &str, type_name: &str, value: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            value: value.map(Into::into),
            unchanged_toast: false,
        }
    }
}

/// One decoded change.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub lsn: Lsn,
    pub xid: Option<i64>,
    pub action: ChangeAction,
    pub schema: Option<String>,
    pub table: Option<String>,
    /// The new tuple for INSERT/UPDATE.
    pub columns: Vec<ColumnValue>,
    /// The old key (replica identity) for UPDATE/DELETE.
    pub identity: Vec<ColumnValue>,
    /// Commit timestamp, on COMMIT records when the plugin includes it.
    pub commit_timestamp: Option<String>,
}

impl ChangeRecord {
    pub fn bare(lsn: Lsn, xid: Option<i64>, action: ChangeAction) -> Self {
        Self {
            lsn,
            xid,
            action,
            schema: None,
            table: None,
            columns: Vec::new(),
            identity: Vec::new(),
            commit_timestamp: None,
        }
    }

    pub fn qualified_table(&self) -> Option<String> {
        match (&self.schema, &self.table) {
            (Some(s), Some(t)) => Some(format!("{s}.{t}")),
            _ => None,
        }
    }
}

/// Tagged dispatcher over the supported plugins. Returns `None` for lines
/// that decode fine but carry nothing to apply.
pub fn parse(
    plugin: Plugin,
    lsn: Lsn,
    xid: Option<i64>,
    data: &str,
) -> Result<Option<ChangeRecord>> {
    match plugin {
        Plugin::Wal2Json => wal2json::parse(lsn, xid, data),
        Plugin::TestDecoding => test_decoding::parse(lsn, xid, data),
    }
}

/// Cheap commit probe used by the receiver's endpos check, without a full
/// parse of every line.
pub fn is_commit(plugin: Plugin, data: &str) -> bool {
    match plugin {
        Plugin::Wal2Json => {
            serde_json::from_str::<serde_json::Value>(data)
                .ok()
                .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(|a| a == "C"))
                .unwrap_or(false)
        }
        Plugin::TestDecoding => data.starts_with("COMMIT"),
    }
}
