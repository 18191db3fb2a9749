//! Transformer — decoded changes to per-transaction SQL scripts.
//!
//! Consumes segment entries in LSN order, parses them through the plugin
//! dispatcher, buffers each transaction between its BEGIN and COMMIT, and
//! on COMMIT publishes one script named by the commit LSN under
//! `cdc/<slot>/sql/`. Scripts are written to a temp file and renamed into
//! place, so a partially written transaction can never be applied; a
//! restart simply discards the open buffer.
//!
//! # Idempotency
//!
//! Every INSERT becomes an upsert keyed by the relation's replica
//! identity; UPDATE and DELETE key by replica identity; TRUNCATE passes
//! through. Re-applying any committed suffix therefore converges to the
//! same target state, which is what lets the applier be at-least-once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Plugin;
use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;
use crate::pgsql::{quote_ident, quote_literal, quote_qualified};
use crate::plan::WorkPlan;

use super::record::{self, ChangeAction, ChangeRecord, ColumnValue};
use super::segment::SegmentEntry;

/// Sentinel comment closing every published script; the applier refuses
/// scripts without it.
pub const COMMIT_SENTINEL: &str = "-- COMMIT ";

/// Replica-identity columns per `schema.table`, from the work plan.
pub fn identity_map(plan: &WorkPlan) -> HashMap<String, Vec<String>> {
    plan.tables
        .iter()
        .filter(|t| !t.identity_columns.is_empty())
        .map(|t| (t.qualified_name(), t.identity_columns.clone()))
        .collect()
}

/// Name of the script holding the transaction committed at `lsn`.
pub fn script_name(lsn: Lsn) -> String {
    format!("{}.sql", lsn.to_segment_name())
}

/// Scripts present in `dir`, in commit order.
pub fn list_scripts(dir: &Path) -> Result<Vec<(Lsn, PathBuf)>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(ShuttleError::io(dir.display().to_string(), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| ShuttleError::io(dir.display().to_string(), e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".sql") else {
            continue;
        };
        if let Some(lsn) = Lsn::from_segment_name(stem) {
            out.push((lsn, entry.path()));
        }
    }
    out.sort_by_key(|(lsn, _)| *lsn);
    Ok(out)
}

struct TxnBuffer {
    xid: Option<i64>,
    begin_lsn: Lsn,
    statements: Vec<String>,
}

/// Streaming transformer state.
pub struct Transformer {
    plugin: Plugin,
    out_dir: PathBuf,
    identity: HashMap<String, Vec<String>>,
    open: Option<TxnBuffer>,
    /// Commits at or below this are already published (resume point).
    last_emitted: Lsn,
}

impl Transformer {
    pub fn new(
        plugin: Plugin,
        out_dir: impl Into<PathBuf>,
        identity: HashMap<String, Vec<String>>,
        resume_after: Lsn,
    ) -> Self {
        Self {
            plugin,
            out_dir: out_dir.into(),
            identity,
            open: None,
            last_emitted: resume_after,
        }
    }

    pub fn last_emitted(&self) -> Lsn {
        self.last_emitted
    }

    /// Feed one raw entry. Returns the commit LSN and script path when a
    /// transaction was published.
    pub fn feed(&mut self, entry: &SegmentEntry) -> Result<Option<(Lsn, PathBuf)>> {
        let Some(rec) = record::parse(self.plugin, entry.lsn, entry.xid, &entry.data)? else {
            return Ok(None);
        };
        self.feed_record(rec)
    }

    fn feed_record(&mut self, rec: ChangeRecord) -> Result<Option<(Lsn, PathBuf)>> {
        match rec.action {
            ChangeAction::Begin => {
                if let Some(stale) = self.open.take() {
                    // only possible after a receiver restart replayed a
                    // partially-received transaction
                    warn!(
                        begin = %stale.begin_lsn,
                        xid = stale.xid,
                        "discarding unterminated transaction buffer"
                    );
                }
                self.open = Some(TxnBuffer {
                    xid: rec.xid,
                    begin_lsn: rec.lsn,
                    statements: Vec::new(),
                });
                Ok(None)
            }
            ChangeAction::Commit => {
                let Some(txn) = self.open.take() else {
                    // head of a replayed stream; its script was already
                    // published by a previous pass
                    return Ok(None);
                };
                if rec.lsn <= self.last_emitted {
                    return Ok(None);
                }
                let path = self.publish(&txn, &rec)?;
                self.last_emitted = rec.lsn;
                Ok(Some((rec.lsn, path)))
            }
            ChangeAction::Message => Ok(None),
            _ => {
                let identity = rec
                    .qualified_table()
                    .and_then(|q| self.identity.get(&q).cloned())
                    .unwrap_or_default();
                let statement = statement_for(&rec, &identity)?;
                if let Some(txn) = self.open.as_mut() {
                    if let Some(statement) = statement {
                        txn.statements.push(statement);
                    }
                } else {
                    debug!(lsn = %rec.lsn, "change outside any transaction, skipped");
                }
                Ok(None)
            }
        }
    }

    /// Write the transaction script atomically: temp file, fsync, rename.
    fn publish(&self, txn: &TxnBuffer, commit: &ChangeRecord) -> Result<PathBuf> {
        let final_path = self.out_dir.join(script_name(commit.lsn));
        let tmp_path = self.out_dir.join(format!(".{}.tmp", script_name(commit.lsn)));

        let mut script = String::with_capacity(txn.statements.len() * 64 + 128);
        script.push_str(&format!(
            "-- xid={} begin={} commit={}{}\n",
            txn.xid.map_or_else(|| "?".into(), |x| x.to_string()),
            txn.begin_lsn,
            commit.lsn,
            commit
                .commit_timestamp
                .as_deref()
                .map(|ts| format!(" ts={ts}"))
                .unwrap_or_default(),
        ));
        for statement in &txn.statements {
            script.push_str(statement);
            script.push('\n');
        }
        script.push_str(COMMIT_SENTINEL);
        script.push_str(&commit.lsn.to_string());
        script.push('\n');

        std::fs::write(&tmp_path, &script)
            .map_err(|e| ShuttleError::io(tmp_path.display().to_string(), e))?;
        let file = std::fs::File::open(&tmp_path)
            .map_err(|e| ShuttleError::io(tmp_path.display().to_string(), e))?;
        file.sync_all()
            .map_err(|e| ShuttleError::io(tmp_path.display().to_string(), e))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| ShuttleError::io(final_path.display().to_string(), e))?;
        Ok(final_path)
    }
}

// ── Statement generation ───────────────────────────────────────────────────

/// Render one change as idempotent SQL. `identity` is the replica-identity
/// column list from the plan (may be empty for identity-less tables).
pub fn statement_for(rec: &ChangeRecord, identity: &[String]) -> Result<Option<String>> {
    let Some(schema) = rec.schema.as_deref() else {
        return Ok(None);
    };
    let Some(table) = rec.table.as_deref() else {
        return Ok(None);
    };
    let tbl = quote_qualified(schema, table);

    match rec.action {
        ChangeAction::Insert => Ok(Some(insert_statement(&tbl, &rec.columns, identity))),
        ChangeAction::Update => {
            let where_cols = effective_identity(rec, identity);
            if where_cols.is_empty() {
                return Err(ShuttleError::Decode {
                    plugin: "transform".into(),
                    lsn: rec.lsn.to_string(),
                    detail: format!("UPDATE on {tbl} without replica identity"),
                });
            }
            let sets: Vec<String> = rec
                .columns
                .iter()
                .filter(|c| !c.unchanged_toast)
                .map(|c| format!("{} = {}", quote_ident(&c.name), literal(c)))
                .collect();
            if sets.is_empty() {
                return Ok(None);
            }
            Ok(Some(format!(
                "UPDATE {tbl} SET {} WHERE {};",
                sets.join(", "),
                conditions(&where_cols)
            )))
        }
        ChangeAction::Delete => {
            let where_cols = effective_identity(rec, identity);
            if where_cols.is_empty() {
                return Err(ShuttleError::Decode {
                    plugin: "transform".into(),
                    lsn: rec.lsn.to_string(),
                    detail: format!("DELETE on {tbl} without replica identity"),
                });
            }
            Ok(Some(format!(
                "DELETE FROM {tbl} WHERE {};",
                conditions(&where_cols)
            )))
        }
        ChangeAction::Truncate => Ok(Some(format!("TRUNCATE ONLY {tbl};"))),
        _ => Ok(None),
    }
}

/// Upsert keyed on the replica identity; plain INSERT when the table has
/// none (nothing to conflict on).
fn insert_statement(tbl: &str, columns: &[ColumnValue], identity: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let values: Vec<String> = columns.iter().map(literal).collect();
    let insert = format!(
        "INSERT INTO {tbl} ({}) VALUES ({})",
        names.join(", "),
        values.join(", ")
    );

    let have_all_keys = !identity.is_empty()
        && identity
            .iter()
            .all(|k| columns.iter().any(|c| &c.name == k));
    if !have_all_keys {
        return format!("{insert};");
    }

    let keys: Vec<String> = identity.iter().map(|k| quote_ident(k)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !identity.contains(&c.name))
        .map(|c| {
            let name = quote_ident(&c.name);
            format!("{name} = EXCLUDED.{name}")
        })
        .collect();
    if updates.is_empty() {
        format!("{insert} ON CONFLICT ({}) DO NOTHING;", keys.join(", "))
    } else {
        format!(
            "{insert} ON CONFLICT ({}) DO UPDATE SET {};",
            keys.join(", "),
            updates.join(", ")
        )
    }
}

/// Key columns for UPDATE/DELETE: the decoded old key when present,
/// otherwise the identity columns picked out of the new tuple (the key
/// did not change).
fn effective_identity(rec: &ChangeRecord, identity: &[String]) -> Vec<ColumnValue> {
    if !rec.identity.is_empty() {
        return rec.identity.clone();
    }
    rec.columns
        .iter()
        .filter(|c| identity.contains(&c.name))
        .cloned()
        .collect()
}

fn conditions(cols: &[ColumnValue]) -> String {
    cols.iter()
        .map(|c| {
            let name = quote_ident(&c.name);
            match &c.value {
                Some(_) => format!("{name} = {}", literal(c)),
                None => format!("{name} IS NULL"),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Quote a decoded value as a cast literal: `'x'::text`, `NULL::integer`.
fn literal(c: &ColumnValue) -> String {
    match &c.value {
        Some(v) if c.type_name.is_empty() => quote_literal(v),
        Some(v) => format!("{}::{}", quote_literal(v), c.type_name),
        None if c.type_name.is_empty() => "NULL".to_string(),
        None => format!("NULL::{}", c.type_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::record::ChangeAction;

    fn lsn(s: &str) -> Lsn {
        s.parse().unwrap()
    }

    fn insert_rec(values: &[(&str, &str, Option<&str>)]) -> ChangeRecord {
        let mut rec = ChangeRecord::bare(lsn("0/100"), Some(1), ChangeAction::Insert);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        rec.columns = values
            .iter()
            .map(|(n, t, v)| ColumnValue::new(n, t, *v))
            .collect();
        rec
    }

    #[test]
    fn test_insert_becomes_upsert() {
        let rec = insert_rec(&[
            ("id", "integer", Some("1")),
            ("note", "text", Some("x")),
        ]);
        let sql = statement_for(&rec, &["id".to_string()]).unwrap().unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"a\" (\"id\", \"note\") \
             VALUES ('1'::integer, 'x'::text) \
             ON CONFLICT (\"id\") DO UPDATE SET \"note\" = EXCLUDED.\"note\";"
        );
    }

    #[test]
    fn test_insert_all_key_columns_does_nothing_on_conflict() {
        let rec = insert_rec(&[("id", "integer", Some("1"))]);
        let sql = statement_for(&rec, &["id".to_string()]).unwrap().unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING;"));
    }

    #[test]
    fn test_insert_without_identity_is_plain() {
        let rec = insert_rec(&[("v", "text", Some("x"))]);
        let sql = statement_for(&rec, &[]).unwrap().unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"a\" (\"v\") VALUES ('x'::text);"
        );
    }

    #[test]
    fn test_update_keys_by_old_identity() {
        let mut rec = ChangeRecord::bare(lsn("0/110"), Some(1), ChangeAction::Update);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        rec.columns = vec![
            ColumnValue::new("id", "integer", Some("2")),
            ColumnValue::new("note", "text", Some("n")),
        ];
        rec.identity = vec![ColumnValue::new("id", "integer", Some("1"))];
        let sql = statement_for(&rec, &["id".to_string()]).unwrap().unwrap();
        assert_eq!(
            sql,
            "UPDATE \"public\".\"a\" SET \"id\" = '2'::integer, \"note\" = 'n'::text \
             WHERE \"id\" = '1'::integer;"
        );
    }

    #[test]
    fn test_update_without_old_key_uses_new_tuple_identity() {
        let mut rec = ChangeRecord::bare(lsn("0/110"), Some(1), ChangeAction::Update);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        rec.columns = vec![
            ColumnValue::new("id", "integer", Some("7")),
            ColumnValue::new("note", "text", Some("n")),
        ];
        let sql = statement_for(&rec, &["id".to_string()]).unwrap().unwrap();
        assert!(sql.contains("WHERE \"id\" = '7'::integer;"));
    }

    #[test]
    fn test_update_skips_unchanged_toast() {
        let mut rec = ChangeRecord::bare(lsn("0/110"), Some(1), ChangeAction::Update);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        let mut toast = ColumnValue::new("blob", "text", None);
        toast.unchanged_toast = true;
        rec.columns = vec![ColumnValue::new("id", "integer", Some("1")), toast];
        let sql = statement_for(&rec, &["id".to_string()]).unwrap().unwrap();
        assert!(!sql.contains("blob"));
    }

    #[test]
    fn test_delete_with_null_safe_conditions() {
        let mut rec = ChangeRecord::bare(lsn("0/120"), Some(1), ChangeAction::Delete);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        rec.identity = vec![
            ColumnValue::new("id", "integer", Some("3")),
            ColumnValue::new("tag", "text", None),
        ];
        let sql = statement_for(&rec, &[]).unwrap().unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"public\".\"a\" WHERE \"id\" = '3'::integer AND \"tag\" IS NULL;"
        );
    }

    #[test]
    fn test_update_without_any_identity_is_protocol_error() {
        let mut rec = ChangeRecord::bare(lsn("0/130"), Some(1), ChangeAction::Update);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        rec.columns = vec![ColumnValue::new("v", "text", Some("x"))];
        assert!(statement_for(&rec, &[]).is_err());
    }

    #[test]
    fn test_truncate_passthrough() {
        let mut rec = ChangeRecord::bare(lsn("0/140"), Some(1), ChangeAction::Truncate);
        rec.schema = Some("public".into());
        rec.table = Some("a".into());
        let sql = statement_for(&rec, &[]).unwrap().unwrap();
        assert_eq!(sql, "TRUNCATE ONLY \"public\".\"a\";");
    }

    #[test]
    fn test_literal_quoting() {
        let c = ColumnValue::new("n", "text", Some("O'Brien"));
        assert_eq!(literal(&c), "'O''Brien'::text");
        let c = ColumnValue::new("n", "integer", None);
        assert_eq!(literal(&c), "NULL::integer");
    }

    // ── Transformer end-to-end over segment entries ────────────────────

    fn entry(lsn_s: &str, data: &str) -> SegmentEntry {
        SegmentEntry {
            lsn: lsn(lsn_s),
            xid: Some(9),
            data: data.into(),
        }
    }

    fn id_map() -> HashMap<String, Vec<String>> {
        HashMap::from([("public.a".to_string(), vec!["id".to_string()])])
    }

    #[test]
    fn test_transformer_publishes_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Transformer::new(Plugin::TestDecoding, dir.path(), id_map(), Lsn::ZERO);

        assert!(t.feed(&entry("0/100", "BEGIN 9")).unwrap().is_none());
        assert!(
            t.feed(&entry("0/110", "table public.a: INSERT: id[integer]:1 v[text]:'x'"))
                .unwrap()
                .is_none()
        );
        let (commit, path) = t
            .feed(&entry("0/120", "COMMIT 9"))
            .unwrap()
            .expect("commit publishes");
        assert_eq!(commit.to_string(), "0/120");

        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("ON CONFLICT (\"id\")"));
        assert!(script.trim_end().ends_with("-- COMMIT 0/120"));
        assert_eq!(t.last_emitted().to_string(), "0/120");
    }

    #[test]
    fn test_transformer_skips_already_emitted_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Transformer::new(
            Plugin::TestDecoding,
            dir.path(),
            id_map(),
            lsn("0/200"),
        );
        t.feed(&entry("0/100", "BEGIN 9")).unwrap();
        t.feed(&entry("0/110", "table public.a: INSERT: id[integer]:1 v[text]:'x'"))
            .unwrap();
        // replayed commit below the resume point: no script
        assert!(t.feed(&entry("0/120", "COMMIT 9")).unwrap().is_none());
        assert!(list_scripts(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_transformer_discards_partial_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Transformer::new(Plugin::TestDecoding, dir.path(), id_map(), Lsn::ZERO);

        // stream replays mid-transaction: changes before any BEGIN vanish
        t.feed(&entry("0/90", "table public.a: INSERT: id[integer]:0 v[text]:'ghost'"))
            .unwrap();
        assert!(t.feed(&entry("0/95", "COMMIT 8")).unwrap().is_none());

        // an unterminated buffer is dropped when the next BEGIN arrives
        t.feed(&entry("0/100", "BEGIN 9")).unwrap();
        t.feed(&entry("0/110", "table public.a: INSERT: id[integer]:1 v[text]:'x'"))
            .unwrap();
        t.feed(&entry("0/200", "BEGIN 10")).unwrap();
        t.feed(&entry("0/210", "table public.a: INSERT: id[integer]:2 v[text]:'y'"))
            .unwrap();
        let (commit, path) = t.feed(&entry("0/220", "COMMIT 10")).unwrap().unwrap();
        assert_eq!(commit.to_string(), "0/220");
        let script = std::fs::read_to_string(path).unwrap();
        assert!(script.contains("'2'::integer"));
        assert!(!script.contains("'1'::integer"));
    }

    #[test]
    fn test_script_listing_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0000000000000300", "0000000000000100", "0000000000000200"] {
            std::fs::write(dir.path().join(format!("{name}.sql")), "x").unwrap();
        }
        // stray files are ignored
        std::fs::write(dir.path().join(".0000000000000400.sql.tmp"), "x").unwrap();
        let scripts = list_scripts(dir.path()).unwrap();
        let lsns: Vec<String> = scripts.iter().map(|(l, _)| l.to_string()).collect();
        assert_eq!(lsns, vec!["0/100", "0/200", "0/300"]);
    }

    #[test]
    fn test_identity_map_from_plan() {
        use crate::plan::{ReplicaIdentity, SplitStrategy, TableTask, WorkPlan};
        let plan = WorkPlan {
            system_identifier: "x".into(),
            timeline_id: 1,
            snapshot: None,
            tables: vec![
                TableTask {
                    oid: 1,
                    schema: "public".into(),
                    name: "a".into(),
                    bytes: 0,
                    reltuples: 0,
                    relpages: 0,
                    replica_identity: ReplicaIdentity::Default,
                    identity_columns: vec!["id".into()],
                    is_partition_parent: false,
                    parent_oid: None,
                    split: SplitStrategy::None,
                    part_key: None,
                    exclude_data: false,
                },
                TableTask {
                    oid: 2,
                    schema: "public".into(),
                    name: "keyless".into(),
                    bytes: 0,
                    reltuples: 0,
                    relpages: 0,
                    replica_identity: ReplicaIdentity::Nothing,
                    identity_columns: vec![],
                    is_partition_parent: false,
                    parent_oid: None,
                    split: SplitStrategy::None,
                    part_key: None,
                    exclude_data: false,
                },
            ],
            parts: vec![],
            indexes: vec![],
            constraints: vec![],
            sequences: vec![],
            extensions: vec![],
            matviews: vec![],
            large_object_count: 0,
        };
        let map = identity_map(&plan);
        assert_eq!(map.get("public.a").unwrap(), &vec!["id".to_string()]);
        assert!(!map.contains_key("public.keyless"));
    }
}
