//! `compare schema` and `compare data`.
//!
//! Schema comparison introspects both sides with the same filters and
//! diffs the plans under task-identity-keyed comparison (qualified names,
//! not OIDs: the target assigns its own). Data comparison computes a
//! `(row count, checksum)` pair per table on each side, where the
//! checksum is a 64-bit xor-aggregate of `hashtextextended(row::text)`,
//! order-independent and cheap enough to run in one scan.

use std::collections::BTreeMap;

use tokio_postgres::Client;
use tracing::info;

use crate::config::CloneOptions;
use crate::error::Result;
use crate::filters::FilterSet;
use crate::introspect::{self, IntrospectOptions};
use crate::pgsql::{PgConn, quote_qualified};
use crate::plan::WorkPlan;

/// One schema difference, rendered for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDiff {
    MissingTable(String),
    ExtraTable(String),
    MissingIndex(String),
    MissingConstraint(String),
    MissingSequence(String),
}

impl std::fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaDiff::MissingTable(n) => write!(f, "table only on source: {n}"),
            SchemaDiff::ExtraTable(n) => write!(f, "table only on target: {n}"),
            SchemaDiff::MissingIndex(n) => write!(f, "index missing on target: {n}"),
            SchemaDiff::MissingConstraint(n) => write!(f, "constraint missing on target: {n}"),
            SchemaDiff::MissingSequence(n) => write!(f, "sequence missing on target: {n}"),
        }
    }
}

/// Diff two plans by object identity.
pub fn diff_plans(source: &WorkPlan, target: &WorkPlan) -> Vec<SchemaDiff> {
    let mut diffs = Vec::new();

    let src_tables: BTreeMap<String, &crate::plan::TableTask> = source
        .tables
        .iter()
        .map(|t| (t.qualified_name(), t))
        .collect();
    let dst_tables: BTreeMap<String, &crate::plan::TableTask> = target
        .tables
        .iter()
        .map(|t| (t.qualified_name(), t))
        .collect();

    for name in src_tables.keys() {
        if !dst_tables.contains_key(name) {
            diffs.push(SchemaDiff::MissingTable(name.clone()));
        }
    }
    for name in dst_tables.keys() {
        if !src_tables.contains_key(name) {
            diffs.push(SchemaDiff::ExtraTable(name.clone()));
        }
    }

    let dst_indexes: Vec<String> = target
        .indexes
        .iter()
        .map(|i| format!("{}.{}", i.schema, i.name))
        .collect();
    for ix in &source.indexes {
        let name = format!("{}.{}", ix.schema, ix.name);
        if !dst_indexes.contains(&name) {
            diffs.push(SchemaDiff::MissingIndex(name));
        }
    }

    let dst_constraints: Vec<&String> = target.constraints.iter().map(|c| &c.name).collect();
    for c in &source.constraints {
        if !dst_constraints.contains(&&c.name) {
            diffs.push(SchemaDiff::MissingConstraint(c.name.clone()));
        }
    }

    let dst_sequences: Vec<String> = target
        .sequences
        .iter()
        .map(|s| format!("{}.{}", s.schema, s.name))
        .collect();
    for s in &source.sequences {
        let name = format!("{}.{}", s.schema, s.name);
        if !dst_sequences.contains(&name) {
            diffs.push(SchemaDiff::MissingSequence(name));
        }
    }

    diffs
}

/// Introspect both sides and report the differences. Returns the diffs so
/// the CLI can pick the exit code.
pub async fn compare_schema(options: &CloneOptions) -> Result<Vec<SchemaDiff>> {
    let introspect_options = IntrospectOptions {
        split_tables_larger_than: None,
        skip_extensions: options.skip_extensions,
        skip_large_objects: options.skip_large_objects,
    };
    let source = PgConn::connect(&options.conn.source).await?;
    let source_plan =
        introspect::build_plan(&source, &options.filters, &introspect_options, None).await?;
    let target = PgConn::connect(&options.conn.target).await?;
    let target_plan =
        introspect::build_plan(&target, &options.filters, &introspect_options, None).await?;

    let diffs = diff_plans(&source_plan, &target_plan);
    for diff in &diffs {
        println!("{diff}");
    }
    if diffs.is_empty() {
        info!("schemas match");
    }
    Ok(diffs)
}

/// `(count, checksum)` of one table.
async fn table_signature(client: &Client, schema: &str, name: &str) -> Result<(i64, i64)> {
    let sql = format!(
        "SELECT count(*)::bigint, \
                coalesce(bit_xor(hashtextextended(t::text, 0)), 0)::bigint \
         FROM {} t",
        quote_qualified(schema, name)
    );
    let row = client.query_one(&sql, &[]).await?;
    Ok((row.get(0), row.get(1)))
}

/// One per-table data comparison result.
#[derive(Debug, Clone)]
pub struct DataDiff {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
    pub checksum_match: bool,
}

impl DataDiff {
    pub fn matches(&self) -> bool {
        self.source_rows == self.target_rows && self.checksum_match
    }
}

/// Compare row counts and checksums for every filtered table.
pub async fn compare_data(options: &CloneOptions) -> Result<Vec<DataDiff>> {
    let filters: &FilterSet = &options.filters;
    let source = PgConn::connect(&options.conn.source).await?;
    let introspect_options = IntrospectOptions {
        split_tables_larger_than: None,
        skip_extensions: true,
        skip_large_objects: true,
    };
    let plan = introspect::build_plan(&source, filters, &introspect_options, None).await?;
    let target = PgConn::connect(&options.conn.target).await?;

    let mut out = Vec::new();
    for table in plan.tables.iter().filter(|t| t.copies_rows()) {
        let (src_rows, src_sum) = table_signature(&source, &table.schema, &table.name).await?;
        let (dst_rows, dst_sum) = table_signature(&target, &table.schema, &table.name).await?;
        let diff = DataDiff {
            table: table.qualified_name(),
            source_rows: src_rows,
            target_rows: dst_rows,
            checksum_match: src_sum == dst_sum,
        };
        let status = if diff.matches() { "ok" } else { "MISMATCH" };
        println!(
            "{:<40} source={:>10} target={:>10} {status}",
            diff.table, diff.source_rows, diff.target_rows
        );
        out.push(diff);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ReplicaIdentity, SplitStrategy, TableTask};

    fn plan_with_tables(names: &[&str]) -> WorkPlan {
        WorkPlan {
            system_identifier: "x".into(),
            timeline_id: 1,
            snapshot: None,
            tables: names
                .iter()
                .enumerate()
                .map(|(i, n)| TableTask {
                    oid: i as u32 + 1,
                    schema: "public".into(),
                    name: n.to_string(),
                    bytes: 0,
                    reltuples: 0,
                    relpages: 0,
                    replica_identity: ReplicaIdentity::Default,
                    identity_columns: vec![],
                    is_partition_parent: false,
                    parent_oid: None,
                    split: SplitStrategy::None,
                    part_key: None,
                    exclude_data: false,
                })
                .collect(),
            parts: vec![],
            indexes: vec![],
            constraints: vec![],
            sequences: vec![],
            extensions: vec![],
            matviews: vec![],
            large_object_count: 0,
        }
    }

    #[test]
    fn test_diff_plans_tables() {
        let source = plan_with_tables(&["a", "b"]);
        let target = plan_with_tables(&["b", "c"]);
        let diffs = diff_plans(&source, &target);
        assert!(diffs.contains(&SchemaDiff::MissingTable("public.a".into())));
        assert!(diffs.contains(&SchemaDiff::ExtraTable("public.c".into())));
        assert_eq!(diffs.len(), 2);
    }

    #[test]
    fn test_diff_plans_identical() {
        let source = plan_with_tables(&["a"]);
        let target = plan_with_tables(&["a"]);
        // OIDs differ between clusters; identity is the qualified name
        assert!(diff_plans(&source, &target).is_empty());
    }

    #[test]
    fn test_data_diff_matching() {
        let diff = DataDiff {
            table: "public.a".into(),
            source_rows: 10,
            target_rows: 10,
            checksum_match: true,
        };
        assert!(diff.matches());
        let diff = DataDiff {
            checksum_match: false,
            ..diff
        };
        assert!(!diff.matches());
    }
}
