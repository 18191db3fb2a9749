//! Source introspection — builds the Work Plan from the system catalogs.
//!
//! Runs single-threaded, once per invocation, on a connection whose
//! REPEATABLE READ snapshot is the run's snapshot, so the plan is
//! internally consistent: sizes, partition lists, sequence values and the
//! large-object census all describe the same instant.
//!
//! Classification rules:
//! - ordinary tables and leaf partitions become copy tasks;
//! - partitioned parents are planned for bookkeeping but never copied;
//! - materialized views are queued as post-data refreshes;
//! - sequences are read here (under the snapshot) and applied after copy;
//! - extension-owned relations are excluded (CREATE EXTENSION recreates
//!   them on the target).

use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::Result;
use crate::filters::FilterSet;
use crate::pgsql::{self, quote_qualified};
use crate::plan::{
    self, ConstraintKind, ConstraintTask, ExtensionTask, IndexTask, MatviewTask, ReplicaIdentity,
    SequenceTask, SplitStrategy, TablePart, TableTask, WorkPlan,
};

/// Knobs the introspector honors while planning.
#[derive(Debug, Clone, Default)]
pub struct IntrospectOptions {
    /// Split tables larger than this many bytes into concurrent ranges.
    pub split_tables_larger_than: Option<u64>,
    pub skip_extensions: bool,
    pub skip_large_objects: bool,
}

/// Decide the COPY partitioning strategy for one table.
///
/// Tables above the threshold split by their not-null integer key when one
/// exists, by ctid page ranges otherwise. Empty heaps never split.
pub fn decide_split(
    bytes: u64,
    threshold: Option<u64>,
    has_integer_key: bool,
    relpages: i64,
) -> SplitStrategy {
    match threshold {
        Some(t) if t > 0 && bytes > t && relpages > 1 => {
            if has_integer_key {
                SplitStrategy::ByIntegerColumn
            } else {
                SplitStrategy::ByCtidRange
            }
        }
        _ => SplitStrategy::None,
    }
}

/// Build the complete Work Plan. `client` must already sit inside the
/// run's snapshot transaction.
pub async fn build_plan(
    client: &Client,
    filters: &FilterSet,
    options: &IntrospectOptions,
    snapshot: Option<String>,
) -> Result<WorkPlan> {
    let system_identifier = pgsql::system_identifier(client).await?;
    let timeline_id = pgsql::timeline_id(client).await?;

    let relations = list_relations(client, filters).await?;

    let mut tables: Vec<TableTask> = Vec::new();
    let mut matviews: Vec<MatviewTask> = Vec::new();
    let mut sequence_idents: Vec<(u32, String, String)> = Vec::new();

    for rel in relations {
        match rel.kind.as_str() {
            "r" => {
                let exclude_data = !filters.table_data_included(&rel.schema, &rel.name);
                tables.push(TableTask {
                    oid: rel.oid,
                    schema: rel.schema,
                    name: rel.name,
                    bytes: rel.bytes,
                    reltuples: rel.reltuples.max(0),
                    relpages: rel.relpages,
                    replica_identity: ReplicaIdentity::from_char(rel.replident),
                    identity_columns: Vec::new(),
                    is_partition_parent: false,
                    parent_oid: rel.parent_oid,
                    split: SplitStrategy::None,
                    part_key: None,
                    exclude_data,
                });
            }
            "p" => {
                tables.push(TableTask {
                    oid: rel.oid,
                    schema: rel.schema,
                    name: rel.name,
                    bytes: 0,
                    reltuples: 0,
                    relpages: 0,
                    replica_identity: ReplicaIdentity::from_char(rel.replident),
                    identity_columns: Vec::new(),
                    is_partition_parent: true,
                    parent_oid: rel.parent_oid,
                    split: SplitStrategy::None,
                    part_key: None,
                    exclude_data: false,
                });
            }
            "m" => matviews.push(MatviewTask {
                oid: rel.oid,
                schema: rel.schema,
                name: rel.name,
                bytes: rel.bytes,
            }),
            "S" => sequence_idents.push((rel.oid, rel.schema, rel.name)),
            _ => {}
        }
    }

    // Split decision needs a precise size and the key column; both are one
    // extra query per candidate, so only candidates pay for them.
    let mut parts: Vec<TablePart> = Vec::new();
    if let Some(threshold) = options.split_tables_larger_than {
        for table in &mut tables {
            if !table.copies_rows() || table.bytes <= threshold {
                continue;
            }
            let precise = relation_size(client, table.oid).await?;
            table.bytes = precise;
            let key = integer_key_column(client, table.oid).await?;
            table.split =
                decide_split(precise, Some(threshold), key.is_some(), table.relpages);
            match (table.split, key) {
                (SplitStrategy::ByIntegerColumn, Some(column)) => {
                    let (min, max) = key_bounds(client, table, &column).await?;
                    table.part_key = Some(column);
                    if let (Some(min), Some(max)) = (min, max) {
                        let count = plan::split_count(precise, threshold);
                        let mut ranges = plan::integer_ranges(min, max, count);
                        for p in &mut ranges {
                            p.table_oid = table.oid;
                        }
                        parts.extend(ranges);
                    } else {
                        // empty table despite the size estimate
                        table.split = SplitStrategy::None;
                        table.part_key = None;
                    }
                }
                (SplitStrategy::ByCtidRange, _) => {
                    let count = plan::split_count(precise, threshold);
                    let mut ranges = plan::ctid_ranges(table.relpages, count);
                    for p in &mut ranges {
                        p.table_oid = table.oid;
                    }
                    parts.extend(ranges);
                }
                _ => {}
            }
            if table.split != SplitStrategy::None {
                debug!(
                    table = %table.qualified_name(),
                    strategy = table.split.as_str(),
                    parts = plan::split_count(precise, threshold),
                    "table will be copied in ranges"
                );
            }
        }
    }

    let table_oids: Vec<u32> = tables.iter().map(|t| t.oid).collect();

    // replica-identity columns key the CDC transformer's upserts
    let identities = identity_columns(client, &table_oids).await?;
    for table in &mut tables {
        if let Some(cols) = identities.get(&table.oid) {
            table.identity_columns = cols.clone();
        }
    }

    let indexes = list_indexes(client, &table_oids, &tables, filters).await?;
    let constraints = list_constraints(client, &table_oids).await?;
    let sequences = read_sequences(client, &sequence_idents).await?;
    let extensions = if options.skip_extensions {
        Vec::new()
    } else {
        list_extensions(client, filters).await?
    };
    let large_object_count = if options.skip_large_objects {
        0
    } else {
        count_large_objects(client).await?
    };

    plan::largest_first(&mut tables);

    let plan = WorkPlan {
        system_identifier,
        timeline_id,
        snapshot,
        tables,
        parts,
        indexes,
        constraints,
        sequences,
        extensions,
        matviews,
        large_object_count,
    };
    plan.validate()?;

    info!(
        tables = plan.tables.len(),
        indexes = plan.indexes.len(),
        constraints = plan.constraints.len(),
        sequences = plan.sequences.len(),
        matviews = plan.matviews.len(),
        large_objects = plan.large_object_count,
        "work plan ready"
    );
    Ok(plan)
}

struct Relation {
    oid: u32,
    schema: String,
    name: String,
    kind: String,
    relpages: i64,
    reltuples: i64,
    replident: char,
    bytes: u64,
    parent_oid: Option<u32>,
}

/// Enumerate user relations, excluding system schemas and extension
/// members, honoring the filter manifest.
async fn list_relations(client: &Client, filters: &FilterSet) -> Result<Vec<Relation>> {
    let rows = client
        .query(
            "SELECT c.oid, n.nspname, c.relname, c.relkind::text, \
                    c.relpages::bigint, c.reltuples::bigint, c.relreplident::text, \
                    c.relpages::bigint * current_setting('block_size')::bigint AS bytes, \
                    i.inhparent \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             LEFT JOIN pg_inherits i ON i.inhrelid = c.oid \
             WHERE c.relkind IN ('r', 'p', 'm', 'S') \
               AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
               AND n.nspname NOT LIKE 'pg_toast%' \
               AND n.nspname NOT LIKE 'pg_temp%' \
               AND NOT EXISTS (SELECT 1 FROM pg_depend d \
                               WHERE d.classid = 'pg_class'::regclass \
                                 AND d.objid = c.oid AND d.deptype = 'e') \
             ORDER BY n.nspname, c.relname",
            &[],
        )
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let schema: String = row.get(1);
        let name: String = row.get(2);
        if !filters.table_included(&schema, &name) {
            continue;
        }
        let bytes: i64 = row.get(7);
        out.push(Relation {
            oid: row.get(0),
            schema,
            name,
            kind: row.get(3),
            relpages: row.get(4),
            reltuples: row.get(5),
            replident: row
                .get::<_, String>(6)
                .chars()
                .next()
                .unwrap_or('d'),
            bytes: bytes.max(0) as u64,
            parent_oid: row.get(8),
        });
    }
    Ok(out)
}

/// Precise size of the main fork.
async fn relation_size(client: &Client, oid: u32) -> Result<u64> {
    let row = client
        .query_one("SELECT pg_relation_size($1::oid)", &[&oid])
        .await?;
    Ok(row.get::<_, i64>(0).max(0) as u64)
}

/// Replica-identity columns per table: the columns of the replica
/// identity index when one is configured, the primary key otherwise.
async fn identity_columns(
    client: &Client,
    table_oids: &[u32],
) -> Result<std::collections::HashMap<u32, Vec<String>>> {
    let rows = client
        .query(
            "SELECT i.indrelid, i.indisreplident, a.attname \
             FROM pg_index i \
             JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) ON true \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
             WHERE i.indrelid = ANY($1) AND i.indisvalid \
               AND (i.indisreplident OR i.indisprimary) \
             ORDER BY i.indrelid, i.indisreplident DESC, k.ord",
            &[&table_oids],
        )
        .await?;

    let mut primaries: std::collections::HashMap<u32, Vec<String>> = Default::default();
    let mut replidents: std::collections::HashMap<u32, Vec<String>> = Default::default();
    for row in rows {
        let oid: u32 = row.get(0);
        let is_replident: bool = row.get(1);
        let name: String = row.get(2);
        let bucket = if is_replident {
            &mut replidents
        } else {
            &mut primaries
        };
        bucket.entry(oid).or_default().push(name);
    }
    // an explicit REPLICA IDENTITY USING INDEX wins over the primary key
    for (oid, cols) in replidents {
        primaries.insert(oid, cols);
    }
    Ok(primaries)
}

/// The single not-null integer key column of a table's primary key, if it
/// has one. That column drives `by-integer-column` splitting.
async fn integer_key_column(client: &Client, oid: u32) -> Result<Option<String>> {
    let row = client
        .query_opt(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = i.indkey[0] \
             JOIN pg_type t ON t.oid = a.atttypid \
             WHERE i.indrelid = $1::oid AND i.indisprimary AND i.indnkeyatts = 1 \
               AND a.attnotnull AND t.typname IN ('int2', 'int4', 'int8')",
            &[&oid],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Min and max of the key column under the plan snapshot.
async fn key_bounds(
    client: &Client,
    table: &TableTask,
    column: &str,
) -> Result<(Option<i64>, Option<i64>)> {
    let sql = format!(
        "SELECT min({col})::bigint, max({col})::bigint FROM {tbl}",
        col = pgsql::quote_ident(column),
        tbl = quote_qualified(&table.schema, &table.name),
    );
    let row = client.query_one(&sql, &[]).await?;
    Ok((row.get(0), row.get(1)))
}

/// Enumerate valid indexes on the planned tables.
///
/// Indexes that are themselves partitions of a parent index are skipped:
/// creating the parent's index cascades to every leaf. Indexes on
/// data-excluded tables are still built (the DDL survives the filter).
async fn list_indexes(
    client: &Client,
    table_oids: &[u32],
    tables: &[TableTask],
    filters: &FilterSet,
) -> Result<Vec<IndexTask>> {
    let rows = client
        .query(
            "SELECT x.indexrelid, x.indrelid, n.nspname, ic.relname, \
                    pg_get_indexdef(x.indexrelid), x.indisunique, x.indisprimary, \
                    con.conname \
             FROM pg_index x \
             JOIN pg_class ic ON ic.oid = x.indexrelid \
             JOIN pg_namespace n ON n.oid = ic.relnamespace \
             LEFT JOIN pg_constraint con \
                    ON con.conindid = x.indexrelid AND con.contype IN ('p', 'u', 'x') \
             WHERE x.indrelid = ANY($1) AND x.indisvalid \
               AND NOT EXISTS (SELECT 1 FROM pg_inherits h WHERE h.inhrelid = x.indexrelid) \
             ORDER BY x.indrelid, x.indexrelid",
            &[&table_oids],
        )
        .await?;

    let parent_of = |oid: u32| tables.iter().find(|t| t.oid == oid);
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let schema: String = row.get(2);
        let name: String = row.get(3);
        if !filters.index_included(&schema, &name) {
            continue;
        }
        let table_oid: u32 = row.get(1);
        // leaf partitions of partitioned tables get their indexes from
        // the parent's CREATE INDEX cascade
        if parent_of(table_oid).is_some_and(|t| t.parent_oid.is_some()) {
            continue;
        }
        out.push(IndexTask {
            oid: row.get(0),
            table_oid,
            schema,
            name,
            definition: row.get(4),
            is_unique: row.get(5),
            is_primary: row.get(6),
            backs_constraint: row.get(7),
        });
    }
    Ok(out)
}

/// Enumerate post-data constraints: primary keys, unique, foreign keys and
/// exclusion constraints. CHECK constraints travel with the table DDL in
/// the pre-data section, so they are not tasks.
async fn list_constraints(client: &Client, table_oids: &[u32]) -> Result<Vec<ConstraintTask>> {
    let rows = client
        .query(
            "SELECT con.oid, con.conrelid, con.conname, pg_get_constraintdef(con.oid), \
                    con.contype::text, \
                    nullif(con.conindid, 0), nullif(con.confrelid, 0) \
             FROM pg_constraint con \
             WHERE con.conrelid = ANY($1) \
               AND con.contype IN ('p', 'u', 'f', 'x') \
               AND con.coninhcount = 0 \
             ORDER BY con.conrelid, con.oid",
            &[&table_oids],
        )
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let contype: String = row.get(4);
        let Some(kind) = ConstraintKind::from_contype(contype.chars().next().unwrap_or(' '))
        else {
            continue;
        };
        // FKs referencing tables outside the filtered plan are dropped
        // from the plan; the referenced side does not exist on the target.
        let ref_table_oid: Option<u32> = row.get(6);
        if let Some(r) = ref_table_oid {
            if kind == ConstraintKind::ForeignKey && !table_oids.contains(&r) {
                continue;
            }
        }
        out.push(ConstraintTask {
            oid: row.get(0),
            table_oid: row.get(1),
            name: row.get(2),
            definition: row.get(3),
            kind,
            index_oid: row.get(5),
            ref_table_oid,
        });
    }
    Ok(out)
}

/// Read `(last_value, is_called)` for every sequence under the snapshot.
async fn read_sequences(
    client: &Client,
    idents: &[(u32, String, String)],
) -> Result<Vec<SequenceTask>> {
    let mut out = Vec::with_capacity(idents.len());
    for (oid, schema, name) in idents {
        let sql = format!(
            "SELECT last_value, is_called FROM {}",
            quote_qualified(schema, name)
        );
        let row = client.query_one(&sql, &[]).await?;
        out.push(SequenceTask {
            oid: *oid,
            schema: schema.clone(),
            name: name.clone(),
            last_value: row.get(0),
            is_called: row.get(1),
        });
    }
    Ok(out)
}

/// Enumerate installed extensions, minus the always-present plpgsql.
async fn list_extensions(client: &Client, filters: &FilterSet) -> Result<Vec<ExtensionTask>> {
    let rows = client
        .query(
            "SELECT e.oid, e.extname, n.nspname, e.extversion \
             FROM pg_extension e \
             JOIN pg_namespace n ON n.oid = e.extnamespace \
             WHERE e.extname <> 'plpgsql' \
             ORDER BY e.extname",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .filter(|row| filters.extension_included(row.get(1)))
        .map(|row| ExtensionTask {
            oid: row.get(0),
            name: row.get(1),
            schema: row.get(2),
            version: row.get(3),
        })
        .collect())
}

async fn count_large_objects(client: &Client) -> Result<i64> {
    let row = client
        .query_one("SELECT count(*) FROM pg_largeobject_metadata", &[])
        .await?;
    Ok(row.get(0))
}

/// A collation in use by user relations, for drift checks before a clone.
#[derive(Debug, Clone)]
pub struct CollationInfo {
    pub schema: String,
    pub name: String,
    pub provider: String,
    pub version: Option<String>,
}

/// Non-default collations, surfaced by `list collations` and the
/// pre-clone check unless `--skip-collations`.
pub async fn list_collations(client: &Client) -> Result<Vec<CollationInfo>> {
    let rows = client
        .query(
            "SELECT n.nspname, c.collname, c.collprovider::text, c.collversion \
             FROM pg_collation c \
             JOIN pg_namespace n ON n.oid = c.collnamespace \
             WHERE n.nspname NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY n.nspname, c.collname",
            &[],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| CollationInfo {
            schema: row.get(0),
            name: row.get(1),
            provider: row.get(2),
            version: row.get(3),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_split_below_threshold() {
        let mb = 1u64 << 20;
        assert_eq!(decide_split(mb / 2, Some(mb), true, 100), SplitStrategy::None);
        assert_eq!(decide_split(mb, Some(mb), true, 100), SplitStrategy::None);
    }

    #[test]
    fn test_decide_split_prefers_integer_key() {
        let mb = 1u64 << 20;
        assert_eq!(
            decide_split(10 * mb, Some(mb), true, 1280),
            SplitStrategy::ByIntegerColumn
        );
        assert_eq!(
            decide_split(10 * mb, Some(mb), false, 1280),
            SplitStrategy::ByCtidRange
        );
    }

    #[test]
    fn test_decide_split_disabled() {
        assert_eq!(decide_split(u64::MAX, None, true, 1 << 20), SplitStrategy::None);
        assert_eq!(decide_split(u64::MAX, Some(0), true, 1 << 20), SplitStrategy::None);
    }

    #[test]
    fn test_decide_split_single_page_table() {
        // a table with one page has nothing to parallelize, whatever the
        // size estimate claims
        let mb = 1u64 << 20;
        assert_eq!(decide_split(10 * mb, Some(mb), false, 1), SplitStrategy::None);
    }
}
