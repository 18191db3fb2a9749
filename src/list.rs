//! `list` subcommands: quick operator-facing inventories.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::{CloneOptions, format_size};
use crate::error::Result;
use crate::introspect::{self, IntrospectOptions};
use crate::pgsql::PgConn;

/// `list tables` — name, size, row estimate, split decision.
pub async fn tables(options: &CloneOptions) -> Result<()> {
    let source = PgConn::connect(&options.conn.source).await?;
    let plan = introspect::build_plan(
        &source,
        &options.filters,
        &IntrospectOptions {
            split_tables_larger_than: options.split_tables_larger_than,
            skip_extensions: true,
            skip_large_objects: true,
        },
        None,
    )
    .await?;

    println!("{:<48} {:>12} {:>14} {:<18}", "TABLE", "SIZE", "ROWS", "COPY");
    for t in &plan.tables {
        let how = if t.is_partition_parent {
            "partitions".to_string()
        } else if t.exclude_data {
            "ddl-only".to_string()
        } else {
            t.split.as_str().to_string()
        };
        println!(
            "{:<48} {:>12} {:>14} {:<18}",
            t.qualified_name(),
            format_size(t.bytes),
            t.reltuples,
            how
        );
    }
    Ok(())
}

/// `list indexes` — per-table index inventory.
pub async fn indexes(options: &CloneOptions) -> Result<()> {
    let source = PgConn::connect(&options.conn.source).await?;
    let plan = introspect::build_plan(
        &source,
        &options.filters,
        &IntrospectOptions::default(),
        None,
    )
    .await?;

    println!("{:<48} {:<32} {:<10}", "INDEX", "CONSTRAINT", "KIND");
    for ix in &plan.indexes {
        let kind = if ix.is_primary {
            "primary"
        } else if ix.is_unique {
            "unique"
        } else {
            "plain"
        };
        println!(
            "{:<48} {:<32} {:<10}",
            format!("{}.{}", ix.schema, ix.name),
            ix.backs_constraint.as_deref().unwrap_or("-"),
            kind
        );
    }
    Ok(())
}

/// `list schemas` — namespaces surviving the filters.
pub async fn schemas(options: &CloneOptions) -> Result<()> {
    let source = PgConn::connect(&options.conn.source).await?;
    let rows = source
        .query(
            "SELECT nspname FROM pg_namespace \
             WHERE nspname NOT IN ('pg_catalog', 'information_schema') \
               AND nspname NOT LIKE 'pg_toast%' AND nspname NOT LIKE 'pg_temp%' \
             ORDER BY nspname",
            &[],
        )
        .await?;
    for row in rows {
        let name: String = row.get(0);
        if options.filters.schema_included(&name) {
            println!("{name}");
        }
    }
    Ok(())
}

/// `list collations` — non-default collations, a pre-clone drift check.
pub async fn collations(options: &CloneOptions) -> Result<()> {
    let source = PgConn::connect(&options.conn.source).await?;
    let collations = introspect::list_collations(&source).await?;
    if collations.is_empty() {
        println!("no user collations");
        return Ok(());
    }
    println!("{:<40} {:<10} {:<16}", "COLLATION", "PROVIDER", "VERSION");
    for c in collations {
        println!(
            "{:<40} {:<10} {:<16}",
            format!("{}.{}", c.schema, c.name),
            c.provider,
            c.version.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// `list extensions` — installed extensions with versions.
pub async fn extensions(options: &CloneOptions) -> Result<()> {
    let source = PgConn::connect(&options.conn.source).await?;
    let plan = introspect::build_plan(
        &source,
        &options.filters,
        &IntrospectOptions {
            split_tables_larger_than: None,
            skip_extensions: false,
            skip_large_objects: true,
        },
        None,
    )
    .await?;
    println!("{:<32} {:<16} {:<16}", "EXTENSION", "VERSION", "SCHEMA");
    for e in &plan.extensions {
        println!("{:<32} {:<16} {:<16}", e.name, e.version, e.schema);
    }
    Ok(())
}

/// `list progress` — task counts by state from the catalog.
pub fn progress(catalog: &Arc<Catalog>) -> Result<()> {
    let counts = catalog.progress_counts()?;
    if counts.is_empty() {
        println!("no work plan in the catalog");
        return Ok(());
    }
    println!("{:<12} {:<12} {:>8}", "KIND", "STATE", "COUNT");
    for (kind, state, count) in counts {
        println!("{kind:<12} {state:<12} {count:>8}");
    }
    let (bytes, rows) = catalog.copy_totals()?;
    println!("\ncopied {} in {rows} rows", format_size(bytes));
    let (blob_copied, blob_total) = catalog.blob_counts()?;
    if blob_total > 0 || blob_copied > 0 {
        println!("large objects: {blob_copied}/{blob_total}");
    }
    Ok(())
}
