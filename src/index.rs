//! Index & constraint supervisor.
//!
//! Wakes as the copy supervisor reports finished tables and fans each
//! table's post-data objects out in dependency order:
//!
//! 1. constraint-backing unique indexes (primary keys first),
//! 2. the remaining indexes, in parallel up to `index-jobs`,
//! 3. promotion of PK/UK constraints with `ADD CONSTRAINT ... USING
//!    INDEX` so the already-built index is adopted instead of rebuilt,
//! 4. an opportunistic `VACUUM ANALYZE`, bounded by `vacuum-jobs`.
//!
//! Foreign keys wait until *every* referenced table is loaded, then drain
//! from a shared queue. A failed index fails only itself (and whatever
//! constraint depended on it), never the table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, RetryPolicy, ShuttleError};
use crate::pgsql::{PgPool, quote_ident, quote_qualified};
use crate::plan::{self, ConstraintKind, ConstraintTask, IndexTask, TableTask};

// ── SQL builders ───────────────────────────────────────────────────────────

/// Promotion or installation statement for one constraint.
///
/// PK/UK constraints adopt their pre-built index; everything else applies
/// the catalog definition verbatim.
pub fn constraint_sql(
    table: &TableTask,
    constraint: &ConstraintTask,
    index_name: Option<&str>,
) -> String {
    let tbl = quote_qualified(&table.schema, &table.name);
    let name = quote_ident(&constraint.name);
    match (constraint.kind, index_name) {
        (ConstraintKind::PrimaryKey, Some(ix)) => {
            format!("ALTER TABLE {tbl} ADD CONSTRAINT {name} PRIMARY KEY USING INDEX {}",
                quote_ident(ix))
        }
        (ConstraintKind::Unique, Some(ix)) => {
            format!("ALTER TABLE {tbl} ADD CONSTRAINT {name} UNIQUE USING INDEX {}",
                quote_ident(ix))
        }
        _ => format!(
            "ALTER TABLE {tbl} ADD CONSTRAINT {name} {}",
            constraint.definition
        ),
    }
}

pub fn vacuum_sql(table: &TableTask) -> String {
    format!(
        "VACUUM ANALYZE {}",
        quote_qualified(&table.schema, &table.name)
    )
}

// ── Supervisor ─────────────────────────────────────────────────────────────

/// Run until the copy feed closes and every dependent object is built.
pub async fn run(
    options: &CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    mut done_rx: mpsc::UnboundedReceiver<u32>,
) -> Result<()> {
    let plan = catalog.load_plan()?;

    let tables: HashMap<u32, TableTask> =
        plan.tables.iter().map(|t| (t.oid, t.clone())).collect();
    let mut indexes_by_table: HashMap<u32, Vec<IndexTask>> = HashMap::new();
    for ix in &plan.indexes {
        indexes_by_table
            .entry(ix.table_oid)
            .or_default()
            .push(ix.clone());
    }
    let mut constraints_by_table: HashMap<u32, Vec<ConstraintTask>> = HashMap::new();
    for c in &plan.constraints {
        if c.kind != ConstraintKind::ForeignKey {
            constraints_by_table
                .entry(c.table_oid)
                .or_default()
                .push(c.clone());
        }
    }
    // indexes owned by exclusion constraints are built by the constraint
    // itself; creating them standalone would build them twice
    let exclusion_indexes: HashSet<u32> = plan
        .constraints
        .iter()
        .filter(|c| c.kind == ConstraintKind::Exclusion)
        .filter_map(|c| c.index_oid)
        .collect();

    let pool = Arc::new(PgPool::new(options.conn.target.clone()));
    let index_slots = Arc::new(Semaphore::new(options.jobs.index_jobs.max(1)));
    let vacuum_slots = Arc::new(Semaphore::new(options.jobs.vacuum_jobs.max(1)));
    let policy = RetryPolicy::default();

    let mut pipelines = JoinSet::new();
    let mut seen: HashSet<u32> = HashSet::new();

    while let Some(oid) = done_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        if !seen.insert(oid) {
            continue;
        }
        let Some(table) = tables.get(&oid).cloned() else {
            continue;
        };
        let indexes: Vec<IndexTask> = indexes_by_table
            .get(&oid)
            .map(|v| {
                v.iter()
                    .filter(|ix| !exclusion_indexes.contains(&ix.oid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let constraints = constraints_by_table.get(&oid).cloned().unwrap_or_default();
        if indexes.is_empty() && constraints.is_empty() && options.skip_vacuum {
            continue;
        }

        let catalog = Arc::clone(&catalog);
        let pool = Arc::clone(&pool);
        let index_slots = Arc::clone(&index_slots);
        let vacuum_slots = Arc::clone(&vacuum_slots);
        let cancel = cancel.clone();
        let policy = policy.clone();
        let skip_vacuum = options.skip_vacuum;
        pipelines.spawn(async move {
            table_pipeline(
                table,
                indexes,
                constraints,
                catalog,
                pool,
                index_slots,
                vacuum_slots,
                policy,
                cancel,
                skip_vacuum,
            )
            .await
        });
    }

    let mut first_error: Option<ShuttleError> = None;
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShuttleError::StreamState(format!(
                    "index pipeline panicked: {join_err}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(ShuttleError::Cancelled);
    }

    // FK phase: the copy feed is closed, so table states are final.
    fk_phase(&plan, &tables, &catalog, &pool, &index_slots, &policy, &cancel).await
}

#[allow(clippy::too_many_arguments)]
async fn table_pipeline(
    table: TableTask,
    indexes: Vec<IndexTask>,
    constraints: Vec<ConstraintTask>,
    catalog: Arc<Catalog>,
    pool: Arc<PgPool>,
    index_slots: Arc<Semaphore>,
    vacuum_slots: Arc<Semaphore>,
    policy: RetryPolicy,
    cancel: Cancel,
    skip_vacuum: bool,
) -> Result<()> {
    debug!(table = %table.qualified_name(), indexes = indexes.len(), "post-copy pipeline starting");

    let ordered: Vec<IndexTask> = plan::order_indexes(&indexes).into_iter().cloned().collect();
    let (backing, plain): (Vec<IndexTask>, Vec<IndexTask>) = ordered
        .into_iter()
        .partition(|ix| ix.backs_constraint.is_some());

    // constraint-backing indexes must exist before promotion; build them
    // first, then the rest
    build_index_wave(&backing, &catalog, &pool, &index_slots, &policy, &cancel).await?;
    build_index_wave(&plain, &catalog, &pool, &index_slots, &policy, &cancel).await?;

    // promote PK/UK constraints sequentially: each takes an exclusive
    // lock on the table anyway
    for constraint in &constraints {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }
        if !catalog.claim_constraint(constraint.oid)? {
            continue;
        }
        let index_name = constraint.index_oid.and_then(|oid| {
            indexes
                .iter()
                .chain(backing.iter())
                .find(|ix| ix.oid == oid)
                .map(|ix| ix.name.clone())
        });
        if let Some(ix_oid) = constraint.index_oid {
            let ok = backing
                .iter()
                .find(|ix| ix.oid == ix_oid)
                .map(|ix| catalog.index_state_is_copied(ix.oid))
                .transpose()?
                .unwrap_or(true);
            if !ok {
                catalog.constraint_failed(
                    constraint.oid,
                    "backing index failed to build",
                )?;
                continue;
            }
        }
        let sql = constraint_sql(&table, constraint, index_name.as_deref());
        match run_statement(&pool, &sql, &cancel).await {
            Ok(()) => catalog.constraint_done(constraint.oid)?,
            Err(ShuttleError::Cancelled) => {
                catalog.constraint_requeue(constraint.oid, "cancelled")?;
                return Err(ShuttleError::Cancelled);
            }
            Err(e) => {
                warn!(constraint = %constraint.name, error = %e, "constraint failed");
                catalog.constraint_failed(constraint.oid, &e.to_string())?;
            }
        }
    }

    if !skip_vacuum && table.copies_rows() {
        let _permit = vacuum_slots
            .acquire()
            .await
            .map_err(|_| ShuttleError::Cancelled)?;
        if let Err(e) = run_statement(&pool, &vacuum_sql(&table), &cancel).await {
            // vacuum is best-effort; the clone is still correct without it
            warn!(table = %table.qualified_name(), error = %e, "vacuum analyze failed");
        }
    }

    Ok(())
}

/// Build one wave of indexes in parallel, bounded by the shared slots.
async fn build_index_wave(
    indexes: &[IndexTask],
    catalog: &Arc<Catalog>,
    pool: &Arc<PgPool>,
    slots: &Arc<Semaphore>,
    policy: &RetryPolicy,
    cancel: &Cancel,
) -> Result<()> {
    let mut wave = JoinSet::new();
    for ix in indexes {
        let ix = ix.clone();
        let catalog = Arc::clone(catalog);
        let pool = Arc::clone(pool);
        let slots = Arc::clone(slots);
        let policy = policy.clone();
        let cancel = cancel.clone();
        wave.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| ShuttleError::Cancelled)?;
            create_one_index(&ix, &catalog, &pool, &policy, &cancel).await
        });
    }
    let mut first_error: Option<ShuttleError> = None;
    while let Some(joined) = wave.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShuttleError::StreamState(format!(
                    "index worker panicked: {join_err}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(ShuttleError::Cancelled);
    }
    Ok(())
}

/// Create one index with the task retry protocol. A terminal failure
/// fails only this index task.
async fn create_one_index(
    ix: &IndexTask,
    catalog: &Catalog,
    pool: &PgPool,
    policy: &RetryPolicy,
    cancel: &Cancel,
) -> Result<()> {
    if !catalog.claim_index(ix.oid)? {
        return Ok(());
    }
    let mut attempts: u32 = 1;
    loop {
        match run_statement(pool, &ix.definition, cancel).await {
            Ok(()) => {
                debug!(index = %ix.name, "index created");
                catalog.index_done(ix.oid)?;
                return Ok(());
            }
            Err(ShuttleError::Cancelled) => {
                catalog.index_requeue(ix.oid, "cancelled")?;
                return Err(ShuttleError::Cancelled);
            }
            Err(e) if e.is_retryable() && policy.should_retry(attempts) => {
                warn!(index = %ix.name, attempt = attempts, error = %e, "index build retry");
                catalog.index_requeue(ix.oid, &e.to_string())?;
                let backoff = Duration::from_millis(policy.backoff_ms(attempts - 1));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
                }
                if !catalog.claim_index(ix.oid)? {
                    return Ok(());
                }
                attempts += 1;
            }
            Err(e) => {
                warn!(index = %ix.name, error = %e, "index build failed");
                catalog.index_failed(ix.oid, &e.to_string())?;
                return Ok(());
            }
        }
    }
}

/// Apply the shared foreign-key queue once every endpoint table is loaded.
async fn fk_phase(
    plan: &crate::plan::WorkPlan,
    tables: &HashMap<u32, TableTask>,
    catalog: &Arc<Catalog>,
    pool: &Arc<PgPool>,
    slots: &Arc<Semaphore>,
    policy: &RetryPolicy,
    cancel: &Cancel,
) -> Result<()> {
    let ready = catalog.fk_constraints_ready()?;
    if ready.is_empty() {
        return Ok(());
    }
    info!(count = ready.len(), "installing foreign keys");

    let fks: Vec<ConstraintTask> = plan
        .constraints
        .iter()
        .filter(|c| ready.contains(&c.oid))
        .cloned()
        .collect();

    let mut wave = JoinSet::new();
    for fk in fks {
        let Some(table) = tables.get(&fk.table_oid).cloned() else {
            continue;
        };
        let catalog = Arc::clone(catalog);
        let pool = Arc::clone(pool);
        let slots = Arc::clone(slots);
        let policy = policy.clone();
        let cancel = cancel.clone();
        wave.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| ShuttleError::Cancelled)?;
            if !catalog.claim_constraint(fk.oid)? {
                return Ok(());
            }
            let sql = constraint_sql(&table, &fk, None);
            let mut attempts: u32 = 1;
            loop {
                match run_statement(&pool, &sql, &cancel).await {
                    Ok(()) => {
                        catalog.constraint_done(fk.oid)?;
                        return Ok(());
                    }
                    Err(ShuttleError::Cancelled) => {
                        catalog.constraint_requeue(fk.oid, "cancelled")?;
                        return Err(ShuttleError::Cancelled);
                    }
                    Err(e) if e.is_retryable() && policy.should_retry(attempts) => {
                        catalog.constraint_requeue(fk.oid, &e.to_string())?;
                        let backoff = Duration::from_millis(policy.backoff_ms(attempts - 1));
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
                        }
                        if !catalog.claim_constraint(fk.oid)? {
                            return Ok(());
                        }
                        attempts += 1;
                    }
                    Err(e) => {
                        warn!(constraint = %fk.name, error = %e, "foreign key failed");
                        catalog.constraint_failed(fk.oid, &e.to_string())?;
                        return Ok(());
                    }
                }
            }
        });
    }
    let mut first_error: Option<ShuttleError> = None;
    while let Some(joined) = wave.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShuttleError::StreamState(format!(
                    "fk worker panicked: {join_err}"
                )));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run one statement on a pooled connection, racing cancellation.
async fn run_statement(pool: &PgPool, sql: &str, cancel: &Cancel) -> Result<()> {
    let conn = pool.get().await?;
    let result = tokio::select! {
        res = conn.batch_execute(sql) => res.map_err(ShuttleError::from_db),
        _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
    };
    if result.is_ok() {
        pool.put(conn);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ReplicaIdentity, SplitStrategy};

    fn table() -> TableTask {
        TableTask {
            oid: 1,
            schema: "public".into(),
            name: "orders".into(),
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
        }
    }

    fn constraint(kind: ConstraintKind, definition: &str) -> ConstraintTask {
        ConstraintTask {
            oid: 10,
            table_oid: 1,
            name: "orders_pkey".into(),
            definition: definition.into(),
            kind,
            index_oid: Some(20),
            ref_table_oid: None,
        }
    }

    #[test]
    fn test_primary_key_promotion_uses_index() {
        let sql = constraint_sql(
            &table(),
            &constraint(ConstraintKind::PrimaryKey, "PRIMARY KEY (id)"),
            Some("orders_pkey"),
        );
        assert_eq!(
            sql,
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_pkey\" \
             PRIMARY KEY USING INDEX \"orders_pkey\""
        );
    }

    #[test]
    fn test_unique_promotion_uses_index() {
        let mut c = constraint(ConstraintKind::Unique, "UNIQUE (email)");
        c.name = "orders_email_key".into();
        let sql = constraint_sql(&table(), &c, Some("orders_email_key"));
        assert!(sql.contains("UNIQUE USING INDEX \"orders_email_key\""));
    }

    #[test]
    fn test_fk_applies_definition_verbatim() {
        let c = ConstraintTask {
            oid: 11,
            table_oid: 1,
            name: "orders_customer_fkey".into(),
            definition: "FOREIGN KEY (customer_id) REFERENCES public.customers(id)".into(),
            kind: ConstraintKind::ForeignKey,
            index_oid: None,
            ref_table_oid: Some(2),
        };
        let sql = constraint_sql(&table(), &c, None);
        assert_eq!(
            sql,
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_customer_fkey\" \
             FOREIGN KEY (customer_id) REFERENCES public.customers(id)"
        );
    }

    #[test]
    fn test_promotion_without_index_falls_back_to_definition() {
        let sql = constraint_sql(
            &table(),
            &constraint(ConstraintKind::PrimaryKey, "PRIMARY KEY (id)"),
            None,
        );
        assert_eq!(
            sql,
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_pkey\" PRIMARY KEY (id)"
        );
    }

    #[test]
    fn test_vacuum_sql() {
        assert_eq!(vacuum_sql(&table()), "VACUUM ANALYZE \"public\".\"orders\"");
    }
}
