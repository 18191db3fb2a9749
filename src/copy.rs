//! Copy supervisor — the parallel table-data pipeline.
//!
//! A fixed pool of `table-jobs` workers drains a largest-first queue of
//! copy units (a whole table, or one range of a split table). Each worker
//! owns one source and one target connection for its lifetime; the source
//! connection sits inside a REPEATABLE READ transaction importing the
//! run's snapshot, so all workers observe the same instant.
//!
//! Rows travel `COPY ... TO STDOUT (FORMAT binary)` straight into
//! `COPY ... FROM STDIN (FORMAT binary)` with no intermediate buffering:
//! the out-stream's chunks are fed to the in-sink as they arrive, counting
//! bytes on the way through.
//!
//! Failure handling follows the task protocol: transient errors requeue
//! the unit (fresh claim, next attempt) with exponential backoff until
//! `max-attempts`, then the task is failed and its peers keep draining.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, TryStreamExt, pin_mut};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, RetryPolicy, ShuttleError};
use crate::pgsql::{self, PgConn, quote_ident, quote_qualified};
use crate::plan::{self, SplitStrategy, TablePart, TableTask, TaskState};

/// One dequeued unit of copy work.
#[derive(Debug, Clone)]
pub struct CopyUnit {
    pub table: TableTask,
    pub part: Option<TablePart>,
}

/// Aggregate result of the bulk copy phase.
#[derive(Debug, Default, Clone)]
pub struct CopyOutcome {
    pub tables_copied: u64,
    pub failed: u64,
    pub bytes: u64,
    pub rows: u64,
}

// ── SQL builders ───────────────────────────────────────────────────────────

/// The source-side COPY command for a unit.
pub fn source_copy_sql(table: &TableTask, part: Option<&TablePart>) -> String {
    let tbl = quote_qualified(&table.schema, &table.name);
    let Some(part) = part else {
        return format!("COPY {tbl} TO STDOUT (FORMAT binary)");
    };
    let filter = match table.split {
        SplitStrategy::ByIntegerColumn => {
            let key = quote_ident(table.part_key.as_deref().unwrap_or("id"));
            match part.upper {
                Some(upper) => format!("{key} >= {} AND {key} < {}", part.lower, upper),
                None => format!("{key} >= {}", part.lower),
            }
        }
        SplitStrategy::ByCtidRange => match part.upper {
            Some(upper) => format!(
                "ctid >= '({},0)'::tid AND ctid < '({},0)'::tid",
                part.lower, upper
            ),
            None => format!("ctid >= '({},0)'::tid", part.lower),
        },
        SplitStrategy::None => return format!("COPY {tbl} TO STDOUT (FORMAT binary)"),
    };
    format!("COPY (SELECT * FROM {tbl} WHERE {filter}) TO STDOUT (FORMAT binary)")
}

/// The target-side COPY command.
pub fn target_copy_sql(table: &TableTask) -> String {
    format!(
        "COPY {} FROM STDIN (FORMAT binary)",
        quote_qualified(&table.schema, &table.name)
    )
}

/// Truncate statement for (re)loading a table.
pub fn truncate_sql(table: &TableTask) -> String {
    format!(
        "TRUNCATE ONLY {}",
        quote_qualified(&table.schema, &table.name)
    )
}

// ── Queue construction ─────────────────────────────────────────────────────

/// Build the largest-first work queue from the persisted plan, skipping
/// tasks a previous run already finished.
pub fn build_queue(
    tables: &[TableTask],
    parts: &[TablePart],
    state_of: impl Fn(u32) -> Option<TaskState>,
    part_state_of: impl Fn(u32, u32) -> Option<TaskState>,
) -> VecDeque<CopyUnit> {
    let mut ordered: Vec<TableTask> = tables.to_vec();
    plan::largest_first(&mut ordered);

    let mut queue = VecDeque::new();
    for table in ordered {
        if !table.copies_rows() {
            continue;
        }
        if table.split == SplitStrategy::None {
            if state_of(table.oid) == Some(TaskState::Planned) {
                queue.push_back(CopyUnit {
                    table,
                    part: None,
                });
            }
        } else {
            for part in parts.iter().filter(|p| p.table_oid == table.oid) {
                if part_state_of(part.table_oid, part.part_num) == Some(TaskState::Planned) {
                    queue.push_back(CopyUnit {
                        table: table.clone(),
                        part: Some(part.clone()),
                    });
                }
            }
        }
    }
    queue
}

// ── Supervisor ─────────────────────────────────────────────────────────────

/// Run the bulk copy to completion (or cancellation). Completed table OIDs
/// are reported on `done_tx` as they finish, waking the index supervisor.
pub async fn run(
    options: &CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    done_tx: mpsc::UnboundedSender<u32>,
) -> Result<CopyOutcome> {
    let plan = catalog.load_plan()?;
    let queue = build_queue(
        &plan.tables,
        &plan.parts,
        |oid| {
            catalog
                .table_status(oid)
                .ok()
                .flatten()
                .map(|s| s.state)
        },
        |oid, part| catalog.part_status(oid, part).ok().flatten(),
    );
    let total_units = queue.len();
    info!(units = total_units, jobs = options.jobs.table_jobs, "bulk copy starting");

    // Split tables are truncated once, up front, before any of their parts
    // can race; untouched non-split tables are truncated by their worker.
    {
        let target = PgConn::connect(&options.conn.target).await?;
        for table in plan.tables.iter().filter(|t| t.split != SplitStrategy::None) {
            if table.copies_rows() && catalog.parts_all_planned(table.oid)? {
                target.batch_execute(&truncate_sql(table)).await?;
            }
        }
    }

    let queue = Arc::new(Mutex::new(queue));
    let policy = RetryPolicy::default();

    let mut workers = JoinSet::new();
    for worker_id in 0..options.jobs.table_jobs.max(1) {
        let queue = Arc::clone(&queue);
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        let done_tx = done_tx.clone();
        let options = options.clone();
        let policy = policy.clone();
        workers.spawn(async move {
            copy_worker(worker_id, options, catalog, cancel, queue, done_tx, policy).await
        });
    }

    // Join every worker before reporting: a fatal error in one must not
    // abort its peers mid-COPY, their progress still lands in the catalog.
    let mut first_error: Option<ShuttleError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "copy worker aborted");
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShuttleError::StreamState(format!(
                    "copy worker panicked: {join_err}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let (bytes, rows) = catalog.copy_totals()?;
    let failed = catalog
        .failed_tasks()?
        .iter()
        .filter(|(kind, ..)| kind == "table")
        .count() as u64;
    let outcome = CopyOutcome {
        tables_copied: total_units as u64,
        failed,
        bytes,
        rows,
    };
    info!(
        bytes = outcome.bytes,
        rows = outcome.rows,
        failed = outcome.failed,
        "bulk copy finished"
    );
    Ok(outcome)
}

fn next_unit(queue: &Arc<Mutex<VecDeque<CopyUnit>>>) -> Option<CopyUnit> {
    queue.lock().ok()?.pop_front()
}

async fn copy_worker(
    worker_id: usize,
    options: CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    queue: Arc<Mutex<VecDeque<CopyUnit>>>,
    done_tx: mpsc::UnboundedSender<u32>,
    policy: RetryPolicy,
) -> Result<()> {
    let mut source: Option<PgConn> = None;
    let mut target: Option<PgConn> = None;

    while let Some(unit) = next_unit(&queue) {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }

        let oid = unit.table.oid;
        let claimed = match &unit.part {
            Some(part) => {
                let ok = catalog.claim_part(oid, part.part_num)?;
                if ok {
                    catalog.table_start_parts(oid)?;
                }
                ok
            }
            None => catalog.claim_table(oid)?,
        };
        if !claimed {
            continue;
        }

        let mut attempts: u32 = 1;
        loop {
            let result = copy_attempt(
                &options,
                &mut source,
                &mut target,
                &unit,
                &cancel,
            )
            .await;

            match result {
                Ok((bytes, rows)) => {
                    debug!(
                        worker_id,
                        table = %unit.table.qualified_name(),
                        part = unit.part.as_ref().map(|p| p.part_num),
                        bytes,
                        rows,
                        "unit copied"
                    );
                    match &unit.part {
                        Some(part) => {
                            catalog.part_done(oid, part.part_num, bytes, rows)?;
                            if catalog.finish_table_from_parts(oid)? {
                                notify_done(&catalog, &done_tx, &unit.table)?;
                            }
                        }
                        None => {
                            catalog.table_done(oid, bytes, rows)?;
                            notify_done(&catalog, &done_tx, &unit.table)?;
                        }
                    }
                    break;
                }
                Err(ShuttleError::Cancelled) => {
                    requeue(&catalog, &unit, "cancelled")?;
                    return Err(ShuttleError::Cancelled);
                }
                Err(e) if e.is_retryable() && policy.should_retry(attempts) => {
                    warn!(
                        worker_id,
                        table = %unit.table.qualified_name(),
                        attempt = attempts,
                        error = %e,
                        "transient copy failure, will retry"
                    );
                    requeue(&catalog, &unit, &e.to_string())?;
                    // connections are suspect after a transient failure
                    source = None;
                    target = None;

                    let backoff = Duration::from_millis(policy.backoff_ms(attempts - 1));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
                    }

                    let reclaimed = match &unit.part {
                        Some(part) => catalog.claim_part(oid, part.part_num)?,
                        None => catalog.claim_table(oid)?,
                    };
                    if !reclaimed {
                        // someone else picked it up meanwhile
                        break;
                    }
                    attempts += 1;
                }
                Err(e) => {
                    warn!(
                        worker_id,
                        table = %unit.table.qualified_name(),
                        attempt = attempts,
                        error = %e,
                        "copy task failed"
                    );
                    if let Some(part) = &unit.part {
                        catalog.part_failed(oid, part.part_num, &e.to_string())?;
                    }
                    catalog.table_failed(oid, &e.to_string())?;
                    // an interrupted COPY leaves the snapshot transaction
                    // aborted; start the next unit on fresh connections
                    source = None;
                    target = None;
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Report a finished table, and its partitioned parent once the last
/// sibling lands.
fn notify_done(
    catalog: &Catalog,
    done_tx: &mpsc::UnboundedSender<u32>,
    table: &TableTask,
) -> Result<()> {
    let _ = done_tx.send(table.oid);
    if let Some(parent) = table.parent_oid {
        if catalog.partition_children_outstanding(parent)? == 0 {
            let _ = done_tx.send(parent);
        }
    }
    Ok(())
}

fn requeue(catalog: &Catalog, unit: &CopyUnit, err: &str) -> Result<()> {
    match &unit.part {
        Some(part) => catalog.part_requeue(unit.table.oid, part.part_num, err),
        None => catalog.table_requeue(unit.table.oid, err),
    }
}

/// One attempt at one unit: (re)establish the worker's connections, then
/// stream the rows, racing the whole thing against cancellation.
async fn copy_attempt(
    options: &CloneOptions,
    source: &mut Option<PgConn>,
    target: &mut Option<PgConn>,
    unit: &CopyUnit,
    cancel: &Cancel,
) -> Result<(u64, u64)> {
    tokio::select! {
        res = async {
            if source.is_none() {
                let conn = PgConn::connect(&options.conn.source).await?;
                if let Some(snapshot) = &options.snapshot {
                    pgsql::import_snapshot(&conn, snapshot).await?;
                }
                *source = Some(conn);
            }
            if target.is_none() {
                *target = Some(PgConn::connect(&options.conn.target).await?);
            }
            let src = source
                .as_ref()
                .ok_or_else(|| ShuttleError::Connection("source connection unavailable".into()))?;
            let dst = target
                .as_ref()
                .ok_or_else(|| ShuttleError::Connection("target connection unavailable".into()))?;

            // whole-table loads are truncated per attempt so a retry (or a
            // resumed run) never doubles rows; split ranges rely on the
            // supervisor's up-front truncate
            let truncate = unit.part.is_none();
            stream_unit(src, dst, unit, truncate).await
        } => res,
        _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
    }
}

async fn stream_unit(
    source: &PgConn,
    target: &PgConn,
    unit: &CopyUnit,
    truncate: bool,
) -> Result<(u64, u64)> {
    if truncate {
        target.batch_execute(&truncate_sql(&unit.table)).await?;
    }

    let out_sql = source_copy_sql(&unit.table, unit.part.as_ref());
    let in_sql = target_copy_sql(&unit.table);

    let stream = source.copy_out(out_sql.as_str()).await?;
    let sink = target.copy_in::<_, Bytes>(in_sql.as_str()).await?;
    pin_mut!(stream, sink);

    let mut bytes: u64 = 0;
    while let Some(chunk) = stream.try_next().await? {
        bytes += chunk.len() as u64;
        sink.send(chunk).await?;
    }
    let rows = sink.finish().await?;
    Ok((bytes, rows))
}
