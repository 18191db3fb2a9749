//! The `clone` orchestration: plan, schema, parallel copy, post-data,
//! and optionally the CDC follow.
//!
//! Control flow (spec order):
//!
//! 1. open the progress catalog (resume or fresh);
//! 2. in follow mode, create the replication slot *first* so its
//!    consistent point precedes the snapshot;
//! 3. export the REPEATABLE READ snapshot and introspect under it;
//! 4. install extensions and the pre-data schema;
//! 5. run the copy, index and blob supervisors concurrently;
//! 6. carry sequence values, install post-data, refresh matviews;
//! 7. in follow mode, enable apply and stream until endpos.
//!
//! One-shot phases are recorded in the catalog's run-step ledger so a
//! resumed run skips them exactly once.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::cdc::{self, StreamMode};
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::introspect::{self, IntrospectOptions};
use crate::pgsql::{self, PgConn};
use crate::plan::TaskState;
use crate::summary::{self, RunStatus};
use crate::{blobs, copy, extensions, index, matviews, schema, sequences};

/// Run-step ledger keys.
pub mod step {
    pub const EXTENSIONS: &str = "extensions";
    pub const SCHEMA_DUMP: &str = "schema-dump";
    pub const SCHEMA_PRE_DATA: &str = "schema-pre-data";
    pub const SCHEMA_POST_DATA: &str = "schema-post-data";
    pub const SEQUENCES: &str = "sequences";
    pub const MATVIEWS: &str = "matviews";
}

/// Full clone, with optional follow.
pub async fn run(mut options: CloneOptions, cancel: Cancel) -> Result<RunStatus> {
    let started = Instant::now();
    options.dirs.ensure(&options.stream.slot_name)?;

    let (catalog, rebuilt) = Catalog::open(&options.dirs.catalog_path())?;
    if rebuilt {
        warn!("catalog format changed; previous progress discarded");
    }
    let catalog = Arc::new(catalog);

    // The slot pins WAL from before the snapshot; create it first.
    if options.follow {
        let mut stream = options.stream.clone();
        stream.create_slot = true;
        cdc::slot::setup(&options.conn.source, &stream, &catalog).await?;
    }

    // The coordinator connection owns the snapshot transaction and must
    // outlive the whole copy phase.
    let coordinator = PgConn::connect(&options.conn.source).await?;
    info!(
        server_version = pgsql::server_version_num(&coordinator).await?,
        "connected to source"
    );

    prepare_plan(&mut options, &catalog, &coordinator).await?;

    // ── Schema and data phases ─────────────────────────────────────────

    if !options.skip_collations {
        let collations = introspect::list_collations(&coordinator).await?;
        if !collations.is_empty() {
            warn!(
                count = collations.len(),
                "source uses non-default collations; index ordering depends on \
                 matching collation versions on the target (see `list collations`)"
            );
        }
    }

    if !options.skip_extensions && !catalog.step_done(step::EXTENSIONS)? {
        extensions::run(&options, Arc::clone(&catalog), cancel.clone()).await?;
        catalog.step_mark(step::EXTENSIONS)?;
    }

    if !catalog.step_done(step::SCHEMA_DUMP)? {
        schema::dump_section(&options, schema::Section::PreData).await?;
        schema::dump_section(&options, schema::Section::PostData).await?;
        catalog.step_mark(step::SCHEMA_DUMP)?;
    }
    if !catalog.step_done(step::SCHEMA_PRE_DATA)? {
        schema::restore_section(&options, schema::Section::PreData).await?;
        catalog.step_mark(step::SCHEMA_PRE_DATA)?;
    }

    // Follow mode receives and transforms during the copy; apply stays
    // disabled until the bulk phase lands.
    let stream_task = options.follow.then(|| {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(
            async move { cdc::run_stream(&options, catalog, cancel, StreamMode::Replay).await },
        )
    });

    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let copy_task = {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move { copy::run(&options, catalog, cancel, done_tx).await })
    };
    let index_task = {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move { index::run(&options, catalog, cancel, done_rx).await })
    };
    let blob_task = (!options.skip_large_objects).then(|| {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move { blobs::run(&options, catalog, cancel).await })
    });

    // Let every supervisor drain before deciding the run's fate; a fatal
    // error in one must not vaporize its peers' progress.
    let mut first_error: Option<ShuttleError> = None;
    match copy_task.await {
        Ok(Ok(outcome)) => {
            if outcome.failed > 0 {
                warn!(failed = outcome.failed, "tables failed during copy");
            }
        }
        Ok(Err(e)) => record_error(&mut first_error, e),
        Err(join_err) => record_error(
            &mut first_error,
            ShuttleError::StreamState(format!("copy supervisor panicked: {join_err}")),
        ),
    }
    match index_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => record_error(&mut first_error, e),
        Err(join_err) => record_error(
            &mut first_error,
            ShuttleError::StreamState(format!("index supervisor panicked: {join_err}")),
        ),
    }
    if let Some(blob_task) = blob_task {
        match blob_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => record_error(&mut first_error, e),
            Err(join_err) => record_error(
                &mut first_error,
                ShuttleError::StreamState(format!("blob supervisor panicked: {join_err}")),
            ),
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    if !catalog.step_done(step::SEQUENCES)? {
        sequences::run(&options, Arc::clone(&catalog), cancel.clone()).await?;
        catalog.step_mark(step::SEQUENCES)?;
    }

    if !catalog.all_tables_copied()? {
        warn!("not every table is loaded; post-data objects on the failed ones may error");
    }

    if !catalog.step_done(step::SCHEMA_POST_DATA)? {
        schema::restore_section(&options, schema::Section::PostData).await?;
        catalog.step_mark(step::SCHEMA_POST_DATA)?;
    }

    if !catalog.step_done(step::MATVIEWS)? {
        matviews::run(&options, Arc::clone(&catalog), cancel.clone()).await?;
        catalog.step_mark(step::MATVIEWS)?;
    }

    // the snapshot is no longer needed once bulk copy is over
    drop(coordinator);

    // ── Follow: catch up and stay live ─────────────────────────────────

    if let Some(stream_task) = stream_task {
        info!("bulk copy complete; enabling change apply");
        let mut sentinel = catalog.sentinel_get()?.unwrap_or_default();
        sentinel.apply_enabled = true;
        if sentinel.endpos.is_none() {
            sentinel.endpos = options.stream.endpos;
        }
        catalog.sentinel_put(&sentinel)?;

        match stream_task.await {
            Ok(Ok(Some(outcome))) => {
                info!(
                    applied_through = %outcome.applied_through,
                    transactions = outcome.transactions,
                    "change data capture finished"
                );
            }
            Ok(Ok(None)) => {}
            Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(ShuttleError::StreamState(format!(
                    "stream pipeline panicked: {join_err}"
                )));
            }
        }
    }

    summary::print(&catalog, started.elapsed())
}

fn record_error(slot: &mut Option<ShuttleError>, e: ShuttleError) {
    if matches!(e, ShuttleError::Cancelled) && slot.is_some() {
        return;
    }
    warn!(error = %e, "supervisor failed");
    if slot.is_none() {
        *slot = Some(e);
    }
}

/// Acquire (or reuse) the snapshot and make sure the catalog holds the
/// plan this run executes.
async fn prepare_plan(
    options: &mut CloneOptions,
    catalog: &Arc<Catalog>,
    coordinator: &PgConn,
) -> Result<()> {
    let source_identity = pgsql::system_identifier(coordinator).await?;

    if options.resume && catalog.plan_exists()? {
        let setup = catalog
            .setup()?
            .ok_or_else(|| ShuttleError::Catalog("missing setup row".into()))?;
        if setup.system_identifier != source_identity {
            return Err(ShuttleError::Config(format!(
                "cannot resume: catalog was planned against system {} but the source is {}",
                setup.system_identifier, source_identity
            )));
        }
        let recovered = catalog.recover()?;
        info!(recovered, "resuming previous run");

        // Workers can only share a point in time if the original snapshot
        // is still held open by some session.
        match (&options.snapshot, options.not_consistent) {
            (Some(_), _) => {}
            (None, true) => {
                warn!(
                    "resuming without a snapshot; consistency with the interrupted \
                     run is not guaranteed"
                );
                options.snapshot = None;
            }
            (None, false) => {
                return Err(ShuttleError::Config(
                    "resuming needs the original snapshot still held (pass --snapshot) \
                     or --not-consistent"
                        .into(),
                ));
            }
        }
        return Ok(());
    }

    if catalog.plan_exists()? {
        info!("discarding previous plan (no --resume)");
        catalog.plan_reset()?;
    }

    if options.snapshot.is_none() && !options.not_consistent {
        let snapshot = pgsql::export_snapshot(coordinator).await?;
        info!(snapshot = %snapshot, "snapshot exported");
        options.snapshot = Some(snapshot);
    } else if options.snapshot.is_some() {
        pgsql::import_snapshot(coordinator, options.snapshot.as_deref().unwrap_or_default())
            .await?;
    }

    let plan = introspect::build_plan(
        coordinator,
        &options.filters,
        &IntrospectOptions {
            split_tables_larger_than: options.split_tables_larger_than,
            skip_extensions: options.skip_extensions,
            skip_large_objects: options.skip_large_objects,
        },
        options.snapshot.clone(),
    )
    .await?;
    catalog.plan_init(&plan)?;
    write_plan_snapshot(options, &plan)?;
    Ok(())
}

/// Drop a human-readable copy of the plan under `run/`; the catalog stays
/// authoritative, this one is for the operator.
fn write_plan_snapshot(options: &CloneOptions, plan: &crate::plan::WorkPlan) -> Result<()> {
    let path = options.dirs.run_dir().join("plan.json");
    let json = serde_json::to_string_pretty(plan)
        .map_err(|e| ShuttleError::Catalog(format!("plan snapshot: {e}")))?;
    std::fs::write(&path, json).map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
    Ok(())
}

// ── Phase commands (`copy …`) ──────────────────────────────────────────────

/// Feed the index supervisor every table already in a terminal loaded
/// state, for the standalone `copy indexes` / `copy constraints` phases.
pub async fn run_index_phase(options: &CloneOptions, catalog: Arc<Catalog>, cancel: Cancel) -> Result<()> {
    let plan = catalog.load_plan()?;
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    for table in &plan.tables {
        let state = catalog
            .table_status(table.oid)?
            .map(|s| s.state)
            .unwrap_or(TaskState::Planned);
        if matches!(state, TaskState::Copied | TaskState::Skipped) {
            let _ = done_tx.send(table.oid);
        }
    }
    drop(done_tx);
    index::run(options, catalog, cancel, done_rx).await
}

/// `copy table-data` / `copy data`: the copy supervisor with (optionally)
/// the index supervisor attached.
pub async fn run_copy_phase(
    options: &CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    with_indexes: bool,
) -> Result<()> {
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let index_task = with_indexes.then(|| {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move { index::run(&options, catalog, cancel, done_rx).await })
    });

    copy::run(options, Arc::clone(&catalog), cancel, done_tx).await?;
    if let Some(task) = index_task {
        match task.await {
            Ok(result) => result?,
            Err(join_err) => {
                return Err(ShuttleError::StreamState(format!(
                    "index supervisor panicked: {join_err}"
                )));
            }
        }
    }
    Ok(())
}

/// Make sure a plan exists for a standalone phase command, introspecting
/// on the fly when the catalog is empty. Returns the connection holding
/// the snapshot transaction; the caller must keep it alive for as long as
/// workers import that snapshot.
pub async fn ensure_plan(
    options: &mut CloneOptions,
    catalog: &Arc<Catalog>,
) -> Result<Option<PgConn>> {
    if catalog.plan_exists()? {
        catalog.recover()?;
        return Ok(None);
    }
    let coordinator = PgConn::connect(&options.conn.source).await?;
    if options.snapshot.is_none() && !options.not_consistent {
        options.snapshot = Some(pgsql::export_snapshot(&coordinator).await?);
    }
    let plan = introspect::build_plan(
        &coordinator,
        &options.filters,
        &IntrospectOptions {
            split_tables_larger_than: options.split_tables_larger_than,
            skip_extensions: options.skip_extensions,
            skip_large_objects: options.skip_large_objects,
        },
        options.snapshot.clone(),
    )
    .await?;
    catalog.plan_init(&plan)?;
    write_plan_snapshot(options, &plan)?;
    Ok(Some(coordinator))
}
