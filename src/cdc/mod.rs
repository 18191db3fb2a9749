//! Change Data Capture pipeline: receive → transform → apply.
//!
//! Three cooperating stages with explicit buffering between them:
//!
//! - the **receiver** drains the logical slot into append-only segment
//!   files ([`segment`]), confirming consumption only after fsync;
//! - the **transformer** turns segments into per-transaction idempotent
//!   SQL scripts ([`transform`]);
//! - the **applier** replays the scripts on the target in commit-LSN
//!   order, single-threaded, recording progress in the target itself
//!   ([`apply`]).
//!
//! Stages communicate position through watch channels and the catalog;
//! each can be run alone (`stream prefetch`, `stream catchup`) or all
//! together (`stream replay`, `clone --follow`).

pub mod apply;
pub mod receive;
pub mod record;
pub mod segment;
pub mod slot;
pub mod test_decoding;
pub mod transform;
pub mod wal2json;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;

pub use apply::ApplyOutcome;

/// Position report from one stage to the next.
#[derive(Debug, Clone, Default)]
pub struct StageStatus {
    pub pos: Lsn,
    pub done: bool,
}

/// Which stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Receive and transform only; nothing touches the target.
    Prefetch,
    /// Transform and apply what is already on disk; no receiving.
    Catchup,
    /// All three stages.
    Replay,
}

/// Run the CDC pipeline in the given mode until its stop condition.
pub async fn run_stream(
    options: &CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    mode: StreamMode,
) -> Result<Option<ApplyOutcome>> {
    let stream = options.stream.clone();
    options.dirs.ensure(&stream.slot_name)?;

    let (recv_tx, recv_rx) = watch::channel(StageStatus::default());
    let (transformed_tx, transformed_rx) = watch::channel(StageStatus::default());

    // Without a receiver, the transformer only has the on-disk backlog.
    if mode == StreamMode::Catchup {
        let flushed = catalog
            .slot_get(&stream.slot_name)?
            .map(|s| s.flush_lsn)
            .unwrap_or(Lsn::ZERO);
        let _ = recv_tx.send(StageStatus {
            pos: flushed,
            done: true,
        });
    }

    let receiver = (mode != StreamMode::Catchup).then(|| {
        let source_uri = options.conn.source.clone();
        let stream = stream.clone();
        let dirs = options.dirs.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            receive::run(&source_uri, &stream, &dirs, catalog, cancel, recv_tx).await
        })
    });

    let transformer = {
        let options = options.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            transform_task(&options, catalog, cancel, recv_rx, transformed_tx).await
        })
    };

    let applier = (mode != StreamMode::Prefetch).then(|| {
        let target_uri = options.conn.target.clone();
        let stream = stream.clone();
        let dirs = options.dirs.clone();
        let catalog = Arc::clone(&catalog);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            apply::run(&target_uri, &stream, &dirs, catalog, cancel, transformed_rx).await
        })
    });

    let mut outcome = None;
    if let Some(applier) = applier {
        match applier.await {
            Ok(Ok(result)) => outcome = Some(result),
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(ShuttleError::StreamState(format!(
                    "applier panicked: {join_err}"
                )));
            }
        }
        // endpos reached (or apply done): the other stages stop on cancel
        // or on their own endpos detection; give them a nudge by waiting.
    }

    match transformer.await {
        Ok(Ok(())) => {}
        Ok(Err(ShuttleError::Cancelled)) => {}
        Ok(Err(e)) => return Err(e),
        Err(join_err) => {
            return Err(ShuttleError::StreamState(format!(
                "transformer panicked: {join_err}"
            )));
        }
    }
    if let Some(receiver) = receiver {
        match receiver.await {
            Ok(Ok(_flushed)) => {}
            Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => {
                return Err(ShuttleError::StreamState(format!(
                    "receiver panicked: {join_err}"
                )));
            }
        }
    }

    if cancel.is_cancelled() && outcome.is_none() {
        return Err(ShuttleError::Cancelled);
    }
    Ok(outcome)
}

/// The transformer stage: scan segments as the receiver reports progress,
/// feed entries past the per-file consumed offsets, publish on commit.
async fn transform_task(
    options: &CloneOptions,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    mut recv_rx: watch::Receiver<StageStatus>,
    transformed_tx: watch::Sender<StageStatus>,
) -> Result<()> {
    let stream = &options.stream;
    let seg_dir = options.dirs.cdc_dir(&stream.slot_name);
    let sql_dir = options.dirs.cdc_sql_dir(&stream.slot_name);

    // identity columns come from the plan when one exists; without it the
    // decoded old keys still make UPDATE/DELETE correct
    let identity = if catalog.plan_exists()? {
        transform::identity_map(&catalog.load_plan()?)
    } else {
        HashMap::new()
    };

    let resume_after = {
        let applied = catalog.cursor_read()?.applied_commit_lsn;
        let published = transform::list_scripts(&sql_dir)?
            .last()
            .map(|(lsn, _)| *lsn)
            .unwrap_or(Lsn::ZERO);
        applied.max(published)
    };
    let mut transformer = transform::Transformer::new(
        stream.plugin,
        &sql_dir,
        identity,
        resume_after,
    );
    info!(resume = %resume_after, "transformer started");

    // per segment: (file size at last scan, entries fed). The size check
    // skips re-parsing segments that did not grow.
    let mut consumed: HashMap<std::path::PathBuf, (u64, usize)> = HashMap::new();

    loop {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }

        let mut progressed = false;
        for (_, path) in segment::list_segments(&seg_dir)? {
            let size = std::fs::metadata(&path)
                .map(|m| m.len())
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            let (seen_size, offset) = consumed.get(&path).copied().unwrap_or((0, 0));
            if size == seen_size {
                continue;
            }
            let entries = segment::read_segment(&path)?;
            if entries.len() <= offset {
                consumed.insert(path, (size, offset));
                continue;
            }
            for entry in &entries[offset..] {
                match transformer.feed(entry) {
                    Ok(Some((commit, _))) => {
                        let _ = transformed_tx.send(StageStatus {
                            pos: commit,
                            done: false,
                        });
                    }
                    Ok(None) => {}
                    Err(e @ ShuttleError::Decode { .. }) => {
                        // Protocol errors are fatal with the LSN logged.
                        warn!(error = %e, "decoder failure");
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            consumed.insert(path, (size, entries.len()));
            progressed = true;
        }
        // the applier purges applied segments; drop their offsets
        consumed.retain(|path, _| path.exists());

        if !progressed {
            let recv = recv_rx.borrow().clone();
            if recv.done {
                let _ = transformed_tx.send(StageStatus {
                    pos: transformer.last_emitted(),
                    done: true,
                });
                info!(through = %transformer.last_emitted(), "transformer drained");
                return Ok(());
            }
            tokio::select! {
                _ = recv_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
            }
        }
    }
}
