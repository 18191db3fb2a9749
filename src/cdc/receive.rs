//! Receiver — logical slot to segment files.
//!
//! Polls the slot in bounded batches (peek, never get), appends the raw
//! changes to the current segment, fsyncs, and only then advances the
//! slot. The advance is the flush confirmation: the source can recycle
//! WAL below it because the bytes are durable on our disk. Falling behind
//! the apply side is therefore absorbed by disk, not by server memory.
//!
//! With an endpos set, the receiver keeps going until a COMMIT at or past
//! the endpos is on disk; stopping earlier could truncate a transaction
//! that the applier is required to apply in full.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::{ShuttleDirs, StreamOptions};
use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;
use crate::pgsql::PgConn;

use super::StageStatus;
use super::record;
use super::segment::{DEFAULT_SEGMENT_BYTES, SegmentWriter};
use super::slot;

/// Changes fetched per poll. Bounds memory and keeps slot advances fresh.
const PEEK_BATCH: i32 = 500;

/// Idle sleep between polls when the slot has nothing new.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the receiver until cancellation or until the endpos commit is
/// durable. Returns the final flushed position.
pub async fn run(
    source_uri: &str,
    stream: &StreamOptions,
    dirs: &ShuttleDirs,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    status_tx: watch::Sender<StageStatus>,
) -> Result<Lsn> {
    let conn = PgConn::connect(source_uri).await?;
    let slot_state = catalog
        .slot_get(&stream.slot_name)?
        .ok_or_else(|| ShuttleError::StreamState("stream has not been set up".into()))?;

    let seg_dir = dirs.cdc_dir(&stream.slot_name);
    let mut writer = SegmentWriter::open_existing(&seg_dir, DEFAULT_SEGMENT_BYTES)?;

    let mut flushed = slot::confirmed_flush_lsn(&conn, &stream.slot_name).await?;
    info!(
        slot = %stream.slot_name,
        plugin = %slot_state.plugin,
        resume = %flushed,
        "receiver started"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let sentinel = catalog.sentinel_get()?.unwrap_or_default();
        let endpos = stream.endpos.or(sentinel.endpos);

        let batch = tokio::select! {
            res = slot::peek_changes(&conn, &stream.slot_name, stream.plugin, PEEK_BATCH) => res?,
            _ = cancel.cancelled() => break,
        };

        if batch.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                _ = cancel.cancelled() => break,
            }
        }

        writer.append(&batch)?;
        let last = batch
            .last()
            .map(|e| e.lsn)
            .unwrap_or(flushed);

        // the batch is durable: confirm it so the source can move on
        slot::advance_slot(&conn, &stream.slot_name, last).await?;
        catalog.slot_update_positions(&stream.slot_name, last, last)?;
        flushed = last;
        let _ = status_tx.send(StageStatus {
            pos: flushed,
            done: false,
        });
        let lag = slot::slot_lag_bytes(&conn, &stream.slot_name)
            .await
            .unwrap_or(0);
        debug!(through = %flushed, changes = batch.len(), lag_bytes = lag, "batch received");

        if let Some(endpos) = endpos {
            let endpos_commit_received = batch
                .iter()
                .any(|e| e.lsn >= endpos && record::is_commit(stream.plugin, &e.data));
            if endpos_commit_received {
                info!(endpos = %endpos, flushed = %flushed, "endpos commit received");
                break;
            }
        }
    }

    let _ = status_tx.send(StageStatus {
        pos: flushed,
        done: true,
    });
    info!(flushed = %flushed, "receiver stopped");
    Ok(flushed)
}
