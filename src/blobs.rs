//! Blob supervisor — parallel large-object transfer.
//!
//! Large objects use their own read/write API rather than COPY, so they
//! get their own pipeline: OIDs are enumerated in order from the source
//! (under the run snapshot), chunked, and fanned out to
//! `large-objects-jobs` workers. Each worker moves content plus metadata
//! (owner, comment) for its chunk.
//!
//! Resume: the catalog's blob cursor is a low-water mark. Chunks complete
//! out of order, so an aggregator advances the cursor only across the
//! contiguous prefix of finished chunks; a crash re-copies at most the
//! in-flight chunks, and `lo_create` collisions on re-copy are resolved by
//! unlinking first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::pgsql::{self, PgConn, quote_ident};

/// OIDs per worker chunk. Bounds per-chunk memory and the re-copy window
/// after a crash.
const CHUNK_SIZE: usize = 64;

/// Split an ordered OID list into contiguous chunks.
pub fn chunk_oids(oids: &[u32], chunk_size: usize) -> Vec<Vec<u32>> {
    oids.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Advance a contiguous-prefix frontier. `done` maps chunk index to its
/// highest OID; returns the new frontier (next expected index) and the
/// highest OID safe to persist, if the prefix grew.
pub fn advance_frontier(
    next_expected: usize,
    done: &HashMap<usize, u32>,
) -> (usize, Option<u32>) {
    let mut next = next_expected;
    let mut high = None;
    while let Some(max_oid) = done.get(&next) {
        high = Some(*max_oid);
        next += 1;
    }
    (next, high)
}

/// Copy all large objects above the persisted cursor.
pub async fn run(options: &CloneOptions, catalog: Arc<Catalog>, cancel: Cancel) -> Result<()> {
    let cursor = catalog.blob_cursor()?;

    let source = PgConn::connect(&options.conn.source).await?;
    if let Some(snapshot) = &options.snapshot {
        pgsql::import_snapshot(&source, snapshot).await?;
    }
    let rows = source
        .query(
            "SELECT oid FROM pg_largeobject_metadata WHERE oid > $1 ORDER BY oid",
            &[&cursor],
        )
        .await?;
    let oids: Vec<u32> = rows.iter().map(|r| r.get(0)).collect();
    drop(source);

    if oids.is_empty() {
        debug!("no large objects to copy");
        return Ok(());
    }
    info!(count = oids.len(), resume_after = cursor, "copying large objects");

    let chunks = chunk_oids(&oids, CHUNK_SIZE);
    let queue: Arc<Mutex<Vec<(usize, Vec<u32>)>>> =
        Arc::new(Mutex::new(chunks.into_iter().enumerate().rev().collect()));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, u32, u64)>();

    let mut workers = JoinSet::new();
    for _ in 0..options.jobs.large_objects_jobs.max(1) {
        let queue = Arc::clone(&queue);
        let options = options.clone();
        let cancel = cancel.clone();
        let done_tx = done_tx.clone();
        workers.spawn(async move { blob_worker(options, queue, cancel, done_tx).await });
    }
    drop(done_tx);

    // the aggregator owns cursor advancement: strictly contiguous
    let mut next_expected = 0usize;
    let mut done: HashMap<usize, u32> = HashMap::new();
    let mut pending_counts: HashMap<usize, u64> = HashMap::new();
    while let Some((chunk_idx, max_oid, count)) = done_rx.recv().await {
        done.insert(chunk_idx, max_oid);
        pending_counts.insert(chunk_idx, count);
        let (next, high) = advance_frontier(next_expected, &done);
        if let Some(high) = high {
            let copied: u64 = (next_expected..next)
                .map(|i| pending_counts.remove(&i).unwrap_or(0))
                .sum();
            catalog.blob_advance(high, copied)?;
            next_expected = next;
        }
    }

    let mut first_error: Option<ShuttleError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) | Ok(Err(ShuttleError::Cancelled)) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShuttleError::StreamState(format!(
                    "blob worker panicked: {join_err}"
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

    let (copied, _) = catalog.blob_counts()?;
    info!(copied, "large objects copied");
    Ok(())
}

fn next_chunk(queue: &Arc<Mutex<Vec<(usize, Vec<u32>)>>>) -> Option<(usize, Vec<u32>)> {
    queue.lock().ok()?.pop()
}

async fn blob_worker(
    options: CloneOptions,
    queue: Arc<Mutex<Vec<(usize, Vec<u32>)>>>,
    cancel: Cancel,
    done_tx: mpsc::UnboundedSender<(usize, u32, u64)>,
) -> Result<()> {
    let mut source: Option<PgConn> = None;
    let mut target: Option<PgConn> = None;
    let policy = crate::error::RetryPolicy::default();

    while let Some((chunk_idx, oids)) = next_chunk(&queue) {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }
        let mut copied = 0u64;
        let mut max_oid = 0u32;
        for oid in oids {
            let mut attempts: u32 = 0;
            loop {
                let moved = tokio::select! {
                    res = async {
                        if source.is_none() {
                            let conn = PgConn::connect(&options.conn.source).await?;
                            if let Some(snapshot) = &options.snapshot {
                                pgsql::import_snapshot(&conn, snapshot).await?;
                            }
                            source = Some(conn);
                        }
                        if target.is_none() {
                            target = Some(PgConn::connect(&options.conn.target).await?);
                        }
                        let src = source.as_ref().ok_or_else(|| {
                            ShuttleError::Connection("source connection unavailable".into())
                        })?;
                        let dst = target.as_ref().ok_or_else(|| {
                            ShuttleError::Connection("target connection unavailable".into())
                        })?;
                        copy_one_blob(src, dst, oid, options.no_owner).await
                    } => res,
                    _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
                };
                match moved {
                    Ok(()) => {
                        copied += 1;
                        max_oid = max_oid.max(oid);
                        break;
                    }
                    Err(ShuttleError::Cancelled) => return Err(ShuttleError::Cancelled),
                    Err(e) if e.is_retryable() && policy.should_retry(attempts + 1) => {
                        warn!(oid, attempt = attempts, error = %e, "large object retry");
                        source = None;
                        target = None;
                        attempts += 1;
                        let backoff =
                            std::time::Duration::from_millis(policy.backoff_ms(attempts - 1));
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if max_oid > 0 {
            let _ = done_tx.send((chunk_idx, max_oid, copied));
        }
    }
    Ok(())
}

/// Move one large object: content, owner, comment.
async fn copy_one_blob(
    source: &PgConn,
    target: &PgConn,
    oid: u32,
    no_owner: bool,
) -> Result<()> {
    let row = source
        .query_one(
            "SELECT lo_get($1), \
                    (SELECT rolname FROM pg_roles r \
                     JOIN pg_largeobject_metadata m ON m.lomowner = r.oid \
                     WHERE m.oid = $1), \
                    obj_description($1, 'pg_largeobject')",
            &[&oid],
        )
        .await?;
    let content: Vec<u8> = row.get(0);
    let owner: Option<String> = row.get(1);
    let comment: Option<String> = row.get(2);

    // re-copies after a crash may find the object already present
    target
        .execute(
            "SELECT lo_unlink($1) FROM pg_largeobject_metadata WHERE oid = $1",
            &[&oid],
        )
        .await?;
    target.execute("SELECT lo_create($1)", &[&oid]).await?;
    target
        .execute("SELECT lo_put($1, 0, $2)", &[&oid, &content])
        .await?;

    if let Some(owner) = owner {
        if !no_owner {
            let sql = format!("ALTER LARGE OBJECT {oid} OWNER TO {}", quote_ident(&owner));
            target.batch_execute(&sql).await?;
        }
    }
    if let Some(comment) = comment {
        let sql = format!(
            "COMMENT ON LARGE OBJECT {oid} IS {}",
            pgsql::quote_literal(&comment)
        );
        target.batch_execute(&sql).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_oids() {
        let oids: Vec<u32> = (1..=10).collect();
        let chunks = chunk_oids(&oids, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec![1, 2, 3, 4]);
        assert_eq!(chunks[2], vec![9, 10]);
        assert!(chunk_oids(&[], 4).is_empty());
    }

    #[test]
    fn test_advance_frontier_contiguous_only() {
        let mut done = HashMap::new();
        // chunk 1 finishes before chunk 0: frontier must not move
        done.insert(1, 200);
        assert_eq!(advance_frontier(0, &done), (0, None));

        done.insert(0, 100);
        // now 0 and 1 are both done: frontier jumps past both, cursor at
        // chunk 1's high OID
        assert_eq!(advance_frontier(0, &done), (2, Some(200)));

        // nothing new
        assert_eq!(advance_frontier(2, &done), (2, None));

        done.insert(3, 400);
        assert_eq!(advance_frontier(2, &done), (2, None));
        done.insert(2, 300);
        assert_eq!(advance_frontier(2, &done), (4, Some(400)));
    }
}
