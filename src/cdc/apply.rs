//! Applier — transformed scripts to the target, in commit order.
//!
//! There is exactly one applier, on one target connection: logical
//! consistency trumps throughput. Each script is applied inside a single
//! target transaction that also carries the origin-progress upsert, so
//! the recorded source commit LSN and the applied rows are atomic; a
//! crash mid-transaction rolls both back and the restart replays from the
//! last recorded LSN. Scripts are idempotent, so the at-least-once replay
//! converges.
//!
//! Stop conditions: a cancel, or an endpos. The transaction whose commit
//! LSN first reaches the endpos is applied *in full*, then the applier
//! stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::catalog::{ApplyCursor, Catalog};
use crate::config::{ShuttleDirs, StreamOptions};
use crate::error::{ErrorKind, Result, RetryPolicy, ShuttleError};
use crate::lsn::Lsn;
use crate::pgsql::{PgConn, quote_literal};

use super::StageStatus;
use super::segment;
use super::transform::{self, COMMIT_SENTINEL};

/// Idle sleep while waiting for new scripts or for apply to be enabled.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Final word from the applier.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub applied_through: Lsn,
    pub transactions: u64,
    pub endpos_reached: bool,
}

/// Progress table on the target; apply progress survives a target restart
/// because it commits atomically with each transaction.
const PROGRESS_DDL: &str = "\
CREATE SCHEMA IF NOT EXISTS pgshuttle;
CREATE TABLE IF NOT EXISTS pgshuttle.apply_progress (
    origin     TEXT PRIMARY KEY,
    commit_lsn PG_LSN NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);";

pub async fn ensure_progress_table(conn: &PgConn) -> Result<()> {
    conn.batch_execute(PROGRESS_DDL).await?;
    Ok(())
}

/// Last source commit LSN recorded on the target for this origin.
pub async fn read_target_progress(conn: &PgConn, origin: &str) -> Result<Option<Lsn>> {
    let row = conn
        .query_opt(
            "SELECT commit_lsn::text FROM pgshuttle.apply_progress WHERE origin = $1",
            &[&origin],
        )
        .await?;
    row.map(|r| r.get::<_, String>(0).parse()).transpose()
}

/// Wrap a transformed script into the single target transaction that
/// applies it and records its source commit LSN.
pub fn wrap_script(script: &str, origin: &str, commit: Lsn) -> String {
    format!(
        "BEGIN;\n{script}\
         INSERT INTO pgshuttle.apply_progress (origin, commit_lsn) \
         VALUES ({origin_lit}, '{commit}'::pg_lsn) \
         ON CONFLICT (origin) DO UPDATE SET \
           commit_lsn = EXCLUDED.commit_lsn, updated_at = now();\n\
         COMMIT;\n",
        origin_lit = quote_literal(origin),
    )
}

/// Whether a script file is complete (its publish rename happened after a
/// full write; torn copies are impossible, but stay paranoid).
pub fn script_complete(script: &str) -> bool {
    script
        .lines()
        .last()
        .is_some_and(|l| l.starts_with(COMMIT_SENTINEL))
}

/// Run the applier until endpos, cancellation, or (once the upstream
/// stages are done) the scripts run dry.
pub async fn run(
    target_uri: &str,
    stream: &StreamOptions,
    dirs: &ShuttleDirs,
    catalog: Arc<Catalog>,
    cancel: Cancel,
    mut transformed_rx: watch::Receiver<StageStatus>,
) -> Result<ApplyOutcome> {
    let sql_dir = dirs.cdc_sql_dir(&stream.slot_name);
    let seg_dir = dirs.cdc_dir(&stream.slot_name);
    let policy = RetryPolicy::default();

    let mut target: Option<PgConn> = Some(PgConn::connect(target_uri).await?);
    if let Some(conn) = &target {
        ensure_progress_table(conn).await?;
    }

    // the target's own record wins over the local cursor: it is the one
    // that is atomic with the applied rows
    let mut applied = catalog.cursor_read()?.applied_commit_lsn;
    if let Some(conn) = &target {
        if let Some(remote) = read_target_progress(conn, &stream.origin).await? {
            applied = applied.max(remote);
        }
    }
    // nothing below the start position is ever applied; it was part of
    // the bulk copy's snapshot
    if let Some(sentinel) = catalog.sentinel_get()? {
        applied = applied.max(sentinel.startpos);
    }
    if let Some(startpos) = stream.startpos {
        applied = applied.max(startpos);
    }
    info!(origin = %stream.origin, resume = %applied, "applier started");

    let mut transactions = 0u64;
    let mut endpos_reached = false;

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }
        let sentinel = catalog.sentinel_get()?.unwrap_or_default();
        if !sentinel.apply_enabled {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                _ = cancel.cancelled() => break,
            }
        }
        let endpos = stream.endpos.or(sentinel.endpos);

        let scripts: Vec<(Lsn, std::path::PathBuf)> = transform::list_scripts(&sql_dir)?
            .into_iter()
            .filter(|(lsn, _)| *lsn > applied)
            .collect();

        let mut progressed = false;
        for (commit, path) in scripts {
            if cancel.is_cancelled() {
                break 'outer;
            }
            let script = std::fs::read_to_string(&path)
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            if !script_complete(&script) {
                warn!(script = %path.display(), "incomplete script, waiting");
                break;
            }

            apply_one(
                target_uri,
                &mut target,
                &wrap_script(&script, &stream.origin, commit),
                commit,
                &policy,
                &cancel,
            )
            .await?;
            transactions += 1;
            progressed = true;

            applied = commit;
            let status = transformed_rx.borrow().clone();
            catalog.cursor_write(&ApplyCursor {
                applied_commit_lsn: applied,
                written_lsn: status.pos.max(applied),
                flushed_lsn: applied,
            })?;
            std::fs::remove_file(&path)
                .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
            segment::purge_below(&seg_dir, applied)?;
            debug!(
                commit = %applied,
                behind_bytes = status.pos.delta_from(applied),
                "transaction applied"
            );

            if let Some(endpos) = endpos {
                if applied >= endpos {
                    info!(endpos = %endpos, applied = %applied, "endpos reached");
                    endpos_reached = true;
                    break 'outer;
                }
            }
        }

        if !progressed {
            let status = transformed_rx.borrow().clone();
            if status.done && status.pos <= applied {
                break;
            }
            tokio::select! {
                _ = transformed_rx.changed() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    info!(
        applied = %applied,
        transactions,
        endpos_reached,
        "applier stopped"
    );
    Ok(ApplyOutcome {
        applied_through: applied,
        transactions,
        endpos_reached,
    })
}

/// Apply one wrapped script with the retry ladder: transient errors back
/// off and reconnect up to `max-attempts`; a data error is retried once
/// (the script is idempotent, a racing writer may have gone away), then
/// fails the run with the offending LSN attached.
async fn apply_one(
    target_uri: &str,
    target: &mut Option<PgConn>,
    wrapped: &str,
    commit: Lsn,
    policy: &RetryPolicy,
    cancel: &Cancel,
) -> Result<()> {
    let mut attempts: u32 = 0;
    let mut data_retried = false;
    loop {
        if target.is_none() {
            *target = Some(PgConn::connect(target_uri).await?);
            if let Some(conn) = &target {
                ensure_progress_table(conn).await?;
            }
        }
        let conn = target
            .as_ref()
            .ok_or_else(|| ShuttleError::Connection("target connection unavailable".into()))?;

        let result = tokio::select! {
            res = conn.batch_execute(wrapped) => res.map_err(ShuttleError::from_db),
            _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(ShuttleError::Cancelled) => return Err(ShuttleError::Cancelled),
            Err(e) if e.kind() == ErrorKind::Data && !data_retried => {
                warn!(commit = %commit, error = %e, "apply data error, retrying once");
                // the session is in an aborted transaction after the error
                if let Some(conn) = &target {
                    let _ = conn.batch_execute("ROLLBACK").await;
                }
                data_retried = true;
            }
            Err(e) if e.is_retryable() && policy.should_retry(attempts + 1) => {
                warn!(commit = %commit, attempt = attempts, error = %e, "apply retry");
                *target = None;
                attempts += 1;
                let backoff = Duration::from_millis(policy.backoff_ms(attempts - 1));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(ShuttleError::Cancelled),
                }
            }
            Err(e) => return Err(e.at_lsn(&commit.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_script_contains_progress_update() {
        let commit: Lsn = "0/1A2B".parse().unwrap();
        let wrapped = wrap_script(
            "INSERT INTO \"public\".\"a\" (\"id\") VALUES ('1'::integer);\n-- COMMIT 0/1A2B\n",
            "pgshuttle",
            commit,
        );
        assert!(wrapped.starts_with("BEGIN;\n"));
        assert!(wrapped.trim_end().ends_with("COMMIT;"));
        assert!(wrapped.contains("'0/1A2B'::pg_lsn"));
        assert!(wrapped.contains("'pgshuttle'"));
        assert!(wrapped.contains("ON CONFLICT (origin)"));
    }

    #[test]
    fn test_script_complete_checks_sentinel() {
        assert!(script_complete("INSERT ...;\n-- COMMIT 0/1\n"));
        assert!(!script_complete("INSERT ...;\n"));
        assert!(!script_complete(""));
    }
}
