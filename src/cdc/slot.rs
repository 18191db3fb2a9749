//! Logical replication slot management.
//!
//! The slot is created *before* the bulk-copy snapshot is exported, so its
//! `consistent_point` precedes the snapshot: every change at or after the
//! consistent point is delivered through the slot, and the overlap with
//! the snapshot collapses under idempotent apply.
//!
//! Consumption is peek-then-advance: the receiver reads with
//! `pg_logical_slot_peek_changes` and only advances the slot once the
//! batch is durable in a segment file, so the source retains WAL for
//! anything not yet flushed to disk.

use tokio_postgres::Client;
use tracing::{debug, info};

use crate::catalog::{Catalog, Sentinel, SlotState};
use crate::config::{Plugin, StreamOptions};
use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;
use crate::pgsql;

use super::segment::SegmentEntry;

/// Whether the slot exists on the source.
pub async fn slot_exists(client: &Client, slot_name: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
            &[&slot_name],
        )
        .await?;
    Ok(row.get(0))
}

/// Create the logical slot; returns its consistent point. If the slot
/// already exists, returns its confirmed flush position instead.
pub async fn create_slot(client: &Client, slot_name: &str, plugin: Plugin) -> Result<Lsn> {
    if slot_exists(client, slot_name).await? {
        let lsn = confirmed_flush_lsn(client, slot_name).await?;
        debug!(slot = slot_name, lsn = %lsn, "slot already exists");
        return Ok(lsn);
    }
    let row = client
        .query_one(
            "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &plugin.as_str()],
        )
        .await?;
    let lsn: Lsn = row.get::<_, String>(0).parse()?;
    info!(slot = slot_name, plugin = plugin.as_str(), consistent_point = %lsn, "slot created");
    Ok(lsn)
}

/// Drop the slot if present.
pub async fn drop_slot(client: &Client, slot_name: &str) -> Result<()> {
    if slot_exists(client, slot_name).await? {
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
            .await?;
        info!(slot = slot_name, "slot dropped");
    }
    Ok(())
}

/// The position the source considers consumed.
pub async fn confirmed_flush_lsn(client: &Client, slot_name: &str) -> Result<Lsn> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;
    match row {
        Some(row) => row.get::<_, String>(0).parse(),
        None => Err(ShuttleError::StreamState(format!(
            "replication slot {slot_name:?} does not exist"
        ))),
    }
}

/// Bytes of WAL the slot is holding back, for lag reporting.
pub async fn slot_lag_bytes(client: &Client, slot_name: &str) -> Result<i64> {
    let row = client
        .query_opt(
            "SELECT (pg_current_wal_lsn() - confirmed_flush_lsn)::bigint \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;
    Ok(row.map(|r| r.get(0)).unwrap_or(0))
}

/// Confirm consumption up to `to`, letting the source recycle WAL.
pub async fn advance_slot(client: &Client, slot_name: &str, to: Lsn) -> Result<()> {
    client
        .execute(
            "SELECT end_lsn FROM pg_replication_slot_advance($1, $2::pg_lsn)",
            &[&slot_name, &to.to_string()],
        )
        .await?;
    Ok(())
}

/// Peek the next batch of decoded changes without consuming them.
pub async fn peek_changes(
    client: &Client,
    slot_name: &str,
    plugin: Plugin,
    limit: i32,
) -> Result<Vec<SegmentEntry>> {
    let options: Vec<&str> = match plugin {
        Plugin::Wal2Json => vec![
            "format-version",
            "2",
            "include-xids",
            "1",
            "include-timestamp",
            "1",
        ],
        Plugin::TestDecoding => vec!["include-xids", "1", "include-timestamp", "1"],
    };
    let rows = client
        .query(
            "SELECT lsn::text, xid::text, data \
             FROM pg_logical_slot_peek_changes($1, NULL, $2, VARIADIC $3::text[])",
            &[&slot_name, &limit, &options],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let lsn: Lsn = row.get::<_, String>(0).parse()?;
        let xid = row.get::<_, String>(1).parse::<i64>().ok();
        out.push(SegmentEntry {
            lsn,
            xid,
            data: row.get(2),
        });
    }
    Ok(out)
}

// ── setup / cleanup ────────────────────────────────────────────────────────

/// `stream setup`: create the slot and seed the catalog's slot state and
/// sentinel. Idempotent when the slot and state already exist.
pub async fn setup(
    source_uri: &str,
    stream: &StreamOptions,
    catalog: &Catalog,
) -> Result<SlotState> {
    let conn = pgsql::PgConn::connect(source_uri).await?;

    if let Some(existing) = catalog.slot_get(&stream.slot_name)? {
        if slot_exists(&conn, &stream.slot_name).await? {
            debug!(slot = %stream.slot_name, "stream already set up");
            return Ok(existing);
        }
        return Err(ShuttleError::StreamState(format!(
            "slot {:?} is tracked in the catalog but missing on the source; \
             run stream cleanup first",
            stream.slot_name
        )));
    }

    if !stream.create_slot && !slot_exists(&conn, &stream.slot_name).await? {
        return Err(ShuttleError::StreamState(format!(
            "slot {:?} does not exist (use --create-slot)",
            stream.slot_name
        )));
    }

    let consistent_point = create_slot(&conn, &stream.slot_name, stream.plugin).await?;
    let timeline = pgsql::timeline_id(&conn).await?;

    let state = SlotState {
        slot_name: stream.slot_name.clone(),
        plugin: stream.plugin.as_str().to_string(),
        consistent_point,
        write_lsn: Lsn::ZERO,
        flush_lsn: Lsn::ZERO,
        timeline_id: timeline,
    };
    catalog.slot_put(&state)?;

    let startpos = stream.startpos.unwrap_or(consistent_point);
    catalog.sentinel_put(&Sentinel {
        startpos,
        endpos: stream.endpos,
        apply_enabled: false,
    })?;
    Ok(state)
}

/// `stream cleanup`: drop the slot and forget all CDC state.
pub async fn cleanup(source_uri: &str, stream: &StreamOptions, catalog: &Catalog) -> Result<()> {
    let conn = pgsql::PgConn::connect(source_uri).await?;
    drop_slot(&conn, &stream.slot_name).await?;
    catalog.slot_delete(&stream.slot_name)?;
    catalog.stream_state_reset()?;
    Ok(())
}
