//! Sequence value transfer.
//!
//! Sequence values were read at plan time under the run snapshot; this
//! phase replays them onto the target with `setval`. Cheap enough to run
//! on a single connection after the bulk copy.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::pgsql::{PgConn, quote_qualified};
use crate::plan::SequenceTask;

/// `setval` call for one sequence.
pub fn setval_sql(seq: &SequenceTask) -> String {
    format!(
        "SELECT pg_catalog.setval('{}', {}, {})",
        quote_qualified(&seq.schema, &seq.name).replace('\'', "''"),
        seq.last_value,
        seq.is_called
    )
}

/// Apply every planned sequence task.
pub async fn run(options: &CloneOptions, catalog: Arc<Catalog>, cancel: Cancel) -> Result<()> {
    let plan = catalog.load_plan()?;
    if plan.sequences.is_empty() {
        return Ok(());
    }

    let target = PgConn::connect(&options.conn.target).await?;
    let mut applied = 0u64;
    for seq in &plan.sequences {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }
        if !catalog.claim_sequence(seq.oid)? {
            continue;
        }
        let sql = setval_sql(seq);
        let result = tokio::select! {
            res = target.batch_execute(&sql) => res.map_err(ShuttleError::from_db),
            _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
        };
        match result {
            Ok(()) => {
                catalog.sequence_done(seq.oid)?;
                applied += 1;
            }
            Err(ShuttleError::Cancelled) => return Err(ShuttleError::Cancelled),
            Err(e) => {
                warn!(sequence = %format!("{}.{}", seq.schema, seq.name), error = %e,
                      "sequence reset failed");
                catalog.sequence_failed(seq.oid, &e.to_string())?;
            }
        }
    }
    info!(applied, "sequence values carried over");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setval_sql() {
        let seq = SequenceTask {
            oid: 1,
            schema: "public".into(),
            name: "orders_id_seq".into(),
            last_value: 4242,
            is_called: true,
        };
        assert_eq!(
            setval_sql(&seq),
            "SELECT pg_catalog.setval('\"public\".\"orders_id_seq\"', 4242, true)"
        );
    }

    #[test]
    fn test_setval_sql_never_called() {
        let seq = SequenceTask {
            oid: 1,
            schema: "app".into(),
            name: "s".into(),
            last_value: 1,
            is_called: false,
        };
        assert!(setval_sql(&seq).ends_with(", 1, false)"));
    }
}
