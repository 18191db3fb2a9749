//! Materialized view refresh.
//!
//! Matviews are restored as definitions by the schema bridge but their
//! contents are rebuilt here, after post-data, largest first, in parallel
//! up to `index-jobs`. A failed refresh fails only that matview.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::pgsql::{PgPool, quote_qualified};
use crate::plan::MatviewTask;

pub fn refresh_sql(mv: &MatviewTask) -> String {
    format!(
        "REFRESH MATERIALIZED VIEW {}",
        quote_qualified(&mv.schema, &mv.name)
    )
}

/// Refresh every planned matview.
pub async fn run(options: &CloneOptions, catalog: Arc<Catalog>, cancel: Cancel) -> Result<()> {
    let plan = catalog.load_plan()?;
    if plan.matviews.is_empty() {
        return Ok(());
    }

    let mut matviews = plan.matviews.clone();
    matviews.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));

    let pool = Arc::new(PgPool::new(options.conn.target.clone()));
    let slots = Arc::new(Semaphore::new(options.jobs.index_jobs.max(1)));
    let mut wave = JoinSet::new();

    for mv in matviews {
        let catalog = Arc::clone(&catalog);
        let pool = Arc::clone(&pool);
        let slots = Arc::clone(&slots);
        let cancel = cancel.clone();
        wave.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| ShuttleError::Cancelled)?;
            if !catalog.claim_matview(mv.oid)? {
                return Ok(());
            }
            let conn = pool.get().await?;
            let sql = refresh_sql(&mv);
            let result = tokio::select! {
                res = conn.batch_execute(&sql) => res.map_err(ShuttleError::from_db),
                _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
            };
            match result {
                Ok(()) => {
                    pool.put(conn);
                    catalog.matview_done(mv.oid)?;
                    Ok(())
                }
                Err(ShuttleError::Cancelled) => Err(ShuttleError::Cancelled),
                Err(e) => {
                    warn!(matview = %format!("{}.{}", mv.schema, mv.name), error = %e,
                          "matview refresh failed");
                    catalog.matview_failed(mv.oid, &e.to_string())?;
                    Ok(())
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
                    "matview worker panicked: {join_err}"
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
    info!("materialized views refreshed");
    Ok(())
}
