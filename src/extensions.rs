//! Extension installation on the target.
//!
//! Extensions are installed here, before the pre-data restore, so that
//! types and operators they provide exist when table DDL arrives. The
//! schema bridge's restore manifest always comments extension entries out;
//! this phase is the single owner of extension creation and the one place
//! `exclude-extension` and `--skip-extensions` are honored for DDL.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::catalog::Catalog;
use crate::config::CloneOptions;
use crate::error::{Result, ShuttleError};
use crate::pgsql::{PgConn, quote_ident};
use crate::plan::ExtensionTask;

/// Creation statement for one extension. The version is not pinned: the
/// target installs whatever it packages, and `compare schema` surfaces
/// drift.
pub fn create_extension_sql(ext: &ExtensionTask) -> String {
    format!(
        "CREATE EXTENSION IF NOT EXISTS {} WITH SCHEMA {} CASCADE",
        quote_ident(&ext.name),
        quote_ident(&ext.schema)
    )
}

/// Install every planned extension task.
pub async fn run(options: &CloneOptions, catalog: Arc<Catalog>, cancel: Cancel) -> Result<()> {
    let plan = catalog.load_plan()?;
    if plan.extensions.is_empty() {
        return Ok(());
    }

    let target = PgConn::connect(&options.conn.target).await?;
    let mut installed = 0u64;
    for ext in &plan.extensions {
        if cancel.is_cancelled() {
            return Err(ShuttleError::Cancelled);
        }
        let sql = create_extension_sql(ext);
        let result = tokio::select! {
            res = target.batch_execute(&sql) => {
                res.map_err(ShuttleError::from_db)
            }
            _ = cancel.cancelled() => Err(ShuttleError::Cancelled),
        };
        match result {
            Ok(()) => installed += 1,
            Err(ShuttleError::Cancelled) => return Err(ShuttleError::Cancelled),
            Err(e) => {
                warn!(extension = %ext.name, error = %e, "extension install failed");
            }
        }
    }
    info!(installed, "extensions installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_extension_sql() {
        let ext = ExtensionTask {
            oid: 1,
            name: "pgcrypto".into(),
            schema: "public".into(),
            version: "1.3".into(),
        };
        assert_eq!(
            create_extension_sql(&ext),
            "CREATE EXTENSION IF NOT EXISTS \"pgcrypto\" WITH SCHEMA \"public\" CASCADE"
        );
    }
}
