//! Object filtering manifest.
//!
//! A filter manifest is a TOML file with list-valued sections, each naming
//! fully qualified objects:
//!
//! ```toml
//! include-only-schema = ["app"]
//! exclude-table = ["app.audit_log"]
//! exclude-table-data = ["app.scratch"]
//! exclude-index = ["app.audit_log_created_idx"]
//! exclude-extension = ["postgis"]
//! ```
//!
//! Filters are applied at plan time by the introspector (filtered objects
//! never become tasks) and again by the schema bridge when it edits the
//! pg_restore TOC list, so both the data path and the DDL path agree.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShuttleError};

/// The parsed manifest. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct FilterSet {
    pub include_only_schema: Vec<String>,
    pub exclude_schema: Vec<String>,
    pub include_only_table: Vec<String>,
    pub exclude_table: Vec<String>,
    pub exclude_index: Vec<String>,
    pub exclude_table_data: Vec<String>,
    pub exclude_extension: Vec<String>,
}

impl FilterSet {
    /// Load a manifest from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ShuttleError::io(path.display().to_string(), e))?;
        toml::from_str(&text).map_err(|e| {
            ShuttleError::Config(format!("invalid filter manifest {}: {e}", path.display()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &FilterSet::default()
    }

    /// Whether a namespace survives the schema filters.
    pub fn schema_included(&self, schema: &str) -> bool {
        if self.exclude_schema.iter().any(|s| s == schema) {
            return false;
        }
        if !self.include_only_schema.is_empty() {
            return self.include_only_schema.iter().any(|s| s == schema);
        }
        true
    }

    /// Whether a relation survives the schema and table filters.
    pub fn table_included(&self, schema: &str, name: &str) -> bool {
        if !self.schema_included(schema) {
            return false;
        }
        let qualified = format!("{schema}.{name}");
        if self.exclude_table.iter().any(|t| t == &qualified) {
            return false;
        }
        if !self.include_only_table.is_empty() {
            return self.include_only_table.iter().any(|t| t == &qualified);
        }
        true
    }

    /// Whether a relation's *data* should be copied. A table can keep its
    /// DDL while its rows are excluded.
    pub fn table_data_included(&self, schema: &str, name: &str) -> bool {
        if !self.table_included(schema, name) {
            return false;
        }
        let qualified = format!("{schema}.{name}");
        !self.exclude_table_data.iter().any(|t| t == &qualified)
    }

    /// Whether an index survives the index filters (its table's filters
    /// are checked by the caller, which knows the owning table).
    pub fn index_included(&self, schema: &str, name: &str) -> bool {
        let qualified = format!("{schema}.{name}");
        !self.exclude_index.iter().any(|i| i == &qualified)
    }

    /// Whether an extension survives the extension filter.
    pub fn extension_included(&self, name: &str) -> bool {
        !self.exclude_extension.iter().any(|e| e == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> FilterSet {
        toml::from_str(
            r#"
            include-only-schema = ["app", "ref"]
            exclude-table = ["app.audit_log"]
            exclude-table-data = ["app.scratch"]
            exclude-index = ["app.slow_idx"]
            exclude-extension = ["postgis"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_manifest_includes_everything() {
        let f = FilterSet::default();
        assert!(f.is_empty());
        assert!(f.schema_included("anything"));
        assert!(f.table_included("public", "t"));
        assert!(f.table_data_included("public", "t"));
        assert!(f.index_included("public", "i"));
        assert!(f.extension_included("hstore"));
    }

    #[test]
    fn test_include_only_schema() {
        let f = manifest();
        assert!(f.schema_included("app"));
        assert!(f.schema_included("ref"));
        assert!(!f.schema_included("public"));
        // table in a non-included schema is out regardless of table lists
        assert!(!f.table_included("public", "t"));
    }

    #[test]
    fn test_exclude_schema_beats_include_only() {
        let f: FilterSet = toml::from_str(
            r#"
            include-only-schema = ["app"]
            exclude-schema = ["app"]
            "#,
        )
        .unwrap();
        assert!(!f.schema_included("app"));
    }

    #[test]
    fn test_exclude_table_and_data() {
        let f = manifest();
        assert!(!f.table_included("app", "audit_log"));
        assert!(f.table_included("app", "scratch"));
        assert!(!f.table_data_included("app", "scratch"));
        assert!(f.table_data_included("app", "orders"));
    }

    #[test]
    fn test_include_only_table() {
        let f: FilterSet = toml::from_str(r#"include-only-table = ["public.a"]"#).unwrap();
        assert!(f.table_included("public", "a"));
        assert!(!f.table_included("public", "b"));
    }

    #[test]
    fn test_index_and_extension_filters() {
        let f = manifest();
        assert!(!f.index_included("app", "slow_idx"));
        assert!(f.index_included("app", "other_idx"));
        assert!(!f.extension_included("postgis"));
        assert!(f.extension_included("pgcrypto"));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let r: std::result::Result<FilterSet, _> =
            toml::from_str(r#"exclude-tables = ["typo.section"]"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.toml");
        std::fs::write(&path, "exclude-schema = [\"tmp\"]\n").unwrap();
        let f = FilterSet::load(&path).unwrap();
        assert!(!f.schema_included("tmp"));
        assert!(FilterSet::load(&dir.path().join("missing.toml")).is_err());
    }
}
