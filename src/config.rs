//! Runtime configuration for pg_shuttle.
//!
//! The CLI layer (`cli`) parses arguments and environment variables and
//! lowers them into the typed option structs here; everything below the CLI
//! depends only on these types. Defaults follow the documented invocation
//! surface: `/tmp/pgshuttle` as the working directory, four workers per
//! pool, `pgshuttle` as the replication slot and origin name.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShuttleError};
use crate::filters::FilterSet;
use crate::lsn::Lsn;

/// Environment variable consulted when `--source` is absent.
pub const ENV_SOURCE_PGURI: &str = "PGSHUTTLE_SOURCE_PGURI";
/// Environment variable consulted when `--target` is absent.
pub const ENV_TARGET_PGURI: &str = "PGSHUTTLE_TARGET_PGURI";

/// Default working directory.
pub const DEFAULT_DIR: &str = "/tmp/pgshuttle";
/// Default replication slot and origin name.
pub const DEFAULT_SLOT_NAME: &str = "pgshuttle";

/// Source and target connection strings (libpq URI or keyword form).
#[derive(Debug, Clone)]
pub struct ConnStrings {
    pub source: String,
    pub target: String,
}

/// Per-pool worker counts.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Concurrent table COPY workers.
    pub table_jobs: usize,
    /// Concurrent CREATE INDEX / ADD CONSTRAINT workers.
    pub index_jobs: usize,
    /// Parallelism handed to pg_restore (`--jobs`).
    pub restore_jobs: usize,
    /// Concurrent large-object workers.
    pub large_objects_jobs: usize,
    /// Concurrent VACUUM ANALYZE workers.
    pub vacuum_jobs: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            table_jobs: 4,
            index_jobs: 4,
            restore_jobs: 4,
            large_objects_jobs: 4,
            vacuum_jobs: 1,
        }
    }
}

/// Logical decoding output plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plugin {
    Wal2Json,
    TestDecoding,
}

impl Plugin {
    /// The plugin name as the server knows it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Plugin::Wal2Json => "wal2json",
            Plugin::TestDecoding => "test_decoding",
        }
    }
}

impl FromStr for Plugin {
    type Err = ShuttleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wal2json" => Ok(Plugin::Wal2Json),
            "test_decoding" => Ok(Plugin::TestDecoding),
            other => Err(ShuttleError::Config(format!(
                "unknown output plugin {other:?} (expected wal2json or test_decoding)"
            ))),
        }
    }
}

/// CDC options shared by `clone --follow` and the `stream` commands.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub slot_name: String,
    pub plugin: Plugin,
    /// Replication origin name used to key apply progress on the target.
    pub origin: String,
    /// Create the slot if it does not exist.
    pub create_slot: bool,
    /// Resume receiving at this LSN instead of the slot's confirmed position.
    pub startpos: Option<Lsn>,
    /// Stop applying after the transaction whose commit LSN reaches this.
    pub endpos: Option<Lsn>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            slot_name: DEFAULT_SLOT_NAME.to_string(),
            plugin: Plugin::Wal2Json,
            origin: DEFAULT_SLOT_NAME.to_string(),
            create_slot: false,
            startpos: None,
            endpos: None,
        }
    }
}

/// Everything a `clone` run needs. The `copy`/`stream` phase commands use
/// subsets of this.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub conn: ConnStrings,
    pub dirs: ShuttleDirs,
    pub jobs: JobsConfig,
    pub filters: FilterSet,
    /// Reuse an externally exported snapshot instead of acquiring one.
    pub snapshot: Option<String>,
    pub resume: bool,
    /// Allow running without a consistent snapshot (each worker sees its
    /// own point in time).
    pub not_consistent: bool,
    /// Split tables larger than this many bytes into concurrent ranges.
    pub split_tables_larger_than: Option<u64>,
    pub skip_large_objects: bool,
    pub skip_extensions: bool,
    pub skip_collations: bool,
    pub skip_vacuum: bool,
    pub no_owner: bool,
    pub no_acl: bool,
    pub drop_if_exists: bool,
    /// Mask pg_restore failures on database-property TOC entries.
    pub skip_db_properties: bool,
    pub follow: bool,
    pub stream: StreamOptions,
}

impl CloneOptions {
    pub fn new(conn: ConnStrings, dirs: ShuttleDirs) -> Self {
        Self {
            conn,
            dirs,
            jobs: JobsConfig::default(),
            filters: FilterSet::default(),
            snapshot: None,
            resume: false,
            not_consistent: false,
            split_tables_larger_than: None,
            skip_large_objects: false,
            skip_extensions: false,
            skip_collations: false,
            skip_vacuum: false,
            no_owner: false,
            no_acl: false,
            drop_if_exists: false,
            skip_db_properties: false,
            follow: false,
            stream: StreamOptions::default(),
        }
    }
}

// ── Working directory layout ───────────────────────────────────────────────

/// Persisted state layout under the working directory:
///
/// ```text
/// <dir>/
///   pgshuttle.db        progress catalog
///   schema/             pg_dump artifacts + restore manifests
///   run/                plan snapshot, tool logs
///   cdc/<slot>/         raw segment files
///   cdc/<slot>/sql/     transformed per-transaction SQL files
/// ```
#[derive(Debug, Clone)]
pub struct ShuttleDirs {
    pub root: PathBuf,
}

impl ShuttleDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("pgshuttle.db")
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join("schema")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn cdc_dir(&self, slot: &str) -> PathBuf {
        self.root.join("cdc").join(slot)
    }

    pub fn cdc_sql_dir(&self, slot: &str) -> PathBuf {
        self.cdc_dir(slot).join("sql")
    }

    /// Create the directory tree. Idempotent.
    pub fn ensure(&self, slot: &str) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.schema_dir(),
            self.run_dir(),
            self.cdc_dir(slot),
            self.cdc_sql_dir(slot),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| ShuttleError::io(dir.display().to_string(), e))?;
        }
        Ok(())
    }
}

impl Default for ShuttleDirs {
    fn default() -> Self {
        Self::new(DEFAULT_DIR)
    }
}

// ── Size parsing ───────────────────────────────────────────────────────────

/// Parse a human byte size: `1048576`, `64kB`, `1MB`, `2 GB`, `1TB`.
///
/// Unit multiples are binary (1 kB = 1024 bytes), matching how the server
/// reports relation sizes.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(ShuttleError::Config(format!("invalid size: {input:?}")));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ShuttleError::Config(format!("invalid size: {input:?}")))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        "tb" | "t" => 1 << 40,
        other => {
            return Err(ShuttleError::Config(format!(
                "unknown size unit {other:?} in {input:?}"
            )));
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ShuttleError::Config(format!("size overflows: {input:?}")))
}

/// Render a byte count the way `parse_size` reads it.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[(&str, u64)] = &[("TB", 1 << 40), ("GB", 1 << 30), ("MB", 1 << 20), ("kB", 1 << 10)];
    for (unit, factor) in UNITS {
        if bytes >= *factor {
            let whole = bytes / factor;
            let tenths = (bytes % factor) * 10 / factor;
            return if tenths == 0 {
                format!("{whole} {unit}")
            } else {
                format!("{whole}.{tenths} {unit}")
            };
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1048576").unwrap(), 1 << 20);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("64kB").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1MB").unwrap(), 1 << 20);
        assert_eq!(parse_size("2 GB").unwrap(), 2u64 << 30);
        assert_eq!(parse_size("1tb").unwrap(), 1 << 40);
        assert_eq!(parse_size("10M").unwrap(), 10 << 20);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("-1MB").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(64 * 1024), "64 kB");
        assert_eq!(format_size((1 << 20) + (1 << 19)), "1.5 MB");
        assert_eq!(format_size(3u64 << 30), "3 GB");
    }

    #[test]
    fn test_dirs_layout() {
        let dirs = ShuttleDirs::new("/tmp/pgshuttle-test");
        assert_eq!(
            dirs.catalog_path(),
            PathBuf::from("/tmp/pgshuttle-test/pgshuttle.db")
        );
        assert_eq!(
            dirs.cdc_sql_dir("pgshuttle"),
            PathBuf::from("/tmp/pgshuttle-test/cdc/pgshuttle/sql")
        );
    }

    #[test]
    fn test_plugin_round_trip() {
        assert_eq!("wal2json".parse::<Plugin>().unwrap(), Plugin::Wal2Json);
        assert_eq!(
            "test_decoding".parse::<Plugin>().unwrap(),
            Plugin::TestDecoding
        );
        assert!("pgoutput".parse::<Plugin>().is_err());
        assert_eq!(Plugin::Wal2Json.as_str(), "wal2json");
    }
}
