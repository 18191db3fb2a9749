//! Schema bridge — drives the vendor dump/restore tools.
//!
//! DDL generation is never done in-process: `pg_dump` materializes the
//! pre-data (types, tables) and post-data (triggers, rules, defaults)
//! sections as custom-format archives under `schema/`, and `pg_restore`
//! installs them on the target. Object filtering happens by rewriting the
//! archive's TOC listing (`pg_restore -l`) into a manifest passed back via
//! `-L`: dropped entries are commented out, so the archive itself is never
//! edited.
//!
//! Indexes and PK/UK/FK constraints are always commented out of the
//! post-data restore: the index supervisor builds them itself, in
//! dependency order, as tables finish loading.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{CloneOptions, ShuttleDirs};
use crate::error::{Result, ShuttleError};
use crate::filters::FilterSet;

/// The two archive sections the bridge manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    PreData,
    PostData,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data",
            Section::PostData => "post-data",
        }
    }

    fn archive_name(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data.dump",
            Section::PostData => "post-data.dump",
        }
    }

    fn manifest_name(&self) -> &'static str {
        match self {
            Section::PreData => "pre-data.list",
            Section::PostData => "post-data.list",
        }
    }
}

/// Paths for one section's artifacts.
pub fn archive_path(dirs: &ShuttleDirs, section: Section) -> PathBuf {
    dirs.schema_dir().join(section.archive_name())
}

fn manifest_path(dirs: &ShuttleDirs, section: Section) -> PathBuf {
    dirs.schema_dir().join(section.manifest_name())
}

// ── Tool invocation ────────────────────────────────────────────────────────

async fn run_tool(tool: &str, args: &[String]) -> Result<std::process::Output> {
    debug!(tool, ?args, "running external tool");
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ShuttleError::ToolSpawn {
            tool: tool.to_string(),
            source: e,
        })?;
    Ok(output)
}

fn tool_failure(tool: &str, output: &std::process::Output) -> ShuttleError {
    ShuttleError::Tool {
        tool: tool.to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Dump one section of the source schema into the working directory.
///
/// The dump runs under the plan snapshot when one exists, so the DDL
/// matches the data the copy workers will stream.
pub async fn dump_section(options: &CloneOptions, section: Section) -> Result<PathBuf> {
    let archive = archive_path(&options.dirs, section);
    let mut args: Vec<String> = vec![
        "--format".into(),
        "custom".into(),
        "--section".into(),
        section.as_str().into(),
        "--file".into(),
        archive.display().to_string(),
    ];
    if let Some(snapshot) = &options.snapshot {
        args.push("--snapshot".into());
        args.push(snapshot.clone());
    }
    for schema in &options.filters.include_only_schema {
        args.push("--schema".into());
        args.push(schema.clone());
    }
    for schema in &options.filters.exclude_schema {
        args.push("--exclude-schema".into());
        args.push(schema.clone());
    }
    args.push("--dbname".into());
    args.push(options.conn.source.clone());

    let output = run_tool("pg_dump", &args).await?;
    if !output.status.success() {
        return Err(tool_failure("pg_dump", &output));
    }
    info!(section = section.as_str(), archive = %archive.display(), "schema section dumped");
    Ok(archive)
}

/// Restore one section into the target, filtered through a TOC manifest.
pub async fn restore_section(options: &CloneOptions, section: Section) -> Result<()> {
    let archive = archive_path(&options.dirs, section);
    let listing = toc_listing(&archive).await?;
    let entries = parse_toc(&listing);
    let manifest = render_manifest(&entries, section, &options.filters, options.skip_db_properties);

    let manifest_file = manifest_path(&options.dirs, section);
    std::fs::write(&manifest_file, manifest)
        .map_err(|e| ShuttleError::io(manifest_file.display().to_string(), e))?;

    let mut args: Vec<String> = vec![
        "--use-list".into(),
        manifest_file.display().to_string(),
        "--jobs".into(),
        options.jobs.restore_jobs.to_string(),
    ];
    if options.no_owner {
        args.push("--no-owner".into());
    }
    if options.no_acl {
        args.push("--no-acl".into());
    }
    if options.drop_if_exists && section == Section::PreData {
        args.push("--clean".into());
        args.push("--if-exists".into());
    }
    args.push("--dbname".into());
    args.push(options.conn.target.clone());
    args.push(archive.display().to_string());

    let output = run_tool("pg_restore", &args).await?;
    if !output.status.success() {
        let err = tool_failure("pg_restore", &output);
        // pg_restore exits 1 when it only hit ignorable errors (existing
        // objects, database properties it may not set). The opt-in policy
        // masks exactly that case.
        if options.skip_db_properties && output.status.code() == Some(1) {
            warn!(section = section.as_str(), error = %err, "pg_restore warnings masked by policy");
            return Ok(());
        }
        return Err(err);
    }
    info!(section = section.as_str(), "schema section restored");
    Ok(())
}

async fn toc_listing(archive: &Path) -> Result<String> {
    let args = vec!["--list".to_string(), archive.display().to_string()];
    let output = run_tool("pg_restore", &args).await?;
    if !output.status.success() {
        return Err(tool_failure("pg_restore", &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ── TOC parsing and filtering ──────────────────────────────────────────────

/// One entry from `pg_restore --list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub dump_id: u32,
    pub desc: String,
    pub schema: String,
    pub name: String,
    /// The verbatim listing line, echoed into the manifest when kept.
    pub raw: String,
}

/// Object kinds as they appear in a TOC listing. Multi-word first so the
/// prefix match never truncates them.
const KNOWN_DESCS: &[&str] = &[
    "FK CONSTRAINT",
    "TABLE DATA",
    "SEQUENCE SET",
    "SEQUENCE OWNED BY",
    "MATERIALIZED VIEW DATA",
    "MATERIALIZED VIEW",
    "DATABASE PROPERTIES",
    "DEFAULT ACL",
    "EVENT TRIGGER",
    "LARGE OBJECT",
    "ROW SECURITY",
    "FOREIGN TABLE",
    "FOREIGN DATA WRAPPER",
    "USER MAPPING",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "TEXT SEARCH PARSER",
    "TEXT SEARCH TEMPLATE",
    "OPERATOR CLASS",
    "OPERATOR FAMILY",
    "ACCESS METHOD",
    "PUBLICATION TABLE",
    "CONSTRAINT",
    "EXTENSION",
    "AGGREGATE",
    "COLLATION",
    "PROCEDURE",
    "PUBLICATION",
    "SUBSCRIPTION",
    "STATISTICS",
    "CONVERSION",
    "FUNCTION",
    "OPERATOR",
    "DATABASE",
    "SEQUENCE",
    "TRIGGER",
    "COMMENT",
    "DEFAULT",
    "SCHEMA",
    "DOMAIN",
    "SERVER",
    "POLICY",
    "INDEX",
    "TABLE",
    "BLOBS",
    "VIEW",
    "TYPE",
    "CAST",
    "RULE",
    "ACL",
];

/// Parse the text of `pg_restore --list`. Comment and banner lines are
/// skipped; unrecognized data lines are kept verbatim with an empty desc
/// so filtering stays conservative.
pub fn parse_toc(listing: &str) -> Vec<TocEntry> {
    let mut out = Vec::new();
    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let Some((id_part, rest)) = trimmed.split_once(';') else {
            continue;
        };
        let Ok(dump_id) = id_part.trim().parse::<u32>() else {
            continue;
        };
        // rest = " <catalog oid> <object oid> <DESC> <schema> <name> <owner>"
        let mut fields = rest.trim().splitn(3, ' ');
        let _cat_oid = fields.next().unwrap_or_default();
        let _obj_oid = fields.next().unwrap_or_default();
        let tail = fields.next().unwrap_or_default();

        let (desc, after) = match KNOWN_DESCS
            .iter()
            .find(|d| (tail.starts_with(**d) && tail[d.len()..].starts_with(' ')) || tail == **d)
        {
            Some(d) => (d.to_string(), tail[d.len()..].trim_start()),
            None => (String::new(), tail),
        };

        let mut words = after.split_whitespace();
        let schema = words.next().unwrap_or_default().to_string();
        let name = words.next().unwrap_or_default().to_string();

        out.push(TocEntry {
            dump_id,
            desc,
            schema,
            name,
            raw: trimmed.to_string(),
        });
    }
    out
}

/// Whether a restore keeps this entry. Dropped entries are commented out
/// of the manifest.
pub fn keep_entry(
    entry: &TocEntry,
    section: Section,
    filters: &FilterSet,
    skip_db_properties: bool,
) -> bool {
    match entry.desc.as_str() {
        // the index supervisor owns these
        "INDEX" | "CONSTRAINT" | "FK CONSTRAINT" => false,
        // the matview tasks refresh these, largest first
        "MATERIALIZED VIEW DATA" => section == Section::PreData,
        // data never travels through the bridge
        "TABLE DATA" | "BLOBS" | "LARGE OBJECT" => false,
        "DATABASE PROPERTIES" => !skip_db_properties,
        "SCHEMA" => filters.schema_included(&entry.name),
        // the extension phase installs these before pre-data
        "EXTENSION" => false,
        "TABLE" | "MATERIALIZED VIEW" | "VIEW" | "FOREIGN TABLE" => {
            filters.table_included(&entry.schema, &entry.name)
        }
        "SEQUENCE" | "SEQUENCE SET" | "SEQUENCE OWNED BY" => {
            filters.schema_included(&entry.schema)
        }
        "TRIGGER" | "RULE" | "POLICY" | "ROW SECURITY" => {
            // these name "<table> <object>"; the schema field is the
            // namespace, the name field the table for triggers
            filters.schema_included(&entry.schema)
        }
        _ => true,
    }
}

/// Produce the `-L` manifest: kept entries verbatim, dropped entries
/// commented out so the listing remains auditable.
pub fn render_manifest(
    entries: &[TocEntry],
    section: Section,
    filters: &FilterSet,
    skip_db_properties: bool,
) -> String {
    let mut out = String::with_capacity(entries.len() * 64);
    out.push_str(";\n; pg_shuttle restore manifest\n;\n");
    for entry in entries {
        if keep_entry(entry, section, filters, skip_db_properties) {
            out.push_str(&entry.raw);
        } else {
            out.push(';');
            out.push(' ');
            out.push_str(&entry.raw);
        }
        out.push('\n');
    }
    out
}
