//! Command-line surface.
//!
//! One executable with subcommands: `clone` (bulk, `--follow` for CDC),
//! the `copy` family for individual phases, `stream` for the CDC
//! pipeline, `compare`, `list`, `dump`, `restore` and `snapshot`.
//! Argument structs lower into the typed options in [`crate::config`];
//! nothing below this module touches clap.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::cancel::{Cancel, cancel_pair};
use crate::catalog::{Catalog, Sentinel};
use crate::cdc::{self, StreamMode};
use crate::clone;
use crate::config::{
    self, CloneOptions, ConnStrings, DEFAULT_DIR, DEFAULT_SLOT_NAME, ENV_SOURCE_PGURI,
    ENV_TARGET_PGURI, JobsConfig, Plugin, ShuttleDirs, StreamOptions,
};
use crate::error::{Result, ShuttleError};
use crate::filters::FilterSet;
use crate::lsn::Lsn;
use crate::pgsql::{self, PgConn};
use crate::schema;
use crate::summary::RunStatus;
use crate::{blobs, compare, list, sequences};

fn parse_size_arg(s: &str) -> std::result::Result<u64, String> {
    config::parse_size(s).map_err(|e| e.to_string())
}

fn parse_lsn_arg(s: &str) -> std::result::Result<Lsn, String> {
    s.parse().map_err(|e: ShuttleError| e.to_string())
}

fn parse_plugin_arg(s: &str) -> std::result::Result<Plugin, String> {
    s.parse().map_err(|e: ShuttleError| e.to_string())
}

#[derive(Parser, Debug)]
#[command(
    name = "pgshuttle",
    version,
    about = "Clone a live PostgreSQL database into another live instance, \
             with optional logical-decoding follow"
)]
pub struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ConnArgs {
    /// Source connection string (libpq URI or keywords).
    #[arg(long, env = ENV_SOURCE_PGURI)]
    pub source: String,

    /// Target connection string.
    #[arg(long, env = ENV_TARGET_PGURI)]
    pub target: Option<String>,

    /// Working directory for the catalog, schema artifacts and CDC files.
    #[arg(long, default_value = DEFAULT_DIR)]
    pub dir: PathBuf,
}

impl ConnArgs {
    fn conn(&self) -> Result<ConnStrings> {
        Ok(ConnStrings {
            source: self.source.clone(),
            target: self
                .target
                .clone()
                .ok_or_else(|| ShuttleError::Config("--target is required".into()))?,
        })
    }

    fn source_only(&self) -> ConnStrings {
        ConnStrings {
            source: self.source.clone(),
            target: self.target.clone().unwrap_or_default(),
        }
    }

    fn dirs(&self) -> ShuttleDirs {
        ShuttleDirs::new(&self.dir)
    }
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Concurrent table COPY workers.
    #[arg(long, default_value_t = 4)]
    pub table_jobs: usize,

    /// Concurrent index/constraint workers.
    #[arg(long, default_value_t = 4)]
    pub index_jobs: usize,

    /// Parallel jobs handed to pg_restore.
    #[arg(long, default_value_t = 4)]
    pub restore_jobs: usize,

    /// Concurrent large-object workers.
    #[arg(long, default_value_t = 4)]
    pub large_objects_jobs: usize,

    /// Concurrent VACUUM ANALYZE workers.
    #[arg(long, default_value_t = 1)]
    pub vacuum_jobs: usize,

    /// Copy tables larger than this in concurrent ranges (e.g. 1GB).
    #[arg(long, value_parser = parse_size_arg)]
    pub split_tables_larger_than: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ModeArgs {
    /// Filter manifest (TOML) with include/exclude sections.
    #[arg(long)]
    pub filters: Option<PathBuf>,

    /// Reuse an externally exported snapshot.
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Pick up a previously interrupted run from the catalog.
    #[arg(long)]
    pub resume: bool,

    /// Allow running without a shared snapshot.
    #[arg(long)]
    pub not_consistent: bool,

    #[arg(long)]
    pub skip_large_objects: bool,

    #[arg(long)]
    pub skip_extensions: bool,

    #[arg(long)]
    pub skip_collations: bool,

    #[arg(long)]
    pub skip_vacuum: bool,

    /// Do not restore object ownership.
    #[arg(long)]
    pub no_owner: bool,

    /// Do not restore access privileges.
    #[arg(long)]
    pub no_acl: bool,

    /// Drop target objects before recreating them.
    #[arg(long)]
    pub drop_if_exists: bool,

    /// Mask pg_restore failures on database properties.
    #[arg(long)]
    pub skip_db_properties: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Replication slot name.
    #[arg(long, default_value = DEFAULT_SLOT_NAME)]
    pub slot_name: String,

    /// Create the slot if it does not exist.
    #[arg(long)]
    pub create_slot: bool,

    /// Logical decoding output plugin.
    #[arg(long, default_value = "wal2json", value_parser = parse_plugin_arg)]
    pub plugin: Plugin,

    /// Origin name keying apply progress on the target.
    #[arg(long, default_value = DEFAULT_SLOT_NAME)]
    pub origin: String,

    /// Stop applying after the transaction committing at/after this LSN.
    #[arg(long, value_parser = parse_lsn_arg)]
    pub endpos: Option<Lsn>,

    /// Resume receiving at this LSN.
    #[arg(long, value_parser = parse_lsn_arg)]
    pub startpos: Option<Lsn>,
}

impl StreamArgs {
    fn options(&self) -> StreamOptions {
        StreamOptions {
            slot_name: self.slot_name.clone(),
            plugin: self.plugin,
            origin: self.origin.clone(),
            create_slot: self.create_slot,
            startpos: self.startpos,
            endpos: self.endpos,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CloneArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    #[command(flatten)]
    pub jobs: JobArgs,
    #[command(flatten)]
    pub modes: ModeArgs,
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Keep the target synchronized through logical decoding after the
    /// bulk copy.
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PhaseArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    #[command(flatten)]
    pub jobs: JobArgs,
    #[command(flatten)]
    pub modes: ModeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Clone the source database into the target.
    Clone(CloneArgs),

    /// Run one phase of the clone.
    Copy {
        #[command(subcommand)]
        phase: CopyPhase,
    },

    /// Change Data Capture pipeline commands.
    Stream {
        #[command(subcommand)]
        action: StreamAction,
    },

    /// Compare source and target.
    Compare {
        #[command(subcommand)]
        what: CompareWhat,
    },

    /// Inventory commands.
    List {
        #[command(subcommand)]
        what: ListWhat,
    },

    /// Dump the schema sections into the working directory.
    Dump(PhaseArgs),

    /// Restore previously dumped schema sections into the target.
    Restore(PhaseArgs),

    /// Export a REPEATABLE READ snapshot and hold it until interrupted.
    Snapshot {
        #[command(flatten)]
        conn: ConnArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum CopyPhase {
    /// Pre-data schema (types, tables) via pg_dump/pg_restore.
    Schema(PhaseArgs),
    /// Table data plus indexes and constraints.
    Data(PhaseArgs),
    /// Table data only.
    TableData(PhaseArgs),
    /// Large objects only.
    Blobs(PhaseArgs),
    /// Sequence values only.
    Sequences(PhaseArgs),
    /// Indexes (and the constraints they back).
    Indexes(PhaseArgs),
    /// Constraints, including foreign keys.
    Constraints(PhaseArgs),
}

#[derive(Subcommand, Debug)]
pub enum StreamAction {
    /// Create the replication slot and seed the stream state.
    Setup {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Drop the slot and forget the stream state.
    Cleanup {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Receive and transform changes without applying them.
    Prefetch {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Apply already-transformed changes, without receiving.
    Catchup {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Receive, transform and apply until endpos (or interruption).
    Replay {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Inspect or adjust the stream sentinel.
    Sentinel {
        #[command(flatten)]
        conn: ConnArgs,
        #[command(subcommand)]
        op: SentinelOp,
    },
}

#[derive(Subcommand, Debug)]
pub enum SentinelOp {
    /// Print the sentinel.
    Get,
    /// Update one sentinel field.
    Set {
        #[command(subcommand)]
        field: SentinelField,
    },
}

#[derive(Subcommand, Debug)]
pub enum SentinelField {
    /// Set the replay start position.
    Startpos {
        #[arg(value_parser = parse_lsn_arg)]
        lsn: Lsn,
    },
    /// Set the apply stop position.
    Endpos {
        #[arg(value_parser = parse_lsn_arg)]
        lsn: Lsn,
    },
    /// Enable applying transformed changes.
    Apply,
    /// Disable applying (receive and transform only).
    Prefetch,
}

#[derive(Subcommand, Debug)]
pub enum CompareWhat {
    Schema(PhaseArgs),
    Data(PhaseArgs),
}

#[derive(Subcommand, Debug)]
pub enum ListWhat {
    Tables(PhaseArgs),
    Indexes(PhaseArgs),
    Schemas(PhaseArgs),
    Collations(PhaseArgs),
    Extensions(PhaseArgs),
    Progress(PhaseArgs),
}

// ── Lowering into runtime options ──────────────────────────────────────────

fn load_filters(path: &Option<PathBuf>) -> Result<FilterSet> {
    match path {
        Some(path) => FilterSet::load(path),
        None => Ok(FilterSet::default()),
    }
}

fn clone_options(args: &CloneArgs) -> Result<CloneOptions> {
    let mut options = CloneOptions::new(args.conn.conn()?, args.conn.dirs());
    options.jobs = JobsConfig {
        table_jobs: args.jobs.table_jobs,
        index_jobs: args.jobs.index_jobs,
        restore_jobs: args.jobs.restore_jobs,
        large_objects_jobs: args.jobs.large_objects_jobs,
        vacuum_jobs: args.jobs.vacuum_jobs,
    };
    options.filters = load_filters(&args.modes.filters)?;
    options.snapshot = args.modes.snapshot.clone();
    options.resume = args.modes.resume;
    options.not_consistent = args.modes.not_consistent;
    options.split_tables_larger_than = args.jobs.split_tables_larger_than;
    options.skip_large_objects = args.modes.skip_large_objects;
    options.skip_extensions = args.modes.skip_extensions;
    options.skip_collations = args.modes.skip_collations;
    options.skip_vacuum = args.modes.skip_vacuum;
    options.no_owner = args.modes.no_owner;
    options.no_acl = args.modes.no_acl;
    options.drop_if_exists = args.modes.drop_if_exists;
    options.skip_db_properties = args.modes.skip_db_properties;
    options.follow = args.follow;
    options.stream = args.stream.options();
    Ok(options)
}

fn phase_options(args: &PhaseArgs, need_target: bool) -> Result<CloneOptions> {
    let conn = if need_target {
        args.conn.conn()?
    } else {
        args.conn.source_only()
    };
    let mut options = CloneOptions::new(conn, args.conn.dirs());
    options.jobs = JobsConfig {
        table_jobs: args.jobs.table_jobs,
        index_jobs: args.jobs.index_jobs,
        restore_jobs: args.jobs.restore_jobs,
        large_objects_jobs: args.jobs.large_objects_jobs,
        vacuum_jobs: args.jobs.vacuum_jobs,
    };
    options.filters = load_filters(&args.modes.filters)?;
    options.snapshot = args.modes.snapshot.clone();
    options.resume = args.modes.resume;
    options.not_consistent = args.modes.not_consistent;
    options.split_tables_larger_than = args.jobs.split_tables_larger_than;
    options.skip_large_objects = args.modes.skip_large_objects;
    options.skip_extensions = args.modes.skip_extensions;
    options.skip_collations = args.modes.skip_collations;
    options.skip_vacuum = args.modes.skip_vacuum;
    options.no_owner = args.modes.no_owner;
    options.no_acl = args.modes.no_acl;
    options.drop_if_exists = args.modes.drop_if_exists;
    options.skip_db_properties = args.modes.skip_db_properties;
    Ok(options)
}

fn stream_options(conn: &ConnArgs, stream: &StreamArgs, need_target: bool) -> Result<CloneOptions> {
    let mut options = CloneOptions::new(
        if need_target {
            conn.conn()?
        } else {
            conn.source_only()
        },
        conn.dirs(),
    );
    options.stream = stream.options();
    Ok(options)
}

fn open_catalog(options: &CloneOptions) -> Result<Arc<Catalog>> {
    options.dirs.ensure(&options.stream.slot_name)?;
    let (catalog, rebuilt) = Catalog::open(&options.dirs.catalog_path())?;
    if rebuilt {
        info!("catalog format changed; previous progress discarded");
    }
    Ok(Arc::new(catalog))
}

// ── Logging and signal wiring ──────────────────────────────────────────────

/// Install tracing. Filter via `PGSHUTTLE_LOG` or `RUST_LOG`, default
/// `info`.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("PGSHUTTLE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// One cancellation token for the whole run, fed by SIGINT/SIGTERM.
fn install_cancel() -> Cancel {
    let (source, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            source.cancel();
        }
    });
    token
}

// ── Dispatch ───────────────────────────────────────────────────────────────

pub async fn run(cli: Cli) -> Result<RunStatus> {
    let cancel = install_cancel();

    match cli.command {
        Commands::Clone(args) => {
            let options = clone_options(&args)?;
            clone::run(options, cancel).await
        }

        Commands::Copy { phase } => run_copy_phase(phase, cancel).await,

        Commands::Stream { action } => run_stream_action(action, cancel).await,

        Commands::Compare { what } => match what {
            CompareWhat::Schema(args) => {
                let options = phase_options(&args, true)?;
                let diffs = compare::compare_schema(&options).await?;
                Ok(if diffs.is_empty() {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                })
            }
            CompareWhat::Data(args) => {
                let options = phase_options(&args, true)?;
                let diffs = compare::compare_data(&options).await?;
                Ok(if diffs.iter().all(|d| d.matches()) {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                })
            }
        },

        Commands::List { what } => {
            match what {
                ListWhat::Tables(args) => list::tables(&phase_options(&args, false)?).await?,
                ListWhat::Indexes(args) => list::indexes(&phase_options(&args, false)?).await?,
                ListWhat::Schemas(args) => list::schemas(&phase_options(&args, false)?).await?,
                ListWhat::Collations(args) => {
                    list::collations(&phase_options(&args, false)?).await?
                }
                ListWhat::Extensions(args) => {
                    list::extensions(&phase_options(&args, false)?).await?
                }
                ListWhat::Progress(args) => {
                    let options = phase_options(&args, false)?;
                    let catalog = open_catalog(&options)?;
                    list::progress(&catalog)?;
                }
            }
            Ok(RunStatus::Success)
        }

        Commands::Dump(args) => {
            let options = phase_options(&args, false)?;
            options.dirs.ensure(&options.stream.slot_name)?;
            schema::dump_section(&options, schema::Section::PreData).await?;
            schema::dump_section(&options, schema::Section::PostData).await?;
            Ok(RunStatus::Success)
        }

        Commands::Restore(args) => {
            let options = phase_options(&args, true)?;
            schema::restore_section(&options, schema::Section::PreData).await?;
            schema::restore_section(&options, schema::Section::PostData).await?;
            Ok(RunStatus::Success)
        }

        Commands::Snapshot { conn } => {
            let source = PgConn::connect(&conn.source).await?;
            let snapshot = pgsql::export_snapshot(&source).await?;
            println!("{snapshot}");
            info!("holding snapshot until interrupted");
            cancel.cancelled().await;
            Ok(RunStatus::Success)
        }
    }
}

async fn run_copy_phase(phase: CopyPhase, cancel: Cancel) -> Result<RunStatus> {
    match phase {
        CopyPhase::Schema(args) => {
            let options = phase_options(&args, true)?;
            options.dirs.ensure(&options.stream.slot_name)?;
            schema::dump_section(&options, schema::Section::PreData).await?;
            schema::restore_section(&options, schema::Section::PreData).await?;
            Ok(RunStatus::Success)
        }
        CopyPhase::Data(args) => {
            let mut options = phase_options(&args, true)?;
            let catalog = open_catalog(&options)?;
            let _snapshot_holder = clone::ensure_plan(&mut options, &catalog).await?;
            clone::run_copy_phase(&options, Arc::clone(&catalog), cancel.clone(), true).await?;
            sequences::run(&options, Arc::clone(&catalog), cancel).await?;
            finish(&catalog)
        }
        CopyPhase::TableData(args) => {
            let mut options = phase_options(&args, true)?;
            let catalog = open_catalog(&options)?;
            let _snapshot_holder = clone::ensure_plan(&mut options, &catalog).await?;
            clone::run_copy_phase(&options, Arc::clone(&catalog), cancel, false).await?;
            finish(&catalog)
        }
        CopyPhase::Blobs(args) => {
            let mut options = phase_options(&args, true)?;
            let catalog = open_catalog(&options)?;
            let _snapshot_holder = clone::ensure_plan(&mut options, &catalog).await?;
            blobs::run(&options, Arc::clone(&catalog), cancel).await?;
            finish(&catalog)
        }
        CopyPhase::Sequences(args) => {
            let mut options = phase_options(&args, true)?;
            let catalog = open_catalog(&options)?;
            let _snapshot_holder = clone::ensure_plan(&mut options, &catalog).await?;
            sequences::run(&options, Arc::clone(&catalog), cancel).await?;
            finish(&catalog)
        }
        CopyPhase::Indexes(args) | CopyPhase::Constraints(args) => {
            let mut options = phase_options(&args, true)?;
            let catalog = open_catalog(&options)?;
            let _snapshot_holder = clone::ensure_plan(&mut options, &catalog).await?;
            clone::run_index_phase(&options, Arc::clone(&catalog), cancel).await?;
            finish(&catalog)
        }
    }
}

fn finish(catalog: &Arc<Catalog>) -> Result<RunStatus> {
    Ok(if catalog.failed_tasks()?.is_empty() {
        RunStatus::Success
    } else {
        RunStatus::Failed
    })
}

async fn run_stream_action(action: StreamAction, cancel: Cancel) -> Result<RunStatus> {
    match action {
        StreamAction::Setup { conn, stream } => {
            let options = stream_options(&conn, &stream, false)?;
            let catalog = open_catalog(&options)?;
            let state = cdc::slot::setup(&options.conn.source, &options.stream, &catalog).await?;
            println!(
                "slot {} ({}) at {}",
                state.slot_name, state.plugin, state.consistent_point
            );
            Ok(RunStatus::Success)
        }
        StreamAction::Cleanup { conn, stream } => {
            let options = stream_options(&conn, &stream, false)?;
            let catalog = open_catalog(&options)?;
            cdc::slot::cleanup(&options.conn.source, &options.stream, &catalog).await?;
            Ok(RunStatus::Success)
        }
        StreamAction::Prefetch { conn, stream } => {
            let options = stream_options(&conn, &stream, false)?;
            let catalog = open_catalog(&options)?;
            cdc::run_stream(&options, catalog, cancel, StreamMode::Prefetch).await?;
            Ok(RunStatus::Success)
        }
        StreamAction::Catchup { conn, stream } => {
            let options = stream_options(&conn, &stream, true)?;
            let catalog = open_catalog(&options)?;
            enable_apply(&catalog)?;
            cdc::run_stream(&options, catalog, cancel, StreamMode::Catchup).await?;
            Ok(RunStatus::Success)
        }
        StreamAction::Replay { conn, stream } => {
            let options = stream_options(&conn, &stream, true)?;
            let catalog = open_catalog(&options)?;
            enable_apply(&catalog)?;
            cdc::run_stream(&options, catalog, cancel, StreamMode::Replay).await?;
            Ok(RunStatus::Success)
        }
        StreamAction::Sentinel { conn, op } => {
            let options = stream_options(&conn, &StreamArgs::default_args(), false)?;
            let catalog = open_catalog(&options)?;
            match op {
                SentinelOp::Get => {
                    let sentinel = catalog.sentinel_get()?.unwrap_or_default();
                    println!("startpos: {}", sentinel.startpos);
                    println!(
                        "endpos:   {}",
                        sentinel
                            .endpos
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "-".into())
                    );
                    println!("apply:    {}", sentinel.apply_enabled);
                    if let Ok(source) = PgConn::connect(&options.conn.source).await {
                        if let Ok(wal) = pgsql::current_wal_lsn(&source).await {
                            println!("wal:      {wal}");
                        }
                    }
                    let cursor = catalog.cursor_read()?;
                    println!("applied:  {}", cursor.applied_commit_lsn);
                }
                SentinelOp::Set { field } => {
                    let mut sentinel = catalog.sentinel_get()?.unwrap_or_default();
                    match field {
                        SentinelField::Startpos { lsn } => sentinel.startpos = lsn,
                        SentinelField::Endpos { lsn } => sentinel.endpos = Some(lsn),
                        SentinelField::Apply => sentinel.apply_enabled = true,
                        SentinelField::Prefetch => sentinel.apply_enabled = false,
                    }
                    catalog.sentinel_put(&sentinel)?;
                }
            }
            Ok(RunStatus::Success)
        }
    }
}

impl StreamArgs {
    fn default_args() -> Self {
        Self {
            slot_name: DEFAULT_SLOT_NAME.to_string(),
            create_slot: false,
            plugin: Plugin::Wal2Json,
            origin: DEFAULT_SLOT_NAME.to_string(),
            endpos: None,
            startpos: None,
        }
    }
}

fn enable_apply(catalog: &Arc<Catalog>) -> Result<()> {
    let mut sentinel = catalog.sentinel_get()?.unwrap_or(Sentinel {
        startpos: Lsn::ZERO,
        endpos: None,
        apply_enabled: false,
    });
    sentinel.apply_enabled = true;
    catalog.sentinel_put(&sentinel)?;
    Ok(())
}
