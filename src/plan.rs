//! The Work Plan and its task model.
//!
//! The introspector produces a [`WorkPlan`] once per run; the progress
//! catalog persists it and the supervisors consume it. A plan is immutable
//! after creation: workers only ever mutate task *state* through the
//! catalog, never the plan itself.
//!
//! # Invariants
//!
//! - Every index and constraint task references a table task in the plan
//!   ([`WorkPlan::validate`]).
//! - Partitioned parents are planned but never copied; their leaf
//!   partitions carry the data.
//! - Split sub-tasks ([`TablePart`]) share the parent task's state and
//!   advance independent byte counters.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShuttleError};

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    InProgress,
    Copied,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Planned => "planned",
            TaskState::InProgress => "in-progress",
            TaskState::Copied => "copied",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(TaskState::Planned),
            "in-progress" => Ok(TaskState::InProgress),
            "copied" => Ok(TaskState::Copied),
            "failed" => Ok(TaskState::Failed),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(ShuttleError::Catalog(format!("unknown task state {other:?}"))),
        }
    }

    /// Terminal states are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Copied | TaskState::Failed | TaskState::Skipped)
    }
}

/// How a table's rows identify themselves in logical decoding output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    /// Primary key columns (the server default).
    Default,
    /// All columns.
    Full,
    /// A designated unique index.
    Index,
    /// No identity; UPDATE/DELETE cannot be decoded for this table.
    Nothing,
}

impl ReplicaIdentity {
    pub fn from_char(c: char) -> Self {
        match c {
            'f' => ReplicaIdentity::Full,
            'i' => ReplicaIdentity::Index,
            'n' => ReplicaIdentity::Nothing,
            _ => ReplicaIdentity::Default,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            ReplicaIdentity::Default => 'd',
            ReplicaIdentity::Full => 'f',
            ReplicaIdentity::Index => 'i',
            ReplicaIdentity::Nothing => 'n',
        }
    }
}

/// COPY partitioning strategy for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Stream the whole table in one COPY.
    None,
    /// Divide the heap into contiguous page ranges scanned by ctid.
    ByCtidRange,
    /// Divide a not-null integer key column into value ranges.
    ByIntegerColumn,
}

impl SplitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitStrategy::None => "none",
            SplitStrategy::ByCtidRange => "by-ctid-range",
            SplitStrategy::ByIntegerColumn => "by-integer-column",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(SplitStrategy::None),
            "by-ctid-range" => Ok(SplitStrategy::ByCtidRange),
            "by-integer-column" => Ok(SplitStrategy::ByIntegerColumn),
            other => Err(ShuttleError::Catalog(format!(
                "unknown split strategy {other:?}"
            ))),
        }
    }
}

/// One table to copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTask {
    /// Source relation OID; the task identity.
    pub oid: u32,
    pub schema: String,
    pub name: String,
    /// Estimated size in bytes (`relpages * block_size`, refined by
    /// `pg_relation_size` for split candidates).
    pub bytes: u64,
    /// Planner row estimate.
    pub reltuples: i64,
    /// Heap pages, for ctid-range splitting.
    pub relpages: i64,
    pub replica_identity: ReplicaIdentity,
    /// The columns logical decoding keys this table's rows by: the replica
    /// identity index when one is configured, the primary key otherwise.
    /// Empty when the table has neither.
    pub identity_columns: Vec<String>,
    /// True for a partitioned parent: planned for bookkeeping, not copied.
    pub is_partition_parent: bool,
    /// For leaf partitions, the parent's OID.
    pub parent_oid: Option<u32>,
    pub split: SplitStrategy,
    /// The not-null integer key column for `ByIntegerColumn`.
    pub part_key: Option<String>,
    /// DDL survives but rows are excluded (`exclude-table-data`).
    pub exclude_data: bool,
}

impl TableTask {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Whether this task itself moves rows (parents and data-excluded
    /// tables do not).
    pub fn copies_rows(&self) -> bool {
        !self.is_partition_parent && !self.exclude_data
    }
}

/// One range of a split table. `upper == None` means unbounded (the last
/// range also picks up rows appended after planning).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePart {
    pub table_oid: u32,
    pub part_num: u32,
    pub total_parts: u32,
    /// Inclusive lower bound: a key value or a heap page number.
    pub lower: i64,
    /// Exclusive upper bound.
    pub upper: Option<i64>,
}

/// One index to create on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTask {
    pub oid: u32,
    pub table_oid: u32,
    pub schema: String,
    pub name: String,
    /// Full `CREATE INDEX` statement from `pg_get_indexdef`.
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Name of the constraint this index backs, when it does.
    pub backs_constraint: Option<String>,
}

/// Kinds of constraints the supervisor promotes or installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
    Exclusion,
}

impl ConstraintKind {
    pub fn from_contype(c: char) -> Option<Self> {
        match c {
            'p' => Some(ConstraintKind::PrimaryKey),
            'u' => Some(ConstraintKind::Unique),
            'f' => Some(ConstraintKind::ForeignKey),
            'x' => Some(ConstraintKind::Exclusion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey => "primary-key",
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign-key",
            ConstraintKind::Exclusion => "exclusion",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "primary-key" => Ok(ConstraintKind::PrimaryKey),
            "unique" => Ok(ConstraintKind::Unique),
            "foreign-key" => Ok(ConstraintKind::ForeignKey),
            "exclusion" => Ok(ConstraintKind::Exclusion),
            other => Err(ShuttleError::Catalog(format!(
                "unknown constraint kind {other:?}"
            ))),
        }
    }
}

/// One constraint to install on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintTask {
    pub oid: u32,
    pub table_oid: u32,
    pub name: String,
    /// Body from `pg_get_constraintdef` (without `ALTER TABLE`).
    pub definition: String,
    pub kind: ConstraintKind,
    /// The index that must exist first (PK/UK promotion).
    pub index_oid: Option<u32>,
    /// For FKs, the referenced table; the constraint waits until both
    /// endpoints are copied.
    pub ref_table_oid: Option<u32>,
}

/// One sequence whose value is carried over after the copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTask {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub last_value: i64,
    pub is_called: bool,
}

/// One extension present on the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionTask {
    pub oid: u32,
    pub name: String,
    pub schema: String,
    pub version: String,
}

/// One materialized view to refresh after post-data restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatviewTask {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub bytes: u64,
}

/// The complete plan for one run. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    /// `pg_control_system()` system identifier of the source.
    pub system_identifier: String,
    pub timeline_id: i64,
    /// Snapshot all copy workers import; `None` under `--not-consistent`.
    pub snapshot: Option<String>,
    pub tables: Vec<TableTask>,
    pub parts: Vec<TablePart>,
    pub indexes: Vec<IndexTask>,
    pub constraints: Vec<ConstraintTask>,
    pub sequences: Vec<SequenceTask>,
    pub extensions: Vec<ExtensionTask>,
    pub matviews: Vec<MatviewTask>,
    /// Large objects counted at plan time (the blob task tracks its own
    /// OID cursor).
    pub large_object_count: i64,
}

impl WorkPlan {
    /// Check the referential invariants: every index/constraint points at a
    /// planned table, every part at a split table.
    pub fn validate(&self) -> Result<()> {
        let has_table = |oid: u32| self.tables.iter().any(|t| t.oid == oid);
        for ix in &self.indexes {
            if !has_table(ix.table_oid) {
                return Err(ShuttleError::InvalidPlan(format!(
                    "index {} references unplanned table oid {}",
                    ix.name, ix.table_oid
                )));
            }
        }
        for c in &self.constraints {
            if !has_table(c.table_oid) {
                return Err(ShuttleError::InvalidPlan(format!(
                    "constraint {} references unplanned table oid {}",
                    c.name, c.table_oid
                )));
            }
            if let Some(r) = c.ref_table_oid {
                if !has_table(r) {
                    return Err(ShuttleError::InvalidPlan(format!(
                        "constraint {} references unplanned table oid {r}",
                        c.name
                    )));
                }
            }
        }
        for p in &self.parts {
            if !has_table(p.table_oid) {
                return Err(ShuttleError::InvalidPlan(format!(
                    "part {}/{} references unplanned table oid {}",
                    p.part_num, p.total_parts, p.table_oid
                )));
            }
        }
        Ok(())
    }
}

// ── Scheduling helpers ─────────────────────────────────────────────────────

/// Longest-processing-time order: largest tables first, then qualified
/// name for determinism.
pub fn largest_first(tasks: &mut [TableTask]) {
    tasks.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| a.qualified_name().cmp(&b.qualified_name()))
    });
}

/// Number of ranges a table of `bytes` is divided into at the given
/// threshold. Tables at or below the threshold are not split.
pub fn split_count(bytes: u64, threshold: u64) -> u32 {
    if threshold == 0 || bytes <= threshold {
        return 1;
    }
    bytes.div_ceil(threshold).min(u32::MAX as u64) as u32
}

/// Divide `[min, max]` key values into `parts` contiguous ranges. The last
/// range is unbounded so rows above the planned maximum are still caught.
pub fn integer_ranges(min: i64, max: i64, parts: u32) -> Vec<TablePart> {
    range_spans(min, max.saturating_add(1), parts)
}

/// Divide `relpages` heap pages into `parts` contiguous page ranges.
pub fn ctid_ranges(relpages: i64, parts: u32) -> Vec<TablePart> {
    range_spans(0, relpages.max(1), parts)
}

fn range_spans(lo: i64, hi: i64, parts: u32) -> Vec<TablePart> {
    let parts = parts.max(1);
    let span = (hi - lo).max(1);
    let chunk = (span as f64 / parts as f64).ceil() as i64;
    let chunk = chunk.max(1);
    let mut out = Vec::with_capacity(parts as usize);
    let mut lower = lo;
    for n in 0..parts {
        let last = n == parts - 1;
        let upper = if last { None } else { Some((lower + chunk).min(hi)) };
        out.push(TablePart {
            table_oid: 0,
            part_num: n,
            total_parts: parts,
            lower,
            upper,
        });
        if let Some(u) = upper {
            lower = u;
        }
    }
    out
}

/// Dependency order for one table's indexes: constraint-backing unique
/// indexes first (primary keys ahead of plain unique), then the rest,
/// name-ordered within each tier for determinism.
pub fn order_indexes<'a>(indexes: &'a [IndexTask]) -> Vec<&'a IndexTask> {
    let mut ordered: Vec<&IndexTask> = indexes.iter().collect();
    ordered.sort_by_key(|ix| {
        let tier = if ix.is_primary {
            0
        } else if ix.backs_constraint.is_some() {
            1
        } else {
            2
        };
        (tier, ix.name.clone())
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(oid: u32, name: &str, bytes: u64) -> TableTask {
        TableTask {
            oid,
            schema: "public".into(),
            name: name.into(),
            bytes,
            reltuples: 0,
            relpages: 0,
            replica_identity: ReplicaIdentity::Default,
            identity_columns: vec!["id".into()],
            is_partition_parent: false,
            parent_oid: None,
            split: SplitStrategy::None,
            part_key: None,
            exclude_data: false,
        }
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            TaskState::Planned,
            TaskState::InProgress,
            TaskState::Copied,
            TaskState::Failed,
            TaskState::Skipped,
        ] {
            assert_eq!(TaskState::parse(s.as_str()).unwrap(), s);
        }
        assert!(TaskState::parse("done").is_err());
        assert!(TaskState::Copied.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
    }

    #[test]
    fn test_largest_first_is_deterministic() {
        let mut tasks = vec![table(1, "b", 100), table(2, "a", 100), table(3, "huge", 5000)];
        largest_first(&mut tasks);
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["huge", "a", "b"]);
    }

    #[test]
    fn test_split_count() {
        let mb = 1 << 20;
        assert_eq!(split_count(512 * 1024, mb), 1);
        assert_eq!(split_count(mb, mb), 1);
        assert_eq!(split_count(mb + 1, mb), 2);
        assert_eq!(split_count(10 * mb, mb), 10);
        assert_eq!(split_count(mb, 0), 1);
    }

    #[test]
    fn test_integer_ranges_cover_domain() {
        let parts = integer_ranges(1, 100, 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].lower, 1);
        // ranges chain: each upper equals the next lower
        for w in parts.windows(2) {
            assert_eq!(w[0].upper.unwrap(), w[1].lower);
        }
        // last range is open-ended
        assert!(parts[3].upper.is_none());
        // every key in [1, 100] lands in exactly one range
        for key in [1i64, 25, 26, 50, 99, 100] {
            let hits = parts
                .iter()
                .filter(|p| key >= p.lower && p.upper.is_none_or(|u| key < u))
                .count();
            assert_eq!(hits, 1, "key {key}");
        }
    }

    #[test]
    fn test_integer_ranges_single_part() {
        let parts = integer_ranges(5, 5, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].lower, 5);
        assert!(parts[0].upper.is_none());
    }

    #[test]
    fn test_ctid_ranges() {
        let parts = ctid_ranges(1000, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].lower, 0);
        assert_eq!(parts[0].upper, Some(334));
        assert_eq!(parts[1].lower, 334);
        assert!(parts[2].upper.is_none());
    }

    #[test]
    fn test_ctid_ranges_empty_table() {
        let parts = ctid_ranges(0, 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].lower, 0);
    }

    #[test]
    fn test_order_indexes_constraint_backing_first() {
        let ix = |oid: u32, name: &str, primary: bool, constraint: Option<&str>| IndexTask {
            oid,
            table_oid: 1,
            schema: "public".into(),
            name: name.into(),
            definition: String::new(),
            is_unique: primary || constraint.is_some(),
            is_primary: primary,
            backs_constraint: constraint.map(Into::into),
        };
        let indexes = vec![
            ix(10, "t_btree_idx", false, None),
            ix(11, "t_uniq_key", false, Some("t_uniq_key")),
            ix(12, "t_pkey", true, Some("t_pkey")),
            ix(13, "t_another_idx", false, None),
        ];
        let ordered: Vec<&str> = order_indexes(&indexes).iter().map(|i| i.name.as_str()).collect();
        assert_eq!(ordered, vec!["t_pkey", "t_uniq_key", "t_another_idx", "t_btree_idx"]);
    }

    #[test]
    fn test_plan_validation_catches_dangling_references() {
        let mut plan = WorkPlan {
            system_identifier: "7000000000000000001".into(),
            timeline_id: 1,
            snapshot: None,
            tables: vec![table(1, "a", 10)],
            parts: vec![],
            indexes: vec![],
            constraints: vec![],
            sequences: vec![],
            extensions: vec![],
            matviews: vec![],
            large_object_count: 0,
        };
        assert!(plan.validate().is_ok());

        plan.indexes.push(IndexTask {
            oid: 99,
            table_oid: 42,
            schema: "public".into(),
            name: "dangling".into(),
            definition: String::new(),
            is_unique: false,
            is_primary: false,
            backs_constraint: None,
        });
        assert!(plan.validate().is_err());
    }
}
