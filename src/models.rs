use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage object kinds the scanner knows how to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Ordinary heap table
    Table,
    /// Materialized view
    MaterializedView,
    /// Out-of-line storage for oversized column values of a table
    ToastTable,
    /// Plain (or unique) index
    Index,
    /// Index backing a primary key constraint
    #[serde(rename = "index_pk")]
    PrimaryKeyIndex,
}

impl ObjectKind {
    /// Maps a `pg_class.relkind` value to a kind. Unknown relkinds yield `None`.
    pub fn from_relkind(relkind: &str, is_primary: bool) -> Option<Self> {
        match relkind {
            "r" => Some(ObjectKind::Table),
            "m" => Some(ObjectKind::MaterializedView),
            "t" => Some(ObjectKind::ToastTable),
            "i" if is_primary => Some(ObjectKind::PrimaryKeyIndex),
            "i" => Some(ObjectKind::Index),
            _ => None,
        }
    }

    /// Value stored in the `objecttype` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::MaterializedView => "materialized_view",
            ObjectKind::ToastTable => "toast_table",
            ObjectKind::Index => "index",
            ObjectKind::PrimaryKeyIndex => "index_pk",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "table" => Some(ObjectKind::Table),
            "materialized_view" => Some(ObjectKind::MaterializedView),
            "toast_table" => Some(ObjectKind::ToastTable),
            "index" => Some(ObjectKind::Index),
            "index_pk" => Some(ObjectKind::PrimaryKeyIndex),
            _ => None,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ObjectKind::Index | ObjectKind::PrimaryKeyIndex)
    }

    /// Tables and materialized views can own auxiliary storage and be sampled
    /// approximately.
    pub fn is_heap(&self) -> bool {
        matches!(self, ObjectKind::Table | ObjectKind::MaterializedView)
    }

    pub fn partition(&self) -> Partition {
        if self.is_index() {
            Partition::Indexes
        } else {
            Partition::Tables
        }
    }

    /// Fillfactor the server applies when the object has no storage option.
    pub fn default_fillfactor(&self) -> f64 {
        if self.is_index() {
            90.0
        } else {
            100.0
        }
    }

    pub fn label(&self) -> ObjectLabel {
        match self {
            ObjectKind::Table | ObjectKind::ToastTable => ObjectLabel::Table,
            ObjectKind::MaterializedView => ObjectLabel::MaterializedView,
            ObjectKind::Index => ObjectLabel::Index,
            ObjectKind::PrimaryKeyIndex => ObjectLabel::PrimaryKey,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short kind label shown in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectLabel {
    #[serde(rename = "t")]
    Table,
    #[serde(rename = "i")]
    Index,
    #[serde(rename = "p")]
    PrimaryKey,
    #[serde(rename = "mv")]
    MaterializedView,
}

impl ObjectLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectLabel::Table => "t",
            ObjectLabel::Index => "i",
            ObjectLabel::PrimaryKey => "p",
            ObjectLabel::MaterializedView => "mv",
        }
    }
}

/// The two disjoint halves of the persisted statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Tables,
    Indexes,
}

impl Partition {
    pub fn table_name(&self) -> &'static str {
        match self {
            Partition::Tables => "bloat_tables",
            Partition::Indexes => "bloat_indexes",
        }
    }
}

/// Schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Splits `schema.name` on the first dot. Unqualified input yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let (schema, name) = value.trim().split_once('.')?;
        if schema.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(schema, name))
    }

    /// Double-quoted form safe to splice into SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// One storage object selected for scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTarget {
    pub oid: i64,
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
    /// Reserve ratio in percent (10-100)
    pub fillfactor: f64,
    /// Table whose statistics are refreshed before sampling this object
    pub owner: QualifiedName,
}

impl ScanTarget {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(self.schema.clone(), self.name.clone())
    }
}

/// Raw occupancy statistics of one object as returned by pgstattuple.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    pub size_bytes: i64,
    pub live_tuple_count: i64,
    pub live_tuple_percent: f64,
    pub dead_tuple_count: i64,
    pub dead_tuple_size_bytes: i64,
    pub dead_tuple_percent: f64,
    pub free_space_bytes: i64,
    pub free_percent: f64,
    pub approximate: bool,
    pub relpages: i64,
}

impl RawStats {
    /// Completely unoccupied objects report zero for every measurement.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
            && self.live_tuple_count == 0
            && self.dead_tuple_count == 0
            && self.dead_tuple_size_bytes == 0
            && self.free_space_bytes == 0
    }

    pub fn raw_wasted_bytes(&self) -> i64 {
        self.dead_tuple_size_bytes + self.free_space_bytes
    }

    pub fn raw_wasted_percent(&self) -> f64 {
        self.dead_tuple_percent + self.free_percent
    }
}

/// Wasted space after discounting the fillfactor reserve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WastedSpace {
    pub reserved_bytes: f64,
    pub wasted_bytes: i64,
    pub wasted_percent: f64,
}

/// One row of the persisted statistics tables.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub oid: i64,
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
    pub owning_table: QualifiedName,
    pub stats: RawStats,
    pub fillfactor: f64,
    pub block_size: i64,
    /// Filled in by the database on insert
    pub captured_at: Option<String>,
}

impl PersistedRecord {
    pub fn new(target: &ScanTarget, stats: RawStats, block_size: i64) -> Self {
        Self {
            oid: target.oid,
            schema: target.schema.clone(),
            name: target.name.clone(),
            kind: target.kind,
            owning_table: target.owner.clone(),
            stats,
            fillfactor: target.fillfactor,
            block_size,
            captured_at: None,
        }
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(self.schema.clone(), self.name.clone())
    }
}

/// A filtered, labelled row handed to the output layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub oid: i64,
    #[serde(rename = "schemaname")]
    pub schema: String,
    #[serde(rename = "objectname")]
    pub name: String,
    #[serde(rename = "objecttype")]
    pub kind: ObjectKind,
    pub label: ObjectLabel,
    pub owning_table: String,
    pub size_bytes: i64,
    pub live_tuple_count: i64,
    pub live_tuple_percent: f64,
    pub dead_tuple_count: i64,
    pub dead_tuple_size_bytes: i64,
    pub dead_tuple_percent: f64,
    pub free_space_bytes: i64,
    pub free_percent: f64,
    pub wasted_bytes: i64,
    pub wasted_percent: f64,
    pub approximate: bool,
    pub stats_timestamp: Option<String>,
}

/// Counters describing one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub candidates: usize,
    pub recorded: usize,
    pub excluded: usize,
    pub vanished: usize,
    pub empty: usize,
    pub below_threshold: usize,
    pub batches_committed: usize,
    pub interrupted: bool,
}
