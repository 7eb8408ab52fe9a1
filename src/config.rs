use crate::analysis::exclusion::ExclusionList;
use crate::analysis::units::convert_to_bytes;
use crate::models::{ObjectKind, Partition, QualifiedName};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use sqlx::postgres::PgConnectOptions;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Failed to read config file: {}", source))]
    FileRead { source: std::io::Error },

    #[snafu(display("Failed to parse YAML config: {}", source))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("--schema and --exclude-schema are mutually exclusive and cannot be set together"))]
    ExclusiveSchemaFilters,

    #[snafu(display("Invalid size for {}: '{}'", option, value))]
    InvalidSize { option: String, value: String },

    #[snafu(display("Object name must be schema qualified: '{}'", value))]
    UnqualifiedObject { value: String },

    #[snafu(display("Failed to read exclusion file {}: {}", path.display(), source))]
    ExclusionFile { path: PathBuf, source: csv::Error },

    #[snafu(display("Invalid exclusion rule on line {}: {}", line, reason))]
    InvalidExclusionRule { line: u64, reason: String },

    #[snafu(display("Exclusion rule for {} is defined more than once", object))]
    DuplicateExclusion { object: String },
}

type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Connection settings plus the location of the statistics tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Schema holding the bloat statistics tables; search path when unset
    #[serde(default)]
    pub bloat_schema: Option<String>,
}

/// One entry of a YAML run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub db: DbConfig,
    #[serde(default)]
    pub options: BloatOptions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Tables,
    Indexes,
    #[default]
    Both,
}

impl ScanMode {
    pub fn partitions(&self) -> &'static [Partition] {
        match self {
            ScanMode::Tables => &[Partition::Tables],
            ScanMode::Indexes => &[Partition::Indexes],
            ScanMode::Both => &[Partition::Tables, Partition::Indexes],
        }
    }

    pub fn includes(&self, kind: ObjectKind) -> bool {
        self.partitions().contains(&kind.partition())
    }
}

/// Schema filter applied while enumerating candidates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SchemaFilter {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

/// Which objects a scan looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    Schemas(SchemaFilter),
    /// A single object; overrides schema filters and mode
    Object(QualifiedName),
}

/// Global report thresholds. Objects must be strictly above each one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_size: i64,
    pub min_wasted_bytes: i64,
    pub min_wasted_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_size: 1,
            min_wasted_bytes: 1,
            min_wasted_percent: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub scope: ScanScope,
    pub thresholds: Thresholds,
    pub approximate: bool,
    pub analyze: bool,
    /// Records appended per commit; 0 commits once at the end
    pub commit_rate: usize,
    pub pgstattuple_schema: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Both,
            scope: ScanScope::Schemas(SchemaFilter::All),
            thresholds: Thresholds::default(),
            approximate: false,
            analyze: true,
            commit_rate: 5,
            pgstattuple_schema: None,
        }
    }
}

impl ScanOptions {
    pub fn named_object(&self) -> Option<&QualifiedName> {
        match &self.scope {
            ScanScope::Object(name) => Some(name),
            ScanScope::Schemas(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub mode: ScanMode,
    pub thresholds: Thresholds,
    pub object: Option<QualifiedName>,
}

/// User-facing options as they appear on the command line or in a run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloatOptions {
    pub mode: ScanMode,
    pub schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub table: Option<String>,
    pub min_size: String,
    pub min_wasted_size: String,
    pub min_wasted_percent: f64,
    pub quick: bool,
    pub analyze: bool,
    pub commit_rate: usize,
    pub exclude_object_file: Option<PathBuf>,
    pub pgstattuple_schema: Option<String>,
    pub recovery_mode_norun: bool,
}

impl Default for BloatOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Both,
            schemas: Vec::new(),
            exclude_schemas: Vec::new(),
            table: None,
            min_size: "1".to_string(),
            min_wasted_size: "1".to_string(),
            min_wasted_percent: 0.1,
            quick: false,
            analyze: true,
            commit_rate: 5,
            exclude_object_file: None,
            pgstattuple_schema: None,
            recovery_mode_norun: false,
        }
    }
}

/// Options after validation, ready to be threaded into the engine.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub scan: ScanOptions,
    pub report: ReportFilter,
    pub exclusions: ExclusionList,
    pub recovery_mode_norun: bool,
}

impl BloatOptions {
    pub fn resolve(&self) -> Result<ResolvedOptions> {
        let schemas = clean_list(&self.schemas);
        let exclude_schemas = clean_list(&self.exclude_schemas);

        let filter = match (schemas.is_empty(), exclude_schemas.is_empty()) {
            (false, false) => return Err(ConfigError::ExclusiveSchemaFilters),
            (false, true) => {
                let mut schemas = schemas;
                // catalog tables are always part of an inclusion list
                if !schemas.iter().any(|s| s == "pg_catalog") {
                    schemas.push("pg_catalog".to_string());
                }
                SchemaFilter::Include(schemas)
            }
            (true, false) => SchemaFilter::Exclude(exclude_schemas),
            (true, true) => SchemaFilter::All,
        };

        let object = self
            .table
            .as_deref()
            .map(|value| {
                QualifiedName::parse(value).ok_or_else(|| ConfigError::UnqualifiedObject {
                    value: value.to_string(),
                })
            })
            .transpose()?;

        let thresholds = Thresholds {
            min_size: parse_size("--min-size", &self.min_size)?,
            min_wasted_bytes: parse_size("--min-wasted-size", &self.min_wasted_size)?,
            min_wasted_percent: self.min_wasted_percent,
        };

        let exclusions = match &self.exclude_object_file {
            Some(path) => ExclusionList::from_file(path)?,
            None => ExclusionList::default(),
        };

        let scope = match &object {
            Some(name) => ScanScope::Object(name.clone()),
            None => ScanScope::Schemas(filter),
        };

        Ok(ResolvedOptions {
            scan: ScanOptions {
                mode: self.mode,
                scope,
                thresholds,
                approximate: self.quick,
                analyze: self.analyze,
                commit_rate: self.commit_rate,
                pgstattuple_schema: self.pgstattuple_schema.clone(),
            },
            report: ReportFilter {
                // a named object is reported with everything its scan recorded
                mode: if object.is_some() {
                    ScanMode::Both
                } else {
                    self.mode
                },
                thresholds,
                object,
            },
            exclusions,
            recovery_mode_norun: self.recovery_mode_norun,
        })
    }
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_size(option: &str, value: &str) -> Result<i64> {
    convert_to_bytes(value.trim())
        .as_i64()
        .ok_or_else(|| ConfigError::InvalidSize {
            option: option.to_string(),
            value: value.to_string(),
        })
}

impl DbConfig {
    pub fn from_connection_params(
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
        bloat_schema: Option<String>,
    ) -> Self {
        Self {
            host,
            port,
            database,
            username,
            password,
            bloat_schema,
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .application_name("pgbloat");
        if !self.password.is_empty() {
            opts = opts.password(&self.password);
        }
        opts
    }
}

impl RunConfig {
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let content = fs::read_to_string(path).context(FileReadSnafu)?;
        let configs: Vec<RunConfig> = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        Ok(configs)
    }
}
