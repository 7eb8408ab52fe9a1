use crate::analysis::scan::{
    ExtensionMissingSnafu, ExtensionSchemaMismatchSnafu, ExtensionTooOldSnafu, ScanError,
};
use crate::checker::CheckerError;
use crate::config::ScanOptions;
use crate::models::{quote_ident, QualifiedName, RawStats, ScanTarget};
use crate::source::{ExtensionInfo, StatsSource};
use snafu::OptionExt;
use std::collections::HashSet;
use tracing::debug;

/// pgstattuple_approx() ships with extension version 1.3 (PostgreSQL 9.5).
pub const APPROXIMATE_MIN_VERSION: (u32, u32) = (1, 3);

/// Parses an extension version such as `1.5` into `(major, minor)`.
pub fn parse_extension_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

/// Verifies pgstattuple can serve the requested scan. Runs before anything is
/// written to the statistics tables.
pub async fn check_extension<S: StatsSource>(
    source: &mut S,
    options: &ScanOptions,
) -> Result<ExtensionInfo, ScanError> {
    let info = source
        .pgstattuple_extension()
        .await?
        .context(ExtensionMissingSnafu)?;

    if let Some(expected) = &options.pgstattuple_schema {
        if *expected != info.schema {
            return ExtensionSchemaMismatchSnafu {
                expected: expected.clone(),
                found: info.schema.clone(),
            }
            .fail();
        }
    }

    if options.approximate {
        let supported = parse_extension_version(&info.version)
            .is_some_and(|version| version >= APPROXIMATE_MIN_VERSION);
        if !supported {
            return ExtensionTooOldSnafu {
                found: info.version.clone(),
            }
            .fail();
        }
    }

    debug!(
        "pgstattuple {} found in schema {}",
        info.version, info.schema
    );
    Ok(info)
}

/// Approximate sampling only applies to heap objects; toast tables and
/// indexes are always read exactly.
pub fn use_approximate(target: &ScanTarget, requested: bool) -> bool {
    requested && target.kind.is_heap()
}

pub(crate) fn stattuple_query(approximate: bool, schema: Option<&str>) -> String {
    let prefix = schema
        .map(|s| format!("{}.", quote_ident(s)))
        .unwrap_or_default();

    let columns = if approximate {
        "s.table_len, s.approx_tuple_count AS tuple_count, s.approx_tuple_percent AS tuple_percent, \
         s.dead_tuple_count, s.dead_tuple_len, s.dead_tuple_percent, \
         s.approx_free_space AS free_space, s.approx_free_percent AS free_percent"
    } else {
        "s.table_len, s.tuple_count, s.tuple_percent, \
         s.dead_tuple_count, s.dead_tuple_len, s.dead_tuple_percent, \
         s.free_space, s.free_percent"
    };
    let function = if approximate {
        "pgstattuple_approx"
    } else {
        "pgstattuple"
    };

    format!(
        "SELECT {columns}, c.relpages::bigint AS relpages \
         FROM {prefix}{function}($1::oid::regclass) s, pg_catalog.pg_class c \
         WHERE c.oid = $1::oid"
    )
}

/// Samples one target. Completely empty objects collapse to `None`.
pub async fn sample<S: StatsSource>(
    source: &mut S,
    target: &ScanTarget,
    approximate: bool,
) -> Result<Option<RawStats>, CheckerError> {
    let approximate = use_approximate(target, approximate);
    let stats = source.stattuple(target.oid, approximate).await?;

    match stats {
        Some(stats) if !stats.is_empty() => Ok(Some(stats)),
        _ => {
            debug!("{}.{} is empty, skipping", target.schema, target.name);
            Ok(None)
        }
    }
}

/// Remembers which tables were analyzed so a table with several indexes is
/// refreshed only once per pass.
#[derive(Debug, Default)]
pub struct AnalyzeTracker {
    analyzed: HashSet<QualifiedName>,
}

impl AnalyzeTracker {
    /// Returns whether an ANALYZE was issued.
    pub async fn refresh<S: StatsSource>(
        &mut self,
        source: &mut S,
        table: &QualifiedName,
    ) -> Result<bool, CheckerError> {
        if self.analyzed.contains(table) {
            debug!("{} already analyzed, skipping", table);
            return Ok(false);
        }
        source.analyze(table).await?;
        self.analyzed.insert(table.clone());
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.analyzed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzed.is_empty()
    }
}
