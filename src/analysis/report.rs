use crate::analysis::exclusion::ExclusionList;
use crate::analysis::scan::{ScanError, SchemaMissingSnafu};
use crate::analysis::wasted;
use crate::config::ReportFilter;
use crate::models::{PersistedRecord, QualifiedName, ReportRow};
use crate::store::BloatStore;
use std::cmp::Ordering;
use tracing::debug;

fn to_row(record: PersistedRecord) -> ReportRow {
    let waste = wasted::compute(&record.stats, record.fillfactor, record.block_size);
    let stats = record.stats;

    ReportRow {
        oid: record.oid,
        schema: record.schema,
        name: record.name,
        kind: record.kind,
        label: record.kind.label(),
        owning_table: record.owning_table.to_string(),
        size_bytes: stats.size_bytes,
        live_tuple_count: stats.live_tuple_count,
        live_tuple_percent: stats.live_tuple_percent,
        dead_tuple_count: stats.dead_tuple_count,
        dead_tuple_size_bytes: stats.dead_tuple_size_bytes,
        dead_tuple_percent: stats.dead_tuple_percent,
        free_space_bytes: stats.free_space_bytes,
        free_percent: stats.free_percent,
        wasted_bytes: waste.wasted_bytes,
        wasted_percent: waste.wasted_percent,
        approximate: stats.approximate,
        stats_timestamp: record.captured_at,
    }
}

fn by_waste(a: &ReportRow, b: &ReportRow) -> Ordering {
    b.wasted_bytes
        .cmp(&a.wasted_bytes)
        .then_with(|| a.schema.cmp(&b.schema))
        .then_with(|| a.name.cmp(&b.name))
}

/// Table a named object belongs to: its owner when the object was recorded,
/// the name itself otherwise.
fn owning_table_of(records: &[PersistedRecord], object: &QualifiedName) -> QualifiedName {
    records
        .iter()
        .find(|record| record.qualified_name() == *object)
        .map(|record| record.owning_table.clone())
        .unwrap_or_else(|| object.clone())
}

/// Filters and orders persisted measurements.
///
/// Rows must be strictly above every threshold. A single-object report keeps
/// the object together with its table and everything that table owns, and
/// ignores exclusion rules.
pub fn build_report(
    records: Vec<PersistedRecord>,
    filter: &ReportFilter,
    exclusions: &ExclusionList,
) -> Vec<ReportRow> {
    let thresholds = &filter.thresholds;
    let family = filter
        .object
        .as_ref()
        .map(|object| (object, owning_table_of(&records, object)));

    let mut rows: Vec<ReportRow> = records
        .into_iter()
        .filter(|record| filter.mode.includes(record.kind))
        .filter(|record| match &family {
            Some((object, table)) => {
                record.owning_table == *table || record.qualified_name() == **object
            }
            None => true,
        })
        .filter(|record| {
            if filter.object.is_some() {
                return true;
            }
            let waste = wasted::compute(&record.stats, record.fillfactor, record.block_size);
            let excluded = exclusions.should_exclude(&record.qualified_name(), &waste);
            if excluded {
                debug!("{} excluded from report", record.qualified_name());
            }
            !excluded
        })
        .map(to_row)
        .filter(|row| {
            row.size_bytes > thresholds.min_size
                && row.wasted_bytes > thresholds.min_wasted_bytes
                && row.wasted_percent > thresholds.min_wasted_percent
        })
        .collect();

    rows.sort_by(by_waste);
    rows
}

/// Loads the partitions selected by the filter and builds the report.
/// Never modifies the store.
pub async fn run_report<P: BloatStore>(
    store: &mut P,
    filter: &ReportFilter,
    exclusions: &ExclusionList,
) -> Result<Vec<ReportRow>, ScanError> {
    if let Some(table) = store.missing_table().await? {
        return SchemaMissingSnafu { table }.fail();
    }

    let records = store.load(filter.mode.partitions()).await?;
    debug!("Loaded {} persisted records", records.len());

    Ok(build_report(records, filter, exclusions))
}
