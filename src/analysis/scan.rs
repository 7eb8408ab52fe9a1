use crate::analysis::catalog;
use crate::analysis::exclusion::ExclusionList;
use crate::analysis::sampler::{self, AnalyzeTracker};
use crate::analysis::wasted;
use crate::checker::CheckerError;
use crate::config::{ScanOptions, Thresholds};
use crate::models::{PersistedRecord, RawStats, ScanSummary, ScanTarget};
use crate::source::StatsSource;
use crate::store::{BatchWriter, BloatStore};
use snafu::Snafu;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Conditions that abort a scan or report.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ScanError {
    #[snafu(display(
        "pgstattuple extension not found. Please ensure it is installed in the database being scanned"
    ))]
    ExtensionMissing,

    #[snafu(display(
        "pgstattuple not found in schema {} given by --pgstattuple-schema; found in {} instead",
        expected,
        found
    ))]
    ExtensionSchemaMismatch { expected: String, found: String },

    #[snafu(display(
        "--quick requires pgstattuple version 1.3 or greater (PostgreSQL 9.5); found {}",
        found
    ))]
    ExtensionTooOld { found: String },

    #[snafu(display(
        "Required statistics table {} does not exist. Run create-stats-table first",
        table
    ))]
    SchemaMissing { table: String },

    #[snafu(display("Relation {} does not exist", name))]
    UnknownObject { name: String },

    #[snafu(display("Cannot rewrite index definition: {}", definition))]
    UnexpectedIndexDefinition { definition: String },

    #[snafu(context(false), display("{}", source))]
    Checker { source: CheckerError },
}

/// Cooperative stop request, honoured between objects only.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raises the signal and reports whether it was already raised.
    pub fn escalate(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }
}

/// Scan-time prefilter on raw measurements, before fillfactor is discounted.
fn passes_thresholds(stats: &RawStats, thresholds: &Thresholds) -> bool {
    stats.size_bytes > thresholds.min_size
        && (stats.raw_wasted_bytes() > thresholds.min_wasted_bytes
            || stats.raw_wasted_percent() > thresholds.min_wasted_percent)
}

/// What happened to a single candidate.
enum Outcome {
    Recorded(PersistedRecord),
    Excluded,
    Vanished,
    Empty,
    BelowThreshold,
}

/// Full scan pass: enumerate, sample, compute waste, filter and persist.
///
/// Fatal conditions are checked before the statistics tables are touched.
/// A full scan clears the partitions of its mode; a named-object scan only
/// replaces the rows of the objects it enumerated. When `stop` is raised the
/// pass ends at the next object boundary after committing what it recorded,
/// leaving the partition partially repopulated until the next full scan.
pub async fn run_scan<S: StatsSource, P: BloatStore>(
    source: &mut S,
    store: &mut P,
    options: &ScanOptions,
    exclusions: &ExclusionList,
    stop: &StopSignal,
) -> Result<ScanSummary, ScanError> {
    sampler::check_extension(source, options).await?;
    if let Some(table) = store.missing_table().await? {
        return SchemaMissingSnafu { table }.fail();
    }

    let block_size = source.block_size().await?;
    let targets = catalog::enumerate(source, options).await?;
    let named = options.named_object().is_some();

    let mut summary = ScanSummary {
        candidates: targets.len(),
        ..ScanSummary::default()
    };

    if named {
        let oids: Vec<i64> = targets.iter().map(|t| t.oid).collect();
        store.remove_objects(&oids).await?;
    } else {
        store.begin_scan(options.mode.partitions()).await?;
    }

    let mut writer = BatchWriter::new(store, options.commit_rate);
    let mut analyzed = AnalyzeTracker::default();

    for target in &targets {
        if stop.is_raised() {
            warn!(
                "Scan interrupted after {} of {} objects; statistics are partially repopulated",
                summary.recorded + summary.excluded + summary.vanished + summary.empty
                    + summary.below_threshold,
                targets.len()
            );
            summary.interrupted = true;
            break;
        }

        let outcome = scan_target(
            source,
            target,
            options,
            exclusions,
            &mut analyzed,
            block_size,
            named,
        )
        .await?;

        match outcome {
            Outcome::Recorded(record) => {
                writer.record(record).await?;
                summary.recorded += 1;
            }
            Outcome::Excluded => summary.excluded += 1,
            Outcome::Vanished => summary.vanished += 1,
            Outcome::Empty => summary.empty += 1,
            Outcome::BelowThreshold => summary.below_threshold += 1,
        }
    }

    summary.batches_committed = writer.finalize().await?;

    info!(
        "Scan finished: {} recorded, {} excluded, {} vanished, {} empty, {} below thresholds",
        summary.recorded, summary.excluded, summary.vanished, summary.empty, summary.below_threshold
    );
    Ok(summary)
}

async fn scan_target<S: StatsSource>(
    source: &mut S,
    target: &ScanTarget,
    options: &ScanOptions,
    exclusions: &ExclusionList,
    analyzed: &mut AnalyzeTracker,
    block_size: i64,
    named: bool,
) -> Result<Outcome, ScanError> {
    let name = target.qualified_name();

    // zero-ceiling rules need no measurements
    if !named && exclusions.excludes_unconditionally(&name) {
        debug!("{} is excluded unconditionally", name);
        return Ok(Outcome::Excluded);
    }

    if !catalog::still_exists(source, target).await? {
        return Ok(Outcome::Vanished);
    }

    if options.analyze {
        if let Err(err) = analyzed.refresh(source, &target.owner).await {
            return vanished_or(source, target, err).await;
        }
    }

    let stats = match sampler::sample(source, target, options.approximate).await {
        Ok(Some(stats)) => stats,
        Ok(None) => return Ok(Outcome::Empty),
        Err(err) => return vanished_or(source, target, err).await,
    };

    if !named {
        if !passes_thresholds(&stats, &options.thresholds) {
            debug!("{} is below the scan thresholds", name);
            return Ok(Outcome::BelowThreshold);
        }

        let waste = wasted::compute(&stats, target.fillfactor, block_size);
        if exclusions.should_exclude(&name, &waste) {
            debug!(
                "{} is excluded: {} bytes / {:.2}% wasted within its ceilings",
                name, waste.wasted_bytes, waste.wasted_percent
            );
            return Ok(Outcome::Excluded);
        }
    }

    Ok(Outcome::Recorded(PersistedRecord::new(target, stats, block_size)))
}

/// An object dropped mid-sample makes its statements fail; that is a skip,
/// anything else is fatal.
async fn vanished_or<S: StatsSource>(
    source: &mut S,
    target: &ScanTarget,
    err: CheckerError,
) -> Result<Outcome, ScanError> {
    if source.object_exists(target.oid).await? {
        return Err(err.into());
    }
    debug!(
        "{}.{} was dropped while being sampled, skipping",
        target.schema, target.name
    );
    Ok(Outcome::Vanished)
}
