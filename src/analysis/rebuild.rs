use crate::analysis::exclusion::ExclusionList;
use crate::analysis::report;
use crate::analysis::scan::{ScanError, UnexpectedIndexDefinitionSnafu};
use crate::config::{ReportFilter, ScanMode};
use crate::models::{quote_ident, ObjectKind, QualifiedName, ReportRow};
use crate::source::StatsSource;
use crate::store::BloatStore;
use rand::Rng;
use snafu::OptionExt;
use tracing::debug;

/// Catalog facts about an index needed to rebuild it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDetails {
    pub table: QualifiedName,
    pub tablespace: Option<String>,
    /// Output of `pg_get_indexdef`
    pub definition: String,
    /// Partial index predicate as printed by `pg_get_expr`
    pub predicate: Option<String>,
    pub is_clustered: bool,
    /// Unique, primary key or exclusion constraint backed by the index
    pub constraint: Option<String>,
}

/// One state of the rebuild sequence. Every plan passes through all of them
/// in declaration order, with statistics refreshed twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildStep {
    Identify {
        index: QualifiedName,
        table: QualifiedName,
    },
    CreateReplacementConcurrently {
        statement: String,
        /// `ALTER TABLE .. CLUSTER ON` moving the clustering mark
        cluster_on: Option<String>,
    },
    RefreshStatistics {
        table: QualifiedName,
    },
    FinalizeReplacement {
        statements: Vec<String>,
    },
    Done {
        warn_recluster: Option<QualifiedName>,
    },
}

impl RebuildStep {
    pub fn state(&self) -> &'static str {
        match self {
            RebuildStep::Identify { .. } => "identify",
            RebuildStep::CreateReplacementConcurrently { .. } => "create_replacement_concurrently",
            RebuildStep::RefreshStatistics { .. } => "refresh_statistics",
            RebuildStep::FinalizeReplacement { .. } => "finalize_replacement",
            RebuildStep::Done { .. } => "done",
        }
    }

    fn render(&self) -> Vec<String> {
        match self {
            RebuildStep::Identify { index, table } => {
                vec![format!("-- {} on {}", index, table)]
            }
            RebuildStep::CreateReplacementConcurrently {
                statement,
                cluster_on,
            } => std::iter::once(statement.clone())
                .chain(cluster_on.clone())
                .collect(),
            RebuildStep::RefreshStatistics { table } => {
                vec![format!("ANALYZE {};", table.quoted())]
            }
            RebuildStep::FinalizeReplacement { statements } => statements.clone(),
            RebuildStep::Done {
                warn_recluster: Some(table),
            } => vec![
                String::new(),
                "-- WARNING: The following statement will exclusively lock the table for the duration of its runtime.".into(),
                "--   Uncomment it or manually run it to recluster the table on the newly created index.".into(),
                format!("-- CLUSTER {};", table.quoted()),
            ],
            RebuildStep::Done {
                warn_recluster: None,
            } => Vec::new(),
        }
    }
}

/// Command sequence rebuilding one index without blocking writes. Never
/// executed by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    pub index: QualifiedName,
    pub replacement: String,
    pub steps: Vec<RebuildStep>,
}

impl RebuildPlan {
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .flat_map(RebuildStep::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn random_replacement_name() -> String {
    format!("pgbloat_rebuild_{}", rand::thread_rng().gen_range(1000..=9999))
}

/// Rewrites `CREATE [UNIQUE] INDEX name ON ...` into a concurrent build of
/// `replacement`, keeping the tablespace and partial predicate.
///
/// `pg_get_indexdef` quotes the name only when it has to, so both spellings
/// are tried.
fn replacement_definition(
    details: &IndexDetails,
    index_name: &str,
    replacement: &str,
) -> Option<String> {
    let (head, rest) = ["CREATE UNIQUE", "CREATE"].into_iter().find_map(|head| {
        details
            .definition
            .strip_prefix(head)
            .and_then(|rest| rest.strip_prefix(" INDEX "))
            .map(|rest| (head, rest))
    })?;
    let target = [quote_ident(index_name), index_name.to_string()]
        .iter()
        .find_map(|name| rest.strip_prefix(name.as_str())?.strip_prefix(" ON "))?;

    let (target, predicate) = match &details.predicate {
        Some(predicate) => {
            let clause = format!(" WHERE {predicate}");
            match target.strip_suffix(&clause) {
                Some(stripped) => (stripped, clause),
                None => (target, String::new()),
            }
        }
        None => (target, String::new()),
    };
    let tablespace = details
        .tablespace
        .as_deref()
        .map(|ts| format!(" TABLESPACE {}", quote_ident(ts)))
        .unwrap_or_default();

    Some(format!(
        "{head} INDEX CONCURRENTLY {} ON {target}{tablespace}{predicate};",
        quote_ident(replacement)
    ))
}

/// Derives the rebuild sequence for one reported index.
pub fn plan_rebuild(
    row: &ReportRow,
    details: &IndexDetails,
    replacement: String,
) -> Result<RebuildPlan, ScanError> {
    let index = QualifiedName::new(row.schema.clone(), row.name.clone());
    let table = details.table.clone();
    let quoted_table = table.quoted();
    let quoted_replacement = quote_ident(&replacement);

    let create = replacement_definition(details, &row.name, &replacement).context(
        UnexpectedIndexDefinitionSnafu {
            definition: details.definition.clone(),
        },
    )?;
    let cluster_on = details
        .is_clustered
        .then(|| format!("ALTER TABLE {quoted_table} CLUSTER ON {quoted_replacement};"));

    let finalize = if row.kind == ObjectKind::PrimaryKeyIndex {
        let constraint = quote_ident(details.constraint.as_deref().unwrap_or(&row.name));
        vec![
            format!("ALTER TABLE {quoted_table} DROP CONSTRAINT {constraint};"),
            format!(
                "ALTER TABLE {quoted_table} ADD CONSTRAINT {constraint} PRIMARY KEY USING INDEX {quoted_replacement};"
            ),
        ]
    } else {
        let drop = match &details.constraint {
            Some(constraint) => format!(
                "ALTER TABLE {quoted_table} DROP CONSTRAINT {};",
                quote_ident(constraint)
            ),
            None => format!("DROP INDEX CONCURRENTLY {};", index.quoted()),
        };
        vec![
            drop,
            format!(
                "ALTER INDEX {}.{quoted_replacement} RENAME TO {};",
                quote_ident(&index.schema),
                quote_ident(&index.name)
            ),
        ]
    };

    let steps = vec![
        RebuildStep::Identify {
            index: index.clone(),
            table: table.clone(),
        },
        RebuildStep::CreateReplacementConcurrently {
            statement: create,
            cluster_on,
        },
        RebuildStep::RefreshStatistics {
            table: table.clone(),
        },
        RebuildStep::FinalizeReplacement {
            statements: finalize,
        },
        RebuildStep::RefreshStatistics {
            table: table.clone(),
        },
        RebuildStep::Done {
            warn_recluster: details.is_clustered.then_some(table),
        },
    ];

    Ok(RebuildPlan {
        index,
        replacement,
        steps,
    })
}

/// Plans a rebuild for every index the report selects. Indexes dropped since
/// the last scan are skipped.
pub async fn run_rebuild<S: StatsSource, P: BloatStore>(
    source: &mut S,
    store: &mut P,
    filter: &ReportFilter,
    exclusions: &ExclusionList,
    names: &mut impl FnMut() -> String,
) -> Result<Vec<RebuildPlan>, ScanError> {
    let filter = ReportFilter {
        mode: ScanMode::Indexes,
        ..filter.clone()
    };
    let rows = report::run_report(store, &filter, exclusions).await?;

    let mut plans = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(details) = source.index_details(row.oid).await? else {
            debug!("{}.{} no longer exists, skipping", row.schema, row.name);
            continue;
        };
        plans.push(plan_rebuild(row, &details, names())?);
    }
    Ok(plans)
}
