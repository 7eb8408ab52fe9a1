use crate::analysis::rebuild::{self, RebuildPlan};
use crate::analysis::report;
use crate::analysis::scan::{self, ScanError, StopSignal};
use crate::config::{DbConfig, ResolvedOptions};
use crate::models::{ReportRow, ScanSummary};
use crate::source::{PgStatsSource, StatsSource};
use crate::store::PgBloatStore;
use snafu::{ResultExt, Snafu};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::info;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckerError {
    #[snafu(display("Failed to connect to database: {}", source))]
    ConnectionError { source: sqlx::Error },

    #[snafu(display("Failed to execute query: {}", query))]
    QueryError { query: String, source: sqlx::Error },
}

type Result<T, E = CheckerError> = std::result::Result<T, E>;

/// Owns the connection pool and drives scans, reports and rebuild plans for
/// one database.
pub struct BloatChecker {
    config: DbConfig,
    pool: Pool<Postgres>,
}

impl BloatChecker {
    pub async fn new(config: DbConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}",
            config.host, config.port
        );

        // one connection samples while the other holds the batch transaction
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(config.connect_options())
            .await
            .context(ConnectionSnafu)?;

        info!("Successfully connected to database: {}", config.database);

        Ok(Self { config, pool })
    }

    fn source(&self, options: &ResolvedOptions) -> PgStatsSource {
        PgStatsSource::new(self.pool.clone(), options.scan.pgstattuple_schema.clone())
    }

    fn store(&self) -> PgBloatStore {
        PgBloatStore::new(self.pool.clone(), self.config.bloat_schema.clone())
    }

    /// True when the server is a replica and the options ask to skip replicas.
    pub async fn should_skip(&self, options: &ResolvedOptions) -> Result<bool> {
        if !options.recovery_mode_norun {
            return Ok(false);
        }
        let in_recovery = self.source(options).is_in_recovery().await?;
        if in_recovery {
            info!("Server is in recovery; skipping run");
        } else {
            info!("Server is a primary; running as normal");
        }
        Ok(in_recovery)
    }

    pub async fn scan(
        &self,
        options: &ResolvedOptions,
        stop: &StopSignal,
    ) -> Result<ScanSummary, ScanError> {
        let mut source = self.source(options);
        let mut store = self.store();
        scan::run_scan(
            &mut source,
            &mut store,
            &options.scan,
            &options.exclusions,
            stop,
        )
        .await
    }

    pub async fn report(&self, options: &ResolvedOptions) -> Result<Vec<ReportRow>, ScanError> {
        let mut store = self.store();
        report::run_report(&mut store, &options.report, &options.exclusions).await
    }

    pub async fn rebuild_plans(
        &self,
        options: &ResolvedOptions,
    ) -> Result<Vec<RebuildPlan>, ScanError> {
        let mut source = self.source(options);
        let mut store = self.store();
        rebuild::run_rebuild(
            &mut source,
            &mut store,
            &options.report,
            &options.exclusions,
            &mut rebuild::random_replacement_name,
        )
        .await
    }

    pub async fn create_stats_table(&self) -> Result<()> {
        self.store().create_tables().await
    }
}
