use clap::{Args, Parser, Subcommand};
use pgbloat::analysis::scan::StopSignal;
use pgbloat::checker::BloatChecker;
use pgbloat::config::{BloatOptions, DbConfig, ResolvedOptions, RunConfig, ScanMode};
use pgbloat::reporter::{ReportFormat, Reporter};
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PostgreSQL bloat checker - measures wasted space in tables and indexes with pgstattuple
#[derive(Parser, Debug)]
#[command(name = "pgbloat")]
#[command(version)]
#[command(about = "PostgreSQL table and index bloat checker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(
        short = 'f',
        long = "format",
        value_enum,
        default_value = "simple",
        global = true
    )]
    format: ReportFormat,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Once to hide the "no bloat" message, twice to hide all report output
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Database host
    #[arg(
        short = 'H',
        long = "host",
        env = "POSTGRES_HOST",
        default_value = "localhost"
    )]
    host: String,

    /// Database port
    #[arg(long = "port", env = "POSTGRES_PORT", default_value = "5432")]
    port: u16,

    /// Database name
    #[arg(short = 'd', long = "database", env = "POSTGRES_DATABASE")]
    database: String,

    /// Username
    #[arg(short = 'u', long = "username", env = "POSTGRES_USER")]
    username: String,

    /// Password
    #[arg(
        short = 'p',
        long = "password",
        env = "POSTGRES_PASSWORD",
        default_value = ""
    )]
    password: String,

    /// Schema containing the bloat statistics tables
    #[arg(long = "bloat-schema")]
    bloat_schema: Option<String>,
}

impl ConnectionArgs {
    fn into_config(self) -> DbConfig {
        DbConfig::from_connection_params(
            self.host,
            self.port,
            self.database,
            self.username,
            self.password,
            self.bloat_schema,
        )
    }
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Which objects to scan or report on
    #[arg(long = "mode", value_enum, default_value = "both")]
    mode: ScanMode,

    /// Only these schemas (comma separated); pg_catalog is always included
    #[arg(long = "schema", value_delimiter = ',')]
    schemas: Vec<String>,

    /// Skip these schemas (comma separated)
    #[arg(long = "exclude-schema", value_delimiter = ',')]
    exclude_schemas: Vec<String>,

    /// A single schema-qualified table or index, with its indexes or table
    #[arg(long = "table")]
    table: Option<String>,

    /// Minimum object size, e.g. 10MB
    #[arg(long = "min-size", default_value = "1")]
    min_size: String,

    /// Minimum wasted space, e.g. 500kB
    #[arg(long = "min-wasted-size", default_value = "1")]
    min_wasted_size: String,

    /// Minimum wasted percentage
    #[arg(long = "min-wasted-percent", default_value_t = 0.1)]
    min_wasted_percent: f64,

    /// Use pgstattuple_approx for tables (pgstattuple 1.3+)
    #[arg(long = "quick", default_value_t = false)]
    quick: bool,

    /// Do not ANALYZE tables before sampling them
    #[arg(long = "no-analyze", default_value_t = false)]
    no_analyze: bool,

    /// Objects recorded per transaction; 0 commits once at the end
    #[arg(long = "commit-rate", default_value_t = 5)]
    commit_rate: usize,

    /// CSV file of objectname,max_wasted_bytes,max_wasted_percent exclusions
    #[arg(long = "exclude-object-file")]
    exclude_object_file: Option<PathBuf>,

    /// Schema pgstattuple is expected to be installed in
    #[arg(long = "pgstattuple-schema")]
    pgstattuple_schema: Option<String>,

    /// Exit successfully without doing anything when the server is a replica
    #[arg(long = "recovery-mode-norun", default_value_t = false)]
    recovery_mode_norun: bool,
}

impl FilterArgs {
    fn into_options(self) -> BloatOptions {
        BloatOptions {
            mode: self.mode,
            schemas: self.schemas,
            exclude_schemas: self.exclude_schemas,
            table: self.table,
            min_size: self.min_size,
            min_wasted_size: self.min_wasted_size,
            min_wasted_percent: self.min_wasted_percent,
            quick: self.quick,
            analyze: !self.no_analyze,
            commit_rate: self.commit_rate,
            exclude_object_file: self.exclude_object_file,
            pgstattuple_schema: self.pgstattuple_schema,
            recovery_mode_norun: self.recovery_mode_norun,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a database, store the statistics and report bloated objects
    Scan {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Report from the statistics of the last scan without rescanning
    Report {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Print commands that rebuild bloated indexes with minimal locking
    RebuildIndex {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Drop and recreate the bloat statistics tables
    CreateStatsTable {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Scan multiple databases from a YAML config file
    Config {
        /// Path to YAML config file
        #[arg(short = 'c', long = "config")]
        config_path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let reporter = Reporter::new(cli.format, cli.quiet);

    match cli.command {
        Commands::Scan {
            connection,
            filters,
        } => {
            let options = filters.into_options().resolve()?;
            scan_and_report(connection.into_config(), &options, &reporter).await?;
        }
        Commands::Report {
            connection,
            filters,
        } => {
            let options = filters.into_options().resolve()?;
            let checker = BloatChecker::new(connection.into_config()).await?;
            if checker.should_skip(&options).await? {
                return Ok(());
            }
            let rows = checker.report(&options).await?;
            reporter.report(&rows)?;
        }
        Commands::RebuildIndex {
            connection,
            filters,
        } => {
            let options = filters.into_options().resolve()?;
            let checker = BloatChecker::new(connection.into_config()).await?;
            if checker.should_skip(&options).await? {
                return Ok(());
            }
            let plans = checker.rebuild_plans(&options).await?;
            reporter.report_rebuild(&plans)?;
        }
        Commands::CreateStatsTable { connection } => {
            let checker = BloatChecker::new(connection.into_config()).await?;
            checker.create_stats_table().await?;
        }
        Commands::Config { config_path } => {
            info!("Loading config from: {}", config_path);
            let runs = RunConfig::from_config_file(&config_path)?;

            // validate every entry before touching any database
            let runs = runs
                .into_iter()
                .map(|run| Ok((run.options.resolve()?, run.db)))
                .collect::<anyhow::Result<Vec<_>>>()?;

            for (options, config) in runs {
                info!("Checking database: {}", config.database);
                scan_and_report(config, &options, &reporter).await?;
            }
        }
    }

    Ok(())
}

async fn scan_and_report(
    config: DbConfig,
    options: &ResolvedOptions,
    reporter: &Reporter,
) -> anyhow::Result<()> {
    let checker = BloatChecker::new(config).await?;
    if checker.should_skip(options).await? {
        return Ok(());
    }

    let stop = StopSignal::new();
    let interrupt = watch_interrupt(stop.clone());
    let summary = checker.scan(options, &stop).await;
    interrupt.abort();

    let summary = summary?;
    if summary.interrupted {
        anyhow::bail!(
            "Scan interrupted after recording {} objects; bloat statistics are incomplete until the next full scan",
            summary.recorded
        );
    }

    let rows = checker.report(options).await?;
    reporter.report(&rows)?;
    Ok(())
}

/// First Ctrl-C stops after the current object, the second exits at once.
fn watch_interrupt(stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if stop.escalate() {
                warn!("Second interrupt received, exiting without committing");
                std::process::exit(130);
            }
            warn!("Interrupt received, stopping after the current object; press Ctrl-C again to abort");
        }
    })
}
