//! Persisted statistics: the `bloat_tables` / `bloat_indexes` pair and the
//! `bloat_stats` view over both.

use crate::checker::CheckerError;
use crate::models::{quote_ident, ObjectKind, Partition, PersistedRecord, QualifiedName, RawStats};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{query_scalar, Pool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

type Result<T, E = CheckerError> = std::result::Result<T, E>;

/// Name of the view unioning both partitions.
pub const STATS_VIEW: &str = "bloat_stats";

/// Where scan results are written and reports read from.
#[async_trait]
pub trait BloatStore: Send {
    /// First statistics table that does not exist, if any.
    async fn missing_table(&mut self) -> Result<Option<String>>;

    /// Clears the given partitions. Committed on its own, before any sampling.
    async fn begin_scan(&mut self, partitions: &[Partition]) -> Result<()>;

    /// Drops the rows of specific objects from both partitions.
    async fn remove_objects(&mut self, oids: &[i64]) -> Result<()>;

    async fn record(&mut self, record: &PersistedRecord) -> Result<()>;

    async fn commit_batch(&mut self) -> Result<()>;

    /// Commits whatever is still pending.
    async fn finalize(&mut self) -> Result<()>;

    async fn load(&mut self, partitions: &[Partition]) -> Result<Vec<PersistedRecord>>;
}

/// Groups inserts into transactions of `commit_rate` records. A rate of zero
/// commits once at the end.
pub struct BatchWriter<'a, P: BloatStore> {
    store: &'a mut P,
    commit_rate: usize,
    pending: usize,
    batches: usize,
}

impl<'a, P: BloatStore> BatchWriter<'a, P> {
    pub fn new(store: &'a mut P, commit_rate: usize) -> Self {
        Self {
            store,
            commit_rate,
            pending: 0,
            batches: 0,
        }
    }

    pub async fn record(&mut self, record: PersistedRecord) -> Result<()> {
        self.store.record(&record).await?;
        self.pending += 1;

        if self.commit_rate > 0 && self.pending >= self.commit_rate {
            self.store.commit_batch().await?;
            self.batches += 1;
            self.pending = 0;
            debug!("Committed batch {}", self.batches);
        }
        Ok(())
    }

    /// Commits the tail and returns how many batches were written in total.
    pub async fn finalize(self) -> Result<usize> {
        self.store.finalize().await?;
        Ok(self.batches + usize::from(self.pending > 0))
    }
}

const COLUMNS: &str = "oid, schemaname, objectname, objecttype, owning_table, \
     size_bytes, live_tuple_count, live_tuple_percent, dead_tuple_count, \
     dead_tuple_size_bytes, dead_tuple_percent, free_space_bytes, free_percent, \
     approximate, relpages, fillfactor, block_size";

fn qualify(schema: Option<&str>, relation: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(relation)),
        None => quote_ident(relation),
    }
}

/// DDL recreating both statistics tables and the view, in execution order.
pub(crate) fn create_statements(schema: Option<&str>) -> Vec<String> {
    let tables = qualify(schema, Partition::Tables.table_name());
    let indexes = qualify(schema, Partition::Indexes.table_name());
    let view = qualify(schema, STATS_VIEW);

    vec![
        format!("DROP VIEW IF EXISTS {view}"),
        format!("DROP TABLE IF EXISTS {indexes}"),
        format!("DROP TABLE IF EXISTS {tables}"),
        format!(
            "CREATE TABLE {tables} (
    oid bigint NOT NULL,
    schemaname text NOT NULL,
    objectname text NOT NULL,
    objecttype text NOT NULL,
    owning_table text NOT NULL,
    size_bytes bigint,
    live_tuple_count bigint,
    live_tuple_percent float8,
    dead_tuple_count bigint,
    dead_tuple_size_bytes bigint,
    dead_tuple_percent float8,
    free_space_bytes bigint,
    free_percent float8,
    stats_timestamp timestamptz DEFAULT now(),
    approximate boolean NOT NULL DEFAULT false,
    relpages bigint NOT NULL DEFAULT 1,
    fillfactor float8 NOT NULL DEFAULT 100,
    block_size bigint NOT NULL DEFAULT 8192,
    PRIMARY KEY (oid)
)"
        ),
        format!("CREATE TABLE {indexes} (LIKE {tables} INCLUDING ALL)"),
        format!(
            "CREATE VIEW {view} AS SELECT * FROM {tables} UNION ALL SELECT * FROM {indexes}"
        ),
    ]
}

pub(crate) fn insert_statement(schema: Option<&str>, partition: Partition) -> String {
    let placeholders = (1..=17)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({COLUMNS}) VALUES ({placeholders})",
        qualify(schema, partition.table_name())
    )
}

pub(crate) fn select_statement(schema: Option<&str>, partition: Partition) -> String {
    format!(
        "SELECT {COLUMNS}, \
         to_char(stats_timestamp, 'YYYY-MM-DD HH24:MI:SS TZ') AS stats_timestamp \
         FROM {}",
        qualify(schema, partition.table_name())
    )
}

fn record_from_row(row: &PgRow) -> PersistedRecord {
    let schema: String = row.get("schemaname");
    let name: String = row.get("objectname");
    let kind_text: String = row.get("objecttype");
    let owner_text: String = row.get("owning_table");

    let kind = ObjectKind::parse(&kind_text).unwrap_or_else(|| {
        warn!("Unknown objecttype {} for {}.{}", kind_text, schema, name);
        ObjectKind::Table
    });
    let owning_table = QualifiedName::parse(&owner_text)
        .unwrap_or_else(|| QualifiedName::new(schema.clone(), name.clone()));

    PersistedRecord {
        oid: row.get("oid"),
        schema,
        name,
        kind,
        owning_table,
        stats: RawStats {
            size_bytes: row.get("size_bytes"),
            live_tuple_count: row.get("live_tuple_count"),
            live_tuple_percent: row.get("live_tuple_percent"),
            dead_tuple_count: row.get("dead_tuple_count"),
            dead_tuple_size_bytes: row.get("dead_tuple_size_bytes"),
            dead_tuple_percent: row.get("dead_tuple_percent"),
            free_space_bytes: row.get("free_space_bytes"),
            free_percent: row.get("free_percent"),
            approximate: row.get("approximate"),
            relpages: row.get("relpages"),
        },
        fillfactor: row.get("fillfactor"),
        block_size: row.get("block_size"),
        captured_at: row.get("stats_timestamp"),
    }
}

/// [`BloatStore`] writing to PostgreSQL. Records accumulate in one open
/// transaction until a batch commit.
pub struct PgBloatStore {
    pool: Pool<Postgres>,
    schema: Option<String>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgBloatStore {
    pub fn new(pool: Pool<Postgres>, schema: Option<String>) -> Self {
        Self {
            pool,
            schema,
            tx: None,
        }
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self
                .pool
                .begin()
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: "BEGIN".into(),
                    source,
                })?,
        };
        Ok(self.tx.insert(tx))
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: "COMMIT".into(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Drops and recreates the statistics tables and view.
    pub async fn create_tables(&mut self) -> Result<()> {
        let statements = create_statements(self.schema.as_deref());
        let tx = self.transaction().await?;
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut **tx)
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: statement.clone(),
                    source,
                })?;
        }
        self.commit().await?;

        info!(
            "Created statistics tables {} and {}",
            Partition::Tables.table_name(),
            Partition::Indexes.table_name()
        );
        Ok(())
    }
}

#[async_trait]
impl BloatStore for PgBloatStore {
    async fn missing_table(&mut self) -> Result<Option<String>> {
        const QUERY: &str = "SELECT pg_catalog.to_regclass($1) IS NOT NULL";

        for partition in [Partition::Tables, Partition::Indexes] {
            let table = qualify(self.schema.as_deref(), partition.table_name());
            let exists = query_scalar::<_, bool>(QUERY)
                .bind(&table)
                .fetch_one(&self.pool)
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: QUERY.into(),
                    source,
                })?;
            if !exists {
                return Ok(Some(table));
            }
        }
        Ok(None)
    }

    async fn begin_scan(&mut self, partitions: &[Partition]) -> Result<()> {
        let tables: Vec<String> = partitions
            .iter()
            .map(|p| qualify(self.schema.as_deref(), p.table_name()))
            .collect();
        let query = format!("TRUNCATE {}", tables.join(", "));

        let tx = self.transaction().await?;
        sqlx::query(&query)
            .execute(&mut **tx)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })?;
        self.commit().await?;

        debug!("Cleared {}", tables.join(", "));
        Ok(())
    }

    async fn remove_objects(&mut self, oids: &[i64]) -> Result<()> {
        let queries: Vec<String> = [Partition::Tables, Partition::Indexes]
            .iter()
            .map(|p| {
                format!(
                    "DELETE FROM {} WHERE oid = ANY($1::bigint[])",
                    qualify(self.schema.as_deref(), p.table_name())
                )
            })
            .collect();

        let tx = self.transaction().await?;
        for query in &queries {
            sqlx::query(query)
                .bind(oids)
                .execute(&mut **tx)
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: query.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn record(&mut self, record: &PersistedRecord) -> Result<()> {
        let query = insert_statement(self.schema.as_deref(), record.kind.partition());
        let tx = self.transaction().await?;

        sqlx::query(&query)
            .bind(record.oid)
            .bind(&record.schema)
            .bind(&record.name)
            .bind(record.kind.as_str())
            .bind(record.owning_table.to_string())
            .bind(record.stats.size_bytes)
            .bind(record.stats.live_tuple_count)
            .bind(record.stats.live_tuple_percent)
            .bind(record.stats.dead_tuple_count)
            .bind(record.stats.dead_tuple_size_bytes)
            .bind(record.stats.dead_tuple_percent)
            .bind(record.stats.free_space_bytes)
            .bind(record.stats.free_percent)
            .bind(record.stats.approximate)
            .bind(record.stats.relpages)
            .bind(record.fillfactor)
            .bind(record.block_size)
            .execute(&mut **tx)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })?;
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<()> {
        self.commit().await
    }

    async fn finalize(&mut self) -> Result<()> {
        self.commit().await
    }

    async fn load(&mut self, partitions: &[Partition]) -> Result<Vec<PersistedRecord>> {
        let mut records = Vec::new();
        for partition in partitions {
            let query = select_statement(self.schema.as_deref(), *partition);
            let rows = sqlx::query(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|source| CheckerError::QueryError {
                    query: query.clone(),
                    source,
                })?;
            records.extend(rows.iter().map(record_from_row));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanTarget;
    use crate::testing::MemoryStore;

    fn record(oid: i64) -> PersistedRecord {
        let target = ScanTarget {
            oid,
            schema: "public".into(),
            name: format!("t{oid}"),
            kind: ObjectKind::Table,
            fillfactor: 100.0,
            owner: QualifiedName::new("public", format!("t{oid}")),
        };
        PersistedRecord::new(&target, RawStats::default(), 8192)
    }

    #[tokio::test]
    async fn writer_commits_at_rate() {
        let mut store = MemoryStore::new();
        let mut writer = BatchWriter::new(&mut store, 3);
        for oid in 1..=7 {
            writer.record(record(oid)).await.unwrap();
        }
        let batches = writer.finalize().await.unwrap();

        assert_eq!(batches, 3);
        assert_eq!(store.commits, 2);
        assert_eq!(store.finalized, 1);
        assert_eq!(store.rows(Partition::Tables).len(), 7);
    }

    #[tokio::test]
    async fn writer_with_nothing_pending_reports_no_extra_batch() {
        let mut store = MemoryStore::new();
        let writer = BatchWriter::new(&mut store, 3);
        assert_eq!(writer.finalize().await.unwrap(), 0);
        assert_eq!(store.finalized, 1);
    }

    #[test]
    fn statements_honour_target_schema() {
        let ddl = create_statements(Some("monitoring"));
        assert_eq!(ddl[0], "DROP VIEW IF EXISTS \"monitoring\".\"bloat_stats\"");
        assert!(ddl[3].starts_with("CREATE TABLE \"monitoring\".\"bloat_tables\" ("));
        assert_eq!(
            ddl[4],
            "CREATE TABLE \"monitoring\".\"bloat_indexes\" (LIKE \"monitoring\".\"bloat_tables\" INCLUDING ALL)"
        );
        assert!(ddl[5].contains("UNION ALL"));

        let insert = insert_statement(None, Partition::Indexes);
        assert!(insert.starts_with("INSERT INTO \"bloat_indexes\" (oid, schemaname"));
        assert!(insert.ends_with("$16, $17)"));
    }

    #[test]
    fn table_definition_carries_every_persisted_column() {
        let ddl = create_statements(None);
        for column in COLUMNS.split(',').map(str::trim) {
            assert!(ddl[3].contains(&format!("    {column} ")), "missing {column}");
        }
        assert!(ddl[3].contains("stats_timestamp timestamptz DEFAULT now()"));
    }

    #[test]
    fn select_formats_capture_time() {
        let select = select_statement(None, Partition::Tables);
        assert!(select.contains("to_char(stats_timestamp"));
        assert!(select.ends_with("FROM \"bloat_tables\""));
    }
}
