//! Statistics source: everything the engine asks of the server.

use crate::analysis::catalog::{candidate_query, CatalogEntry, CatalogRequest};
use crate::analysis::rebuild::IndexDetails;
use crate::analysis::sampler::stattuple_query;
use crate::checker::CheckerError;
use crate::models::{QualifiedName, RawStats};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{query_scalar, Pool, Postgres, Row};
use tracing::debug;

type Result<T, E = CheckerError> = std::result::Result<T, E>;

/// Installed pgstattuple extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub version: String,
    pub schema: String,
}

/// Catalog and statistics capabilities consumed by the scan, report and
/// rebuild paths.
#[async_trait]
pub trait StatsSource: Send {
    async fn server_version_num(&mut self) -> Result<i64>;

    /// Page size the server was built with.
    async fn block_size(&mut self) -> Result<i64>;

    async fn is_in_recovery(&mut self) -> Result<bool>;

    async fn pgstattuple_extension(&mut self) -> Result<Option<ExtensionInfo>>;

    /// Oid of an existing relation, `None` when it does not exist.
    async fn resolve_object(&mut self, name: &QualifiedName) -> Result<Option<i64>>;

    async fn candidates(&mut self, request: &CatalogRequest) -> Result<Vec<CatalogEntry>>;

    /// Auxiliary large-value storage of a table, if it has one.
    async fn toast_table(&mut self, table_oid: i64) -> Result<Option<CatalogEntry>>;

    async fn object_exists(&mut self, oid: i64) -> Result<bool>;

    /// Refreshes planner statistics (and `relpages`) of a table.
    async fn analyze(&mut self, table: &QualifiedName) -> Result<()>;

    /// Tuple-level statistics; `None` when the server returns no row.
    async fn stattuple(&mut self, oid: i64, approximate: bool) -> Result<Option<RawStats>>;

    async fn index_details(&mut self, oid: i64) -> Result<Option<IndexDetails>>;
}

/// [`StatsSource`] backed by a PostgreSQL pool.
pub struct PgStatsSource {
    pool: Pool<Postgres>,
    pgstattuple_schema: Option<String>,
}

impl PgStatsSource {
    pub fn new(pool: Pool<Postgres>, pgstattuple_schema: Option<String>) -> Self {
        Self {
            pool,
            pgstattuple_schema,
        }
    }

    async fn setting(&self, name: &str) -> Result<i64> {
        let query = format!("SELECT current_setting('{name}')::bigint");
        query_scalar::<_, i64>(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })
    }
}

fn catalog_entry(row: &PgRow) -> CatalogEntry {
    CatalogEntry {
        oid: row.get("oid"),
        relkind: row.get("relkind"),
        relname: row.get("relname"),
        nspname: row.get("nspname"),
        is_primary: row.get("indisprimary"),
        reloptions: row.get("reloptions"),
        access_method: row.get("amname"),
        owner: QualifiedName::new(
            row.get::<String, _>("owner_schema"),
            row.get::<String, _>("owner_name"),
        ),
    }
}

#[async_trait]
impl StatsSource for PgStatsSource {
    async fn server_version_num(&mut self) -> Result<i64> {
        self.setting("server_version_num").await
    }

    async fn block_size(&mut self) -> Result<i64> {
        self.setting("block_size").await
    }

    async fn is_in_recovery(&mut self) -> Result<bool> {
        const QUERY: &str = "SELECT pg_catalog.pg_is_in_recovery()";

        query_scalar::<_, bool>(QUERY)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })
    }

    async fn pgstattuple_extension(&mut self) -> Result<Option<ExtensionInfo>> {
        const QUERY: &str = r#"
            SELECT e.extversion, n.nspname::text AS nspname
            FROM pg_catalog.pg_extension e
            JOIN pg_catalog.pg_namespace n ON e.extnamespace = n.oid
            WHERE e.extname = 'pgstattuple'
        "#;

        let row = sqlx::query(QUERY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })?;

        Ok(row.map(|row| ExtensionInfo {
            version: row.get("extversion"),
            schema: row.get("nspname"),
        }))
    }

    async fn resolve_object(&mut self, name: &QualifiedName) -> Result<Option<i64>> {
        const QUERY: &str = "SELECT pg_catalog.to_regclass($1)::oid::bigint";

        query_scalar::<_, Option<i64>>(QUERY)
            .bind(name.quoted())
            .fetch_one(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })
    }

    async fn candidates(&mut self, request: &CatalogRequest) -> Result<Vec<CatalogEntry>> {
        let query = candidate_query(request);
        debug!("candidate query: {}", query);

        let mut statement = sqlx::query(&query);
        if let Some(schemas) = request.filter.schemas() {
            statement = statement.bind(schemas.to_vec());
        } else if let Some(oid) = request.filter.object() {
            statement = statement.bind(oid);
        }

        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })?;

        Ok(rows.iter().map(catalog_entry).collect())
    }

    async fn toast_table(&mut self, table_oid: i64) -> Result<Option<CatalogEntry>> {
        const QUERY: &str = r#"
            SELECT c.oid::bigint AS oid,
                   c.relkind::text AS relkind,
                   c.relname::text AS relname,
                   n.nspname::text AS nspname,
                   false AS indisprimary,
                   c.reloptions,
                   NULL::text AS amname,
                   tn.nspname::text AS owner_schema,
                   t.relname::text AS owner_name
            FROM pg_catalog.pg_class t
            JOIN pg_catalog.pg_namespace tn ON t.relnamespace = tn.oid
            JOIN pg_catalog.pg_class c ON c.oid = t.reltoastrelid
            JOIN pg_catalog.pg_namespace n ON c.relnamespace = n.oid
            WHERE t.oid = $1::oid
              AND t.reltoastrelid <> 0
              AND c.relpersistence <> 't'
        "#;

        let row = sqlx::query(QUERY)
            .bind(table_oid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })?;

        Ok(row.as_ref().map(catalog_entry))
    }

    async fn object_exists(&mut self, oid: i64) -> Result<bool> {
        const QUERY: &str =
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class WHERE oid = $1::oid)";

        query_scalar::<_, bool>(QUERY)
            .bind(oid)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })
    }

    async fn analyze(&mut self, table: &QualifiedName) -> Result<()> {
        let query = format!("ANALYZE {}", table.quoted());
        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })?;
        Ok(())
    }

    async fn stattuple(&mut self, oid: i64, approximate: bool) -> Result<Option<RawStats>> {
        let query = stattuple_query(approximate, self.pgstattuple_schema.as_deref());

        let row = sqlx::query(&query)
            .bind(oid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: query.clone(),
                source,
            })?;

        Ok(row.map(|row| RawStats {
            size_bytes: row.get("table_len"),
            live_tuple_count: row.get("tuple_count"),
            live_tuple_percent: row.get("tuple_percent"),
            dead_tuple_count: row.get("dead_tuple_count"),
            dead_tuple_size_bytes: row.get("dead_tuple_len"),
            dead_tuple_percent: row.get("dead_tuple_percent"),
            free_space_bytes: row.get("free_space"),
            free_percent: row.get("free_percent"),
            approximate,
            relpages: row.get("relpages"),
        }))
    }

    async fn index_details(&mut self, oid: i64) -> Result<Option<IndexDetails>> {
        const QUERY: &str = r#"
            SELECT n.nspname::text AS table_schema,
                   t.relname::text AS table_name,
                   ts.spcname::text AS tablespace,
                   pg_catalog.pg_get_indexdef(i.indexrelid) AS definition,
                   pg_catalog.pg_get_expr(i.indpred, i.indrelid) AS predicate,
                   i.indisclustered,
                   con.conname::text AS constraint_name
            FROM pg_catalog.pg_index i
            JOIN pg_catalog.pg_class t ON t.oid = i.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
            LEFT JOIN pg_catalog.pg_tablespace ts ON ts.oid = ic.reltablespace
            LEFT JOIN pg_catalog.pg_constraint con
                   ON con.conindid = i.indexrelid AND con.contype IN ('p', 'u', 'x')
            WHERE i.indexrelid = $1::oid
        "#;

        let row = sqlx::query(QUERY)
            .bind(oid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| CheckerError::QueryError {
                query: QUERY.into(),
                source,
            })?;

        Ok(row.map(|row| IndexDetails {
            table: QualifiedName::new(
                row.get::<String, _>("table_schema"),
                row.get::<String, _>("table_name"),
            ),
            tablespace: row.get("tablespace"),
            definition: row.get("definition"),
            predicate: row.get("predicate"),
            is_clustered: row.get("indisclustered"),
            constraint: row.get("constraint_name"),
        }))
    }
}
