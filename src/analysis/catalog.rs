use crate::analysis::scan::{ScanError, UnknownObjectSnafu};
use crate::config::{ScanMode, ScanOptions, ScanScope, SchemaFilter};
use crate::models::{ObjectKind, QualifiedName, ScanTarget};
use crate::source::StatsSource;
use itertools::Itertools;
use snafu::OptionExt;
use tracing::debug;

/// Index access methods pgstattuple can walk tuple by tuple.
pub const SUPPORTED_INDEX_METHODS: &[&str] = &["btree", "hash", "gist"];

/// `indislive` exists from 9.3 on.
const INDISLIVE_MIN_VERSION: i64 = 90_300;

/// Raw catalog row describing a candidate relation.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub oid: i64,
    pub relkind: String,
    pub relname: String,
    pub nspname: String,
    pub is_primary: bool,
    pub reloptions: Option<Vec<String>>,
    /// Only set for indexes
    pub access_method: Option<String>,
    pub owner: QualifiedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogFilter {
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
    /// A table or index oid; selects it together with its table or indexes
    Object(i64),
}

impl CatalogFilter {
    pub fn schemas(&self) -> Option<&[String]> {
        match self {
            CatalogFilter::Include(schemas) | CatalogFilter::Exclude(schemas) => Some(schemas),
            _ => None,
        }
    }

    pub fn object(&self) -> Option<i64> {
        match self {
            CatalogFilter::Object(oid) => Some(*oid),
            _ => None,
        }
    }
}

/// Shape of a candidate query. The statement text depends only on this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub mode: ScanMode,
    pub filter: CatalogFilter,
    pub live_indexes_only: bool,
}

const TABLES_SELECT: &str = r#"
    SELECT c.oid::bigint AS oid,
           c.relkind::text AS relkind,
           c.relname::text AS relname,
           n.nspname::text AS nspname,
           false AS indisprimary,
           c.reloptions,
           NULL::text AS amname,
           n.nspname::text AS owner_schema,
           c.relname::text AS owner_name
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON c.relnamespace = n.oid
    WHERE c.relkind IN ('r', 'm')
      AND c.relpersistence <> 't'"#;

const INDEXES_SELECT: &str = r#"
    SELECT c.oid::bigint AS oid,
           c.relkind::text AS relkind,
           c.relname::text AS relname,
           n.nspname::text AS nspname,
           i.indisprimary,
           c.reloptions,
           a.amname::text AS amname,
           tn.nspname::text AS owner_schema,
           t.relname::text AS owner_name
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON c.relnamespace = n.oid
    JOIN pg_catalog.pg_index i ON c.oid = i.indexrelid
    JOIN pg_catalog.pg_class t ON t.oid = i.indrelid
    JOIN pg_catalog.pg_namespace tn ON t.relnamespace = tn.oid
    JOIN pg_catalog.pg_am a ON c.relam = a.oid
    WHERE c.relkind = 'i'
      AND c.relpersistence <> 't'"#;

/// Builds the candidate statement. Schema lists bind as `$1::text[]`, a named
/// object binds its oid as `$1`.
pub(crate) fn candidate_query(request: &CatalogRequest) -> String {
    let (tables_filter, indexes_filter) = match &request.filter {
        CatalogFilter::All => (String::new(), String::new()),
        CatalogFilter::Include(_) => (
            "\n      AND n.nspname = ANY($1::text[])".to_string(),
            "\n      AND n.nspname = ANY($1::text[])".to_string(),
        ),
        CatalogFilter::Exclude(_) => (
            "\n      AND n.nspname <> ALL($1::text[])".to_string(),
            "\n      AND n.nspname <> ALL($1::text[])".to_string(),
        ),
        CatalogFilter::Object(_) => (
            "\n      AND c.oid = COALESCE((SELECT indrelid FROM pg_catalog.pg_index WHERE indexrelid = $1::oid), $1::oid)"
                .to_string(),
            "\n      AND (i.indexrelid = $1::oid OR i.indrelid = $1::oid)".to_string(),
        ),
    };

    let live = if request.live_indexes_only {
        "\n      AND i.indislive"
    } else {
        ""
    };

    let tables = format!("{TABLES_SELECT}{tables_filter}");
    let indexes = format!("{INDEXES_SELECT}{live}{indexes_filter}");

    let body = match request.mode {
        ScanMode::Tables => tables,
        ScanMode::Indexes => indexes,
        ScanMode::Both => format!("{tables}\n    UNION ALL{indexes}"),
    };

    format!("{body}\n    ORDER BY nspname, relname")
}

/// Fillfactor from a relation's storage options, or the kind's default.
pub fn resolve_fillfactor(kind: ObjectKind, reloptions: Option<&[String]>) -> f64 {
    reloptions
        .into_iter()
        .flatten()
        .filter_map(|option| option.split_once('='))
        .find(|(key, _)| key.trim() == "fillfactor")
        .and_then(|(_, value)| value.trim().parse::<f64>().ok())
        .filter(|ff| (10.0..=100.0).contains(ff))
        .unwrap_or_else(|| kind.default_fillfactor())
}

fn to_target(entry: &CatalogEntry) -> Option<ScanTarget> {
    let kind = ObjectKind::from_relkind(&entry.relkind, entry.is_primary)?;
    Some(ScanTarget {
        oid: entry.oid,
        schema: entry.nspname.clone(),
        name: entry.relname.clone(),
        kind,
        fillfactor: resolve_fillfactor(kind, entry.reloptions.as_deref()),
        owner: entry.owner.clone(),
    })
}

fn index_method_supported(entry: &CatalogEntry) -> bool {
    entry
        .access_method
        .as_deref()
        .map_or(true, |am| SUPPORTED_INDEX_METHODS.contains(&am))
}

/// Produces the ordered candidate list for one scan pass.
///
/// A named object always brings its table or indexes along regardless of the
/// configured mode. Every heap candidate is followed by its toast table when
/// it has one.
pub async fn enumerate<S: StatsSource>(
    source: &mut S,
    options: &ScanOptions,
) -> Result<Vec<ScanTarget>, ScanError> {
    let live_indexes_only = source.server_version_num().await? >= INDISLIVE_MIN_VERSION;

    let (mode, filter) = match &options.scope {
        ScanScope::Object(name) => {
            let oid = source
                .resolve_object(name)
                .await?
                .context(UnknownObjectSnafu { name: name.to_string() })?;
            (ScanMode::Both, CatalogFilter::Object(oid))
        }
        ScanScope::Schemas(SchemaFilter::All) => (options.mode, CatalogFilter::All),
        ScanScope::Schemas(SchemaFilter::Include(schemas)) => {
            (options.mode, CatalogFilter::Include(schemas.clone()))
        }
        ScanScope::Schemas(SchemaFilter::Exclude(schemas)) => {
            (options.mode, CatalogFilter::Exclude(schemas.clone()))
        }
    };

    let request = CatalogRequest {
        mode,
        filter,
        live_indexes_only,
    };
    let entries = source.candidates(&request).await?;

    let mut targets = Vec::with_capacity(entries.len());
    for entry in entries {
        if !index_method_supported(&entry) {
            debug!(
                "Skipping {}.{}: access method {} cannot be sampled",
                entry.nspname,
                entry.relname,
                entry.access_method.as_deref().unwrap_or_default()
            );
            continue;
        }

        let Some(target) = to_target(&entry) else {
            debug!(
                "Skipping {}.{}: unexpected relkind {}",
                entry.nspname, entry.relname, entry.relkind
            );
            continue;
        };

        let probe_toast = target.kind.is_heap();
        let table_oid = target.oid;
        targets.push(target);

        if probe_toast {
            if let Some(toast) = source.toast_table(table_oid).await? {
                if let Some(toast_target) = to_target(&toast) {
                    targets.push(toast_target);
                }
            }
        }
    }

    debug!(
        "Enumerated {} candidates: {}",
        targets.len(),
        targets
            .iter()
            .map(|t| format!("{}.{} ({})", t.schema, t.name, t.kind))
            .join(", ")
    );

    Ok(targets)
}

/// Re-checks that a candidate was not dropped since enumeration.
pub async fn still_exists<S: StatsSource>(
    source: &mut S,
    target: &ScanTarget,
) -> Result<bool, ScanError> {
    let exists = source.object_exists(target.oid).await?;
    if !exists {
        debug!(
            "{}.{} was dropped since enumeration, skipping",
            target.schema, target.name
        );
    }
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeObject, FakeSource};
    use rstest::rstest;

    fn request(mode: ScanMode, filter: CatalogFilter) -> CatalogRequest {
        CatalogRequest {
            mode,
            filter,
            live_indexes_only: true,
        }
    }

    #[test]
    fn tables_query_has_no_index_part() {
        let sql = candidate_query(&request(ScanMode::Tables, CatalogFilter::All));
        assert!(sql.contains("relkind IN ('r', 'm')"));
        assert!(!sql.contains("pg_index"));
        assert!(!sql.contains("$1"));
    }

    #[test]
    fn both_query_unions_tables_and_indexes() {
        let sql = candidate_query(&request(
            ScanMode::Both,
            CatalogFilter::Include(vec!["sales".into()]),
        ));
        assert!(sql.contains("UNION ALL"));
        assert_eq!(sql.matches("n.nspname = ANY($1::text[])").count(), 2);
        assert!(sql.contains("AND i.indislive"));
        assert!(sql.trim_end().ends_with("ORDER BY nspname, relname"));
    }

    #[test]
    fn exclusion_filter_uses_all() {
        let sql = candidate_query(&request(
            ScanMode::Indexes,
            CatalogFilter::Exclude(vec!["archive".into()]),
        ));
        assert!(sql.contains("n.nspname <> ALL($1::text[])"));
        assert!(!sql.contains("relkind IN ('r', 'm')"));
    }

    #[test]
    fn liveness_check_is_version_dependent() {
        let mut req = request(ScanMode::Indexes, CatalogFilter::All);
        req.live_indexes_only = false;
        assert!(!candidate_query(&req).contains("indislive"));
    }

    #[test]
    fn named_object_query_selects_table_and_indexes() {
        let sql = candidate_query(&request(ScanMode::Both, CatalogFilter::Object(42)));
        assert!(sql.contains("i.indexrelid = $1::oid OR i.indrelid = $1::oid"));
        assert!(sql.contains("WHERE indexrelid = $1::oid), $1::oid)"));
        assert!(!sql.contains("text[]"));
    }

    #[rstest]
    #[case(ObjectKind::Table, None, 100.0)]
    #[case(ObjectKind::Index, None, 90.0)]
    #[case(ObjectKind::PrimaryKeyIndex, Some(vec!["fillfactor=70".to_string()]), 70.0)]
    #[case(ObjectKind::Table, Some(vec!["autovacuum_enabled=false".to_string(), "fillfactor=80".to_string()]), 80.0)]
    #[case(ObjectKind::Table, Some(vec!["fillfactor=abc".to_string()]), 100.0)]
    #[case(ObjectKind::Index, Some(vec!["fillfactor=5".to_string()]), 90.0)]
    fn fillfactor_resolution(
        #[case] kind: ObjectKind,
        #[case] reloptions: Option<Vec<String>>,
        #[case] expected: f64,
    ) {
        assert_eq!(resolve_fillfactor(kind, reloptions.as_deref()), expected);
    }

    #[tokio::test]
    async fn drops_unsupported_index_methods_silently() {
        let mut source = FakeSource::new()
            .with(FakeObject::table(1, "public", "docs"))
            .with(FakeObject::index(2, "public", "docs_pkey", "public.docs").primary())
            .with(FakeObject::index(3, "public", "docs_body_gin", "public.docs").method("gin"))
            .with(FakeObject::index(4, "public", "docs_ts_brin", "public.docs").method("brin"));

        let targets = enumerate(&mut source, &ScanOptions::default()).await.unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "docs_pkey"]);
        assert_eq!(targets[1].kind, ObjectKind::PrimaryKeyIndex);
        assert_eq!(targets[1].fillfactor, 90.0);
    }

    #[tokio::test]
    async fn storage_options_set_fillfactor() {
        let mut source = FakeSource::new()
            .with(FakeObject::table(1, "public", "hot").fillfactor(70))
            .with(FakeObject::materialized_view(2, "public", "rollup"))
            .with(FakeObject::index(3, "public", "hot_idx", "public.hot").fillfactor(50));

        let targets = enumerate(&mut source, &ScanOptions::default()).await.unwrap();
        let by_name = |name: &str| targets.iter().find(|t| t.name == name).unwrap();
        assert_eq!(by_name("hot").fillfactor, 70.0);
        assert_eq!(by_name("hot_idx").fillfactor, 50.0);
        assert_eq!(by_name("rollup").kind, ObjectKind::MaterializedView);
        assert_eq!(by_name("rollup").fillfactor, 100.0);
    }

    #[tokio::test]
    async fn toast_tables_follow_their_owner() {
        let mut source = FakeSource::new()
            .with(FakeObject::table(1, "public", "docs").toast(10))
            .with(FakeObject::toast_table(10, "pg_toast_1", "public.docs"))
            .with(FakeObject::table(2, "public", "tags"));

        let options = ScanOptions {
            mode: ScanMode::Tables,
            ..ScanOptions::default()
        };
        let targets = enumerate(&mut source, &options).await.unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "pg_toast_1", "tags"]);
        assert_eq!(targets[1].kind, ObjectKind::ToastTable);
        assert_eq!(targets[1].owner, QualifiedName::new("public", "docs"));
    }

    #[tokio::test]
    async fn schema_filters_apply_to_toast_through_owner() {
        let mut source = FakeSource::new()
            .with(FakeObject::table(1, "public", "docs").toast(10))
            .with(FakeObject::toast_table(10, "pg_toast_1", "public.docs"))
            .with(FakeObject::table(2, "sales", "orders"));

        let options = ScanOptions {
            scope: ScanScope::Schemas(SchemaFilter::Include(vec!["sales".into()])),
            ..ScanOptions::default()
        };
        let targets = enumerate(&mut source, &options).await.unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders"]);
    }

    #[tokio::test]
    async fn named_index_brings_its_table() {
        let mut source = FakeSource::new()
            .with(FakeObject::table(1, "public", "orders"))
            .with(FakeObject::index(2, "public", "orders_pkey", "public.orders").primary())
            .with(FakeObject::index(3, "public", "orders_status_idx", "public.orders"));

        let options = ScanOptions {
            mode: ScanMode::Tables,
            scope: ScanScope::Object(QualifiedName::new("public", "orders_pkey")),
            ..ScanOptions::default()
        };
        let targets = enumerate(&mut source, &options).await.unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "orders_pkey"]);
    }

    #[tokio::test]
    async fn unknown_named_object_is_fatal() {
        let mut source = FakeSource::new().with(FakeObject::table(1, "public", "orders"));
        let options = ScanOptions {
            scope: ScanScope::Object(QualifiedName::new("public", "missing")),
            ..ScanOptions::default()
        };
        let err = enumerate(&mut source, &options).await.unwrap_err();
        assert!(matches!(err, ScanError::UnknownObject { .. }));
    }
}
