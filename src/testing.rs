//! In-memory stand-ins for the server and the statistics tables.

use crate::analysis::catalog::{CatalogEntry, CatalogFilter, CatalogRequest};
use crate::analysis::rebuild::IndexDetails;
use crate::checker::CheckerError;
use crate::models::{Partition, PersistedRecord, QualifiedName, RawStats};
use crate::source::{ExtensionInfo, StatsSource};
use crate::store::BloatStore;
use async_trait::async_trait;
use std::collections::HashSet;

type Result<T, E = CheckerError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct FakeObject {
    oid: i64,
    schema: String,
    name: String,
    relkind: &'static str,
    is_primary: bool,
    access_method: Option<String>,
    owner: QualifiedName,
    toast_oid: Option<i64>,
    reloptions: Option<Vec<String>>,
    stats: Option<RawStats>,
    details: Option<IndexDetails>,
}

impl FakeObject {
    fn new(oid: i64, schema: &str, name: &str, relkind: &'static str, owner: QualifiedName) -> Self {
        Self {
            oid,
            schema: schema.into(),
            name: name.into(),
            relkind,
            is_primary: false,
            access_method: None,
            owner,
            toast_oid: None,
            reloptions: None,
            stats: None,
            details: None,
        }
    }

    pub fn table(oid: i64, schema: &str, name: &str) -> Self {
        Self::new(oid, schema, name, "r", QualifiedName::new(schema, name))
    }

    pub fn materialized_view(oid: i64, schema: &str, name: &str) -> Self {
        Self::new(oid, schema, name, "m", QualifiedName::new(schema, name))
    }

    pub fn index(oid: i64, schema: &str, name: &str, owner: &str) -> Self {
        let mut object = Self::new(oid, schema, name, "i", owner_name(owner));
        object.access_method = Some("btree".into());
        object
    }

    pub fn toast_table(oid: i64, name: &str, owner: &str) -> Self {
        Self::new(oid, "pg_toast", name, "t", owner_name(owner))
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn method(mut self, access_method: &str) -> Self {
        self.access_method = Some(access_method.into());
        self
    }

    pub fn toast(mut self, toast_oid: i64) -> Self {
        self.toast_oid = Some(toast_oid);
        self
    }

    pub fn fillfactor(mut self, fillfactor: u32) -> Self {
        self.reloptions = Some(vec![format!("fillfactor={fillfactor}")]);
        self
    }

    /// Occupancy with one page per 8kB of size.
    pub fn stats(mut self, size: i64, dead_bytes: i64, free_bytes: i64) -> Self {
        let percent = |bytes: i64| {
            if size == 0 {
                0.0
            } else {
                bytes as f64 * 100.0 / size as f64
            }
        };
        let live_bytes = size - dead_bytes - free_bytes;
        self.stats = Some(RawStats {
            size_bytes: size,
            live_tuple_count: live_bytes / 100,
            live_tuple_percent: percent(live_bytes),
            dead_tuple_count: dead_bytes / 100,
            dead_tuple_size_bytes: dead_bytes,
            dead_tuple_percent: percent(dead_bytes),
            free_space_bytes: free_bytes,
            free_percent: percent(free_bytes),
            approximate: false,
            relpages: size / 8192,
        });
        self
    }

    pub fn details(mut self, details: IndexDetails) -> Self {
        self.details = Some(details);
        self
    }

    fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(self.schema.clone(), self.name.clone())
    }

    fn is_index(&self) -> bool {
        self.relkind == "i"
    }

    fn is_heap(&self) -> bool {
        matches!(self.relkind, "r" | "m")
    }

    fn entry(&self) -> CatalogEntry {
        CatalogEntry {
            oid: self.oid,
            relkind: self.relkind.into(),
            relname: self.name.clone(),
            nspname: self.schema.clone(),
            is_primary: self.is_primary,
            reloptions: self.reloptions.clone(),
            access_method: self.access_method.clone(),
            owner: self.owner.clone(),
        }
    }
}

fn owner_name(owner: &str) -> QualifiedName {
    QualifiedName::parse(owner).unwrap_or_else(|| QualifiedName::new("public", owner))
}

fn vanished(query: &str) -> CheckerError {
    CheckerError::QueryError {
        query: query.into(),
        source: sqlx::Error::RowNotFound,
    }
}

/// Scripted catalog. Objects never change unless a test drops them.
#[derive(Debug)]
pub struct FakeSource {
    objects: Vec<FakeObject>,
    extension: Option<ExtensionInfo>,
    dropped: HashSet<i64>,
    drop_on_sample: HashSet<i64>,
    pub block_size: i64,
    pub in_recovery: bool,
    pub server_version: i64,
    pub analyzed: Vec<QualifiedName>,
    pub sampled: Vec<i64>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            extension: Some(ExtensionInfo {
                version: "1.5".into(),
                schema: "public".into(),
            }),
            dropped: HashSet::new(),
            drop_on_sample: HashSet::new(),
            block_size: 8192,
            in_recovery: false,
            server_version: 160_000,
            analyzed: Vec::new(),
            sampled: Vec::new(),
        }
    }

    pub fn with(mut self, object: FakeObject) -> Self {
        self.objects.push(object);
        self
    }

    pub fn without_extension(mut self) -> Self {
        self.extension = None;
        self
    }

    pub fn extension_version(mut self, version: &str) -> Self {
        if let Some(extension) = self.extension.as_mut() {
            extension.version = version.into();
        }
        self
    }

    /// Drops the object between enumeration and sampling.
    pub fn drop_before_sampling(&mut self, oid: i64) {
        self.dropped.insert(oid);
    }

    /// Makes sampling fail as if the object was dropped concurrently.
    pub fn drop_during_sampling(&mut self, oid: i64) {
        self.drop_on_sample.insert(oid);
    }

    fn find(&self, oid: i64) -> Option<&FakeObject> {
        self.objects
            .iter()
            .find(|o| o.oid == oid && !self.dropped.contains(&oid))
    }

    fn named_selection(&self, oid: i64) -> Vec<&FakeObject> {
        let Some(named) = self.find(oid) else {
            return Vec::new();
        };
        if named.is_index() {
            self.objects
                .iter()
                .filter(|o| o.oid == oid || (o.is_heap() && o.qualified_name() == named.owner))
                .collect()
        } else {
            let table = named.qualified_name();
            self.objects
                .iter()
                .filter(|o| o.oid == oid || (o.is_index() && o.owner == table))
                .collect()
        }
    }
}

#[async_trait]
impl StatsSource for FakeSource {
    async fn server_version_num(&mut self) -> Result<i64> {
        Ok(self.server_version)
    }

    async fn block_size(&mut self) -> Result<i64> {
        Ok(self.block_size)
    }

    async fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(self.in_recovery)
    }

    async fn pgstattuple_extension(&mut self) -> Result<Option<ExtensionInfo>> {
        Ok(self.extension.clone())
    }

    async fn resolve_object(&mut self, name: &QualifiedName) -> Result<Option<i64>> {
        Ok(self
            .objects
            .iter()
            .find(|o| o.qualified_name() == *name && !self.dropped.contains(&o.oid))
            .map(|o| o.oid))
    }

    async fn candidates(&mut self, request: &CatalogRequest) -> Result<Vec<CatalogEntry>> {
        let selected: Vec<&FakeObject> = match &request.filter {
            CatalogFilter::Object(oid) => self.named_selection(*oid),
            filter => self
                .objects
                .iter()
                .filter(|o| match filter {
                    CatalogFilter::Include(schemas) => schemas.contains(&o.schema),
                    CatalogFilter::Exclude(schemas) => !schemas.contains(&o.schema),
                    _ => true,
                })
                .collect(),
        };

        let mut entries: Vec<CatalogEntry> = selected
            .into_iter()
            .filter(|o| o.relkind != "t")
            .filter(|o| {
                let partition = if o.is_index() {
                    Partition::Indexes
                } else {
                    Partition::Tables
                };
                request.mode.partitions().contains(&partition)
            })
            .map(FakeObject::entry)
            .collect();
        entries.sort_by(|a, b| (&a.nspname, &a.relname).cmp(&(&b.nspname, &b.relname)));
        Ok(entries)
    }

    async fn toast_table(&mut self, table_oid: i64) -> Result<Option<CatalogEntry>> {
        let toast = self
            .find(table_oid)
            .and_then(|table| table.toast_oid)
            .and_then(|oid| self.find(oid))
            .map(FakeObject::entry);
        Ok(toast)
    }

    async fn object_exists(&mut self, oid: i64) -> Result<bool> {
        Ok(self.find(oid).is_some())
    }

    async fn analyze(&mut self, table: &QualifiedName) -> Result<()> {
        self.analyzed.push(table.clone());
        Ok(())
    }

    async fn stattuple(&mut self, oid: i64, approximate: bool) -> Result<Option<RawStats>> {
        if self.drop_on_sample.contains(&oid) {
            self.dropped.insert(oid);
            return Err(vanished("pgstattuple"));
        }
        self.sampled.push(oid);
        Ok(self.find(oid).and_then(|o| o.stats.clone()).map(|mut stats| {
            stats.approximate = approximate;
            stats
        }))
    }

    async fn index_details(&mut self, oid: i64) -> Result<Option<IndexDetails>> {
        Ok(self.find(oid).and_then(|o| o.details.clone()))
    }
}

/// Statistics tables held in memory, with counters for every transaction
/// boundary the engine asks for.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Vec<PersistedRecord>,
    indexes: Vec<PersistedRecord>,
    schema_missing: bool,
    pub cleared: Vec<Vec<Partition>>,
    pub removed: Vec<Vec<i64>>,
    pub commits: usize,
    pub finalized: usize,
    /// Sorted contents of both partitions at every finalize
    pub snapshots: Vec<Vec<PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_schema() -> Self {
        Self {
            schema_missing: true,
            ..Self::default()
        }
    }

    pub fn with_records(records: Vec<PersistedRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.partition_mut(record.kind.partition()).push(record);
        }
        store
    }

    pub fn rows(&self, partition: Partition) -> Vec<PersistedRecord> {
        match partition {
            Partition::Tables => self.tables.clone(),
            Partition::Indexes => self.indexes.clone(),
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut Vec<PersistedRecord> {
        match partition {
            Partition::Tables => &mut self.tables,
            Partition::Indexes => &mut self.indexes,
        }
    }
}

#[async_trait]
impl BloatStore for MemoryStore {
    async fn missing_table(&mut self) -> Result<Option<String>> {
        Ok(self
            .schema_missing
            .then(|| Partition::Tables.table_name().to_string()))
    }

    async fn begin_scan(&mut self, partitions: &[Partition]) -> Result<()> {
        for partition in partitions {
            self.partition_mut(*partition).clear();
        }
        self.cleared.push(partitions.to_vec());
        Ok(())
    }

    async fn remove_objects(&mut self, oids: &[i64]) -> Result<()> {
        self.tables.retain(|r| !oids.contains(&r.oid));
        self.indexes.retain(|r| !oids.contains(&r.oid));
        self.removed.push(oids.to_vec());
        Ok(())
    }

    async fn record(&mut self, record: &PersistedRecord) -> Result<()> {
        self.partition_mut(record.kind.partition())
            .push(record.clone());
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.finalized += 1;
        let mut snapshot: Vec<PersistedRecord> =
            self.tables.iter().chain(&self.indexes).cloned().collect();
        snapshot.sort_by_key(|r| r.oid);
        self.snapshots.push(snapshot);
        Ok(())
    }

    async fn load(&mut self, partitions: &[Partition]) -> Result<Vec<PersistedRecord>> {
        Ok(partitions.iter().flat_map(|p| self.rows(*p)).collect())
    }
}
