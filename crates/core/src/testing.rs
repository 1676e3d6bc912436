//! In-memory collaborators for exercising the pipeline without I/O.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::collaborators::{
    BatchContext, ErrorReport, ErrorSink, IdGenError, IdGenerator, IdPoolLookup, IdRecord,
    LookupError, ReferenceLookup,
};
use crate::enrichment::Clock;
use crate::entity::{AuditDetails, Entity, IdField, RequestInfo};
use crate::repository::{
    post_filter, EntityStore, RepositoryError, SearchCriteria, SearchRequest, SearchResponse,
};

/// Marks an entity as if it had gone through a create: version 1 with an audit stamp.
pub fn persisted<E: Entity>(mut entity: E) -> E {
    let meta = entity.meta_mut();
    if meta.row_version == 0 {
        meta.row_version = 1;
    }
    if meta.audit_details.is_none() {
        meta.audit_details = Some(AuditDetails::for_create("seed", 1_000));
    }
    entity
}

pub fn fixed_clock(epoch_ms: i64) -> Clock {
    Arc::new(move || {
        Utc.timestamp_millis_opt(epoch_ms)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

/// Observable calls made against an [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Save { topic: String, count: usize },
    FindById { field: IdField, ids: Vec<String> },
    Find,
    PutInCache { count: usize },
}

/// Entity store backed by a vector. Saves upsert by id.
pub struct InMemoryStore<E> {
    rows: Mutex<Vec<E>>,
    calls: Mutex<Vec<StoreCall>>,
    published: Mutex<Vec<(String, Vec<E>)>>,
    fail_saves: AtomicBool,
    fail_reads: AtomicBool,
}

impl<E: Entity> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            fail_saves: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }
}

impl<E: Entity> InMemoryStore<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, entities: Vec<E>) {
        self.rows.lock().expect("rows lock").extend(entities);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<E> {
        self.rows.lock().expect("rows lock").clone()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    /// Events published by `save`, as `(topic, batch)`.
    pub fn published(&self) -> Vec<(String, Vec<E>)> {
        self.published.lock().expect("published lock").clone()
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn check_reads(&self) -> Result<(), RepositoryError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query("store is unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> EntityStore<E> for InMemoryStore<E> {
    async fn save(&self, entities: &[E], topic: &str) -> Result<(), RepositoryError> {
        self.record(StoreCall::Save {
            topic: topic.to_string(),
            count: entities.len(),
        });
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Persistence("store is unavailable".into()));
        }

        let mut rows = self.rows.lock().expect("rows lock");
        for entity in entities {
            let stored = rows
                .iter()
                .find(|row| row.id().is_some() && row.id() == entity.id())
                .map(|row| row.row_version())
                .unwrap_or(0);
            if stored != entity.row_version() - 1 {
                return Err(RepositoryError::Conflict {
                    entity_type: E::ENTITY_TYPE,
                    id: entity.id().unwrap_or_default().to_string(),
                    expected: entity.row_version() - 1,
                });
            }
        }
        for entity in entities {
            match rows.iter_mut().find(|row| row.id().is_some() && row.id() == entity.id()) {
                Some(existing) => *existing = entity.clone(),
                None => rows.push(entity.clone()),
            }
        }
        self.published
            .lock()
            .expect("published lock")
            .push((topic.to_string(), entities.to_vec()));
        Ok(())
    }

    async fn find_by_id(
        &self,
        tenant_id: &str,
        ids: &[String],
        field: IdField,
        include_deleted: bool,
    ) -> Result<Vec<E>, RepositoryError> {
        self.record(StoreCall::FindById {
            field,
            ids: ids.to_vec(),
        });
        self.check_reads()?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let rows = self.rows.lock().expect("rows lock");
        Ok(rows
            .iter()
            .filter(|row| row.tenant_id() == tenant_id)
            .filter(|row| include_deleted || !row.is_deleted())
            .filter(|row| field.value_of(*row).is_some_and(|value| wanted.contains(value)))
            .cloned()
            .collect())
    }

    async fn find(
        &self,
        request: &SearchRequest<E::Criteria>,
    ) -> Result<SearchResponse<E>, RepositoryError> {
        self.record(StoreCall::Find);
        self.check_reads()?;

        let criteria = &request.criteria;
        let filters = criteria.field_filters();
        let rows = self.rows.lock().expect("rows lock").clone();
        let mut matching: Vec<E> = post_filter(
            rows,
            Some(&request.tenant_id),
            request.include_deleted,
            request.last_changed_since,
        )
        .into_iter()
        .filter(|row| criteria.ids().map_or(true, |ids| row.id().is_some_and(|id| ids.iter().any(|v| v == id))))
        .filter(|row| {
            criteria.client_reference_ids().map_or(true, |ids| {
                row.client_reference_id()
                    .is_some_and(|id| ids.iter().any(|v| v == id))
            })
        })
        .filter(|row| {
            let payload = serde_json::to_value(row).unwrap_or_default();
            filters.iter().all(|filter| filter.matches(&payload))
        })
        .collect();
        matching.sort_by(|a, b| a.id().cmp(&b.id()));

        let total_count = matching.len() as u64;
        let entities = matching
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .collect();
        Ok(SearchResponse {
            total_count,
            entities,
        })
    }

    async fn put_in_cache(&self, entities: &[E]) {
        self.record(StoreCall::PutInCache {
            count: entities.len(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdGenCall {
    pub tenant_id: String,
    pub format_key: String,
    pub count: usize,
}

/// Issues `{prefix}-1`, `{prefix}-2`, … across calls.
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicUsize,
    short_by: AtomicUsize,
    fail: AtomicBool,
    calls: Mutex<Vec<IdGenCall>>,
}

impl SequentialIdGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicUsize::new(1),
            short_by: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Makes every call return `n` fewer ids than requested.
    pub fn short_by(&self, n: usize) {
        self.short_by.store(n, Ordering::SeqCst);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<IdGenCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl IdGenerator for SequentialIdGenerator {
    async fn get_id_list(
        &self,
        _request_info: &RequestInfo,
        tenant_id: &str,
        format_key: &str,
        _prefix: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>, IdGenError> {
        self.calls.lock().expect("calls lock").push(IdGenCall {
            tenant_id: tenant_id.to_string(),
            format_key: format_key.to_string(),
            count,
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(IdGenError::Transport("connection refused".into()));
        }
        let issued = count.saturating_sub(self.short_by.load(Ordering::SeqCst));
        Ok((0..issued)
            .map(|_| {
                let n = self.next.fetch_add(1, Ordering::SeqCst);
                format!("{}-{n}", self.prefix)
            })
            .collect())
    }
}

/// Reference lookup over a fixed set of known ids.
pub struct StaticReferenceLookup {
    known: HashSet<String>,
    failing_tenants: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl StaticReferenceLookup {
    pub fn new<'a>(known: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            known: known.into_iter().map(str::to_string).collect(),
            failing_tenants: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for_tenant(&self, tenant_id: &str) {
        self.failing_tenants
            .lock()
            .expect("tenants lock")
            .insert(tenant_id.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ReferenceLookup for StaticReferenceLookup {
    async fn fetch_by_ids(
        &self,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, LookupError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((tenant_id.to_string(), ids.to_vec()));
        if self
            .failing_tenants
            .lock()
            .expect("tenants lock")
            .contains(tenant_id)
        {
            return Err(LookupError::Transport("timed out".into()));
        }
        Ok(ids
            .iter()
            .filter(|id| self.known.contains(*id))
            .cloned()
            .collect())
    }
}

/// Id pool holding a fixed list of records.
pub struct StaticIdPool {
    records: Vec<IdRecord>,
    calls: AtomicUsize,
}

impl StaticIdPool {
    pub fn new(records: Vec<IdRecord>) -> Self {
        Self {
            records,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdPoolLookup for StaticIdPool {
    async fn search_id_records(
        &self,
        _request_info: &RequestInfo,
        _tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<IdRecord>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .filter(|record| ids.contains(&record.id))
            .cloned()
            .collect())
    }
}

/// Error sink that keeps every report for later assertions.
#[derive(Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(BatchContext, Vec<ErrorReport>)>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(BatchContext, Vec<ErrorReport>)> {
        self.reports.lock().expect("reports lock").clone()
    }

    /// All reported entries across batches.
    pub fn entries(&self) -> Vec<ErrorReport> {
        self.reports()
            .into_iter()
            .flat_map(|(_, reports)| reports)
            .collect()
    }
}

#[async_trait]
impl ErrorSink for RecordingErrorSink {
    async fn report(&self, context: &BatchContext, reports: Vec<ErrorReport>) {
        self.reports
            .lock()
            .expect("reports lock")
            .push((context.clone(), reports));
    }
}
