use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::{IdGenError, IdGenerator};
use crate::entity::{AuditDetails, ChildContext, Entity, IdField, RequestInfo};
use crate::error::{codes, EntityError};
use crate::repository::{EntityStore, RepositoryError};
use crate::validators::DeleteRowVersionPolicy;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type ChildIdSupplier = Arc<dyn Fn() -> String + Send + Sync>;

/// Failures that abort enrichment of the whole batch.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("id generation failed: {0}")]
    IdGeneration(#[from] IdGenError),
    #[error("failed to load stored records: {0}")]
    Fetch(#[from] RepositoryError),
    #[error("stored record {id} disappeared before enrichment")]
    MissingStored { id: String },
    #[error("tenant id is missing for entity at index {index}")]
    MissingTenant { index: usize },
    #[error("{id} is at row version {stored}, request was built on {submitted}")]
    StaleRowVersion {
        id: String,
        submitted: i64,
        stored: i64,
    },
}

impl EnrichmentError {
    /// Structured entry attached to every entity of the failed batch.
    pub fn to_entity_error(&self) -> EntityError {
        match self {
            Self::IdGeneration(_) => EntityError::non_recoverable(codes::IDGEN_ERROR, self.to_string()),
            Self::Fetch(_) => EntityError::recoverable(codes::PERSISTENCE_ERROR, self.to_string()),
            Self::MissingStored { .. } => {
                EntityError::recoverable(codes::NON_EXISTENT_ENTITY, self.to_string())
            }
            Self::MissingTenant { .. } => {
                EntityError::non_recoverable(codes::VALIDATION_ERROR, self.to_string())
            }
            Self::StaleRowVersion { .. } => {
                EntityError::recoverable(codes::MISMATCHED_ROW_VERSION, self.to_string())
            }
        }
    }
}

/// Stamps identity, version and audit metadata on validated entities.
pub struct Enrichment<E: Entity> {
    id_generator: Arc<dyn IdGenerator>,
    store: Arc<dyn EntityStore<E>>,
    clock: Clock,
    child_ids: ChildIdSupplier,
    delete_row_version: DeleteRowVersionPolicy,
}

impl<E: Entity> Clone for Enrichment<E> {
    fn clone(&self) -> Self {
        Self {
            id_generator: self.id_generator.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            child_ids: self.child_ids.clone(),
            delete_row_version: self.delete_row_version,
        }
    }
}

impl<E: Entity> Enrichment<E> {
    pub fn new(id_generator: Arc<dyn IdGenerator>, store: Arc<dyn EntityStore<E>>) -> Self {
        Self {
            id_generator,
            store,
            clock: Arc::new(Utc::now),
            child_ids: Arc::new(|| Uuid::new_v4().to_string()),
            delete_row_version: DeleteRowVersionPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Deletes under [`DeleteRowVersionPolicy::Skip`] tombstone whatever is stored.
    pub fn with_delete_row_version(mut self, policy: DeleteRowVersionPolicy) -> Self {
        self.delete_row_version = policy;
        self
    }

    pub fn with_child_ids(mut self, child_ids: ChildIdSupplier) -> Self {
        self.child_ids = child_ids;
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)().timestamp_millis()
    }

    /// Assigns server ids (one id-generation call per tenant), `rowVersion = 1`,
    /// `isDeleted = false` and a fresh audit stamp.
    pub async fn create(
        &self,
        entities: &mut [E],
        request_info: &RequestInfo,
    ) -> Result<(), EnrichmentError> {
        if entities.is_empty() {
            return Ok(());
        }
        let groups = group_by_tenant(entities, request_info)?;
        let audit = AuditDetails::for_create(request_info.user_id(), self.now_ms());

        for (tenant, indices) in groups {
            let ids = self
                .id_generator
                .get_id_list(request_info, &tenant, E::ID_FORMAT, None, indices.len())
                .await?;
            if ids.len() != indices.len() {
                return Err(IdGenError::CountMismatch {
                    expected: indices.len(),
                    actual: ids.len(),
                }
                .into());
            }

            for (index, id) in indices.into_iter().zip(ids) {
                let entity = &mut entities[index];
                let meta = entity.meta_mut();
                meta.id = Some(id);
                meta.tenant_id = tenant.clone();
                meta.row_version = 1;
                meta.is_deleted = false;
                meta.audit_details = Some(audit.clone());
                self.stamp_children(entity, &audit);
            }
        }

        tracing::debug!(
            stage = "enrichment",
            entity_type = E::ENTITY_TYPE,
            count = entities.len(),
            "enriched entities for create"
        );
        Ok(())
    }

    /// Reconciles each entity with its stored counterpart: missing immutable
    /// fields are copied forward, `rowVersion` becomes stored + 1 and only the
    /// lastModified* audit fields change. A stored version that moved since
    /// validation fails the batch.
    pub async fn update(
        &self,
        entities: &mut [E],
        request_info: &RequestInfo,
    ) -> Result<(), EnrichmentError> {
        if entities.is_empty() {
            return Ok(());
        }
        let stored = self.fetch_stored(entities, request_info).await?;
        let now = self.now_ms();
        let user = request_info.user_id();

        for entity in entities.iter_mut() {
            let id = entity.id().unwrap_or_default().to_string();
            let existing = stored
                .get(&id)
                .ok_or_else(|| EnrichmentError::MissingStored { id: id.clone() })?;

            ensure_current(&id, entity.row_version(), existing)?;

            let audit = touched_audit(existing.audit_details(), user, now);
            let meta = entity.meta_mut();
            if meta
                .client_reference_id
                .as_deref()
                .map_or(true, |value| value.trim().is_empty())
            {
                meta.client_reference_id = existing.meta().client_reference_id.clone();
            }
            if meta.tenant_id.trim().is_empty() {
                meta.tenant_id = existing.tenant_id().to_string();
            }
            meta.row_version = existing.row_version() + 1;
            meta.audit_details = Some(audit.clone());
            self.stamp_children(entity, &audit);
        }

        tracing::debug!(
            stage = "enrichment",
            entity_type = E::ENTITY_TYPE,
            count = entities.len(),
            "enriched entities for update"
        );
        Ok(())
    }

    /// Builds the tombstones for a delete from the stored records: the
    /// submitted payload only selects which records are deleted.
    pub async fn delete(
        &self,
        entities: &[E],
        request_info: &RequestInfo,
    ) -> Result<Vec<E>, EnrichmentError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.fetch_stored(entities, request_info).await?;
        let now = self.now_ms();
        let user = request_info.user_id();

        let mut tombstones = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = entity.id().unwrap_or_default();
            let mut tombstone = stored
                .get(id)
                .cloned()
                .ok_or_else(|| EnrichmentError::MissingStored { id: id.to_string() })?;
            if self.delete_row_version == DeleteRowVersionPolicy::Enforce {
                ensure_current(id, entity.row_version(), &tombstone)?;
            }
            let audit = touched_audit(tombstone.audit_details(), user, now);
            let meta = tombstone.meta_mut();
            meta.is_deleted = true;
            meta.row_version += 1;
            meta.audit_details = Some(audit);
            tombstones.push(tombstone);
        }
        Ok(tombstones)
    }

    async fn fetch_stored(
        &self,
        entities: &[E],
        request_info: &RequestInfo,
    ) -> Result<HashMap<String, E>, EnrichmentError> {
        let groups = group_by_tenant(entities, request_info)?;
        let mut stored = HashMap::new();
        for (tenant, indices) in groups {
            let ids: Vec<String> = indices
                .iter()
                .filter_map(|index| entities[*index].id())
                .map(str::to_string)
                .collect();
            let found = self
                .store
                .find_by_id(&tenant, &ids, IdField::Id, false)
                .await?;
            for entity in found {
                if let Some(id) = entity.id() {
                    stored.insert(id.to_string(), entity.clone());
                }
            }
        }
        Ok(stored)
    }

    fn stamp_children(&self, entity: &mut E, audit: &AuditDetails) {
        let parent_id = entity.id().map(str::to_string);
        let new_id = self.child_ids.as_ref();
        entity.enrich_children(&ChildContext {
            parent_id: parent_id.as_deref(),
            audit,
            new_id,
        });
    }
}

fn ensure_current<E: Entity>(
    id: &str,
    submitted: i64,
    stored: &E,
) -> Result<(), EnrichmentError> {
    if submitted == stored.row_version() {
        return Ok(());
    }
    Err(EnrichmentError::StaleRowVersion {
        id: id.to_string(),
        submitted,
        stored: stored.row_version(),
    })
}

fn touched_audit(existing: Option<&AuditDetails>, user: &str, now_ms: i64) -> AuditDetails {
    match existing {
        Some(audit) => audit.touched(user, now_ms),
        None => AuditDetails::for_create(user, now_ms),
    }
}

// Tenant resolution is a batch precondition: a single entity without a tenant
// (own or request fallback) fails enrichment of the whole batch.
fn group_by_tenant<E: Entity>(
    entities: &[E],
    request_info: &RequestInfo,
) -> Result<BTreeMap<String, Vec<usize>>, EnrichmentError> {
    let fallback = request_info
        .user_info
        .tenant_id
        .as_deref()
        .filter(|value| !value.trim().is_empty());
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, entity) in entities.iter().enumerate() {
        let tenant = Some(entity.tenant_id())
            .filter(|value| !value.trim().is_empty())
            .or(fallback)
            .ok_or(EnrichmentError::MissingTenant { index })?;
        groups.entry(tenant.to_string()).or_default().push(index);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{Task, TaskResource};
    use crate::entity::EntityMeta;
    use crate::testing::{self, fixed_clock, InMemoryStore, SequentialIdGenerator};

    fn new_task(client_ref: &str) -> Task {
        Task {
            meta: EntityMeta {
                client_reference_id: Some(client_ref.to_string()),
                tenant_id: "t1".into(),
                ..Default::default()
            },
            project_id: Some("p-1".into()),
            resources: vec![TaskResource {
                product_variant_id: Some("pv-1".into()),
                quantity: 1.0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn enrichment(
        store: Arc<InMemoryStore<Task>>,
        ids: Arc<SequentialIdGenerator>,
    ) -> Enrichment<Task> {
        Enrichment::<Task>::new(ids, store)
            .with_clock(fixed_clock(1_700_000_000_000))
            .with_child_ids(Arc::new(|| "child".to_string()))
    }

    #[tokio::test]
    async fn create_assigns_ids_versions_and_audit() {
        let store = Arc::new(InMemoryStore::new());
        let ids = Arc::new(SequentialIdGenerator::new("T"));
        let enrichment = enrichment(store, ids.clone());
        let request_info = RequestInfo::for_user("u-1", "t1");

        let mut batch = vec![new_task("c-1"), new_task("c-2")];
        enrichment.create(&mut batch, &request_info).await.expect("create");

        assert_eq!(batch[0].id(), Some("T-1"));
        assert_eq!(batch[1].id(), Some("T-2"));
        for task in &batch {
            assert_eq!(task.row_version(), 1);
            assert!(!task.is_deleted());
            let audit = task.audit_details().expect("audit");
            assert_eq!(audit.created_by, "u-1");
            assert_eq!(audit.created_time, 1_700_000_000_000);
            assert_eq!(audit.last_modified_time, audit.created_time);
        }
        assert_eq!(batch[1].resources[0].task_id.as_deref(), Some("T-2"));
        assert_eq!(batch[1].resources[0].id.as_deref(), Some("child"));

        let calls = ids.calls();
        assert_eq!(calls.len(), 1, "one id generation call for one tenant");
        assert_eq!(calls[0].format_key, "project.task.id");
        assert_eq!(calls[0].count, 2);
    }

    #[tokio::test]
    async fn create_fails_when_id_count_is_short() {
        let store = Arc::new(InMemoryStore::new());
        let ids = Arc::new(SequentialIdGenerator::new("T"));
        ids.short_by(1);
        let enrichment = enrichment(store, ids);

        let mut batch = vec![new_task("c-1"), new_task("c-2")];
        let err = enrichment
            .create(&mut batch, &RequestInfo::for_user("u-1", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnrichmentError::IdGeneration(IdGenError::CountMismatch { expected: 2, actual: 1 })
        ));
        assert_eq!(err.to_entity_error().code, codes::IDGEN_ERROR);
    }

    #[tokio::test]
    async fn update_increments_stored_version_and_keeps_created_stamp() {
        let store = Arc::new(InMemoryStore::new());
        let mut stored = testing::persisted(new_task("c-1"));
        stored.meta.id = Some("T-1".into());
        stored.meta.row_version = 4;
        stored.meta.audit_details = Some(AuditDetails::for_create("u-0", 5));
        store.seed(vec![stored]);
        let enrichment = enrichment(store, Arc::new(SequentialIdGenerator::new("T")));

        let mut incoming = new_task("");
        incoming.meta.id = Some("T-1".into());
        incoming.meta.client_reference_id = None;
        incoming.meta.row_version = 4;
        incoming.status = Some("DELIVERED".into());

        let mut batch = vec![incoming];
        enrichment
            .update(&mut batch, &RequestInfo::for_user("u-1", "t1"))
            .await
            .expect("update");

        let task = &batch[0];
        assert_eq!(task.row_version(), 5);
        assert_eq!(task.client_reference_id(), Some("c-1"));
        assert_eq!(task.status.as_deref(), Some("DELIVERED"));
        let audit = task.audit_details().unwrap();
        assert_eq!(audit.created_by, "u-0");
        assert_eq!(audit.created_time, 5);
        assert_eq!(audit.last_modified_by, "u-1");
        assert_eq!(audit.last_modified_time, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn delete_tombstones_the_stored_record() {
        let store = Arc::new(InMemoryStore::new());
        let mut stored = testing::persisted(new_task("c-1"));
        stored.meta.id = Some("T-1".into());
        stored.meta.row_version = 2;
        store.seed(vec![stored.clone()]);
        let enrichment = enrichment(store, Arc::new(SequentialIdGenerator::new("T")));

        let mut selector = new_task("c-1");
        selector.meta.id = Some("T-1".into());
        selector.meta.row_version = 2;
        selector.project_id = Some("changed".into());

        let tombstones = enrichment
            .delete(&[selector], &RequestInfo::for_user("u-1", "t1"))
            .await
            .expect("delete");
        let tombstone = &tombstones[0];
        assert!(tombstone.is_deleted());
        assert_eq!(tombstone.row_version(), 3);
        assert_eq!(tombstone.project_id.as_deref(), Some("p-1"));
        assert_eq!(tombstone.audit_details().unwrap().last_modified_by, "u-1");
    }

    #[tokio::test]
    async fn fetch_failure_is_batch_fatal() {
        let store = Arc::new(InMemoryStore::<Task>::new());
        store.fail_reads(true);
        let enrichment = enrichment(store, Arc::new(SequentialIdGenerator::new("T")));
        let mut incoming = new_task("c-1");
        incoming.meta.id = Some("T-1".into());

        let err = enrichment
            .update(&mut [incoming], &RequestInfo::for_user("u-1", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichmentError::Fetch(_)));
    }

    fn stored_task(row_version: i64) -> Task {
        let mut stored = testing::persisted(new_task("c-1"));
        stored.meta.id = Some("T-1".into());
        stored.meta.row_version = row_version;
        stored
    }

    #[tokio::test]
    async fn update_built_on_an_older_version_is_stale() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(vec![stored_task(3)]);
        let enrichment = enrichment(store, Arc::new(SequentialIdGenerator::new("T")));

        let mut incoming = new_task("c-1");
        incoming.meta.id = Some("T-1".into());
        incoming.meta.row_version = 2;
        let err = enrichment
            .update(&mut [incoming], &RequestInfo::for_user("u-1", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnrichmentError::StaleRowVersion { submitted: 2, stored: 3, .. }
        ));
        assert_eq!(err.to_entity_error().code, codes::MISMATCHED_ROW_VERSION);
    }

    #[tokio::test]
    async fn delete_version_check_follows_policy() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(vec![stored_task(3)]);
        let mut selector = new_task("c-1");
        selector.meta.id = Some("T-1".into());
        selector.meta.row_version = 1;

        let enforced = enrichment(store.clone(), Arc::new(SequentialIdGenerator::new("T")));
        let err = enforced
            .delete(&[selector.clone()], &RequestInfo::for_user("u-1", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichmentError::StaleRowVersion { .. }));

        let skipped = enrichment(store, Arc::new(SequentialIdGenerator::new("T")))
            .with_delete_row_version(DeleteRowVersionPolicy::Skip);
        let tombstones = skipped
            .delete(&[selector], &RequestInfo::for_user("u-1", "t1"))
            .await
            .expect("delete");
        assert_eq!(tombstones[0].row_version(), 4);
    }
}
