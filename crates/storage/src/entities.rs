use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};

use hcm_core::entity::{Entity, IdField};
use hcm_core::repository::{
    EntityStore, FieldFilter, FilterValue, RepositoryError, SearchCriteria, SearchRequest,
    SearchResponse,
};

use crate::cache::EntityCache;
use crate::outbox::{NewOutboxEvent, OutboxRepository};

/// SQLite-backed [`EntityStore`] for one entity type.
///
/// Rows live in the shared `entities` table keyed by `(entity_type, id)` with
/// the full entity as JSON. Saves upsert every row and append one outbox event
/// in the same transaction, then refresh the cache. An upsert only lands on the
/// row version directly below its own, so a racing stale write rolls back.
pub struct EntityRepository<E: Entity> {
    pool: SqlitePool,
    outbox: OutboxRepository,
    cache: Arc<EntityCache<E>>,
}

impl<E: Entity> Clone for EntityRepository<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            outbox: self.outbox.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<E: Entity> EntityRepository<E> {
    pub(crate) fn new(pool: SqlitePool, cache_ttl: Duration) -> Self {
        Self {
            outbox: OutboxRepository::new(pool.clone()),
            pool,
            cache: Arc::new(EntityCache::new(cache_ttl)),
        }
    }

    pub fn cache(&self) -> &EntityCache<E> {
        &self.cache
    }

    // Always reads deleted rows too so the cache holds the latest version.
    async fn fetch_by_field(
        &self,
        tenant_id: &str,
        values: &[String],
        field: IdField,
    ) -> Result<Vec<E>, RepositoryError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT payload_json FROM entities WHERE entity_type = ");
        builder.push_bind(E::ENTITY_TYPE);
        builder.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        push_in(&mut builder, id_column(field), values);
        builder.push(" ORDER BY id ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl<E: Entity> EntityStore<E> for EntityRepository<E> {
    async fn save(&self, entities: &[E], topic: &str) -> Result<(), RepositoryError> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(persistence_error)?;
        for entity in entities {
            let id = entity.id().ok_or_else(|| {
                RepositoryError::Persistence(format!(
                    "{} without an id cannot be saved",
                    E::ENTITY_TYPE
                ))
            })?;
            let payload_json = serde_json::to_string(entity).map_err(payload_error)?;
            let result = sqlx::query(
                "INSERT INTO entities \
                 (entity_type, id, client_reference_id, tenant_id, is_deleted, row_version, last_modified_time, payload_json) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(entity_type, id) DO UPDATE SET \
                 client_reference_id = excluded.client_reference_id, \
                 tenant_id = excluded.tenant_id, \
                 is_deleted = excluded.is_deleted, \
                 row_version = excluded.row_version, \
                 last_modified_time = excluded.last_modified_time, \
                 payload_json = excluded.payload_json \
                 WHERE entities.row_version = excluded.row_version - 1",
            )
            .bind(E::ENTITY_TYPE)
            .bind(id)
            .bind(entity.client_reference_id())
            .bind(entity.tenant_id())
            .bind(entity.is_deleted())
            .bind(entity.row_version())
            .bind(entity.last_modified_time())
            .bind(payload_json)
            .execute(&mut *tx)
            .await
            .map_err(persistence_error)?;
            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(persistence_error)?;
                tracing::warn!(
                    stage = "persistence",
                    entity_type = E::ENTITY_TYPE,
                    id,
                    row_version = entity.row_version(),
                    "stale write rejected"
                );
                return Err(RepositoryError::Conflict {
                    entity_type: E::ENTITY_TYPE,
                    id: id.to_string(),
                    expected: entity.row_version() - 1,
                });
            }
        }

        let payload_json = serde_json::to_string(entities).map_err(payload_error)?;
        let seq = self
            .outbox
            .append(
                &mut tx,
                &NewOutboxEvent {
                    topic,
                    entity_type: E::ENTITY_TYPE,
                    entity_count: entities.len(),
                    payload_json: &payload_json,
                    created_at: Utc::now(),
                },
            )
            .await
            .map_err(|err| RepositoryError::Persistence(err.to_string()))?;
        tx.commit().await.map_err(persistence_error)?;

        self.cache.put(entities);
        tracing::debug!(
            stage = "persistence",
            entity_type = E::ENTITY_TYPE,
            topic,
            seq,
            count = entities.len(),
            "entities saved"
        );
        Ok(())
    }

    async fn find_by_id(
        &self,
        tenant_id: &str,
        ids: &[String],
        field: IdField,
        include_deleted: bool,
    ) -> Result<Vec<E>, RepositoryError> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut misses = Vec::new();
        for id in ids.iter().filter(|id| seen.insert(id.as_str())) {
            match self.cache.get(tenant_id, field, id) {
                Some(entity) => found.push(entity),
                None => misses.push(id.clone()),
            }
        }

        if !found.is_empty() {
            counter!("repository_cache_hits_total", "entity_type" => E::ENTITY_TYPE)
                .increment(found.len() as u64);
        }
        if !misses.is_empty() {
            let fetched = self.fetch_by_field(tenant_id, &misses, field).await?;
            self.cache.put(&fetched);
            found.extend(fetched);
        }

        Ok(found
            .into_iter()
            .filter(|entity| include_deleted || !entity.is_deleted())
            .collect())
    }

    async fn find(
        &self,
        request: &SearchRequest<E::Criteria>,
    ) -> Result<SearchResponse<E>, RepositoryError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM entities WHERE ");
        push_conditions(&mut count, E::ENTITY_TYPE, request);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;

        let mut select =
            QueryBuilder::<Sqlite>::new("SELECT payload_json FROM entities WHERE ");
        push_conditions(&mut select, E::ENTITY_TYPE, request);
        select
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(i64::from(request.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(request.offset));

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        let entities = rows.iter().map(decode_row).collect::<Result<Vec<E>, _>>()?;

        Ok(SearchResponse {
            total_count: total.max(0) as u64,
            entities,
        })
    }

    async fn put_in_cache(&self, entities: &[E]) {
        self.cache.put(entities);
    }
}

fn id_column(field: IdField) -> &'static str {
    match field {
        IdField::Id => "id",
        IdField::ClientReferenceId => "client_reference_id",
    }
}

fn push_conditions<C: SearchCriteria>(
    builder: &mut QueryBuilder<'_, Sqlite>,
    entity_type: &'static str,
    request: &SearchRequest<C>,
) {
    builder.push("entity_type = ").push_bind(entity_type);
    builder
        .push(" AND tenant_id = ")
        .push_bind(request.tenant_id.clone());
    if !request.include_deleted {
        builder.push(" AND is_deleted = 0");
    }
    if let Some(since) = request.last_changed_since {
        builder.push(" AND last_modified_time > ").push_bind(since);
    }
    if let Some(ids) = request.criteria.ids() {
        push_in(builder, "id", ids);
    }
    if let Some(ids) = request.criteria.client_reference_ids() {
        push_in(builder, "client_reference_id", ids);
    }
    for filter in request.criteria.field_filters() {
        push_field_filter(builder, &filter);
    }
}

fn push_in(builder: &mut QueryBuilder<'_, Sqlite>, column: &'static str, values: &[String]) {
    builder.push(format!(" AND {column} IN ("));
    let mut list = builder.separated(", ");
    for value in values {
        list.push_bind(value.clone());
    }
    list.push_unseparated(")");
}

// Field paths come from the criteria types, never from request input.
// json_each yields a single row for scalars, so arrays and scalars share one form.
fn push_field_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &FieldFilter) {
    let path = format!("'$.{}'", filter.field);
    match &filter.value {
        FilterValue::AnyOf(values) => {
            builder.push(format!(
                " AND EXISTS (SELECT 1 FROM json_each(entities.payload_json, {path}) AS item WHERE item.value IN ("
            ));
            let mut list = builder.separated(", ");
            for value in values {
                list.push_bind(value.clone());
            }
            list.push_unseparated("))");
        }
        FilterValue::Integer(expected) => {
            builder
                .push(format!(" AND json_extract(entities.payload_json, {path}) = "))
                .push_bind(*expected);
        }
    }
}

fn decode_row<E: Entity>(row: &SqliteRow) -> Result<E, RepositoryError> {
    let payload: String = row.try_get("payload_json").map_err(query_error)?;
    serde_json::from_str(&payload).map_err(payload_error)
}

fn persistence_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Persistence(err.to_string())
}

fn query_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(err.to_string())
}

fn payload_error(err: serde_json::Error) -> RepositoryError {
    RepositoryError::Payload(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_database;
    use hcm_core::domain::{
        Address, ProjectBeneficiary, ProjectBeneficiarySearch, ProjectFacility,
        ProjectFacilitySearch, SideEffect, SideEffectSearch, Task, TaskSearch,
    };
    use hcm_core::entity::{AuditDetails, EntityMeta};

    const TTL: Duration = Duration::from_secs(60);

    fn meta(id: &str, client_ref: &str, tenant: &str, modified: i64) -> EntityMeta {
        EntityMeta {
            id: Some(id.to_string()),
            client_reference_id: Some(client_ref.to_string()),
            tenant_id: tenant.to_string(),
            is_deleted: false,
            row_version: 1,
            audit_details: Some(AuditDetails::for_create("u-1", modified)),
        }
    }

    fn facility(id: &str, tenant: &str, facility_id: &str) -> ProjectFacility {
        ProjectFacility {
            meta: meta(id, &format!("c-{id}"), tenant, 1_000),
            project_id: Some("p-1".into()),
            facility_id: Some(facility_id.into()),
        }
    }

    #[tokio::test]
    async fn save_persists_rows_and_one_outbox_event() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);

        repo.save(
            &[facility("pf-1", "t1", "f-1"), facility("pf-2", "t1", "f-2")],
            "save-project-facility-topic",
        )
        .await
        .expect("save");

        let events = db.outbox().list_after(0, 10).await.expect("outbox");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "save-project-facility-topic");
        assert_eq!(events[0].entity_count, 2);

        let (rows,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entities WHERE entity_type = 'project-facility'")
                .fetch_one(db.pool())
                .await
                .expect("count");
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn save_advances_the_row_version_by_one() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        let mut entity = facility("pf-1", "t1", "f-1");
        repo.save(&[entity.clone()], "save-project-facility-topic")
            .await
            .expect("save");

        entity.facility_id = Some("f-9".into());
        entity.meta.row_version = 2;
        repo.save(&[entity], "update-project-facility-topic")
            .await
            .expect("update");

        let fresh = db.entities::<ProjectFacility>(TTL);
        let found = fresh
            .find_by_id("t1", &["pf-1".into()], IdField::Id, false)
            .await
            .expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].facility_id.as_deref(), Some("f-9"));
        assert_eq!(found[0].meta.row_version, 2);
    }

    #[tokio::test]
    async fn save_rejects_stale_row_version() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        let mut entity = facility("pf-1", "t1", "f-1");
        repo.save(&[entity.clone()], "save-project-facility-topic")
            .await
            .expect("save");
        entity.meta.row_version = 2;
        let mut winner = entity.clone();
        winner.facility_id = Some("f-2".into());
        repo.save(&[winner], "update-project-facility-topic")
            .await
            .expect("first update");

        let mut loser = entity;
        loser.facility_id = Some("f-3".into());
        let err = repo
            .save(
                &[facility("pf-2", "t1", "f-4"), loser],
                "update-project-facility-topic",
            )
            .await
            .unwrap_err();
        match err {
            RepositoryError::Conflict { id, expected, .. } => {
                assert_eq!(id, "pf-1");
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(db.outbox().list_after(0, 10).await.expect("outbox").len(), 2);
        let found = db
            .entities::<ProjectFacility>(Duration::ZERO)
            .find_by_id(
                "t1",
                &["pf-1".to_string(), "pf-2".to_string()],
                IdField::Id,
                true,
            )
            .await
            .expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].facility_id.as_deref(), Some("f-2"));
        assert_eq!(found[0].meta.row_version, 2);
    }

    #[tokio::test]
    async fn save_rejects_create_over_existing_id() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        repo.save(&[facility("pf-1", "t1", "f-1")], "save-project-facility-topic")
            .await
            .expect("save");

        let err = repo
            .save(&[facility("pf-1", "t1", "f-2")], "save-project-facility-topic")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { expected: 0, .. }));
        let found = repo
            .find_by_id("t1", &["pf-1".into()], IdField::Id, false)
            .await
            .expect("find");
        assert_eq!(found[0].facility_id.as_deref(), Some("f-1"));
    }

    #[tokio::test]
    async fn save_without_id_fails_and_rolls_back() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        let mut missing = facility("pf-2", "t1", "f-2");
        missing.meta.id = None;

        let err = repo
            .save(
                &[facility("pf-1", "t1", "f-1"), missing],
                "save-project-facility-topic",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Persistence(_)));
        assert!(db.outbox().list_after(0, 10).await.expect("outbox").is_empty());
        let found = db
            .entities::<ProjectFacility>(TTL)
            .find_by_id("t1", &["pf-1".into()], IdField::Id, true)
            .await
            .expect("find");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn find_by_id_respects_tenant_and_deletion() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(Duration::ZERO);
        let mut deleted = facility("pf-2", "t1", "f-2");
        deleted.meta.is_deleted = true;
        repo.save(
            &[facility("pf-1", "t1", "f-1"), deleted, facility("pf-3", "t2", "f-3")],
            "save-project-facility-topic",
        )
        .await
        .expect("save");

        let ids = vec!["pf-1".to_string(), "pf-2".into(), "pf-3".into()];
        let visible = repo
            .find_by_id("t1", &ids, IdField::Id, false)
            .await
            .expect("find");
        assert_eq!(visible.len(), 1);

        let all = repo
            .find_by_id("t1", &ids, IdField::Id, true)
            .await
            .expect("find");
        assert_eq!(all.len(), 2);

        let by_ref = repo
            .find_by_id("t2", &["c-pf-3".into()], IdField::ClientReferenceId, false)
            .await
            .expect("find");
        assert_eq!(by_ref[0].meta.id.as_deref(), Some("pf-3"));
    }

    #[tokio::test]
    async fn find_by_id_fills_the_cache() {
        let (_dir, db) = test_database().await;
        let writer = db.entities::<ProjectFacility>(Duration::ZERO);
        writer
            .save(&[facility("pf-1", "t1", "f-1")], "save-project-facility-topic")
            .await
            .expect("save");

        let reader = db.entities::<ProjectFacility>(TTL);
        assert!(reader.cache().is_empty());
        reader
            .find_by_id("t1", &["pf-1".into()], IdField::Id, false)
            .await
            .expect("find");
        assert!(reader
            .cache()
            .get("t1", IdField::ClientReferenceId, "c-pf-1")
            .is_some());
    }

    #[tokio::test]
    async fn find_orders_by_id_and_counts_before_paging() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        let batch: Vec<_> = ["pf-3", "pf-1", "pf-4", "pf-2"]
            .into_iter()
            .map(|id| facility(id, "t1", "f-1"))
            .chain([facility("pf-9", "t1", "f-2")])
            .collect();
        repo.save(&batch, "save-project-facility-topic")
            .await
            .expect("save");

        let mut request = SearchRequest::new(
            ProjectFacilitySearch {
                facility_id: Some(vec!["f-1".into()]),
                ..Default::default()
            },
            "t1",
        );
        request.limit = 2;
        request.offset = 1;
        let response = repo.find(&request).await.expect("find");

        assert_eq!(response.total_count, 4);
        let ids: Vec<_> = response.entities.iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec!["pf-2", "pf-3"]);
    }

    #[tokio::test]
    async fn find_filters_on_change_time() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectFacility>(TTL);
        let mut old = facility("pf-1", "t1", "f-1");
        old.meta.audit_details = Some(AuditDetails::for_create("u-1", 500));
        let mut boundary = facility("pf-2", "t1", "f-1");
        boundary.meta.audit_details = Some(AuditDetails::for_create("u-1", 1_000));
        let mut fresh = facility("pf-3", "t1", "f-1");
        fresh.meta.audit_details = Some(AuditDetails::for_create("u-1", 1_500));
        repo.save(&[old, boundary, fresh], "save-project-facility-topic")
            .await
            .expect("save");

        let mut request = SearchRequest::new(ProjectFacilitySearch::default(), "t1");
        request.last_changed_since = Some(1_000);
        let response = repo.find(&request).await.expect("find");
        let ids: Vec<_> = response.entities.iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec!["pf-3"]);
    }

    #[tokio::test]
    async fn find_matches_nested_and_array_fields() {
        let (_dir, db) = test_database().await;
        let tasks = db.entities::<Task>(TTL);
        tasks
            .save(
                &[
                    Task {
                        meta: meta("task-1", "c-1", "t1", 1_000),
                        address: Some(Address {
                            locality_code: Some("L-1".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Task {
                        meta: meta("task-2", "c-2", "t1", 1_000),
                        ..Default::default()
                    },
                ],
                "save-project-task-topic",
            )
            .await
            .expect("save tasks");
        let by_locality = tasks
            .find(&SearchRequest::new(
                TaskSearch {
                    locality_code: Some(vec!["L-1".into()]),
                    ..Default::default()
                },
                "t1",
            ))
            .await
            .expect("find tasks");
        assert_eq!(by_locality.total_count, 1);
        assert_eq!(by_locality.entities[0].meta.id.as_deref(), Some("task-1"));

        let side_effects = db.entities::<SideEffect>(TTL);
        side_effects
            .save(
                &[SideEffect {
                    meta: meta("se-1", "c-se-1", "t1", 1_000),
                    symptoms: vec!["fever".into(), "rash".into()],
                    ..Default::default()
                }],
                "save-side-effect-topic",
            )
            .await
            .expect("save side effects");
        let by_symptom = side_effects
            .find(&SearchRequest::new(
                SideEffectSearch {
                    symptoms: Some(vec!["rash".into()]),
                    ..Default::default()
                },
                "t1",
            ))
            .await
            .expect("find side effects");
        assert_eq!(by_symptom.total_count, 1);
    }

    #[tokio::test]
    async fn find_matches_integer_fields() {
        let (_dir, db) = test_database().await;
        let repo = db.entities::<ProjectBeneficiary>(TTL);
        repo.save(
            &[ProjectBeneficiary {
                meta: meta("pb-1", "c-1", "t1", 1_000),
                date_of_registration: Some(1_690_000_000_000),
                ..Default::default()
            }],
            "save-project-beneficiary-topic",
        )
        .await
        .expect("save");

        let hit = repo
            .find(&SearchRequest::new(
                ProjectBeneficiarySearch {
                    date_of_registration: Some(1_690_000_000_000),
                    ..Default::default()
                },
                "t1",
            ))
            .await
            .expect("find");
        assert_eq!(hit.total_count, 1);

        let miss = repo
            .find(&SearchRequest::new(
                ProjectBeneficiarySearch {
                    date_of_registration: Some(1),
                    ..Default::default()
                },
                "t1",
            ))
            .await
            .expect("find");
        assert_eq!(miss.total_count, 0);
    }
}
