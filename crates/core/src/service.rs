use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;

use crate::collaborators::{BatchContext, ErrorReport, ErrorSink, IdGenerator};
use crate::enrichment::{Clock, Enrichment, EnrichmentError};
use crate::entity::{BatchRequest, Entity, IdField, RequestInfo};
use crate::error::{codes, EntityError, ErrorMap};
use crate::orchestrator::{partition, validate_batch, Rejected};
use crate::repository::{
    post_filter, topic_name, EntityStore, RepositoryError, SearchCriteria, SearchRequest,
    SearchResponse, DEFAULT_SEARCH_LIMIT,
};
use crate::validator::{select_validators, Operation, Validator};
use crate::validators::DeleteRowVersionPolicy;

pub const DEFAULT_MAX_SEARCH_LIMIT: u32 = 1000;

/// A rejected entity as reported to a synchronous caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEntity {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<String>,
    pub errors: Vec<EntityError>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Non-bulk call with at least one rejected entity; nothing was persisted.
    #[error("{operation:?} rejected {} of the submitted entities", .rejected.len())]
    Rejected {
        operation: Operation,
        rejected: Vec<RejectedEntity>,
    },
    #[error("search failed: {0}")]
    Search(#[from] RepositoryError),
    #[error("search request must name a tenant")]
    MissingTenant,
    #[error("pipeline returned no entity for a single-item request")]
    EmptyResult,
}

impl ServiceError {
    /// Every error code carried by a rejection, in entity order.
    pub fn codes(&self) -> Vec<&str> {
        match self {
            Self::Rejected { rejected, .. } => rejected
                .iter()
                .flat_map(|entity| entity.errors.iter().map(|error| error.code.as_str()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

enum PipelineFailure {
    Enrichment(EnrichmentError),
    Persistence(RepositoryError),
}

impl PipelineFailure {
    fn to_entity_error(&self) -> EntityError {
        match self {
            Self::Enrichment(err) => err.to_entity_error(),
            Self::Persistence(err @ RepositoryError::Conflict { .. }) => {
                EntityError::recoverable(codes::MISMATCHED_ROW_VERSION, err.to_string())
            }
            Self::Persistence(err) => {
                EntityError::recoverable(codes::PERSISTENCE_ERROR, err.to_string())
            }
        }
    }
}

/// Create/update/delete/search facade for one entity type.
///
/// Mutations run selector → orchestrator → enrichment → `save`. With
/// `is_bulk = false` any rejected entity fails the whole call and nothing is
/// persisted; with `is_bulk = true` rejections go to the error sink and the
/// remaining entities proceed. Enrichment and persistence failures are
/// attached to every attempted entity and follow the same policy.
pub struct EntityService<E: Entity> {
    validators: Vec<Box<dyn Validator<E>>>,
    enrichment: Enrichment<E>,
    store: Arc<dyn EntityStore<E>>,
    error_sink: Arc<dyn ErrorSink>,
    max_search_limit: u32,
}

impl<E: Entity> EntityService<E> {
    pub fn new(
        store: Arc<dyn EntityStore<E>>,
        id_generator: Arc<dyn IdGenerator>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            validators: Vec::new(),
            enrichment: Enrichment::new(id_generator, store.clone()),
            store,
            error_sink,
            max_search_limit: DEFAULT_MAX_SEARCH_LIMIT,
        }
    }

    /// Registers the ordered validator set; selection happens per call.
    pub fn with_validators(mut self, validators: Vec<Box<dyn Validator<E>>>) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.enrichment = self.enrichment.with_clock(clock);
        self
    }

    pub fn with_delete_row_version(mut self, policy: DeleteRowVersionPolicy) -> Self {
        self.enrichment = self.enrichment.with_delete_row_version(policy);
        self
    }

    pub fn with_enrichment(mut self, enrichment: Enrichment<E>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_max_search_limit(mut self, limit: u32) -> Self {
        self.max_search_limit = limit.max(1);
        self
    }

    pub fn validator_names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    pub async fn create(
        &self,
        request: BatchRequest<E>,
        is_bulk: bool,
    ) -> Result<Vec<E>, ServiceError> {
        self.process(Operation::Create, request, is_bulk).await
    }

    pub async fn update(
        &self,
        request: BatchRequest<E>,
        is_bulk: bool,
    ) -> Result<Vec<E>, ServiceError> {
        self.process(Operation::Update, request, is_bulk).await
    }

    pub async fn delete(
        &self,
        request: BatchRequest<E>,
        is_bulk: bool,
    ) -> Result<Vec<E>, ServiceError> {
        self.process(Operation::Delete, request, is_bulk).await
    }

    pub async fn create_one(&self, request_info: RequestInfo, entity: E) -> Result<E, ServiceError> {
        single(self.create(BatchRequest::single(request_info, entity), false).await)
    }

    pub async fn update_one(&self, request_info: RequestInfo, entity: E) -> Result<E, ServiceError> {
        single(self.update(BatchRequest::single(request_info, entity), false).await)
    }

    pub async fn delete_one(&self, request_info: RequestInfo, entity: E) -> Result<E, ServiceError> {
        single(self.delete(BatchRequest::single(request_info, entity), false).await)
    }

    /// Id-only criteria take the by-id path; anything else goes to `find`.
    /// Both paths are post-filtered on tenant, deletion and change time.
    pub async fn search(
        &self,
        mut request: SearchRequest<E::Criteria>,
    ) -> Result<SearchResponse<E>, ServiceError> {
        if request.tenant_id.trim().is_empty() {
            return Err(ServiceError::MissingTenant);
        }
        if request.limit == 0 {
            request.limit = DEFAULT_SEARCH_LIMIT;
        }
        request.limit = request.limit.min(self.max_search_limit);

        if let Some((field, ids)) = request.criteria.id_only() {
            counter!("repository_search_total", "entity_type" => E::ENTITY_TYPE, "path" => "by_id")
                .increment(1);
            let found = self
                .store
                .find_by_id(&request.tenant_id, ids, field, request.include_deleted)
                .await?;
            let entities = post_filter(
                found,
                Some(&request.tenant_id),
                request.include_deleted,
                request.last_changed_since,
            );
            return Ok(SearchResponse {
                total_count: entities.len() as u64,
                entities,
            });
        }

        counter!("repository_search_total", "entity_type" => E::ENTITY_TYPE, "path" => "criteria")
            .increment(1);
        let response = self.store.find(&request).await?;
        let entities = post_filter(
            response.entities,
            Some(&request.tenant_id),
            request.include_deleted,
            request.last_changed_since,
        );
        Ok(SearchResponse {
            total_count: response.total_count,
            entities,
        })
    }

    pub async fn find_by_id(
        &self,
        tenant_id: &str,
        ids: &[String],
        field: IdField,
        include_deleted: bool,
    ) -> Result<Vec<E>, ServiceError> {
        let found = self
            .store
            .find_by_id(tenant_id, ids, field, include_deleted)
            .await?;
        Ok(post_filter(found, Some(tenant_id), include_deleted, None))
    }

    pub async fn put_in_cache(&self, entities: &[E]) {
        self.store.put_in_cache(entities).await;
    }

    async fn process(
        &self,
        operation: Operation,
        request: BatchRequest<E>,
        is_bulk: bool,
    ) -> Result<Vec<E>, ServiceError> {
        let started = Instant::now();
        let submitted = request.len();
        tracing::info!(
            stage = "pipeline",
            entity_type = E::ENTITY_TYPE,
            operation = operation.as_str(),
            is_bulk,
            count = submitted,
            "processing batch"
        );

        let applicable = select_validators(&self.validators, operation);
        let errors = match validate_batch(&request, &applicable).await {
            Ok(errors) => errors,
            Err(fault) => {
                tracing::error!(
                    stage = "validation",
                    entity_type = E::ENTITY_TYPE,
                    operation = operation.as_str(),
                    error = %fault,
                    "validation aborted"
                );
                ErrorMap::for_all(
                    submitted,
                    EntityError::non_recoverable(codes::VALIDATION_ERROR, fault.to_string()),
                )
            }
        };

        let BatchRequest {
            request_info,
            entities,
        } = request;
        let result = partition(entities, errors);
        self.count(operation, "valid", result.valid.len());
        self.count(operation, "rejected", result.rejected.len());

        if result.has_errors() {
            self.handle_errors(operation, &request_info, result.rejected, is_bulk)
                .await?;
        }

        let mut valid = result.valid;
        let outcome = if valid.is_empty() {
            Ok(Vec::new())
        } else {
            self.enrich_and_save(operation, &request_info, &mut valid).await
        };

        let persisted = match outcome {
            Ok(saved) => saved,
            Err(failure) => {
                let error = failure.to_entity_error();
                tracing::error!(
                    stage = "persistence",
                    entity_type = E::ENTITY_TYPE,
                    operation = operation.as_str(),
                    code = %error.code,
                    error = %error.message,
                    count = valid.len(),
                    "batch failed after validation"
                );
                self.count(operation, "failed", valid.len());
                let attempted = valid
                    .into_iter()
                    .zip(result.valid_indices)
                    .map(|(entity, index)| Rejected {
                        index,
                        entity,
                        errors: vec![error.clone()],
                    })
                    .collect();
                self.handle_errors(operation, &request_info, attempted, is_bulk)
                    .await?;
                Vec::new()
            }
        };

        self.count(operation, "persisted", persisted.len());
        histogram!(
            "pipeline_batch_seconds",
            "entity_type" => E::ENTITY_TYPE,
            "operation" => operation.as_str()
        )
        .record(started.elapsed().as_secs_f64());
        tracing::info!(
            stage = "pipeline",
            entity_type = E::ENTITY_TYPE,
            operation = operation.as_str(),
            submitted,
            persisted = persisted.len(),
            "batch processed"
        );
        Ok(persisted)
    }

    async fn enrich_and_save(
        &self,
        operation: Operation,
        request_info: &RequestInfo,
        valid: &mut Vec<E>,
    ) -> Result<Vec<E>, PipelineFailure> {
        let to_save = match operation {
            Operation::Create => {
                self.enrichment
                    .create(valid, request_info)
                    .await
                    .map_err(PipelineFailure::Enrichment)?;
                valid.clone()
            }
            Operation::Update => {
                self.enrichment
                    .update(valid, request_info)
                    .await
                    .map_err(PipelineFailure::Enrichment)?;
                valid.clone()
            }
            Operation::Delete => self
                .enrichment
                .delete(valid, request_info)
                .await
                .map_err(PipelineFailure::Enrichment)?,
        };

        let topic = topic_name(operation, E::ENTITY_TYPE);
        self.store
            .save(&to_save, &topic)
            .await
            .map_err(PipelineFailure::Persistence)?;
        tracing::debug!(
            stage = "persistence",
            entity_type = E::ENTITY_TYPE,
            topic = %topic,
            count = to_save.len(),
            "batch saved and published"
        );
        Ok(to_save)
    }

    async fn handle_errors(
        &self,
        operation: Operation,
        request_info: &RequestInfo,
        rejected: Vec<Rejected<E>>,
        is_bulk: bool,
    ) -> Result<(), ServiceError> {
        for error in rejected.iter().flat_map(|r| r.errors.iter()) {
            counter!(
                "pipeline_validation_errors_total",
                "entity_type" => E::ENTITY_TYPE,
                "code" => error.code.clone()
            )
            .increment(1);
        }

        if !is_bulk {
            tracing::warn!(
                stage = "errors",
                entity_type = E::ENTITY_TYPE,
                operation = operation.as_str(),
                rejected = rejected.len(),
                "rejecting non-bulk request"
            );
            return Err(ServiceError::Rejected {
                operation,
                rejected: rejected
                    .into_iter()
                    .map(|r| RejectedEntity {
                        index: r.index,
                        id: r.entity.id().map(str::to_string),
                        client_reference_id: r.entity.client_reference_id().map(str::to_string),
                        errors: r.errors,
                    })
                    .collect(),
            });
        }

        let context = BatchContext {
            entity_type: E::ENTITY_TYPE,
            operation,
            request_info: request_info.clone(),
        };
        let fallback_tenant = request_info.user_info.tenant_id.clone().unwrap_or_default();
        let reports = rejected
            .into_iter()
            .map(|r| ErrorReport {
                index: r.index,
                id: r.entity.id().map(str::to_string),
                client_reference_id: r.entity.client_reference_id().map(str::to_string),
                tenant_id: Some(r.entity.tenant_id())
                    .filter(|tenant| !tenant.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback_tenant.clone()),
                payload: serde_json::to_value(&r.entity).unwrap_or_default(),
                errors: r.errors,
            })
            .collect();
        self.error_sink.report(&context, reports).await;
        Ok(())
    }

    fn count(&self, operation: Operation, outcome: &'static str, n: usize) {
        if n == 0 {
            return;
        }
        counter!(
            "pipeline_entities_total",
            "entity_type" => E::ENTITY_TYPE,
            "operation" => operation.as_str(),
            "outcome" => outcome
        )
        .increment(n as u64);
    }
}

fn single<E>(result: Result<Vec<E>, ServiceError>) -> Result<E, ServiceError> {
    result?.into_iter().next().ok_or(ServiceError::EmptyResult)
}
