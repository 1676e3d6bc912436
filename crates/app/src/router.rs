use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{OriginalUri, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use hcm_core::repository::{SearchRequest, SearchResponse, DEFAULT_SEARCH_LIMIT};
use hcm_core::{BatchRequest, Entity, EntityService, Operation, RequestInfo};
use hcm_storage::Database;

use crate::problem::ProblemResponse;
use crate::services::Services;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    services: Services,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, services: Services) -> Self {
        Self {
            metrics,
            storage,
            services,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

pub fn app_router(state: AppState) -> Router {
    let services = state.services().clone();
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/beneficiary", entity_routes(services.beneficiaries))
        .nest("/staff", entity_routes(services.staff))
        .nest("/facility", entity_routes(services.facilities))
        .nest("/task", entity_routes(services.tasks))
        .nest("/referral", entity_routes(services.referrals))
        .nest("/side-effect", entity_routes(services.side_effects))
        .with_state(state)
}

/// Single-item, bulk and search endpoints for one entity type.
fn entity_routes<E: Entity, S>(service: Arc<EntityService<E>>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/v1/_create", post(create_one::<E>))
        .route("/v1/_update", post(update_one::<E>))
        .route("/v1/_delete", post(delete_one::<E>))
        .route("/v1/bulk/_create", post(create_bulk::<E>))
        .route("/v1/bulk/_update", post(update_bulk::<E>))
        .route("/v1/bulk/_delete", post(delete_bulk::<E>))
        .route("/v1/_search", post(search::<E>))
        .with_state(service)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct EntityRequest<E> {
    #[serde(rename = "RequestInfo")]
    request_info: RequestInfo,
    entity: E,
}

#[derive(Debug, Deserialize)]
struct BulkRequest<E> {
    #[serde(rename = "RequestInfo")]
    request_info: RequestInfo,
    // A bare `default` would require `E: Default`.
    #[serde(default = "Vec::new")]
    entities: Vec<E>,
}

#[derive(Debug, Deserialize)]
struct SearchBody<C> {
    #[serde(rename = "RequestInfo", default)]
    _request_info: Option<RequestInfo>,
    #[serde(default)]
    criteria: C,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    limit: Option<u32>,
    offset: Option<u32>,
    tenant_id: Option<String>,
    last_changed_since: Option<i64>,
    include_deleted: Option<bool>,
}

#[derive(Debug, Serialize)]
struct EntityResponse<E> {
    entity: E,
}

#[derive(Debug, Serialize)]
struct BulkResponse<E> {
    entities: Vec<E>,
}

type HandlerResult<T> = Result<(StatusCode, Json<T>), ProblemResponse>;

async fn create_one<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<EntityRequest<E>>,
) -> HandlerResult<EntityResponse<E>> {
    mutate_one(&service, Operation::Create, uri.path(), body).await
}

async fn update_one<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<EntityRequest<E>>,
) -> HandlerResult<EntityResponse<E>> {
    mutate_one(&service, Operation::Update, uri.path(), body).await
}

async fn delete_one<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<EntityRequest<E>>,
) -> HandlerResult<EntityResponse<E>> {
    mutate_one(&service, Operation::Delete, uri.path(), body).await
}

async fn create_bulk<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<BulkRequest<E>>,
) -> HandlerResult<BulkResponse<E>> {
    mutate_bulk(&service, Operation::Create, uri.path(), body).await
}

async fn update_bulk<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<BulkRequest<E>>,
) -> HandlerResult<BulkResponse<E>> {
    mutate_bulk(&service, Operation::Update, uri.path(), body).await
}

async fn delete_bulk<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<BulkRequest<E>>,
) -> HandlerResult<BulkResponse<E>> {
    mutate_bulk(&service, Operation::Delete, uri.path(), body).await
}

// The request path is recorded as the api id so stored rejections name the endpoint.
fn with_api_id(mut request_info: RequestInfo, path: &str) -> RequestInfo {
    request_info.api_id = Some(path.to_string());
    request_info
}

async fn mutate_one<E: Entity>(
    service: &EntityService<E>,
    operation: Operation,
    path: &str,
    body: EntityRequest<E>,
) -> HandlerResult<EntityResponse<E>> {
    let started = Instant::now();
    let request_info = with_api_id(body.request_info, path);
    let outcome = match operation {
        Operation::Create => service.create_one(request_info, body.entity).await,
        Operation::Update => service.update_one(request_info, body.entity).await,
        Operation::Delete => service.delete_one(request_info, body.entity).await,
    };

    match outcome {
        Ok(entity) => {
            observe::<E>(operation.as_str(), StatusCode::ACCEPTED, started);
            Ok((StatusCode::ACCEPTED, Json(EntityResponse { entity })))
        }
        Err(err) => {
            let problem = ProblemResponse::from(err);
            observe::<E>(operation.as_str(), problem.status(), started);
            Err(problem)
        }
    }
}

async fn mutate_bulk<E: Entity>(
    service: &EntityService<E>,
    operation: Operation,
    path: &str,
    body: BulkRequest<E>,
) -> HandlerResult<BulkResponse<E>> {
    let started = Instant::now();
    let request = BatchRequest::new(with_api_id(body.request_info, path), body.entities);
    let submitted = request.len();
    let outcome = match operation {
        Operation::Create => service.create(request, true).await,
        Operation::Update => service.update(request, true).await,
        Operation::Delete => service.delete(request, true).await,
    };

    match outcome {
        Ok(entities) => {
            tracing::info!(
                stage = "api",
                entity_type = E::ENTITY_TYPE,
                operation = operation.as_str(),
                submitted,
                persisted = entities.len(),
                "bulk request processed"
            );
            observe::<E>(operation.as_str(), StatusCode::ACCEPTED, started);
            Ok((StatusCode::ACCEPTED, Json(BulkResponse { entities })))
        }
        Err(err) => {
            let problem = ProblemResponse::from(err);
            observe::<E>(operation.as_str(), problem.status(), started);
            Err(problem)
        }
    }
}

async fn search<E: Entity>(
    State(service): State<Arc<EntityService<E>>>,
    Query(params): Query<SearchParams>,
    Json(body): Json<SearchBody<E::Criteria>>,
) -> HandlerResult<SearchResponse<E>> {
    let started = Instant::now();
    let request = SearchRequest {
        criteria: body.criteria,
        tenant_id: params.tenant_id.unwrap_or_default(),
        limit: params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
        offset: params.offset.unwrap_or(0),
        last_changed_since: params.last_changed_since,
        include_deleted: params.include_deleted.unwrap_or(false),
    };

    match service.search(request).await {
        Ok(response) => {
            observe::<E>("search", StatusCode::OK, started);
            Ok((StatusCode::OK, Json(response)))
        }
        Err(err) => {
            let problem = ProblemResponse::from(err);
            observe::<E>("search", problem.status(), started);
            Err(problem)
        }
    }
}

fn observe<E: Entity>(operation: &'static str, status: StatusCode, started: Instant) {
    counter!(
        "http_requests_total",
        "entity_type" => E::ENTITY_TYPE,
        "operation" => operation,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    histogram!(
        "http_request_seconds",
        "entity_type" => E::ENTITY_TYPE,
        "operation" => operation
    )
    .record(started.elapsed().as_secs_f64());
}
