//! Per-entity validator registration and service wiring.
//!
//! Every entity type gets the lifecycle validators (null id, uniqueness,
//! existence, deletion and row version) followed by its own field and
//! reference checks. Remote reference checks are registered only when the
//! collaborator is configured; references to entities owned by this service
//! resolve against the local stores.

use std::{sync::Arc, time::Duration};

use reqwest::Client;
use url::Url;

use hcm_clients::{IdGenClient, IdPoolClient, ReferenceClient, ReferenceEndpoint, UuidIdGenerator};
use hcm_core::collaborators::{ErrorSink, IdGenerator, IdPoolLookup, ReferenceLookup};
use hcm_core::domain::beneficiary::ProjectBeneficiary;
use hcm_core::domain::facility::ProjectFacility;
use hcm_core::domain::referral::Referral;
use hcm_core::domain::side_effect::SideEffect;
use hcm_core::domain::staff::ProjectStaff;
use hcm_core::domain::task::Task;
use hcm_core::repository::EntityStore;
use hcm_core::validators::{
    AlreadyExistsValidator, DeleteRowVersionPolicy, DeletedSubEntityValidator,
    ExactlyOneOfValidator, FieldCheck, FieldFn, FieldFormatValidator, FieldRule, IdPoolValidator,
    IsDeletedValidator, NonExistentEntityValidator, NullIdValidator, ReferenceValidator,
    RowVersionValidator, StoreReference, UniqueEntityValidator, UniqueSubEntityValidator,
};
use hcm_core::{AppliesTo, Entity, EntityService, IdField, Validator};
use hcm_storage::Database;
use hcm_util::AppConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

type Validators<E> = Vec<Box<dyn Validator<E>>>;

/// External collaborators shared by every entity service.
#[derive(Clone)]
pub struct Collaborators {
    pub id_generator: Arc<dyn IdGenerator>,
    pub project: Option<Arc<dyn ReferenceLookup>>,
    pub facility: Option<Arc<dyn ReferenceLookup>>,
    pub boundary: Option<Arc<dyn ReferenceLookup>>,
    pub user: Option<Arc<dyn ReferenceLookup>>,
    pub id_pool: Option<Arc<dyn IdPoolLookup>>,
    pub error_sink: Arc<dyn ErrorSink>,
}

impl Collaborators {
    /// Local-only collaborators: uuid ids and no remote checks.
    pub fn local(error_sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            id_generator: Arc::new(UuidIdGenerator),
            project: None,
            facility: None,
            boundary: None,
            user: None,
            id_pool: None,
            error_sink,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let urls = &config.collaborators;
        let reference = |base: &Option<Url>, endpoint: ReferenceEndpoint| {
            base.clone().map(|base| {
                Arc::new(ReferenceClient::new(base, endpoint, http.clone()))
                    as Arc<dyn ReferenceLookup>
            })
        };

        let id_generator: Arc<dyn IdGenerator> = match &urls.idgen {
            Some(base) => Arc::new(IdGenClient::new(base.clone(), http.clone())),
            None => Arc::new(UuidIdGenerator),
        };
        let id_pool = urls
            .id_pool
            .clone()
            .filter(|_| config.beneficiary_id_validation)
            .map(|base| Arc::new(IdPoolClient::new(base, http.clone())) as Arc<dyn IdPoolLookup>);

        let collaborators = Self {
            id_generator,
            project: reference(&urls.project, ReferenceEndpoint::project()),
            facility: reference(&urls.facility, ReferenceEndpoint::facility()),
            boundary: reference(&urls.boundary, ReferenceEndpoint::boundary()),
            user: reference(&urls.user, ReferenceEndpoint::user()),
            id_pool,
            error_sink,
        };
        tracing::info!(
            stage = "app",
            remote_idgen = urls.idgen.is_some(),
            project = collaborators.project.is_some(),
            facility = collaborators.facility.is_some(),
            boundary = collaborators.boundary.is_some(),
            user = collaborators.user.is_some(),
            id_pool = collaborators.id_pool.is_some(),
            "collaborators configured"
        );
        Ok(collaborators)
    }
}

/// Pipeline knobs resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub delete_row_version: DeleteRowVersionPolicy,
    pub search_max_limit: u32,
    pub cache_ttl: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            delete_row_version: if config.enforce_delete_row_version {
                DeleteRowVersionPolicy::Enforce
            } else {
                DeleteRowVersionPolicy::Skip
            },
            search_max_limit: config.search_max_limit,
            cache_ttl: config.cache_ttl,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            delete_row_version: DeleteRowVersionPolicy::Enforce,
            search_max_limit: hcm_core::service::DEFAULT_MAX_SEARCH_LIMIT,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// One service per entity type.
#[derive(Clone)]
pub struct Services {
    pub beneficiaries: Arc<EntityService<ProjectBeneficiary>>,
    pub staff: Arc<EntityService<ProjectStaff>>,
    pub facilities: Arc<EntityService<ProjectFacility>>,
    pub tasks: Arc<EntityService<Task>>,
    pub referrals: Arc<EntityService<Referral>>,
    pub side_effects: Arc<EntityService<SideEffect>>,
}

impl Services {
    pub fn build(
        database: &Database,
        collaborators: &Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        // Stores are shared with the local reference checks so both see one cache.
        let beneficiary_store: Arc<dyn EntityStore<ProjectBeneficiary>> =
            Arc::new(database.entities(settings.cache_ttl));
        let staff_store: Arc<dyn EntityStore<ProjectStaff>> =
            Arc::new(database.entities(settings.cache_ttl));
        let facility_store: Arc<dyn EntityStore<ProjectFacility>> =
            Arc::new(database.entities(settings.cache_ttl));
        let task_store: Arc<dyn EntityStore<Task>> =
            Arc::new(database.entities(settings.cache_ttl));
        let referral_store: Arc<dyn EntityStore<Referral>> =
            Arc::new(database.entities(settings.cache_ttl));
        let side_effect_store: Arc<dyn EntityStore<SideEffect>> =
            Arc::new(database.entities(settings.cache_ttl));

        let local = LocalReferences {
            beneficiary_by_id: Arc::new(StoreReference::new(
                beneficiary_store.clone(),
                IdField::Id,
            )),
            beneficiary_by_client_ref: Arc::new(StoreReference::new(
                beneficiary_store.clone(),
                IdField::ClientReferenceId,
            )),
            task_by_id: Arc::new(StoreReference::new(task_store.clone(), IdField::Id)),
            task_by_client_ref: Arc::new(StoreReference::new(
                task_store.clone(),
                IdField::ClientReferenceId,
            )),
        };

        let policy = settings.delete_row_version;
        Self {
            beneficiaries: service(
                beneficiary_validators(&beneficiary_store, collaborators, policy),
                beneficiary_store,
                collaborators,
                settings,
            ),
            staff: service(
                staff_validators(&staff_store, collaborators, policy),
                staff_store,
                collaborators,
                settings,
            ),
            facilities: service(
                facility_validators(&facility_store, collaborators, policy),
                facility_store,
                collaborators,
                settings,
            ),
            tasks: service(
                task_validators(&task_store, collaborators, &local, policy),
                task_store,
                collaborators,
                settings,
            ),
            referrals: service(
                referral_validators(&referral_store, collaborators, &local, policy),
                referral_store,
                collaborators,
                settings,
            ),
            side_effects: service(
                side_effect_validators(&side_effect_store, &local, policy),
                side_effect_store,
                collaborators,
                settings,
            ),
        }
    }
}

struct LocalReferences {
    beneficiary_by_id: Arc<dyn ReferenceLookup>,
    beneficiary_by_client_ref: Arc<dyn ReferenceLookup>,
    task_by_id: Arc<dyn ReferenceLookup>,
    task_by_client_ref: Arc<dyn ReferenceLookup>,
}

fn service<E: Entity>(
    validators: Validators<E>,
    store: Arc<dyn EntityStore<E>>,
    collaborators: &Collaborators,
    settings: PipelineSettings,
) -> Arc<EntityService<E>> {
    let service = EntityService::new(
        store,
        collaborators.id_generator.clone(),
        collaborators.error_sink.clone(),
    )
    .with_validators(validators)
    .with_delete_row_version(settings.delete_row_version)
    .with_max_search_limit(settings.search_max_limit);
    tracing::debug!(
        stage = "app",
        entity_type = E::ENTITY_TYPE,
        validators = ?service.validator_names(),
        "entity service ready"
    );
    Arc::new(service)
}

fn lifecycle<E: Entity>(
    store: &Arc<dyn EntityStore<E>>,
    policy: DeleteRowVersionPolicy,
) -> Validators<E> {
    vec![
        Box::new(NullIdValidator),
        Box::new(UniqueEntityValidator::by_id()),
        Box::new(UniqueEntityValidator::by_client_reference_id()),
        Box::new(AlreadyExistsValidator::new(store.clone())),
        Box::new(NonExistentEntityValidator::new(store.clone())),
        Box::new(IsDeletedValidator),
        Box::new(RowVersionValidator::new(store.clone(), policy)),
    ]
}

fn required<E: Entity>(fields: &[(&'static str, FieldFn<E>)]) -> Box<dyn Validator<E>> {
    let rules = fields
        .iter()
        .map(|(field, extract)| FieldRule::new(*field, *extract, FieldCheck::Required))
        .collect();
    Box::new(FieldFormatValidator::new(AppliesTo::CREATE_UPDATE, rules))
}

fn exactly_one_of<E: Entity>(fields: Vec<(&'static str, FieldFn<E>)>) -> Box<dyn Validator<E>> {
    Box::new(ExactlyOneOfValidator::new(AppliesTo::CREATE_UPDATE, fields))
}

fn push_reference<E: Entity>(
    validators: &mut Validators<E>,
    name: &'static str,
    reference: &'static str,
    extract: FieldFn<E>,
    lookup: Option<&Arc<dyn ReferenceLookup>>,
) {
    if let Some(lookup) = lookup {
        validators.push(Box::new(ReferenceValidator::new(
            name,
            reference,
            extract,
            lookup.clone(),
        )));
    }
}

fn beneficiary_validators(
    store: &Arc<dyn EntityStore<ProjectBeneficiary>>,
    collaborators: &Collaborators,
    policy: DeleteRowVersionPolicy,
) -> Validators<ProjectBeneficiary> {
    let mut validators = lifecycle(store, policy);
    validators.push(required(&[("projectId", ProjectBeneficiary::project_id)]));
    validators.push(exactly_one_of(vec![
        ("beneficiaryId", ProjectBeneficiary::beneficiary_id),
        (
            "beneficiaryClientReferenceId",
            ProjectBeneficiary::beneficiary_client_reference_id,
        ),
    ]));
    push_reference(
        &mut validators,
        "project_id",
        "project",
        ProjectBeneficiary::project_id,
        collaborators.project.as_ref(),
    );
    if let Some(pool) = &collaborators.id_pool {
        validators.push(Box::new(IdPoolValidator::new(
            ProjectBeneficiary::tag,
            pool.clone(),
        )));
    }
    validators
}

fn staff_validators(
    store: &Arc<dyn EntityStore<ProjectStaff>>,
    collaborators: &Collaborators,
    policy: DeleteRowVersionPolicy,
) -> Validators<ProjectStaff> {
    let mut validators = lifecycle(store, policy);
    validators.push(required(&[
        ("projectId", ProjectStaff::project_id),
        ("userId", ProjectStaff::user_id),
    ]));
    push_reference(
        &mut validators,
        "project_id",
        "project",
        ProjectStaff::project_id,
        collaborators.project.as_ref(),
    );
    push_reference(
        &mut validators,
        "user_id",
        "user",
        ProjectStaff::user_id,
        collaborators.user.as_ref(),
    );
    validators
}

fn facility_validators(
    store: &Arc<dyn EntityStore<ProjectFacility>>,
    collaborators: &Collaborators,
    policy: DeleteRowVersionPolicy,
) -> Validators<ProjectFacility> {
    let mut validators = lifecycle(store, policy);
    validators.push(required(&[
        ("projectId", ProjectFacility::project_id),
        ("facilityId", ProjectFacility::facility_id),
    ]));
    push_reference(
        &mut validators,
        "project_id",
        "project",
        ProjectFacility::project_id,
        collaborators.project.as_ref(),
    );
    push_reference(
        &mut validators,
        "facility_id",
        "facility",
        ProjectFacility::facility_id,
        collaborators.facility.as_ref(),
    );
    validators
}

fn task_validators(
    store: &Arc<dyn EntityStore<Task>>,
    collaborators: &Collaborators,
    local: &LocalReferences,
    policy: DeleteRowVersionPolicy,
) -> Validators<Task> {
    let mut validators = lifecycle(store, policy);
    validators.push(Box::new(UniqueSubEntityValidator));
    validators.push(Box::new(DeletedSubEntityValidator::for_create()));
    validators.push(Box::new(DeletedSubEntityValidator::for_update(store.clone())));
    validators.push(Box::new(FieldFormatValidator::new(
        AppliesTo::CREATE_UPDATE,
        vec![
            FieldRule::new("projectId", Task::project_id, FieldCheck::Required),
            FieldRule::new("address.pincode", Task::pincode, FieldCheck::Digits(6)),
        ],
    )));
    validators.push(exactly_one_of(vec![
        ("projectBeneficiaryId", Task::project_beneficiary_id),
        (
            "projectBeneficiaryClientReferenceId",
            Task::project_beneficiary_client_reference_id,
        ),
    ]));
    push_reference(
        &mut validators,
        "project_id",
        "project",
        Task::project_id,
        collaborators.project.as_ref(),
    );
    push_reference(
        &mut validators,
        "locality_code",
        "boundary",
        Task::locality_code,
        collaborators.boundary.as_ref(),
    );
    push_reference(
        &mut validators,
        "project_beneficiary_id",
        "project beneficiary",
        Task::project_beneficiary_id,
        Some(&local.beneficiary_by_id),
    );
    push_reference(
        &mut validators,
        "project_beneficiary_client_reference_id",
        "project beneficiary",
        Task::project_beneficiary_client_reference_id,
        Some(&local.beneficiary_by_client_ref),
    );
    validators
}

fn referral_validators(
    store: &Arc<dyn EntityStore<Referral>>,
    collaborators: &Collaborators,
    local: &LocalReferences,
    policy: DeleteRowVersionPolicy,
) -> Validators<Referral> {
    let mut validators = lifecycle(store, policy);
    validators.push(exactly_one_of(vec![
        ("projectBeneficiaryId", Referral::project_beneficiary_id),
        (
            "projectBeneficiaryClientReferenceId",
            Referral::project_beneficiary_client_reference_id,
        ),
    ]));
    push_reference(
        &mut validators,
        "project_beneficiary_id",
        "project beneficiary",
        Referral::project_beneficiary_id,
        Some(&local.beneficiary_by_id),
    );
    push_reference(
        &mut validators,
        "project_beneficiary_client_reference_id",
        "project beneficiary",
        Referral::project_beneficiary_client_reference_id,
        Some(&local.beneficiary_by_client_ref),
    );
    push_reference(
        &mut validators,
        "referrer_id",
        "referrer",
        Referral::referrer_id,
        collaborators.user.as_ref(),
    );
    validators
}

fn side_effect_validators(
    store: &Arc<dyn EntityStore<SideEffect>>,
    local: &LocalReferences,
    policy: DeleteRowVersionPolicy,
) -> Validators<SideEffect> {
    let mut validators = lifecycle(store, policy);
    validators.push(exactly_one_of(vec![
        ("taskId", SideEffect::task_id),
        ("taskClientReferenceId", SideEffect::task_client_reference_id),
    ]));
    push_reference(
        &mut validators,
        "task_id",
        "task",
        SideEffect::task_id,
        Some(&local.task_by_id),
    );
    push_reference(
        &mut validators,
        "task_client_reference_id",
        "task",
        SideEffect::task_client_reference_id,
        Some(&local.task_by_client_ref),
    );
    push_reference(
        &mut validators,
        "project_beneficiary_id",
        "project beneficiary",
        SideEffect::project_beneficiary_id,
        Some(&local.beneficiary_by_id),
    );
    push_reference(
        &mut validators,
        "project_beneficiary_client_reference_id",
        "project beneficiary",
        SideEffect::project_beneficiary_client_reference_id,
        Some(&local.beneficiary_by_client_ref),
    );
    validators
}
