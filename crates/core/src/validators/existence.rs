use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity, IdField};
use crate::error::{codes, EntityError, ErrorMap};
use crate::repository::EntityStore;
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::{fetch_persisted, persisted_key};

/// Duplicate-submission guard: a create must not reuse a stored clientReferenceId.
pub struct AlreadyExistsValidator<E: Entity> {
    store: Arc<dyn EntityStore<E>>,
}

impl<E: Entity> AlreadyExistsValidator<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for AlreadyExistsValidator<E> {
    fn name(&self) -> &'static str {
        "already_exists"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::CREATE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let field = IdField::ClientReferenceId;
        let candidates: Vec<usize> = (0..request.len())
            .filter(|index| field.value_of(&request.entities[*index]).is_some())
            .collect();
        if candidates.is_empty() {
            return Ok(ErrorMap::new());
        }

        let persisted = fetch_persisted(
            self.name(),
            self.store.as_ref(),
            request,
            candidates.iter().copied(),
            field,
            true,
        )
        .await?;

        let mut errors = ErrorMap::new();
        for index in candidates {
            let Some(key) = persisted_key(request, index, field) else {
                continue;
            };
            if persisted.contains_key(&key) {
                errors.insert(
                    index,
                    EntityError::non_recoverable(
                        codes::ENTITY_ALREADY_EXISTS,
                        format!("clientReferenceId {} already exists", key.1),
                    ),
                );
            }
        }
        Ok(errors)
    }
}

/// Update and delete must target a stored, non-deleted record.
pub struct NonExistentEntityValidator<E: Entity> {
    store: Arc<dyn EntityStore<E>>,
}

impl<E: Entity> NonExistentEntityValidator<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for NonExistentEntityValidator<E> {
    fn name(&self) -> &'static str {
        "non_existent_entity"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::UPDATE_DELETE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let field = IdField::Id;
        // Entities without an id are the null-id validator's concern.
        let candidates: Vec<usize> = (0..request.len())
            .filter(|index| field.value_of(&request.entities[*index]).is_some())
            .collect();
        if candidates.is_empty() {
            return Ok(ErrorMap::new());
        }

        let persisted = fetch_persisted(
            self.name(),
            self.store.as_ref(),
            request,
            candidates.iter().copied(),
            field,
            false,
        )
        .await?;

        let mut errors = ErrorMap::new();
        for index in candidates {
            let Some(key) = persisted_key(request, index, field) else {
                continue;
            };
            if !persisted.contains_key(&key) {
                errors.insert(
                    index,
                    EntityError::non_recoverable(
                        codes::NON_EXISTENT_ENTITY,
                        format!("entity {} does not exist", key.1),
                    ),
                );
            }
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::facility::ProjectFacility;
    use crate::entity::{EntityMeta, RequestInfo};
    use crate::testing::{self, InMemoryStore};

    fn facility(id: Option<&str>, client_ref: &str) -> ProjectFacility {
        ProjectFacility {
            meta: EntityMeta {
                id: id.map(str::to_string),
                client_reference_id: Some(client_ref.to_string()),
                tenant_id: "t1".into(),
                ..Default::default()
            },
            project_id: Some("p-1".into()),
            facility_id: Some("f-1".into()),
        }
    }

    #[tokio::test]
    async fn create_rejects_stored_client_reference_ids_even_if_deleted() {
        let store = Arc::new(InMemoryStore::new());
        let mut deleted = testing::persisted(facility(Some("pf-2"), "c-2"));
        deleted.meta.is_deleted = true;
        store.seed(vec![testing::persisted(facility(Some("pf-1"), "c-1")), deleted]);

        let validator = AlreadyExistsValidator::<ProjectFacility>::new(store.clone());
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![facility(None, "c-1"), facility(None, "c-new"), facility(None, "c-2")],
        );

        let errors = validator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(errors.get(0).unwrap()[0].code, codes::ENTITY_ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn update_rejects_unknown_and_deleted_ids() {
        let store = Arc::new(InMemoryStore::new());
        let mut deleted = testing::persisted(facility(Some("pf-2"), "c-2"));
        deleted.meta.is_deleted = true;
        store.seed(vec![testing::persisted(facility(Some("pf-1"), "c-1")), deleted]);

        let validator = NonExistentEntityValidator::<ProjectFacility>::new(store.clone());
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![
                facility(Some("pf-1"), "c-1"),
                facility(Some("pf-2"), "c-2"),
                facility(Some("pf-9"), "c-9"),
                facility(None, "c-x"),
            ],
        );

        let errors = validator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1, 2]);
        assert!(errors
            .errors()
            .all(|error| error.code == codes::NON_EXISTENT_ENTITY));
    }

    #[tokio::test]
    async fn store_failure_is_a_fault() {
        let store = Arc::new(InMemoryStore::<ProjectFacility>::new());
        store.fail_reads(true);
        let validator = NonExistentEntityValidator::<ProjectFacility>::new(store);
        let request = BatchRequest::single(
            RequestInfo::for_user("u-1", "t1"),
            facility(Some("pf-1"), "c-1"),
        );
        let err = validator.validate(&request).await.unwrap_err();
        assert!(matches!(err, ValidatorFault::Store { .. }));
    }
}
