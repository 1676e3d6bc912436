use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity, IdField};
use crate::error::{codes, EntityError, ErrorMap};
use crate::repository::EntityStore;
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::{fetch_persisted, persisted_key};

/// Update payloads must not arrive already flagged deleted; deletion has its own endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct IsDeletedValidator;

#[async_trait]
impl<E: Entity> Validator<E> for IsDeletedValidator {
    fn name(&self) -> &'static str {
        "is_deleted"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::UPDATE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            if entity.is_deleted() {
                errors.insert(
                    index,
                    EntityError::non_recoverable(
                        codes::IS_DELETED_TRUE,
                        "isDeleted cannot be true on update",
                    ),
                );
            }
        }
        Ok(errors)
    }
}

enum Mode<E: Entity> {
    Create,
    Update(Arc<dyn EntityStore<E>>),
}

/// Guards against attaching or reusing deleted sub-entities.
///
/// On create, no sub-entity may be submitted as deleted. On update, a
/// sub-entity that is deleted in the stored record cannot be revived by
/// sending it again as live.
pub struct DeletedSubEntityValidator<E: Entity> {
    mode: Mode<E>,
}

impl<E: Entity> DeletedSubEntityValidator<E> {
    pub fn for_create() -> Self {
        Self { mode: Mode::Create }
    }

    pub fn for_update(store: Arc<dyn EntityStore<E>>) -> Self {
        Self {
            mode: Mode::Update(store),
        }
    }
}

fn deleted_sub_entity(kind: &str, key: &str) -> EntityError {
    EntityError::non_recoverable(
        codes::DELETED_SUB_ENTITY,
        format!("{kind} {key} is deleted and cannot be attached"),
    )
}

#[async_trait]
impl<E: Entity> Validator<E> for DeletedSubEntityValidator<E> {
    fn name(&self) -> &'static str {
        "deleted_sub_entity"
    }

    fn applies_to(&self) -> AppliesTo {
        match self.mode {
            Mode::Create => AppliesTo::CREATE,
            Mode::Update(_) => AppliesTo::UPDATE,
        }
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        let store = match &self.mode {
            Mode::Create => {
                for (index, entity) in request.entities.iter().enumerate() {
                    for sub in entity.sub_entities().into_iter().filter(|sub| sub.is_deleted) {
                        errors.insert(index, deleted_sub_entity(sub.kind, sub.key));
                    }
                }
                return Ok(errors);
            }
            Mode::Update(store) => store,
        };

        let field = IdField::Id;
        let candidates: Vec<usize> = (0..request.len())
            .filter(|index| {
                let entity = &request.entities[*index];
                field.value_of(entity).is_some()
                    && entity.sub_entities().iter().any(|sub| sub.id.is_some())
            })
            .collect();
        if candidates.is_empty() {
            return Ok(errors);
        }

        let persisted = fetch_persisted(
            self.name(),
            store.as_ref(),
            request,
            candidates.iter().copied(),
            field,
            false,
        )
        .await?;

        for index in candidates {
            let Some(stored) =
                persisted_key(request, index, field).and_then(|key| persisted.get(&key))
            else {
                continue;
            };
            let stored_subs = stored.sub_entities();
            let deleted_ids: HashSet<(&str, &str)> = stored_subs
                .iter()
                .filter(|sub| sub.is_deleted)
                .filter_map(|sub| sub.id.map(|id| (sub.kind, id)))
                .collect();

            for sub in request.entities[index].sub_entities() {
                let Some(id) = sub.id else { continue };
                if !sub.is_deleted && deleted_ids.contains(&(sub.kind, id)) {
                    errors.insert(index, deleted_sub_entity(sub.kind, sub.key));
                }
            }
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{Task, TaskResource};
    use crate::entity::{EntityMeta, RequestInfo};
    use crate::testing::{self, InMemoryStore};

    fn resource(id: Option<&str>, variant: &str, deleted: bool) -> TaskResource {
        TaskResource {
            id: id.map(str::to_string),
            product_variant_id: Some(variant.to_string()),
            quantity: 2.0,
            is_deleted: deleted,
            ..Default::default()
        }
    }

    fn task(id: Option<&str>, resources: Vec<TaskResource>) -> Task {
        Task {
            meta: EntityMeta {
                id: id.map(str::to_string),
                tenant_id: "t1".into(),
                row_version: 1,
                ..Default::default()
            },
            resources,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn payload_flagged_deleted_is_rejected_on_update() {
        let mut deleted = task(Some("t-1"), vec![]);
        deleted.meta.is_deleted = true;
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![task(Some("t-0"), vec![]), deleted],
        );
        let errors = IsDeletedValidator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn create_rejects_deleted_sub_entities() {
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![
                task(None, vec![resource(None, "pv-1", false)]),
                task(None, vec![resource(None, "pv-2", true)]),
            ],
        );
        let errors = DeletedSubEntityValidator::<Task>::for_create()
            .validate(&request)
            .await
            .expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1]);
        assert_eq!(errors.get(1).unwrap()[0].code, codes::DELETED_SUB_ENTITY);
    }

    #[tokio::test]
    async fn update_cannot_revive_a_deleted_sub_entity() {
        let store = Arc::new(InMemoryStore::new());
        store.seed(vec![testing::persisted(task(
            Some("t-1"),
            vec![
                resource(Some("r-1"), "pv-1", false),
                resource(Some("r-2"), "pv-2", true),
            ],
        ))]);
        let validator = DeletedSubEntityValidator::<Task>::for_update(store);

        let revive = task(
            Some("t-1"),
            vec![
                resource(Some("r-1"), "pv-1", false),
                resource(Some("r-2"), "pv-2", false),
            ],
        );
        let keep_deleted = task(
            Some("t-1"),
            vec![
                resource(Some("r-1"), "pv-1", false),
                resource(Some("r-2"), "pv-2", true),
            ],
        );
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![revive, keep_deleted],
        );

        let errors = validator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![0]);
    }
}
