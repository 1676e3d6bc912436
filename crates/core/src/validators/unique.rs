use std::collections::HashMap;

use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity, IdField};
use crate::error::{codes, EntityError, ErrorMap};
use crate::validator::{AppliesTo, Validator, ValidatorFault};

/// Rejects every entity whose identifier occurs more than once in the batch.
#[derive(Debug, Clone, Copy)]
pub struct UniqueEntityValidator {
    field: IdField,
    applies_to: AppliesTo,
}

impl UniqueEntityValidator {
    /// Server ids on update and delete.
    pub fn by_id() -> Self {
        Self {
            field: IdField::Id,
            applies_to: AppliesTo::UPDATE_DELETE,
        }
    }

    /// Client reference ids on create.
    pub fn by_client_reference_id() -> Self {
        Self {
            field: IdField::ClientReferenceId,
            applies_to: AppliesTo::CREATE,
        }
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for UniqueEntityValidator {
    fn name(&self) -> &'static str {
        match self.field {
            IdField::Id => "unique_id",
            IdField::ClientReferenceId => "unique_client_reference_id",
        }
    }

    fn applies_to(&self) -> AppliesTo {
        self.applies_to
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut positions: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            if let Some(value) = self.field.value_of(entity) {
                positions.entry(value).or_default().push(index);
            }
        }

        let mut errors = ErrorMap::new();
        for (value, indices) in positions.into_iter().filter(|(_, v)| v.len() > 1) {
            for index in indices {
                errors.insert(
                    index,
                    EntityError::non_recoverable(
                        codes::DUPLICATE_ENTITY,
                        format!("{} {value} appears more than once in the batch", self.field),
                    ),
                );
            }
        }
        Ok(errors)
    }
}

/// Rejects parents carrying two live sub-entities of the same kind and key
/// (two addresses of one type, two resources for one product variant…).
#[derive(Debug, Default, Clone, Copy)]
pub struct UniqueSubEntityValidator;

#[async_trait]
impl<E: Entity> Validator<E> for UniqueSubEntityValidator {
    fn name(&self) -> &'static str {
        "unique_sub_entity"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::CREATE_UPDATE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
            for sub in entity.sub_entities().into_iter().filter(|sub| !sub.is_deleted) {
                *counts.entry((sub.kind, sub.key)).or_default() += 1;
            }

            let mut duplicates: Vec<_> = counts
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(key, _)| key)
                .collect();
            duplicates.sort_unstable();
            for (kind, key) in duplicates {
                errors.insert(
                    index,
                    EntityError::recoverable(
                        codes::DUPLICATE_SUB_ENTITY,
                        format!("duplicate {kind} {key}"),
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
    use crate::domain::task::{Task, TaskResource};
    use crate::entity::{EntityMeta, RequestInfo};

    fn facility(id: &str) -> ProjectFacility {
        ProjectFacility {
            meta: EntityMeta {
                id: Some(id.to_string()),
                tenant_id: "t1".into(),
                ..Default::default()
            },
            project_id: None,
            facility_id: None,
        }
    }

    fn resource(variant: &str, deleted: bool) -> TaskResource {
        TaskResource {
            product_variant_id: Some(variant.to_string()),
            quantity: 1.0,
            is_deleted: deleted,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn flags_all_occurrences_of_a_repeated_id() {
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![facility("a"), facility("b"), facility("a")],
        );
        let errors = Validator::<ProjectFacility>::validate(&UniqueEntityValidator::by_id(), &request)
            .await
            .expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(errors.get(0).unwrap()[0].code, codes::DUPLICATE_ENTITY);
    }

    #[tokio::test]
    async fn deleted_sub_entities_do_not_count_as_duplicates() {
        let tasks = vec![
            Task {
                resources: vec![resource("pv-1", false), resource("pv-1", false)],
                ..Default::default()
            },
            Task {
                resources: vec![resource("pv-1", false), resource("pv-1", true)],
                ..Default::default()
            },
        ];
        let request = BatchRequest::new(RequestInfo::for_user("u-1", "t1"), tasks);
        let errors = UniqueSubEntityValidator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![0]);
        assert_eq!(errors.get(0).unwrap()[0].code, codes::DUPLICATE_SUB_ENTITY);
    }
}
