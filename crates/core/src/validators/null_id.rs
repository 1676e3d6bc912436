use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity};
use crate::error::{codes, EntityError, ErrorMap};
use crate::validator::{AppliesTo, Validator, ValidatorFault};

/// Update and delete address existing records, so a server id is mandatory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIdValidator;

#[async_trait]
impl<E: Entity> Validator<E> for NullIdValidator {
    fn name(&self) -> &'static str {
        "null_id"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::UPDATE_DELETE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            if entity.id().is_none() {
                errors.insert(
                    index,
                    EntityError::non_recoverable(codes::NULL_ID, "id cannot be null"),
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

    #[tokio::test]
    async fn flags_blank_and_missing_ids() {
        let entities = [Some("pf-1"), None, Some("  ")]
            .into_iter()
            .map(|id| ProjectFacility {
                meta: EntityMeta {
                    id: id.map(str::to_string),
                    tenant_id: "t1".into(),
                    ..Default::default()
                },
                project_id: None,
                facility_id: None,
            })
            .collect();
        let request = BatchRequest::new(RequestInfo::for_user("u-1", "t1"), entities);

        let errors = NullIdValidator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(errors.get(1).unwrap()[0].code, codes::NULL_ID);
    }
}
