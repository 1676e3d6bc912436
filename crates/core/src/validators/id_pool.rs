use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::collaborators::{IdPoolLookup, IdStatus};
use crate::entity::{BatchRequest, Entity};
use crate::error::{codes, EntityError, ErrorMap};
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::{distinct, tenant_groups, FieldFn};

/// Checks externally issued beneficiary ids against the id pool on create.
///
/// An id must be known to the pool, be in `DISPATCHED` state, have been
/// dispatched to the requesting user, and appear once per batch. Masked ids
/// (containing `*`) are not checked.
pub struct IdPoolValidator<E> {
    extract: FieldFn<E>,
    lookup: Arc<dyn IdPoolLookup>,
}

impl<E> IdPoolValidator<E> {
    pub fn new(extract: FieldFn<E>, lookup: Arc<dyn IdPoolLookup>) -> Self {
        Self { extract, lookup }
    }

    fn pooled_id<'a>(&self, entity: &'a E) -> Option<&'a str> {
        (self.extract)(entity).filter(|value| !value.trim().is_empty() && !value.contains('*'))
    }
}

fn invalid_id(message: String) -> EntityError {
    EntityError::non_recoverable(codes::INVALID_BENEFICIARY_ID, message)
}

#[async_trait]
impl<E: Entity> Validator<E> for IdPoolValidator<E> {
    fn name(&self) -> &'static str {
        "id_pool"
    }

    fn applies_to(&self) -> AppliesTo {
        AppliesTo::CREATE
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();

        let mut occurrences: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            if let Some(value) = self.pooled_id(entity) {
                occurrences.entry(value).or_default().push(index);
            }
        }
        if occurrences.is_empty() {
            return Ok(errors);
        }
        for (value, indices) in occurrences.iter().filter(|(_, v)| v.len() > 1) {
            for index in indices {
                errors.insert(*index, invalid_id(format!("beneficiary id {value} is used more than once")));
            }
        }

        let candidates: Vec<usize> = occurrences
            .values()
            .filter(|indices| indices.len() == 1)
            .flatten()
            .copied()
            .collect();
        let groups = tenant_groups(request, candidates)?;
        let request_info = &request.request_info;

        let lookups = groups.iter().map(|(tenant, members)| {
            let ids = distinct(
                members
                    .iter()
                    .filter_map(|index| self.pooled_id(&request.entities[*index])),
            );
            async move {
                let outcome = self.lookup.search_id_records(request_info, tenant, &ids).await;
                (tenant, members, outcome)
            }
        });

        let user = request.request_info.user_id();
        for (tenant, members, outcome) in join_all(lookups).await {
            let records = match outcome {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(
                        stage = "validation",
                        validator = "id_pool",
                        tenant_id = %tenant,
                        error = %err,
                        "id pool lookup failed"
                    );
                    for index in members {
                        errors.insert(
                            *index,
                            EntityError::recoverable(
                                codes::REFERENCE_LOOKUP_FAILED,
                                format!("could not verify beneficiary id: {err}"),
                            ),
                        );
                    }
                    continue;
                }
            };

            let by_id: HashMap<&str, _> = records.iter().map(|r| (r.id.as_str(), r)).collect();
            for index in members {
                let Some(value) = self.pooled_id(&request.entities[*index]) else {
                    continue;
                };
                match by_id.get(value) {
                    None => errors.insert(
                        *index,
                        invalid_id(format!("beneficiary id {value} is not in the id pool")),
                    ),
                    Some(record) if record.status != IdStatus::Dispatched => errors.insert(
                        *index,
                        invalid_id(format!(
                            "beneficiary id {value} has status {}, expected DISPATCHED",
                            record.status.as_str()
                        )),
                    ),
                    Some(record) if record.last_modified_by.as_deref() != Some(user) => errors
                        .insert(
                            *index,
                            EntityError::non_recoverable(
                                codes::INVALID_USER_ID,
                                format!("beneficiary id {value} was not dispatched to user {user}"),
                            ),
                        ),
                    Some(_) => {}
                }
            }
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::IdRecord;
    use crate::domain::beneficiary::ProjectBeneficiary;
    use crate::entity::{EntityMeta, RequestInfo};
    use crate::testing::StaticIdPool;

    fn beneficiary(tag: &str) -> ProjectBeneficiary {
        ProjectBeneficiary {
            meta: EntityMeta {
                tenant_id: "t1".into(),
                ..Default::default()
            },
            tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    fn record(id: &str, status: IdStatus, user: &str) -> IdRecord {
        IdRecord {
            id: id.to_string(),
            tenant_id: "t1".into(),
            status,
            last_modified_by: Some(user.to_string()),
        }
    }

    #[tokio::test]
    async fn applies_pool_rules() {
        let pool = Arc::new(StaticIdPool::new(vec![
            record("B-1", IdStatus::Dispatched, "u-1"),
            record("B-2", IdStatus::Assigned, "u-1"),
            record("B-3", IdStatus::Dispatched, "u-other"),
            record("B-4", IdStatus::Dispatched, "u-1"),
        ]));
        let validator =
            IdPoolValidator::<ProjectBeneficiary>::new(ProjectBeneficiary::tag, pool.clone());
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![
                beneficiary("B-1"),
                beneficiary("B-2"),
                beneficiary("B-3"),
                beneficiary("B-404"),
                beneficiary("B-4"),
                beneficiary("B-4"),
                beneficiary("B-**9"),
            ],
        );

        let errors = validator.validate(&request).await.expect("validate");
        let flagged: Vec<_> = errors
            .iter()
            .map(|(index, list)| (index, list[0].code.as_str()))
            .collect();
        assert_eq!(
            flagged,
            vec![
                (1, codes::INVALID_BENEFICIARY_ID),
                (2, codes::INVALID_USER_ID),
                (3, codes::INVALID_BENEFICIARY_ID),
                (4, codes::INVALID_BENEFICIARY_ID),
                (5, codes::INVALID_BENEFICIARY_ID),
            ]
        );
        assert_eq!(pool.calls(), 1);
    }
}
