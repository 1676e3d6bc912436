use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::collaborators::{LookupError, ReferenceLookup};
use crate::entity::{BatchRequest, Entity, IdField};
use crate::error::{codes, EntityError, ErrorMap};
use crate::repository::EntityStore;
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::{distinct, tenant_groups, FieldFn};

/// Rejects entities whose foreign reference cannot be resolved.
///
/// Entities are grouped by tenant and each tenant gets one lookup; lookups for
/// different tenants run concurrently. A failed lookup marks every entity of
/// that tenant with a recoverable network error instead of failing the batch.
/// Entities without a value are skipped; required-ness belongs to the
/// format validators.
pub struct ReferenceValidator<E> {
    name: &'static str,
    reference: &'static str,
    extract: FieldFn<E>,
    lookup: Arc<dyn ReferenceLookup>,
    applies_to: AppliesTo,
}

impl<E> ReferenceValidator<E> {
    pub fn new(
        name: &'static str,
        reference: &'static str,
        extract: FieldFn<E>,
        lookup: Arc<dyn ReferenceLookup>,
    ) -> Self {
        Self {
            name,
            reference,
            extract,
            lookup,
            applies_to: AppliesTo::CREATE_UPDATE,
        }
    }

    pub fn applying_to(mut self, applies_to: AppliesTo) -> Self {
        self.applies_to = applies_to;
        self
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for ReferenceValidator<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applies_to(&self) -> AppliesTo {
        self.applies_to
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let candidates: Vec<usize> = (0..request.len())
            .filter(|index| {
                (self.extract)(&request.entities[*index]).is_some_and(|v| !v.trim().is_empty())
            })
            .collect();
        if candidates.is_empty() {
            return Ok(ErrorMap::new());
        }

        let groups = tenant_groups(request, candidates)?;
        let lookups = groups.iter().map(|(tenant, members)| {
            let ids = distinct(
                members
                    .iter()
                    .filter_map(|index| (self.extract)(&request.entities[*index])),
            );
            async move {
                let outcome = self.lookup.fetch_by_ids(tenant, &ids).await;
                (tenant, members, outcome)
            }
        });

        let mut errors = ErrorMap::new();
        for (tenant, members, outcome) in join_all(lookups).await {
            match outcome {
                Ok(found) => {
                    let found: HashSet<&str> = found.iter().map(String::as_str).collect();
                    for index in members {
                        let Some(value) = (self.extract)(&request.entities[*index]) else {
                            continue;
                        };
                        if !found.contains(value) {
                            errors.insert(
                                *index,
                                EntityError::non_recoverable(
                                    codes::NON_EXISTENT_REFERENCE,
                                    format!("{} {value} does not exist", self.reference),
                                ),
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        stage = "validation",
                        validator = self.name,
                        tenant_id = %tenant,
                        error = %err,
                        "reference lookup failed"
                    );
                    for index in members {
                        errors.insert(
                            *index,
                            EntityError::recoverable(
                                codes::REFERENCE_LOOKUP_FAILED,
                                format!("could not verify {}: {err}", self.reference),
                            ),
                        );
                    }
                }
            }
        }
        Ok(errors)
    }
}

/// Resolves references against another entity type's store.
pub struct StoreReference<T: Entity> {
    store: Arc<dyn EntityStore<T>>,
    field: IdField,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> StoreReference<T> {
    pub fn new(store: Arc<dyn EntityStore<T>>, field: IdField) -> Self {
        Self {
            store,
            field,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> ReferenceLookup for StoreReference<T> {
    async fn fetch_by_ids(
        &self,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, LookupError> {
        let found = self
            .store
            .find_by_id(tenant_id, ids, self.field, false)
            .await
            .map_err(|err| LookupError::Store(err.to_string()))?;
        Ok(found
            .iter()
            .filter_map(|entity| self.field.value_of(entity))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::beneficiary::ProjectBeneficiary;
    use crate::domain::facility::ProjectFacility;
    use crate::entity::{EntityMeta, RequestInfo};
    use crate::testing::{self, InMemoryStore, StaticReferenceLookup};

    fn facility(tenant: &str, project: &str) -> ProjectFacility {
        ProjectFacility {
            meta: EntityMeta {
                tenant_id: tenant.to_string(),
                ..Default::default()
            },
            project_id: Some(project.to_string()),
            facility_id: Some("f-1".into()),
        }
    }

    #[tokio::test]
    async fn one_lookup_per_tenant_and_missing_ids_flagged() {
        let lookup = Arc::new(StaticReferenceLookup::new(["p-1", "p-2"]));
        let validator = ReferenceValidator::<ProjectFacility>::new(
            "project_reference",
            "projectId",
            ProjectFacility::project_id,
            lookup.clone(),
        );
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![
                facility("t1", "p-1"),
                facility("t1", "p-9"),
                facility("t2", "p-2"),
                facility("t1", "p-1"),
            ],
        );

        let errors = validator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1]);
        assert_eq!(errors.get(1).unwrap()[0].code, codes::NON_EXISTENT_REFERENCE);

        let calls = lookup.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&("t1".to_string(), vec!["p-1".to_string(), "p-9".to_string()])));
        assert!(calls.contains(&("t2".to_string(), vec!["p-2".to_string()])));
    }

    #[tokio::test]
    async fn lookup_failure_becomes_network_error_for_that_tenant() {
        let lookup = Arc::new(StaticReferenceLookup::new(["p-1"]));
        lookup.fail_for_tenant("t2");
        let validator = ReferenceValidator::<ProjectFacility>::new(
            "project_reference",
            "projectId",
            ProjectFacility::project_id,
            lookup,
        );
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![facility("t1", "p-1"), facility("t2", "p-1"), facility("t2", "p-3")],
        );

        let errors = validator.validate(&request).await.expect("validate");
        assert_eq!(errors.indices().collect::<Vec<_>>(), vec![1, 2]);
        for (_, list) in errors.iter() {
            assert_eq!(list[0].code, codes::REFERENCE_LOOKUP_FAILED);
            assert!(list[0].is_recoverable());
        }
    }

    #[tokio::test]
    async fn store_reference_resolves_against_live_records() {
        let store = Arc::new(InMemoryStore::new());
        let live = testing::persisted(ProjectBeneficiary {
            meta: EntityMeta {
                id: Some("pb-1".into()),
                client_reference_id: Some("c-pb-1".into()),
                tenant_id: "t1".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut gone = live.clone();
        gone.meta.id = Some("pb-2".into());
        gone.meta.client_reference_id = Some("c-pb-2".into());
        gone.meta.is_deleted = true;
        store.seed(vec![live, gone]);

        let lookup = StoreReference::<ProjectBeneficiary>::new(store, IdField::ClientReferenceId);
        let found = lookup
            .fetch_by_ids("t1", &["c-pb-1".to_string(), "c-pb-2".to_string()])
            .await
            .expect("lookup");
        assert_eq!(found, vec!["c-pb-1".to_string()]);
    }
}
