use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity, IdField};
use crate::error::{codes, EntityError, ErrorMap};
use crate::repository::EntityStore;
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::{fetch_persisted, persisted_key};

/// Whether deletes are held to the same optimistic-concurrency check as updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteRowVersionPolicy {
    /// Delete payloads must carry the persisted row version.
    #[default]
    Enforce,
    /// Deletes are accepted whatever row version they carry.
    Skip,
}

impl DeleteRowVersionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Skip => "skip",
        }
    }
}

impl FromStr for DeleteRowVersionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enforce" => Ok(Self::Enforce),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown delete row version policy: {other}")),
        }
    }
}

/// Optimistic-concurrency guard: the submitted rowVersion must equal the stored one.
pub struct RowVersionValidator<E: Entity> {
    store: Arc<dyn EntityStore<E>>,
    policy: DeleteRowVersionPolicy,
}

impl<E: Entity> RowVersionValidator<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>, policy: DeleteRowVersionPolicy) -> Self {
        Self { store, policy }
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for RowVersionValidator<E> {
    fn name(&self) -> &'static str {
        "row_version"
    }

    fn applies_to(&self) -> AppliesTo {
        match self.policy {
            DeleteRowVersionPolicy::Enforce => AppliesTo::UPDATE_DELETE,
            DeleteRowVersionPolicy::Skip => AppliesTo::UPDATE,
        }
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let field = IdField::Id;
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
            let Some(stored) =
                persisted_key(request, index, field).and_then(|key| persisted.get(&key))
            else {
                continue;
            };
            let submitted = request.entities[index].row_version();
            if submitted != stored.row_version() {
                errors.insert(
                    index,
                    EntityError::recoverable(
                        codes::MISMATCHED_ROW_VERSION,
                        format!(
                            "row version {submitted} does not match stored version {}",
                            stored.row_version()
                        ),
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
    use crate::validator::Operation;

    fn facility(id: &str, row_version: i64) -> ProjectFacility {
        ProjectFacility {
            meta: EntityMeta {
                id: Some(id.to_string()),
                client_reference_id: Some(format!("c-{id}")),
                tenant_id: "t1".into(),
                row_version,
                ..Default::default()
            },
            project_id: Some("p-1".into()),
            facility_id: Some("f-1".into()),
        }
    }

    fn store_with(version: i64) -> Arc<InMemoryStore<ProjectFacility>> {
        let store = Arc::new(InMemoryStore::new());
        let mut stored = testing::persisted(facility("pf-1", 1));
        stored.meta.row_version = version;
        store.seed(vec![stored]);
        store
    }

    #[tokio::test]
    async fn stale_version_is_rejected_every_time() {
        let validator = RowVersionValidator::<ProjectFacility>::new(
            store_with(3),
            DeleteRowVersionPolicy::Enforce,
        );
        let request = BatchRequest::new(
            RequestInfo::for_user("u-1", "t1"),
            vec![facility("pf-1", 2), facility("pf-1", 3), facility("pf-404", 1)],
        );

        let first = validator.validate(&request).await.expect("validate");
        let second = validator.validate(&request).await.expect("validate");
        assert_eq!(first, second);
        assert_eq!(first.indices().collect::<Vec<_>>(), vec![0]);
        assert_eq!(first.get(0).unwrap()[0].code, codes::MISMATCHED_ROW_VERSION);
    }

    #[test]
    fn skip_policy_drops_delete_from_capability() {
        let enforce =
            RowVersionValidator::<ProjectFacility>::new(store_with(1), DeleteRowVersionPolicy::Enforce);
        let skip =
            RowVersionValidator::<ProjectFacility>::new(store_with(1), DeleteRowVersionPolicy::Skip);
        assert!(enforce.applies_to().includes(Operation::Delete));
        assert!(!skip.applies_to().includes(Operation::Delete));
        assert!(skip.applies_to().includes(Operation::Update));
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("SKIP".parse::<DeleteRowVersionPolicy>(), Ok(DeleteRowVersionPolicy::Skip));
        assert!("lenient".parse::<DeleteRowVersionPolicy>().is_err());
    }
}
