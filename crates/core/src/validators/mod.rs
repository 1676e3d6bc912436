//! Reusable validator families. Each works for any [`Entity`] and can be
//! registered on any [`crate::service::EntityService`].

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::join_all;

use crate::entity::{BatchRequest, Entity, IdField};
use crate::repository::{EntityStore, RepositoryError};
use crate::validator::ValidatorFault;

pub mod existence;
pub mod format;
pub mod id_pool;
pub mod null_id;
pub mod reference;
pub mod row_version;
pub mod soft_delete;
pub mod unique;

pub use existence::{AlreadyExistsValidator, NonExistentEntityValidator};
pub use format::{ExactlyOneOfValidator, FieldCheck, FieldFormatValidator, FieldRule};
pub use id_pool::IdPoolValidator;
pub use null_id::NullIdValidator;
pub use reference::{ReferenceValidator, StoreReference};
pub use row_version::{DeleteRowVersionPolicy, RowVersionValidator};
pub use soft_delete::{DeletedSubEntityValidator, IsDeletedValidator};
pub use unique::{UniqueEntityValidator, UniqueSubEntityValidator};

/// Extracts an optional string field from an entity.
pub type FieldFn<E> = fn(&E) -> Option<&str>;

/// Groups batch positions by effective tenant (the entity's, else the request's).
pub(crate) fn tenant_groups<E: Entity>(
    request: &BatchRequest<E>,
    indices: impl IntoIterator<Item = usize>,
) -> Result<BTreeMap<String, Vec<usize>>, ValidatorFault> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for index in indices {
        let tenant = request
            .tenant_of(index)
            .ok_or(ValidatorFault::MissingTenant { index })?;
        groups.entry(tenant.to_string()).or_default().push(index);
    }
    Ok(groups)
}

/// Distinct values in first-seen order.
pub(crate) fn distinct<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}

/// Loads the persisted counterparts of the entities at `indices`, keyed by
/// `(tenant, identifier)`. One store round trip per tenant, issued concurrently.
pub(crate) async fn fetch_persisted<E: Entity>(
    validator: &'static str,
    store: &dyn EntityStore<E>,
    request: &BatchRequest<E>,
    indices: impl IntoIterator<Item = usize>,
    field: IdField,
    include_deleted: bool,
) -> Result<HashMap<(String, String), E>, ValidatorFault> {
    let groups = tenant_groups(request, indices)?;

    let lookups = groups.iter().map(|(tenant, members)| {
        let ids = distinct(
            members
                .iter()
                .filter_map(|index| field.value_of(&request.entities[*index])),
        );
        async move {
            if ids.is_empty() {
                return Ok::<_, RepositoryError>((tenant, Vec::new()));
            }
            let found = store
                .find_by_id(tenant, &ids, field, include_deleted)
                .await?;
            Ok((tenant, found))
        }
    });

    let mut persisted = HashMap::new();
    for outcome in join_all(lookups).await {
        let (tenant, found) = outcome.map_err(|err| ValidatorFault::Store {
            validator,
            message: err.to_string(),
        })?;
        for entity in found {
            if let Some(key) = field.value_of(&entity) {
                persisted.insert((tenant.clone(), key.to_string()), entity);
            }
        }
    }
    Ok(persisted)
}

/// `(tenant, identifier)` lookup key for the entity at `index`.
pub(crate) fn persisted_key<E: Entity>(
    request: &BatchRequest<E>,
    index: usize,
    field: IdField,
) -> Option<(String, String)> {
    let tenant = request.tenant_of(index)?;
    let value = field.value_of(&request.entities[index])?;
    Some((tenant.to_string(), value.to_string()))
}
