use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entity::{Entity, IdField};
use crate::validator::Operation;

pub const DEFAULT_SEARCH_LIMIT: u32 = 100;

/// Errors surfaced by an [`EntityStore`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("query failure: {0}")]
    Query(String),
    #[error("failed to encode or decode entity payload: {0}")]
    Payload(String),
    /// The stored row is no longer the version this write was built on.
    #[error("{entity_type} {id} was modified concurrently, expected stored row version {expected}")]
    Conflict {
        entity_type: &'static str,
        id: String,
        expected: i64,
    },
}

/// Value side of a criteria filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    AnyOf(Vec<String>),
    Integer(i64),
}

/// Equality filter on one field of the entity payload (a dotted JSON path).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: &'static str,
    pub value: FilterValue,
}

impl FieldFilter {
    pub fn any_of(field: &'static str, values: &[String]) -> Self {
        Self {
            field,
            value: FilterValue::AnyOf(values.to_vec()),
        }
    }

    /// Evaluates the filter against an entity's JSON form. An array field
    /// matches when any of its elements does.
    pub fn matches(&self, payload: &Value) -> bool {
        let mut current = payload;
        for segment in self.field.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return false,
            }
        }
        match current {
            Value::Array(items) => items.iter().any(|item| self.matches_scalar(item)),
            other => self.matches_scalar(other),
        }
    }

    fn matches_scalar(&self, value: &Value) -> bool {
        match (&self.value, value) {
            (FilterValue::AnyOf(options), Value::String(text)) => {
                options.iter().any(|option| option == text)
            }
            (FilterValue::Integer(expected), Value::Number(number)) => {
                number.as_i64() == Some(*expected)
            }
            _ => false,
        }
    }
}

/// Appends an `AnyOf` filter when `values` holds at least one entry.
pub fn push_any_of(filters: &mut Vec<FieldFilter>, field: &'static str, values: &Option<Vec<String>>) {
    if let Some(values) = non_empty(values) {
        filters.push(FieldFilter::any_of(field, values));
    }
}

pub(crate) fn non_empty(values: &Option<Vec<String>>) -> Option<&[String]> {
    values.as_deref().filter(|values| !values.is_empty())
}

/// Entity-specific search criteria.
pub trait SearchCriteria:
    Clone + fmt::Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn ids(&self) -> Option<&[String]>;

    fn client_reference_ids(&self) -> Option<&[String]>;

    /// Filters other than the two identifier lists.
    fn field_filters(&self) -> Vec<FieldFilter>;

    /// Returns the identifier list when the criteria constrain by exactly one
    /// identifier kind and nothing else.
    fn id_only(&self) -> Option<(IdField, &[String])> {
        if !self.field_filters().is_empty() {
            return None;
        }
        match (self.ids(), self.client_reference_ids()) {
            (Some(ids), None) => Some((IdField::Id, ids)),
            (None, Some(ids)) => Some((IdField::ClientReferenceId, ids)),
            _ => None,
        }
    }
}

/// Criteria plus the paging and visibility options shared by every entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest<C> {
    pub criteria: C,
    pub tenant_id: String,
    pub limit: u32,
    pub offset: u32,
    pub last_changed_since: Option<i64>,
    pub include_deleted: bool,
}

impl<C: SearchCriteria> SearchRequest<C> {
    pub fn new(criteria: C, tenant_id: impl Into<String>) -> Self {
        Self {
            criteria,
            tenant_id: tenant_id.into(),
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
            last_changed_since: None,
            include_deleted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse<E> {
    pub total_count: u64,
    pub entities: Vec<E>,
}

/// Persistence, publication and reads for one entity type.
#[async_trait]
pub trait EntityStore<E: Entity>: Send + Sync {
    /// Persists the batch atomically and publishes it as one event on `topic`.
    ///
    /// Each row must be written over exactly `rowVersion - 1`; a row version of
    /// 1 must not collide with an existing row. Otherwise nothing is written and
    /// [`RepositoryError::Conflict`] is returned.
    async fn save(&self, entities: &[E], topic: &str) -> Result<(), RepositoryError>;

    /// Point lookup, served from the cache where possible.
    async fn find_by_id(
        &self,
        tenant_id: &str,
        ids: &[String],
        field: IdField,
        include_deleted: bool,
    ) -> Result<Vec<E>, RepositoryError>;

    /// Filtered, paginated search ordered by id.
    async fn find(
        &self,
        request: &SearchRequest<E::Criteria>,
    ) -> Result<SearchResponse<E>, RepositoryError>;

    async fn put_in_cache(&self, entities: &[E]);
}

/// `{operation}-{entityType}-topic`, with `save` as the create verb.
pub fn topic_name(operation: Operation, entity_type: &str) -> String {
    format!("{}-{}-topic", operation.topic_verb(), entity_type)
}

/// Tenant, soft-delete and changed-since filters applied after either search path.
pub fn post_filter<E: Entity>(
    entities: Vec<E>,
    tenant_id: Option<&str>,
    include_deleted: bool,
    last_changed_since: Option<i64>,
) -> Vec<E> {
    entities
        .into_iter()
        .filter(|entity| tenant_id.map_or(true, |tenant| entity.tenant_id() == tenant))
        .filter(|entity| include_deleted || !entity.is_deleted())
        .filter(|entity| match last_changed_since {
            Some(since) => entity
                .last_modified_time()
                .map_or(false, |modified| modified > since),
            None => true,
        })
        .collect()
}
