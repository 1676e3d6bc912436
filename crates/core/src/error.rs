use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable error codes attached to rejected entities.
pub mod codes {
    pub const NULL_ID: &str = "NULL_ID";
    pub const NON_EXISTENT_ENTITY: &str = "NON_EXISTENT_ENTITY";
    pub const DUPLICATE_ENTITY: &str = "DUPLICATE_ENTITY";
    pub const ENTITY_ALREADY_EXISTS: &str = "ENTITY_ALREADY_EXISTS";
    pub const MISMATCHED_ROW_VERSION: &str = "MISMATCHED_ROW_VERSION";
    pub const IS_DELETED_TRUE: &str = "IS_DELETED_TRUE";
    pub const DUPLICATE_SUB_ENTITY: &str = "DUPLICATE_SUB_ENTITY";
    pub const DELETED_SUB_ENTITY: &str = "DELETED_SUB_ENTITY";
    pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const EXACTLY_ONE_OF: &str = "EXACTLY_ONE_OF";
    pub const NON_EXISTENT_REFERENCE: &str = "NON_EXISTENT_REFERENCE";
    pub const REFERENCE_LOOKUP_FAILED: &str = "REFERENCE_LOOKUP_FAILED";
    pub const INVALID_BENEFICIARY_ID: &str = "INVALID_BENEFICIARY_ID";
    pub const INVALID_USER_ID: &str = "INVALID_USER_ID";
    pub const IDGEN_ERROR: &str = "IDGEN_ERROR";
    pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
}

/// Whether resubmitting the same entity could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Recoverable,
    NonRecoverable,
}

/// One `(code, message, recoverable)` entry attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityError {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
}

impl EntityError {
    pub fn recoverable(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            error_type: ErrorType::Recoverable,
        }
    }

    pub fn non_recoverable(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            error_type: ErrorType::NonRecoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self.error_type, ErrorType::Recoverable)
    }
}

/// Per-entity error lists keyed by the entity's position in its batch.
///
/// Position is the identity used across validators: two validators flagging
/// the same index produce one entry with both errors, in validator order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMap {
    entries: BTreeMap<usize, Vec<EntityError>>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags every index in `0..len` with the same error.
    pub fn for_all(len: usize, error: EntityError) -> Self {
        let mut map = Self::new();
        for index in 0..len {
            map.insert(index, error.clone());
        }
        map
    }

    pub fn insert(&mut self, index: usize, error: EntityError) {
        self.entries.entry(index).or_default().push(error);
    }

    /// Concatenates another map into this one.
    pub fn merge(&mut self, other: ErrorMap) {
        for (index, errors) in other.entries {
            self.entries.entry(index).or_default().extend(errors);
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn get(&self, index: usize) -> Option<&[EntityError]> {
        self.entries.get(&index).map(Vec::as_slice)
    }

    pub fn remove(&mut self, index: usize) -> Option<Vec<EntityError>> {
        self.entries.remove(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of flagged entities (not number of errors).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[EntityError])> {
        self.entries
            .iter()
            .map(|(index, errors)| (*index, errors.as_slice()))
    }

    /// Every error across all entities, in index order.
    pub fn errors(&self) -> impl Iterator<Item = &EntityError> {
        self.entries.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_concatenates_errors_for_the_same_index() {
        let mut left = ErrorMap::new();
        left.insert(1, EntityError::recoverable(codes::NULL_ID, "id is null"));

        let mut right = ErrorMap::new();
        right.insert(
            1,
            EntityError::recoverable(codes::MISMATCHED_ROW_VERSION, "stale"),
        );
        right.insert(3, EntityError::recoverable(codes::NULL_ID, "id is null"));

        left.merge(right);

        assert_eq!(left.len(), 2);
        let codes: Vec<_> = left
            .get(1)
            .unwrap()
            .iter()
            .map(|error| error.code.as_str())
            .collect();
        assert_eq!(codes, vec!["NULL_ID", "MISMATCHED_ROW_VERSION"]);
        assert!(left.contains(3));
    }

    #[test]
    fn error_type_serializes_in_screaming_case() {
        let error = EntityError::non_recoverable(codes::IDGEN_ERROR, "down");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "NON_RECOVERABLE");
        assert!(!error.is_recoverable());
    }
}
