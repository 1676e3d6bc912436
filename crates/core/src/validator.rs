use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{BatchRequest, Entity};
use crate::error::ErrorMap;

/// Mutating operation a batch is submitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Verb used in topic names.
    pub fn topic_verb(self) -> &'static str {
        match self {
            Self::Create => "save",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Static capability tag declaring which operations a validator runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliesTo {
    pub create: bool,
    pub update: bool,
    pub delete: bool,
}

impl AppliesTo {
    pub const CREATE: Self = Self::only(true, false, false);
    pub const UPDATE: Self = Self::only(false, true, false);
    pub const DELETE: Self = Self::only(false, false, true);
    pub const CREATE_UPDATE: Self = Self::only(true, true, false);
    pub const UPDATE_DELETE: Self = Self::only(false, true, true);
    pub const ALL: Self = Self::only(true, true, true);

    const fn only(create: bool, update: bool, delete: bool) -> Self {
        Self {
            create,
            update,
            delete,
        }
    }

    pub fn includes(self, operation: Operation) -> bool {
        match operation {
            Operation::Create => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }
}

/// Infrastructure faults a validator cannot encode as per-entity errors.
#[derive(Debug, Error)]
pub enum ValidatorFault {
    #[error("tenant id is missing for entity at index {index} and on the request")]
    MissingTenant { index: usize },
    #[error("validator {validator} could not read the entity store: {message}")]
    Store {
        validator: &'static str,
        message: String,
    },
}

/// One independent check over a whole batch.
///
/// Implementations read the batch, never mutate it and never look at another
/// validator's output. Business-rule violations go into the returned
/// [`ErrorMap`]; `Err` is reserved for faults that affect the whole batch.
#[async_trait]
pub trait Validator<E: Entity>: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self) -> AppliesTo;

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault>;
}

/// Filters the registered validators down to those tagged for `operation`,
/// keeping registration order.
pub fn select_validators<E: Entity>(
    validators: &[Box<dyn Validator<E>>],
    operation: Operation,
) -> Vec<&dyn Validator<E>> {
    validators
        .iter()
        .filter(|validator| validator.applies_to().includes(operation))
        .map(|validator| validator.as_ref())
        .collect()
}
