use futures::future::join_all;

use crate::entity::{BatchRequest, Entity};
use crate::error::{EntityError, ErrorMap};
use crate::validator::{Validator, ValidatorFault};

/// An entity excluded from downstream stages, with everything flagged against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected<E> {
    pub index: usize,
    pub entity: E,
    pub errors: Vec<EntityError>,
}

/// Outcome of validating one batch: each input entity lands in exactly one side.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult<E> {
    pub valid: Vec<E>,
    /// Batch position of each entry in `valid`.
    pub valid_indices: Vec<usize>,
    pub rejected: Vec<Rejected<E>>,
}

impl<E> ValidationResult<E> {
    pub fn has_errors(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Runs every validator concurrently over the same batch and merges their
/// maps in validator order. The first fault, in validator order, wins.
pub async fn validate_batch<E: Entity>(
    request: &BatchRequest<E>,
    validators: &[&dyn Validator<E>],
) -> Result<ErrorMap, ValidatorFault> {
    let outcomes = join_all(
        validators
            .iter()
            .map(|validator| validator.validate(request)),
    )
    .await;

    let mut merged = ErrorMap::new();
    for (validator, outcome) in validators.iter().zip(outcomes) {
        let errors = outcome?;
        if !errors.is_empty() {
            tracing::debug!(
                stage = "validation",
                validator = validator.name(),
                flagged = errors.len(),
                "validator flagged entities"
            );
        }
        merged.merge(errors);
    }
    Ok(merged)
}

/// Splits `entities` into error-free and flagged sides, preserving input order.
/// Map keys outside the batch are ignored.
pub fn partition<E>(entities: Vec<E>, mut errors: ErrorMap) -> ValidationResult<E> {
    let mut valid = Vec::with_capacity(entities.len());
    let mut valid_indices = Vec::with_capacity(entities.len());
    let mut rejected = Vec::new();

    for (index, entity) in entities.into_iter().enumerate() {
        match errors.remove(index) {
            Some(list) if !list.is_empty() => rejected.push(Rejected {
                index,
                entity,
                errors: list,
            }),
            _ => {
                valid.push(entity);
                valid_indices.push(index);
            }
        }
    }

    ValidationResult {
        valid,
        valid_indices,
        rejected,
    }
}
