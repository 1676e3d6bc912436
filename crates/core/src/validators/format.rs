use async_trait::async_trait;

use crate::entity::{BatchRequest, Entity};
use crate::error::{codes, EntityError, ErrorMap};
use crate::validator::{AppliesTo, Validator, ValidatorFault};
use crate::validators::FieldFn;

/// Constraint applied to one string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCheck {
    /// Must be present and non-blank.
    Required,
    /// When present, exactly `len` ASCII digits.
    Digits(usize),
    /// When present, at most this many characters.
    MaxLength(usize),
}

pub struct FieldRule<E> {
    pub field: &'static str,
    pub extract: FieldFn<E>,
    pub check: FieldCheck,
}

impl<E> FieldRule<E> {
    pub fn new(field: &'static str, extract: FieldFn<E>, check: FieldCheck) -> Self {
        Self {
            field,
            extract,
            check,
        }
    }

    fn evaluate(&self, entity: &E) -> Option<EntityError> {
        let value = (self.extract)(entity).filter(|value| !value.trim().is_empty());
        match (self.check, value) {
            (FieldCheck::Required, None) => Some(EntityError::recoverable(
                codes::MISSING_FIELD,
                format!("{} is required", self.field),
            )),
            (FieldCheck::Digits(len), Some(value))
                if value.len() != len || !value.bytes().all(|b| b.is_ascii_digit()) =>
            {
                Some(EntityError::recoverable(
                    codes::INVALID_FORMAT,
                    format!("{} must be exactly {len} digits", self.field),
                ))
            }
            (FieldCheck::MaxLength(max), Some(value)) if value.chars().count() > max => {
                Some(EntityError::recoverable(
                    codes::INVALID_FORMAT,
                    format!("{} must be at most {max} characters", self.field),
                ))
            }
            _ => None,
        }
    }
}

/// Required-field and pattern checks. Every failing rule contributes one error.
pub struct FieldFormatValidator<E> {
    rules: Vec<FieldRule<E>>,
    applies_to: AppliesTo,
}

impl<E> FieldFormatValidator<E> {
    pub fn new(applies_to: AppliesTo, rules: Vec<FieldRule<E>>) -> Self {
        Self { rules, applies_to }
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for FieldFormatValidator<E> {
    fn name(&self) -> &'static str {
        "field_format"
    }

    fn applies_to(&self) -> AppliesTo {
        self.applies_to
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            for rule in &self.rules {
                if let Some(error) = rule.evaluate(entity) {
                    errors.insert(index, error);
                }
            }
        }
        Ok(errors)
    }
}

/// Exactly one field of the group must be set.
pub struct ExactlyOneOfValidator<E> {
    fields: Vec<(&'static str, FieldFn<E>)>,
    applies_to: AppliesTo,
}

impl<E> ExactlyOneOfValidator<E> {
    pub fn new(applies_to: AppliesTo, fields: Vec<(&'static str, FieldFn<E>)>) -> Self {
        Self { fields, applies_to }
    }

    fn field_names(&self) -> String {
        self.fields
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl<E: Entity> Validator<E> for ExactlyOneOfValidator<E> {
    fn name(&self) -> &'static str {
        "exactly_one_of"
    }

    fn applies_to(&self) -> AppliesTo {
        self.applies_to
    }

    async fn validate(&self, request: &BatchRequest<E>) -> Result<ErrorMap, ValidatorFault> {
        let mut errors = ErrorMap::new();
        for (index, entity) in request.entities.iter().enumerate() {
            let present = self
                .fields
                .iter()
                .filter(|(_, extract)| extract(entity).is_some_and(|v| !v.trim().is_empty()))
                .count();
            if present != 1 {
                errors.insert(
                    index,
                    EntityError::recoverable(
                        codes::EXACTLY_ONE_OF,
                        format!("exactly one of [{}] must be set, found {present}", self.field_names()),
                    ),
                );
            }
        }
        Ok(errors)
    }
}
