//! Generic bulk processing pipeline for campaign entities.
//!
//! A batch flows through validator selection, concurrent validation,
//! partitioning, enrichment and persistence. [`service::EntityService`] wires
//! those stages together for one entity type; the collaborator traits in
//! [`collaborators`] and [`repository`] are the seams to external systems.

pub mod collaborators;
pub mod domain;
pub mod enrichment;
pub mod entity;
pub mod error;
pub mod orchestrator;
pub mod repository;
pub mod service;
pub mod validator;
pub mod validators;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use entity::{BatchRequest, Entity, IdField, RequestInfo};
pub use error::{EntityError, ErrorMap};
pub use service::{EntityService, ServiceError};
pub use validator::{AppliesTo, Operation, Validator};
