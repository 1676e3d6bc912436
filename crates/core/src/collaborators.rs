use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::entity::RequestInfo;
use crate::error::EntityError;
use crate::validator::Operation;

/// Errors raised by referential and id-pool lookups.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup transport failure: {0}")]
    Transport(String),
    #[error("unexpected lookup response: {0}")]
    Response(String),
    #[error("lookup store failure: {0}")]
    Store(String),
}

/// Errors raised by the ID-generation collaborator.
#[derive(Debug, Error)]
pub enum IdGenError {
    #[error("id generation transport failure: {0}")]
    Transport(String),
    #[error("unexpected id generation response: {0}")]
    Response(String),
    #[error("id generation returned {actual} ids, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Issues server-side identifiers in batches.
#[async_trait]
pub trait IdGenerator: Send + Sync {
    /// Returns exactly `count` identifiers, in order.
    async fn get_id_list(
        &self,
        request_info: &RequestInfo,
        tenant_id: &str,
        format_key: &str,
        prefix: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>, IdGenError>;
}

/// Resolves foreign references (project, facility, boundary, user…) for one tenant.
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    /// Returns the subset of `ids` that exist.
    async fn fetch_by_ids(&self, tenant_id: &str, ids: &[String])
        -> Result<Vec<String>, LookupError>;
}

/// Lifecycle of an identifier issued from an external pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdStatus {
    Unassigned,
    Dispatched,
    Assigned,
    Invalid,
    #[serde(other)]
    Unknown,
}

impl IdStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Dispatched => "DISPATCHED",
            Self::Assigned => "ASSIGNED",
            Self::Invalid => "INVALID",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Pool record for an externally issued identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdRecord {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub status: IdStatus,
    #[serde(default)]
    pub last_modified_by: Option<String>,
}

/// Searches the external id pool.
#[async_trait]
pub trait IdPoolLookup: Send + Sync {
    async fn search_id_records(
        &self,
        request_info: &RequestInfo,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<IdRecord>, LookupError>;
}

/// Identifies the batch a set of error reports came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchContext {
    pub entity_type: &'static str,
    pub operation: Operation,
    pub request_info: RequestInfo,
}

/// One rejected entity, with the payload needed to retry it later.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<String>,
    pub tenant_id: String,
    pub payload: Value,
    pub errors: Vec<EntityError>,
}

/// Out-of-band destination for bulk-mode rejections. Fire-and-forget: sinks
/// log their own failures and never fail the pipeline.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, context: &BatchContext, reports: Vec<ErrorReport>);
}

/// Sink that only logs; used when no persistent sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

#[async_trait]
impl ErrorSink for LogErrorSink {
    async fn report(&self, context: &BatchContext, reports: Vec<ErrorReport>) {
        for report in reports {
            let codes: Vec<&str> = report.errors.iter().map(|e| e.code.as_str()).collect();
            tracing::warn!(
                stage = "errors",
                entity_type = context.entity_type,
                operation = context.operation.as_str(),
                index = report.index,
                client_reference_id = report.client_reference_id.as_deref().unwrap_or(""),
                codes = ?codes,
                "entity rejected"
            );
        }
    }
}
