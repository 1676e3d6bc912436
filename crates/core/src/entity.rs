use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::repository::SearchCriteria;

/// Audit metadata stamped on every persisted entity. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDetails {
    pub created_by: String,
    pub created_time: i64,
    pub last_modified_by: String,
    pub last_modified_time: i64,
}

impl AuditDetails {
    /// Audit details for a freshly created record: created* and lastModified* are identical.
    pub fn for_create(user_id: &str, now_ms: i64) -> Self {
        Self {
            created_by: user_id.to_string(),
            created_time: now_ms,
            last_modified_by: user_id.to_string(),
            last_modified_time: now_ms,
        }
    }

    /// Returns a copy with only the lastModified* fields refreshed.
    pub fn touched(&self, user_id: &str, now_ms: i64) -> Self {
        Self {
            last_modified_by: user_id.to_string(),
            last_modified_time: now_ms,
            ..self.clone()
        }
    }
}

/// Identity, versioning and audit fields shared by every entity type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub row_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_details: Option<AuditDetails>,
}

/// Which identifier column a by-id lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdField {
    Id,
    ClientReferenceId,
}

impl IdField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::ClientReferenceId => "clientReferenceId",
        }
    }

    /// Reads this identifier from an entity.
    pub fn value_of<E: Entity>(self, entity: &E) -> Option<&str> {
        match self {
            Self::Id => entity.id(),
            Self::ClientReferenceId => entity.client_reference_id(),
        }
    }
}

impl fmt::Display for IdField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view of a nested record (address, identifier, resource…) owned by an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubEntityRef<'a> {
    pub kind: &'static str,
    pub key: &'a str,
    pub id: Option<&'a str>,
    pub is_deleted: bool,
}

/// Inputs available to an entity when it stamps its nested records.
pub struct ChildContext<'a> {
    pub parent_id: Option<&'a str>,
    pub audit: &'a AuditDetails,
    pub new_id: &'a (dyn Fn() -> String + Send + Sync),
}

/// A record type processed by the bulk pipeline.
///
/// Implementors only expose their [`EntityMeta`]; every accessor used by the
/// validators, enrichment and repository is derived from it.
pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kebab-case type name, used for topic names and storage partitioning.
    const ENTITY_TYPE: &'static str;
    /// Format key handed to the ID-generation collaborator.
    const ID_FORMAT: &'static str;

    type Criteria: SearchCriteria;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> Option<&str> {
        self.meta().id.as_deref().filter(|value| !value.trim().is_empty())
    }

    fn client_reference_id(&self) -> Option<&str> {
        self.meta()
            .client_reference_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }

    fn tenant_id(&self) -> &str {
        &self.meta().tenant_id
    }

    fn is_deleted(&self) -> bool {
        self.meta().is_deleted
    }

    fn row_version(&self) -> i64 {
        self.meta().row_version
    }

    fn audit_details(&self) -> Option<&AuditDetails> {
        self.meta().audit_details.as_ref()
    }

    fn last_modified_time(&self) -> Option<i64> {
        self.audit_details().map(|audit| audit.last_modified_time)
    }

    /// Nested records subject to uniqueness and soft-delete checks.
    fn sub_entities(&self) -> Vec<SubEntityRef<'_>> {
        Vec::new()
    }

    /// Assigns ids and audit metadata to nested records during enrichment.
    fn enrich_children(&mut self, _context: &ChildContext<'_>) {}
}

/// Requesting user as carried in the request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Request metadata shared by every entity in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub user_info: UserInfo,
}

impl RequestInfo {
    pub fn for_user(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            api_id: None,
            msg_id: None,
            user_info: UserInfo {
                uuid: user_id.into(),
                tenant_id: Some(tenant_id.into()),
            },
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_info.uuid
    }
}

/// An ordered batch of entities submitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest<E> {
    pub request_info: RequestInfo,
    pub entities: Vec<E>,
}

impl<E: Entity> BatchRequest<E> {
    pub fn new(request_info: RequestInfo, entities: Vec<E>) -> Self {
        Self {
            request_info,
            entities,
        }
    }

    /// Wraps a single entity as a batch of one.
    pub fn single(request_info: RequestInfo, entity: E) -> Self {
        Self::new(request_info, vec![entity])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Tenant declared on the request envelope, if any.
    pub fn request_tenant(&self) -> Option<&str> {
        self.request_info
            .user_info
            .tenant_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }

    /// Effective tenant for one entity: its own tenant, else the request's.
    pub fn tenant_of(&self, index: usize) -> Option<&str> {
        let own = self
            .entities
            .get(index)
            .map(|entity| entity.tenant_id())
            .filter(|value| !value.trim().is_empty());
        own.or_else(|| self.request_tenant())
    }
}
