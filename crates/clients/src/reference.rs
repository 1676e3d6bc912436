use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

use hcm_core::collaborators::{LookupError, ReferenceLookup};

use crate::{parse_json, HttpError};

/// Shape of one search endpoint: where to post, how to wrap the id list and
/// where to find matches in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceEndpoint {
    pub path: &'static str,
    pub criteria_key: &'static str,
    pub id_key: &'static str,
    pub response_key: &'static str,
}

impl ReferenceEndpoint {
    pub const fn project() -> Self {
        Self {
            path: "project/v1/_search",
            criteria_key: "Projects",
            id_key: "id",
            response_key: "Project",
        }
    }

    pub const fn facility() -> Self {
        Self {
            path: "facility/v1/_search",
            criteria_key: "Facility",
            id_key: "id",
            response_key: "Facilities",
        }
    }

    pub const fn boundary() -> Self {
        Self {
            path: "boundary/v1/_search",
            criteria_key: "Boundary",
            id_key: "code",
            response_key: "Boundary",
        }
    }

    pub const fn user() -> Self {
        Self {
            path: "user/_search",
            criteria_key: "User",
            id_key: "uuid",
            response_key: "user",
        }
    }
}

/// [`ReferenceLookup`] over a remote search endpoint.
#[derive(Clone)]
pub struct ReferenceClient {
    http: Client,
    base_url: Url,
    endpoint: ReferenceEndpoint,
}

impl ReferenceClient {
    pub fn new(base_url: Url, endpoint: ReferenceEndpoint, http: Client) -> Self {
        Self {
            http,
            base_url,
            endpoint,
        }
    }

    async fn search(&self, tenant_id: &str, ids: &[String]) -> Result<Value, HttpError> {
        let mut url = self.base_url.join(self.endpoint.path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tenantId", tenant_id);
            query.append_pair("limit", &ids.len().to_string());
            query.append_pair("offset", "0");
        }

        let body = json!({
            "RequestInfo": {},
            (self.endpoint.criteria_key): {
                (self.endpoint.id_key): ids,
                "tenantId": tenant_id,
            },
        });
        let response = self.http.post(url).json(&body).send().await?;
        parse_json(response).await
    }
}

#[async_trait]
impl ReferenceLookup for ReferenceClient {
    async fn fetch_by_ids(
        &self,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<String>, LookupError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body = self
            .search(tenant_id, ids)
            .await
            .map_err(|err| LookupError::Transport(err.to_string()))?;
        let items = body
            .get(self.endpoint.response_key)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                LookupError::Response(format!(
                    "response has no `{}` list",
                    self.endpoint.response_key
                ))
            })?;

        let found: HashSet<&str> = items
            .iter()
            .filter_map(|item| item.get(self.endpoint.id_key).and_then(Value::as_str))
            .collect();
        Ok(ids
            .iter()
            .filter(|id| found.contains(id.as_str()))
            .cloned()
            .collect())
    }
}
