use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use hcm_core::collaborators::{IdPoolLookup, IdRecord, LookupError};
use hcm_core::entity::RequestInfo;

use crate::{parse_json, HttpError};

/// Client for the beneficiary id pool search.
#[derive(Clone)]
pub struct IdPoolClient {
    http: Client,
    base_url: Url,
}

impl IdPoolClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    async fn search(&self, body: &IdPoolSearchRequest<'_>) -> Result<IdPoolSearchResponse, HttpError> {
        let url = self.base_url.join("id/id_pool/_search")?;
        let response = self.http.post(url).json(body).send().await?;
        parse_json(response).await
    }
}

#[async_trait]
impl IdPoolLookup for IdPoolClient {
    async fn search_id_records(
        &self,
        request_info: &RequestInfo,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<IdRecord>, LookupError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body = IdPoolSearchRequest {
            request_info,
            id_pool_search: IdPoolSearch {
                id_list: ids,
                tenant_id,
            },
        };
        let response = self.search(&body).await.map_err(|err| match err {
            HttpError::Http(inner) if inner.is_decode() => LookupError::Response(inner.to_string()),
            other => LookupError::Transport(other.to_string()),
        })?;
        Ok(response.id_responses)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdPoolSearchRequest<'a> {
    #[serde(rename = "RequestInfo")]
    request_info: &'a RequestInfo,
    id_pool_search: IdPoolSearch<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdPoolSearch<'a> {
    id_list: &'a [String],
    tenant_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdPoolSearchResponse {
    #[serde(default)]
    id_responses: Vec<IdRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcm_core::collaborators::IdStatus;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> IdPoolClient {
        let base = Url::parse(&server.url("/beneficiary-idgen/")).expect("url");
        IdPoolClient::new(base, Client::builder().build().expect("client"))
    }

    #[tokio::test]
    async fn parses_records_and_statuses() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/beneficiary-idgen/id/id_pool/_search")
                    .json_body_partial(
                        json!({"idPoolSearch": {"idList": ["B-1", "B-2"], "tenantId": "t1"}})
                            .to_string(),
                    );
                then.status(200).json_body(json!({
                    "idResponses": [
                        {"id": "B-1", "tenantId": "t1", "status": "DISPATCHED", "lastModifiedBy": "u-1"},
                        {"id": "B-2", "tenantId": "t1", "status": "RESERVED"}
                    ]
                }));
            })
            .await;

        let records = client(&server)
            .search_id_records(
                &RequestInfo::for_user("u-1", "t1"),
                "t1",
                &["B-1".into(), "B-2".into()],
            )
            .await
            .expect("records");
        mock.assert_async().await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, IdStatus::Dispatched);
        assert_eq!(records[0].last_modified_by.as_deref(), Some("u-1"));
        assert_eq!(records[1].status, IdStatus::Unknown);
    }

    #[tokio::test]
    async fn error_status_is_a_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/beneficiary-idgen/id/id_pool/_search");
                then.status(502).body("bad gateway");
            })
            .await;

        let err = client(&server)
            .search_id_records(&RequestInfo::default(), "t1", &["B-1".into()])
            .await
            .expect_err("should error");
        assert!(matches!(err, LookupError::Transport(_)));
    }
}
