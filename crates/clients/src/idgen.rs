use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use hcm_core::collaborators::{IdGenError, IdGenerator};
use hcm_core::entity::RequestInfo;

use crate::{parse_json, HttpError};

/// Client for the remote ID-generation service.
#[derive(Clone)]
pub struct IdGenClient {
    http: Client,
    base_url: Url,
}

impl IdGenClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    async fn generate(&self, body: &GenerateRequest<'_>) -> Result<GenerateResponse, HttpError> {
        let url = self.base_url.join("id/_generate")?;
        let response = self.http.post(url).json(body).send().await?;
        parse_json(response).await
    }
}

#[async_trait]
impl IdGenerator for IdGenClient {
    async fn get_id_list(
        &self,
        request_info: &RequestInfo,
        tenant_id: &str,
        format_key: &str,
        prefix: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>, IdGenError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let body = GenerateRequest {
            request_info,
            id_requests: vec![IdRequest {
                id_name: format_key,
                tenant_id,
                format: prefix,
                count,
            }],
        };
        let response = self.generate(&body).await.map_err(to_idgen_error)?;
        let ids: Vec<String> = response.id_responses.into_iter().map(|r| r.id).collect();
        if ids.len() != count {
            return Err(IdGenError::CountMismatch {
                expected: count,
                actual: ids.len(),
            });
        }
        tracing::debug!(tenant_id, format_key, count, "generated ids");
        Ok(ids)
    }
}

fn to_idgen_error(err: HttpError) -> IdGenError {
    match err {
        HttpError::Http(inner) if inner.is_decode() => IdGenError::Response(inner.to_string()),
        other => IdGenError::Transport(other.to_string()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    #[serde(rename = "RequestInfo")]
    request_info: &'a RequestInfo,
    id_requests: Vec<IdRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdRequest<'a> {
    id_name: &'a str,
    tenant_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    count: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    id_responses: Vec<IdResponse>,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

/// Local generator used when no remote ID service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

#[async_trait]
impl IdGenerator for UuidIdGenerator {
    async fn get_id_list(
        &self,
        _request_info: &RequestInfo,
        _tenant_id: &str,
        _format_key: &str,
        prefix: Option<&str>,
        count: usize,
    ) -> Result<Vec<String>, IdGenError> {
        Ok((0..count)
            .map(|_| match prefix {
                Some(prefix) => format!("{prefix}{}", Uuid::new_v4()),
                None => Uuid::new_v4().to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> IdGenClient {
        let base = Url::parse(&server.url("/egov-idgen/")).expect("url");
        IdGenClient::new(base, Client::builder().build().expect("client"))
    }

    #[tokio::test]
    async fn requests_one_batch_for_the_tenant() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/egov-idgen/id/_generate")
                    .json_body_partial(
                        json!({
                            "idRequests": [
                                {"idName": "project.task.id", "tenantId": "t1", "count": 2}
                            ]
                        })
                        .to_string(),
                    );
                then.status(200).json_body(json!({
                    "idResponses": [{"id": "PT-1"}, {"id": "PT-2"}]
                }));
            })
            .await;

        let ids = client(&server)
            .get_id_list(
                &RequestInfo::for_user("u-1", "t1"),
                "t1",
                "project.task.id",
                None,
                2,
            )
            .await
            .expect("ids");
        mock.assert_async().await;
        assert_eq!(ids, vec!["PT-1", "PT-2"]);
    }

    #[tokio::test]
    async fn short_response_is_a_count_mismatch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/egov-idgen/id/_generate");
                then.status(200)
                    .json_body(json!({"idResponses": [{"id": "PT-1"}]}));
            })
            .await;

        let err = client(&server)
            .get_id_list(&RequestInfo::default(), "t1", "project.task.id", None, 3)
            .await
            .expect_err("should error");
        assert!(matches!(
            err,
            IdGenError::CountMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn error_status_is_a_transport_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/egov-idgen/id/_generate");
                then.status(503).body("unavailable");
            })
            .await;

        let err = client(&server)
            .get_id_list(&RequestInfo::default(), "t1", "referral.id", None, 1)
            .await
            .expect_err("should error");
        match err {
            IdGenError::Transport(message) => assert!(message.contains("unavailable")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn uuid_generator_issues_distinct_ids() {
        let ids = UuidIdGenerator
            .get_id_list(&RequestInfo::default(), "t1", "side.effect.id", Some("SE-"), 3)
            .await
            .expect("ids");
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.starts_with("SE-")));
        assert_ne!(ids[0], ids[1]);
    }
}
