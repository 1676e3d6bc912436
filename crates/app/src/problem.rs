use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use hcm_core::error::codes;
use hcm_core::service::{RejectedEntity, ServiceError};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<RejectedEntity>,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
                errors: Vec::new(),
            },
        }
    }

    /// Attaches per-entity errors as the `errors` extension member.
    pub fn with_errors(mut self, errors: Vec<RejectedEntity>) -> Self {
        self.body.errors = errors;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ServiceError> for ProblemResponse {
    fn from(err: ServiceError) -> Self {
        let detail = err.to_string();
        match err {
            ServiceError::Rejected { rejected, .. } => {
                let failed_downstream = rejected
                    .iter()
                    .flat_map(|entity| entity.errors.iter())
                    .any(|error| {
                        matches!(error.code.as_str(), codes::PERSISTENCE_ERROR | codes::IDGEN_ERROR)
                    });
                if failed_downstream {
                    Self::new(StatusCode::INTERNAL_SERVER_ERROR, "processing_failed", detail)
                        .with_errors(rejected)
                } else {
                    Self::new(StatusCode::BAD_REQUEST, "validation_failed", detail)
                        .with_errors(rejected)
                }
            }
            ServiceError::MissingTenant => {
                Self::new(StatusCode::BAD_REQUEST, "missing_tenant", detail)
            }
            ServiceError::Search(_) => {
                tracing::error!(stage = "search", error = %detail, "search failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "search_failed", detail)
            }
            ServiceError::EmptyResult => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "empty_result", detail)
            }
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
