pub mod id_pool;
pub mod idgen;
pub mod reference;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use id_pool::IdPoolClient;
pub use idgen::{IdGenClient, UuidIdGenerator};
pub use reference::{ReferenceClient, ReferenceEndpoint};

/// Transport-level failures shared by the HTTP collaborators.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, HttpError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HttpError::Status { status, body });
    }

    Ok(response.json().await?)
}
