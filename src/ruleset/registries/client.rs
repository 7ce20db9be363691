//! HTTP plumbing shared by the REST and object-store backends

use std::time::Duration;

use reqwest::{Response, StatusCode};
use tracing::warn;

use crate::config::RegistrySpec;
use crate::ruleset::error::{ConfigError, RegistryError};

const USER_AGENT: &str = concat!("arm/", env!("CARGO_PKG_VERSION"));

/// Client with the registry's timeout applied to every request
pub fn build_client(spec: &RegistrySpec) -> Result<reqwest::Client, ConfigError> {
    build_client_with_timeout(&spec.name, spec.timeout())
}

pub fn build_client_with_timeout(
    registry: &str,
    timeout: Duration,
) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|source| ConfigError::HttpClient {
            registry: registry.to_string(),
            source,
        })
}

/// Map error statuses to [`RegistryError`], passing successful responses through
pub async fn check_response(response: Response, what: &str) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        return Err(RegistryError::NotFound(what.to_string()));
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let quota_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        return Err(RegistryError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RegistryError::Unauthorized(format!("{} ({})", what, status)));
    }

    warn!("Unexpected status {} for {}", status, what);
    Err(RegistryError::InvalidResponse(format!(
        "Unexpected status: {}",
        status
    )))
}

/// Parse a JSON body, reporting failures as invalid responses
pub async fn json<T: serde::de::DeserializeOwned>(
    response: Response,
    what: &str,
) -> Result<T, RegistryError> {
    response.json().await.map_err(|e| {
        warn!("Failed to parse response for {}: {}", what, e);
        RegistryError::InvalidResponse(e.to_string())
    })
}
