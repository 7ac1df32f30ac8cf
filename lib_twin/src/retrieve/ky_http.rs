//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with exponential
//! backoff retries from `reqwest-retry` and JSON response handling.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::UpstreamError;

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with the status and headers of the
/// HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, bearer authentication and automatic retries of
/// transient failures.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client rooted at `base_url`.
    ///
    /// A trailing slash is added to the base URL so relative paths join below
    /// it instead of replacing its last segment.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, UpstreamError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)
            .map_err(|e| UpstreamError::Transport(format!("invalid base url {:?}: {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request and decodes a 2xx body as `T`.
    ///
    /// Non-2xx responses are returned as `ApiResponse { success: false, .. }`
    /// with the body captured; only transport and decode failures are errors.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, UpstreamError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let mut req = self.inner.request(method, full_url);

        if !query.is_empty() {
            req = req.query(query);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(b).map_err(|e| UpstreamError::Decode(e.to_string()))?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            let data = if text.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str::<T>(&text).map_err(|e| UpstreamError::Decode(e.to_string()))?)
            };
            Ok(ApiResponse {
                data,
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = ApiClient::new("http://proxy.local/api", None, Duration::from_secs(1), 0).unwrap();
        assert_eq!(client.base_url().as_str(), "http://proxy.local/api/");
        assert_eq!(
            client.base_url().join("v1/x").unwrap().as_str(),
            "http://proxy.local/api/v1/x"
        );
    }

    #[test]
    fn test_relative_base_url_is_rejected() {
        assert!(matches!(
            ApiClient::new("not a url", None, Duration::from_secs(1), 0),
            Err(UpstreamError::Transport(_))
        ));
    }
}
