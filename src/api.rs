//! Thin HTTP layer over reqwest.
//!
//! `ApiClient` resolves endpoint paths against the base URL, sends JSON and
//! attaches the bearer token. It does not interpret status codes; each
//! coordinator decides what counts as success for its own endpoint.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ClientError> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Attach `Authorization: Bearer <token>` when a token is present.
    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self, ClientError> {
        // Url::join drops the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve a relative endpoint path such as `feature/42/vote/`.
    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidUrl(format!("{path}: {e}")))
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let url = self.endpoint(&request.path)?;
        debug!(
            method = %request.method,
            %url,
            authenticated = request.bearer.is_some(),
            "sending request"
        );

        let mut builder = self
            .http
            .request(request.method, url)
            .header(CONTENT_TYPE, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let res = builder.send().await?;
        let status = res.status();
        let body = res.bytes().await?.to_vec();
        debug!(%status, bytes = body.len(), "received response");

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = ApiClient::new("http://127.0.0.1:8000/api").unwrap();
        assert_eq!(
            api.endpoint("feature/42/vote/").unwrap().as_str(),
            "http://127.0.0.1:8000/api/feature/42/vote/"
        );
        assert_eq!(
            api.endpoint("/auth/login/").unwrap().as_str(),
            "http://127.0.0.1:8000/api/auth/login/"
        );
    }

    #[test]
    fn test_malformed_base_is_a_config_fault() {
        assert!(matches!(
            ApiClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            ApiClient::new("mailto:someone@example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_transport_fault() {
        // Port 9 (discard) on localhost is closed on test machines.
        let api = ApiClient::new("http://127.0.0.1:9/api").unwrap();
        let err = api.execute(ApiRequest::get("features/")).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.to_string().starts_with("Network error: "));
    }
}
