use std::sync::OnceLock;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PlexusError, PlexusErrorCode};

pub(super) fn join_url(base_url: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(super) fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
}

/// Headers every request of one adapter carries. The credential value is
/// marked sensitive so it never shows up in debug output.
pub(super) fn auth_headers(scheme: &str, api_key: &str) -> Result<HeaderMap, PlexusError> {
    let mut value = HeaderValue::from_str(&format!("{scheme} {api_key}")).map_err(|_| {
        PlexusError::new(
            PlexusErrorCode::ConfigurationInvalid,
            "API key contains characters that cannot be sent in a header",
        )
    })?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// The HTTP resources owned by one adapter instance.
///
/// The async client is built eagerly. The blocking client is built on first
/// synchronous use, since constructing it inside an async runtime panics.
pub(super) struct HttpClients {
    provider: String,
    base_url: String,
    headers: HeaderMap,
    client: Client,
    blocking: OnceLock<reqwest::blocking::Client>,
}

impl HttpClients {
    pub(super) fn new(
        provider: &str,
        base_url: &str,
        headers: HeaderMap,
    ) -> Result<Self, PlexusError> {
        let mut builder = Client::builder().default_headers(headers.clone());
        if is_loopback_base_url(base_url) {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|error| client_build_error(provider, error))?;

        Ok(Self {
            provider: provider.to_string(),
            base_url: base_url.to_string(),
            headers,
            client,
            blocking: OnceLock::new(),
        })
    }

    pub(super) fn endpoint(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn blocking_client(&self) -> Result<&reqwest::blocking::Client, PlexusError> {
        if let Some(client) = self.blocking.get() {
            return Ok(client);
        }
        let mut builder =
            reqwest::blocking::Client::builder().default_headers(self.headers.clone());
        if is_loopback_base_url(&self.base_url) {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|error| client_build_error(&self.provider, error))?;
        Ok(self.blocking.get_or_init(|| client))
    }

    /// Sends a JSON POST and returns the successful response along with the
    /// time spent until its headers arrived.
    pub(super) fn post_blocking(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<(reqwest::blocking::Response, Duration), PlexusError> {
        let endpoint = self.endpoint(path);
        debug!(provider = %self.provider, endpoint = %endpoint, payload = %payload, "POST");
        let started = Instant::now();
        let response = self
            .blocking_client()?
            .post(endpoint.as_str())
            .json(payload)
            .send()
            .map_err(|error| self.transport_error(error))?;
        let elapsed = started.elapsed();
        Ok((self.check_blocking(response)?, elapsed))
    }

    pub(super) fn get_blocking(
        &self,
        path: &str,
    ) -> Result<(reqwest::blocking::Response, Duration), PlexusError> {
        let endpoint = self.endpoint(path);
        debug!(provider = %self.provider, endpoint = %endpoint, "GET");
        let started = Instant::now();
        let response = self
            .blocking_client()?
            .get(endpoint.as_str())
            .send()
            .map_err(|error| self.transport_error(error))?;
        let elapsed = started.elapsed();
        Ok((self.check_blocking(response)?, elapsed))
    }

    pub(super) async fn post(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<(reqwest::Response, Duration), PlexusError> {
        let endpoint = self.endpoint(path);
        debug!(provider = %self.provider, endpoint = %endpoint, payload = %payload, "POST");
        let started = Instant::now();
        let response = self
            .client
            .post(endpoint.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;
        let elapsed = started.elapsed();
        Ok((self.check(response).await?, elapsed))
    }

    pub(super) async fn get(
        &self,
        path: &str,
    ) -> Result<(reqwest::Response, Duration), PlexusError> {
        let endpoint = self.endpoint(path);
        debug!(provider = %self.provider, endpoint = %endpoint, "GET");
        let started = Instant::now();
        let response = self
            .client
            .get(endpoint.as_str())
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;
        let elapsed = started.elapsed();
        Ok((self.check(response).await?, elapsed))
    }

    pub(super) fn read_json_blocking(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<Value, PlexusError> {
        let body = response.text().map_err(|error| self.transport_error(error))?;
        self.parse_json(&body)
    }

    pub(super) async fn read_json(
        &self,
        response: reqwest::Response,
    ) -> Result<Value, PlexusError> {
        let body = response
            .text()
            .await
            .map_err(|error| self.transport_error(error))?;
        self.parse_json(&body)
    }

    fn parse_json(&self, body: &str) -> Result<Value, PlexusError> {
        serde_json::from_str(body).map_err(|error| {
            PlexusError::new(
                PlexusErrorCode::ProviderProtocol,
                format!("{} returned invalid JSON: {error}", self.provider),
            )
            .with_details(json!({ "body": truncate_body(body) }))
        })
    }

    fn check_blocking(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, PlexusError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .unwrap_or_else(|_| "unable to read error body".to_string());
        Err(self.http_error(status, &body))
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, PlexusError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());
        Err(self.http_error(status, &body))
    }

    fn http_error(&self, status: u16, body: &str) -> PlexusError {
        PlexusError::new(
            PlexusErrorCode::ProviderHttp,
            format!("{} HTTP {status}: {}", self.provider, truncate_body(body)),
        )
        .with_details(json!({
            "provider": self.provider,
            "status": status,
            "body": truncate_body(body),
        }))
    }

    fn transport_error(&self, error: reqwest::Error) -> PlexusError {
        PlexusError::new(
            PlexusErrorCode::ProviderTransport,
            format!("{} transport failed: {error}", self.provider),
        )
        .with_details(json!({ "provider": self.provider }))
    }
}

fn client_build_error(provider: &str, error: reqwest::Error) -> PlexusError {
    PlexusError::new(
        PlexusErrorCode::ConfigurationInvalid,
        format!("{provider} HTTP client could not be built: {error}"),
    )
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 2048;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("https://a/v1", "chat"), "https://a/v1/chat");
        assert_eq!(join_url("https://a/v1/", "/chat"), "https://a/v1/chat");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_base_url("http://127.0.0.1:8080/v1"));
        assert!(is_loopback_base_url("http://localhost"));
        assert!(!is_loopback_base_url("https://api.groq.com/openai/v1"));
        assert!(!is_loopback_base_url("not a url"));
    }

    #[test]
    fn auth_header_value_is_sensitive() {
        let headers = auth_headers("Bearer", "sk-1").expect("headers");
        let value = headers.get(AUTHORIZATION).expect("authorization header");
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().ok(), Some("Bearer sk-1"));
    }

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let body = "é".repeat(2000);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 2051);
    }
}
