//! Generic HTTP connector: uniform outbound caller for any integration
//! without a native handler.
//!
//! Actions map onto HTTP methods; authentication follows the integration's
//! declared scheme with credentials fetched per call from the store.
//! Idempotent methods retry on transport errors and 5xx responses with
//! exponential backoff; `POST`/`PATCH` only retry when the caller opts in
//! with `params.idempotency_key`, which is also forwarded downstream as the
//! `Idempotency-Key` header.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{debug, instrument, warn};
use url::Url;

use mycel_types::{AuthScheme, Command, IntegrationSpec};

use crate::credentials::{Credential, CredentialStore};
use crate::FabricError;

/// Truncation limit for upstream error bodies carried in fabric errors.
const MAX_ERROR_BODY_LEN: usize = 2048;

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Bounded retry policy for outbound calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for retryable requests (first try included).
    pub max_attempts: u32,
    /// Base backoff delay, doubled per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

//─────────────────────────────
//  Connector
//─────────────────────────────

/// Uniform HTTP caller for generic integrations.
pub struct HttpConnector {
    client: Client,
    credentials: Arc<dyn CredentialStore>,
    retry: RetryPolicy,
}

impl HttpConnector {
    /// Build a connector over `credentials`.
    ///
    /// The client carries only a connect timeout; the overall dispatch
    /// deadline is the router's to enforce.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Result<Self, FabricError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| FabricError::Internal(format!("cannot build http client: {err}")))?;
        Ok(Self { client, credentials, retry: RetryPolicy::default() })
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute `command` against `spec` and normalize the response to
    /// `{ http_status, body, headers }`.
    #[instrument(skip(self, spec, command), fields(integration = %spec.integration, action = %command.action))]
    pub async fn dispatch(
        &self,
        spec: &IntegrationSpec,
        command: &Command,
    ) -> Result<serde_json::Value, FabricError> {
        let method = method_for_action(&command.action)?;
        let url = build_url(spec, &command.params)?;
        let idempotency_key = command
            .params
            .get("idempotency_key")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let retryable = idempotent(&method) || idempotency_key.is_some();
        let max_attempts = if retryable { self.retry.max_attempts.max(1) } else { 1 };
        let mut oauth_retried = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let request = self.build_request(
                method.clone(),
                url.clone(),
                spec,
                command,
                idempotency_key.as_deref(),
            )?;

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED
                        && spec.auth == AuthScheme::OAuth2
                        && !oauth_retried
                    {
                        // The store refreshes tokens out of band; fetch the
                        // credential once more and retry exactly once.
                        debug!("401 from oauth2 integration; retrying with fresh token");
                        oauth_retried = true;
                        attempt -= 1;
                        continue;
                    }
                    if status.is_server_error() && attempt < max_attempts {
                        let delay = self.retry.delay(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "5xx response; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return normalize_response(response).await;
                }
                Err(err) => {
                    if attempt < max_attempts {
                        let delay = self.retry.delay(attempt);
                        warn!(error = %err, attempt, ?delay, "transport error; backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FabricError::Transport(err.to_string()));
                }
            }
        }
    }

    fn build_request(
        &self,
        method: Method,
        url: Url,
        spec: &IntegrationSpec,
        command: &Command,
        idempotency_key: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, FabricError> {
        let mut request = self.client.request(method, url);
        request = self.apply_auth(request, spec, command)?;

        if let Some(query) = command.params.get("query").and_then(|v| v.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(key, value)| (key.clone(), query_value(value)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = command.params.get("body") {
            request = request.json(body);
        }
        if let Some(key) = idempotency_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| FabricError::MissingParam("idempotency_key".to_string()))?;
            request = request.header("Idempotency-Key", value);
        }
        Ok(request)
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        spec: &IntegrationSpec,
        command: &Command,
    ) -> Result<reqwest::RequestBuilder, FabricError> {
        // Credentials are fetched per call and never cached here.
        match spec.auth {
            AuthScheme::None => Ok(request),
            AuthScheme::ApiKey => {
                let Some(Credential::ApiKey(key)) = self.credentials.credential(&spec.integration)
                else {
                    return Err(FabricError::Credential(spec.integration.clone()));
                };
                if let Some(header) = auth_header_override(spec, command)? {
                    let value = HeaderValue::from_str(key.expose_secret())
                        .map_err(|_| FabricError::Credential(spec.integration.clone()))?;
                    Ok(request.header(header, value))
                } else {
                    let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                        .map_err(|_| FabricError::Credential(spec.integration.clone()))?;
                    Ok(request.header(AUTHORIZATION, value))
                }
            }
            AuthScheme::Basic => {
                let Some(Credential::Basic { username, password }) =
                    self.credentials.credential(&spec.integration)
                else {
                    return Err(FabricError::Credential(spec.integration.clone()));
                };
                Ok(request.basic_auth(username, Some(password.expose_secret())))
            }
            AuthScheme::OAuth2 => {
                let Some(Credential::OAuth2Token(token)) =
                    self.credentials.credential(&spec.integration)
                else {
                    return Err(FabricError::Credential(spec.integration.clone()));
                };
                Ok(request.bearer_auth(token.expose_secret()))
            }
        }
    }
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

fn method_for_action(action: &str) -> Result<Method, FabricError> {
    match action {
        "read" => Ok(Method::GET),
        "create" => Ok(Method::POST),
        "update" => Ok(Method::PUT),
        "patch" => Ok(Method::PATCH),
        "delete" => Ok(Method::DELETE),
        "call" => Ok(Method::POST),
        other => Err(FabricError::UnsupportedAction(other.to_string())),
    }
}

fn idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::PUT | Method::DELETE)
}

fn build_url(spec: &IntegrationSpec, params: &serde_json::Value) -> Result<Url, FabricError> {
    let base = spec
        .base_url
        .as_deref()
        .ok_or_else(|| FabricError::Registry(format!(
            "integration '{}' has no base_url",
            spec.integration
        )))?;
    let endpoint = params
        .get("endpoint")
        .and_then(|v| v.as_str())
        .ok_or_else(|| FabricError::MissingParam("endpoint".to_string()))?;

    // Treat the base URL as a directory root so joining never drops path
    // segments the registry declared.
    let mut base = base.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let parsed = Url::parse(&base)
        .map_err(|err| FabricError::Registry(format!("invalid base_url: {err}")))?;
    parsed
        .join(endpoint.trim_start_matches('/'))
        .map_err(|err| FabricError::MissingParam(format!("endpoint: {err}")))
}

fn auth_header_override(
    spec: &IntegrationSpec,
    command: &Command,
) -> Result<Option<HeaderName>, FabricError> {
    let Some(raw) = command.params.get("auth_header").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let permitted = spec
        .extra
        .get("allow_auth_header_override")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !permitted {
        return Err(FabricError::Schema(format!(
            "integration '{}' does not permit auth_header overrides",
            spec.integration
        )));
    }
    HeaderName::from_bytes(raw.as_bytes())
        .map(Some)
        .map_err(|_| FabricError::MissingParam("auth_header".to_string()))
}

fn query_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn normalize_response(response: reqwest::Response) -> Result<serde_json::Value, FabricError> {
    let status = response.status();
    let headers = header_map_json(response.headers());
    let bytes = response
        .bytes()
        .await
        .map_err(|err| FabricError::Transport(format!("reading body: {err}")))?;
    let body: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(&bytes).to_string()),
    };

    if status.is_success() {
        return Ok(json!({
            "http_status": status.as_u16(),
            "body": body,
            "headers": headers,
        }));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(FabricError::Unauthorized(format!(
            "integration rejected credentials ({status})"
        )));
    }
    let mut truncated = body.to_string();
    if truncated.len() > MAX_ERROR_BODY_LEN {
        let mut cut = MAX_ERROR_BODY_LEN;
        while !truncated.is_char_boundary(cut) {
            cut -= 1;
        }
        truncated.truncate(cut);
    }
    Err(FabricError::Upstream { http_status: status.as_u16(), body: truncated })
}

fn header_map_json(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            map.insert(name.to_string(), serde_json::Value::String(text.to_string()));
        }
    }
    serde_json::Value::Object(map)
}
