//! REST client implementing the remote record repository contract.
//!
//! Upserts are idempotent keyed on `client_id`: the backing store declares
//! the conflict target on the client-generated id, never on server-assigned
//! identity. Which record types the credential may write is discovered once
//! at first use and cached for the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use sigerd_core::records::{RecordType, RemoteSnapshot, UpsertAck, UpsertRequest};
use sigerd_core::sync::{RemoteError, RemoteRecordRepository, WriteCapabilities};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Source of the bearer token attached to every request.
///
/// Refresh is invoked by the access policy gateway when the remote reports
/// an expired credential; implementations refresh in place so subsequent
/// `access_token` calls return the new token.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;
    async fn refresh(&self) -> Result<(), RemoteError>;
}

/// Fixed-token provider for tests and long-lived service credentials.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, RemoteError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<(), RemoteError> {
        Err(RemoteError::unauthorized(
            "refresh_unsupported",
            "Static credentials cannot be refreshed",
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequestBody<'a> {
    client_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResponseBody {
    records: HashMap<String, RemoteSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesResponseBody {
    writable: Vec<RecordType>,
}

fn record_type_segment(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::RainfallReading => "rainfall_readings",
        RecordType::Inspection => "inspections",
        RecordType::IncidentDeclaration => "incident_declarations",
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::unreachable(err.to_string())
}

/// Map an HTTP failure status and parsed error body into the contract
/// taxonomy. Timeouts, throttling and server errors are transient; 401/403
/// is a permission question for the gateway; 409/412 is optimistic
/// concurrency; anything else is remote-side validation.
fn map_error_status(status: u16, code: String, message: String) -> RemoteError {
    match status {
        401 | 403 => RemoteError::Unauthorized { code, message },
        409 | 412 => RemoteError::Conflict(format!("{}: {}", code, message)),
        408 | 423 | 425 | 429 => RemoteError::unreachable(format!("{} ({})", message, status)),
        500..=599 => RemoteError::unreachable(format!("{} ({})", message, status)),
        _ => RemoteError::Rejected { code, message },
    }
}

/// Client for the authoritative record store's REST API.
pub struct RemoteRecordClient {
    client: reqwest::Client,
    base_url: String,
    token_provider: Arc<dyn AccessTokenProvider>,
    capabilities: OnceCell<WriteCapabilities>,
}

impl RemoteRecordClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the record API (e.g. "https://api.defesacivil.example")
    /// * `token_provider` - Bearer token source for request auth
    pub fn new(base_url: &str, token_provider: Arc<dyn AccessTokenProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_provider,
            capabilities: OnceCell::new(),
        }
    }

    async fn headers(&self) -> Result<HeaderMap, RemoteError> {
        let token = self.token_provider.access_token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            RemoteError::unauthorized("invalid_token", "Invalid access token format")
        })?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(map_error_status(status.as_u16(), error.code, error.message));
            }
            return Err(map_error_status(
                status.as_u16(),
                "http_error".to_string(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            RemoteError::rejected("parse_error", format!("Failed to parse response: {}", e))
        })
    }

    async fn discover_capabilities(&self) -> Result<WriteCapabilities, RemoteError> {
        let url = format!("{}/api/v1/capabilities", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers().await?)
            .send()
            .await
            .map_err(map_transport_error)?;
        let body: CapabilitiesResponseBody = Self::parse_response(response).await?;
        debug!(
            "[RemoteRepository] Discovered write capabilities: {:?}",
            body.writable
        );
        Ok(WriteCapabilities::new(body.writable))
    }
}

#[async_trait]
impl RemoteRecordRepository for RemoteRecordClient {
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertAck, RemoteError> {
        let url = format!(
            "{}/api/v1/records/{}/upsert",
            self.base_url,
            record_type_segment(request.record_type)
        );
        let response = self
            .client
            .post(&url)
            .headers(self.headers().await?)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::parse_response(response).await
    }

    async fn fetch_by_client_ids(
        &self,
        record_type: RecordType,
        client_ids: &[String],
    ) -> Result<HashMap<String, RemoteSnapshot>, RemoteError> {
        let url = format!(
            "{}/api/v1/records/{}/fetch",
            self.base_url,
            record_type_segment(record_type)
        );
        let response = self
            .client
            .post(&url)
            .headers(self.headers().await?)
            .json(&FetchRequestBody { client_ids })
            .send()
            .await
            .map_err(map_transport_error)?;
        let body: FetchResponseBody = Self::parse_response(response).await?;
        Ok(body.records)
    }

    async fn delete(&self, record_type: RecordType, client_id: &str) -> Result<(), RemoteError> {
        let url = format!(
            "{}/api/v1/records/{}/{}",
            self.base_url,
            record_type_segment(record_type),
            client_id
        );
        let response = self
            .client
            .delete(&url)
            .headers(self.headers().await?)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Self::log_response(status, &body);
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
            return Err(map_error_status(status.as_u16(), error.code, error.message));
        }
        Err(map_error_status(
            status.as_u16(),
            "http_error".to_string(),
            format!("Request failed: {}", body),
        ))
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let url = format!("{}/api/v1/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::unreachable(format!(
                "Liveness probe failed: {}",
                response.status()
            )))
        }
    }

    async fn capabilities(&self) -> Result<WriteCapabilities, RemoteError> {
        self.capabilities
            .get_or_try_init(|| self.discover_capabilities())
            .await
            .cloned()
    }
}
