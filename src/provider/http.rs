//! HTTP/JSON clients for the external services.
//!
//! Status mapping: 429 -> rate limited (honouring `Retry-After`), 408/5xx and
//! connection failures -> transient, anything else non-2xx -> terminal.

use crate::config::ServiceEndpoints;
use crate::design::DesignSpecification;
use crate::error::ServiceError;
use crate::provider::{
    CompositionRequest, CompositionResult, CompositionService, DesignFingerprint,
    FingerprintService, GeneratedArtifact, GenerationRequest, GenerationService, PanelFormatter,
    SimilarityScore, SimilarityService,
};
use crate::types::{ArtifactRef, PanelRole};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const SERVICE_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

fn build_service_http_client(request_timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .connect_timeout(SERVICE_HTTP_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(|e| ServiceError::terminal(format!("Failed to create HTTP client: {}", e)))
}

// Helper function to map transport errors to ServiceError
fn map_http_error(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::transient(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ServiceError::transient(format!("Connection error: {}", error))
    } else if error.is_decode() {
        ServiceError::terminal(format!("Failed to decode response: {}", error))
    } else {
        ServiceError::transient(format!("HTTP error: {}", error))
    }
}

/// `Retry-After` in delta-seconds form, capped at `ceiling`. HTTP-date values
/// are ignored; values too large for a `Duration` are capped.
pub fn parse_retry_after(headers: &HeaderMap, ceiling: Duration) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| !secs.is_nan() && *secs >= 0.0)?;
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(ceiling, |hint| hint.min(ceiling)),
    )
}

pub fn map_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ServiceError {
    match status.as_u16() {
        429 => ServiceError::rate_limited(format!("Rate limit exceeded: {}", body), retry_after),
        408 | 500..=599 => ServiceError::Transient {
            message: format!("Request failed with status {}: {}", status, body),
            retry_after,
        },
        _ => ServiceError::terminal(format!("Request failed with status {}: {}", status, body)),
    }
}

/// Shared JSON POST plumbing for all service clients.
#[derive(Clone)]
pub struct ServiceHttpClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retry_after: Duration,
}

impl ServiceHttpClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_service_http_client(request_timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        })
    }

    pub fn with_max_retry_after(mut self, ceiling: Duration) -> Self {
        self.max_retry_after = ceiling;
        self
    }

    pub async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        let response = request.send().await.map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers(), self.max_retry_after);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, retry_after, &error_text));
        }
        debug!(url = %url, status = %status, "Service response received");

        response
            .json::<Resp>()
            .await
            .map_err(|e| ServiceError::terminal(format!("Failed to parse response: {}", e)))
    }
}

pub struct HttpGenerationClient {
    http: ServiceHttpClient,
    name: String,
}

impl HttpGenerationClient {
    pub fn new(http: ServiceHttpClient) -> Self {
        Self {
            name: format!("http:{}", http.base_url),
            http,
        }
    }
}

#[async_trait]
impl GenerationService for HttpGenerationClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, ServiceError> {
        self.http.post_json("generate", &request).await
    }

    fn service_name(&self) -> &str {
        &self.name
    }
}

pub struct HttpSimilarityClient {
    http: ServiceHttpClient,
}

impl HttpSimilarityClient {
    pub fn new(http: ServiceHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SimilarityService for HttpSimilarityClient {
    async fn score(
        &self,
        candidate: &ArtifactRef,
        fingerprint: &DesignFingerprint,
    ) -> Result<SimilarityScore, ServiceError> {
        let body = json!({
            "candidate_artifact": candidate,
            "fingerprint": fingerprint,
        });
        let score: SimilarityScore = self.http.post_json("score", &body).await?;
        if !(0.0..=1.0).contains(&score.score) {
            return Err(ServiceError::terminal(format!(
                "Similarity score {} outside [0, 1]",
                score.score
            )));
        }
        Ok(score)
    }
}

pub struct HttpFingerprintClient {
    http: ServiceHttpClient,
}

impl HttpFingerprintClient {
    pub fn new(http: ServiceHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FingerprintService for HttpFingerprintClient {
    async fn extract(
        &self,
        anchor: &ArtifactRef,
        design: &DesignSpecification,
    ) -> Result<DesignFingerprint, ServiceError> {
        let body = json!({
            "anchor_artifact": anchor,
            "design_specification": design,
        });
        self.http.post_json("fingerprint", &body).await
    }
}

pub struct HttpCompositionClient {
    http: ServiceHttpClient,
}

impl HttpCompositionClient {
    pub fn new(http: ServiceHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CompositionService for HttpCompositionClient {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionResult, ServiceError> {
        self.http.post_json("compose", &request).await
    }
}

#[derive(Serialize)]
struct FormatRequest<'a> {
    role: &'a PanelRole,
    design_specification: &'a DesignSpecification,
}

#[derive(Deserialize)]
struct FormatResponse {
    artifact_ref: ArtifactRef,
}

pub struct HttpPanelFormatter {
    http: ServiceHttpClient,
}

impl HttpPanelFormatter {
    pub fn new(http: ServiceHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PanelFormatter for HttpPanelFormatter {
    async fn render(
        &self,
        role: &PanelRole,
        design: &DesignSpecification,
    ) -> Result<ArtifactRef, ServiceError> {
        let response: FormatResponse = self
            .http
            .post_json(
                "format",
                &FormatRequest {
                    role,
                    design_specification: design,
                },
            )
            .await?;
        Ok(response.artifact_ref)
    }
}

/// All HTTP collaborators built from one endpoint configuration.
pub struct HttpServices {
    pub generation: HttpGenerationClient,
    pub similarity: HttpSimilarityClient,
    pub fingerprint: HttpFingerprintClient,
    pub composition: HttpCompositionClient,
    pub formatter: HttpPanelFormatter,
}

impl HttpServices {
    pub fn from_endpoints(endpoints: &ServiceEndpoints) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(endpoints.request_timeout_secs);
        let ceiling = Duration::from_secs(endpoints.max_retry_after_secs);
        let client = |url: &str| {
            ServiceHttpClient::new(url, endpoints.api_key.clone(), timeout)
                .map(|http| http.with_max_retry_after(ceiling))
        };
        Ok(Self {
            generation: HttpGenerationClient::new(client(&endpoints.generation_url)?),
            similarity: HttpSimilarityClient::new(client(&endpoints.similarity_url)?),
            fingerprint: HttpFingerprintClient::new(client(&endpoints.fingerprint_url)?),
            composition: HttpCompositionClient::new(client(&endpoints.composition_url)?),
            formatter: HttpPanelFormatter::new(client(&endpoints.formatter_url)?),
        })
    }
}
