//! OpenAI-compatible and Azure OpenAI embedding client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{EmbedError, EmbeddingProvider, ensure_embeddable, normalize_vector};

/// Where embedding requests are sent and how they authenticate.
#[derive(Debug, Clone)]
pub enum OpenAiEndpoint {
    OpenAi {
        base_url: String,
        model: String,
    },
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
    },
}

impl OpenAiEndpoint {
    fn url(&self) -> String {
        match self {
            Self::OpenAi { base_url, .. } => {
                format!("{}/embeddings", base_url.trim_end_matches('/'))
            }
            Self::Azure {
                endpoint,
                deployment,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/embeddings?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }

    fn model_id(&self) -> &str {
        match self {
            Self::OpenAi { model, .. } => model,
            Self::Azure { deployment, .. } => deployment,
        }
    }

    fn backend(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Azure { .. } => "azure-openai",
        }
    }
}

/// Blocking embeddings client. One request per record; the job handles
/// retries and parallelism.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    endpoint: OpenAiEndpoint,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(
        endpoint: OpenAiEndpoint,
        api_key: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing embedding API key");
        anyhow::ensure!(
            !endpoint.model_id().trim().is_empty(),
            "missing embedding model or deployment name"
        );

        let mut headers = HeaderMap::new();
        match &endpoint {
            OpenAiEndpoint::OpenAi { .. } => {
                let auth = format!("Bearer {}", api_key.trim());
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
                );
            }
            OpenAiEndpoint::Azure { .. } => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(api_key.trim())
                        .context("invalid Azure OpenAI API key")?,
                );
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            url: endpoint.url(),
            endpoint,
            dimensions,
        })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> EmbeddingRequest<'a> {
        let model = match &self.endpoint {
            OpenAiEndpoint::OpenAi { model, .. } => Some(model.as_str()),
            OpenAiEndpoint::Azure { .. } => None,
        };
        EmbeddingRequest {
            model,
            input: [text],
            dimensions: self.dimensions,
        }
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        self.endpoint.model_id()
    }

    fn backend(&self) -> &str {
        self.endpoint.backend()
    }

    fn dimensions(&self) -> usize {
        self.dimensions.unwrap_or(0)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        ensure_embeddable(text)?;

        let response = self
            .client
            .post(&self.url)
            .json(&self.request_body(text))
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|err| EmbedError::transient(format!("unreadable embedding response: {err}")))?;
        let mut vector = parsed
            .data
            .into_iter()
            .min_by_key(|entry| entry.index)
            .map(|entry| entry.embedding)
            .ok_or_else(|| EmbedError::transient("embedding response contained no data"))?;

        if let Some(expected) = self.dimensions {
            if vector.len() != expected {
                return Err(EmbedError::fatal(format!(
                    "provider returned {} dimensions, configured for {}",
                    vector.len(),
                    expected
                )));
            }
        }

        normalize_vector(&mut vector);
        Ok(vector)
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> EmbedError {
    let reason = format!("embedding request failed ({status}): {}", truncate(body, 300));
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            EmbedError::transient(reason)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            EmbedError::fatal(reason)
        }
        status if status.is_server_error() => EmbedError::transient(reason),
        _ => EmbedError::permanent(reason),
    }
}

fn classify_transport_error(err: reqwest::Error) -> EmbedError {
    if err.is_builder() {
        return EmbedError::fatal(format!("invalid embedding request: {err}"));
    }
    EmbedError::transient(format!("embedding transport error: {err}"))
}

fn truncate(value: &str, max_chars: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(max_chars).collect::<String>();
    out.push('…');
    out
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FailureKind;

    #[test]
    fn azure_url_includes_deployment_and_api_version() {
        let endpoint = OpenAiEndpoint::Azure {
            endpoint: "https://example.openai.azure.com/".to_string(),
            deployment: "text-embedding-3-small".to_string(),
            api_version: "2024-05-01-preview".to_string(),
        };
        assert_eq!(
            endpoint.url(),
            "https://example.openai.azure.com/openai/deployments/text-embedding-3-small/embeddings?api-version=2024-05-01-preview"
        );
        assert_eq!(endpoint.backend(), "azure-openai");
    }

    #[test]
    fn openai_url_trims_trailing_slash() {
        let endpoint = OpenAiEndpoint::OpenAi {
            base_url: "https://api.openai.com/v1/".to_string(),
            model: "text-embedding-3-small".to_string(),
        };
        assert_eq!(endpoint.url(), "https://api.openai.com/v1/embeddings");
        assert_eq!(endpoint.model_id(), "text-embedding-3-small");
    }

    #[test]
    fn status_classification_separates_retryable_from_fatal() {
        let cases = [
            (StatusCode::TOO_MANY_REQUESTS, FailureKind::Transient),
            (StatusCode::BAD_GATEWAY, FailureKind::Transient),
            (StatusCode::SERVICE_UNAVAILABLE, FailureKind::Transient),
            (StatusCode::UNAUTHORIZED, FailureKind::Fatal),
            (StatusCode::FORBIDDEN, FailureKind::Fatal),
            (StatusCode::NOT_FOUND, FailureKind::Fatal),
            (StatusCode::BAD_REQUEST, FailureKind::Permanent),
            (StatusCode::UNPROCESSABLE_ENTITY, FailureKind::Permanent),
        ];

        for (status, expected) in cases {
            assert_eq!(classify_status(status, "{}").kind(), expected, "{status}");
        }
    }

    #[test]
    fn new_rejects_blank_api_key() {
        let endpoint = OpenAiEndpoint::OpenAi {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
        };
        assert!(OpenAiEmbedder::new(endpoint, "  ", None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn azure_request_omits_model_field() {
        let endpoint = OpenAiEndpoint::Azure {
            endpoint: "https://example.openai.azure.com".to_string(),
            deployment: "embed".to_string(),
            api_version: "2024-05-01-preview".to_string(),
        };
        let embedder =
            OpenAiEmbedder::new(endpoint, "key", Some(1536), Duration::from_secs(5)).unwrap();
        let body = serde_json::to_value(embedder.request_body("hello")).unwrap();
        assert!(body.get("model").is_none());
        assert_eq!(body["input"][0], "hello");
        assert_eq!(body["dimensions"], 1536);
    }

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "x".repeat(500);
        let out = truncate(&long, 10);
        assert_eq!(out.chars().count(), 11);
    }
}
