//! Embedding providers used by the re-embedding job.
//!
//! Providers never retry on their own. They classify each failure so the job
//! can decide between retrying, recording a per-record failure, or aborting.

mod local;
mod openai;

pub use local::LocalHashEmbedder;
pub use openai::{OpenAiEmbedder, OpenAiEndpoint};

use anyhow::Result;

use crate::config::ProviderConfig;

/// How the job should treat an embedding failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// Worth another attempt after backoff (rate limit, timeout, 5xx).
    Transient,
    /// Tied to the record itself; retrying cannot help.
    Permanent,
    /// The provider cannot serve any record; the run must stop.
    Fatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("transient embedding failure: {reason}")]
    Transient { reason: String },

    #[error("record cannot be embedded: {reason}")]
    Permanent { reason: String },

    #[error("embedding provider unusable: {reason}")]
    Fatal { reason: String },
}

impl EmbedError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } => FailureKind::Transient,
            Self::Permanent { .. } => FailureKind::Permanent,
            Self::Fatal { .. } => FailureKind::Fatal,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason } | Self::Permanent { reason } | Self::Fatal { reason } => {
                reason
            }
        }
    }
}

/// A text embedding backend shared across the job's worker threads.
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    fn backend(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Rejects input that no backend can embed meaningfully.
pub(crate) fn ensure_embeddable(text: &str) -> Result<(), EmbedError> {
    if text.trim().is_empty() {
        return Err(EmbedError::permanent("summary text is empty"));
    }
    Ok(())
}

pub fn build_provider(config: &ProviderConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let provider: Box<dyn EmbeddingProvider> = match config {
        ProviderConfig::Local {
            model_id,
            dimensions,
        } => Box::new(LocalHashEmbedder::new(model_id.clone(), *dimensions)),
        ProviderConfig::OpenAi {
            api_key,
            base_url,
            model,
            dimensions,
            timeout,
        } => Box::new(OpenAiEmbedder::new(
            OpenAiEndpoint::OpenAi {
                base_url: base_url.clone(),
                model: model.clone(),
            },
            api_key.expose(),
            *dimensions,
            *timeout,
        )?),
        ProviderConfig::Azure {
            api_key,
            endpoint,
            deployment,
            api_version,
            dimensions,
            timeout,
        } => Box::new(OpenAiEmbedder::new(
            OpenAiEndpoint::Azure {
                endpoint: endpoint.clone(),
                deployment: deployment.clone(),
                api_version: api_version.clone(),
            },
            api_key.expose(),
            *dimensions,
            *timeout,
        )?),
    };

    Ok(provider)
}

/// Scales `values` to unit length in place; zero vectors are left as-is.
pub fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_error_kind_matches_variant() {
        assert_eq!(EmbedError::transient("429").kind(), FailureKind::Transient);
        assert_eq!(EmbedError::permanent("empty").kind(), FailureKind::Permanent);
        assert_eq!(EmbedError::fatal("401").kind(), FailureKind::Fatal);
        assert_eq!(EmbedError::fatal("401").reason(), "401");
    }

    #[test]
    fn ensure_embeddable_rejects_blank_text() {
        let err = ensure_embeddable("  \n\t").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert!(ensure_embeddable("Summary: ok").is_ok());
    }

    #[test]
    fn normalize_vector_produces_unit_length() {
        let mut values = vec![3.0_f32, 4.0];
        normalize_vector(&mut values);
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);

        let mut zeros = vec![0.0_f32; 4];
        normalize_vector(&mut zeros);
        assert!(zeros.iter().all(|value| *value == 0.0));
    }
}
