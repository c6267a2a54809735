//! Explicit, eagerly validated configuration for the re-embedding job.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{ProviderKind, ReembedArgs};

pub const DEFAULT_LOCAL_MODEL_ID: &str = "risk-summary-local-v1";
pub const DEFAULT_LOCAL_DIMENSIONS: usize = 384;
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
pub const STORE_FILE_NAME: &str = "risk_store.sqlite";
pub const INDEX_FILE_NAME: &str = "vector_index.sqlite";

const MAX_WORKERS: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required credential: set {env_var}")]
    MissingCredential { env_var: &'static str },

    #[error("record store not found: {path}")]
    StoreMissing { path: String },

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Credential wrapper that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Local {
        model_id: String,
        dimensions: usize,
    },
    OpenAi {
        api_key: Secret,
        base_url: String,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
    },
    Azure {
        api_key: Secret,
        endpoint: String,
        deployment: String,
        api_version: String,
        dimensions: Option<usize>,
        timeout: Duration,
    },
}

impl ProviderConfig {
    pub fn model_id(&self) -> &str {
        match self {
            Self::Local { model_id, .. } => model_id,
            Self::OpenAi { model, .. } => model,
            Self::Azure { deployment, .. } => deployment,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
        }
    }
}

/// Settings the job loop itself reads.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub apply: bool,
    pub batch_size: usize,
    pub workers: usize,
    pub retry: RetryConfig,
    /// Consecutive exhausted-retry failures before the provider is treated as
    /// down. Zero disables the check.
    pub max_consecutive_failures: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            apply: false,
            batch_size: 64,
            workers: 4,
            retry: RetryConfig::default(),
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReembedConfig {
    pub cache_root: PathBuf,
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub log_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub job: JobSettings,
    pub provider: ProviderConfig,
}

impl ReembedConfig {
    /// Builds and validates the configuration. Nothing is touched on disk.
    pub fn from_args(args: &ReembedArgs) -> Result<Self, ConfigError> {
        let store_path = args
            .db_path
            .clone()
            .unwrap_or_else(|| args.cache_root.join(STORE_FILE_NAME));
        let index_path = args
            .index_path
            .clone()
            .unwrap_or_else(|| args.cache_root.join(INDEX_FILE_NAME));

        let config = Self {
            cache_root: args.cache_root.clone(),
            store_path,
            index_path,
            log_dir: args.log_dir.clone(),
            manifest_dir: args.cache_root.join("manifests"),
            job: JobSettings {
                apply: args.apply,
                batch_size: args.batch_size,
                workers: args.workers,
                retry: RetryConfig {
                    max_retries: args.max_retries,
                    base_backoff: Duration::from_millis(args.backoff_ms),
                    max_backoff: Duration::from_millis(args.max_backoff_ms),
                },
                max_consecutive_failures: args.max_consecutive_failures,
            },
            provider: resolve_provider(args)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "batch-size",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.job.workers == 0 || self.job.workers > MAX_WORKERS {
            return Err(ConfigError::Invalid {
                name: "workers",
                reason: format!("must be between 1 and {MAX_WORKERS}"),
            });
        }

        if self.job.retry.max_backoff < self.job.retry.base_backoff {
            return Err(ConfigError::Invalid {
                name: "max-backoff-ms",
                reason: "must not be lower than backoff-ms".to_string(),
            });
        }

        if !self.store_path.is_file() {
            return Err(ConfigError::StoreMissing {
                path: self.store_path.display().to_string(),
            });
        }

        Ok(())
    }
}

fn resolve_provider(args: &ReembedArgs) -> Result<ProviderConfig, ConfigError> {
    let timeout = Duration::from_secs(args.timeout_secs.max(1));

    match args.provider {
        ProviderKind::Local => Ok(ProviderConfig::Local {
            model_id: non_blank(args.model_id.as_deref())
                .unwrap_or(DEFAULT_LOCAL_MODEL_ID)
                .to_string(),
            dimensions: args.dimensions.unwrap_or(DEFAULT_LOCAL_DIMENSIONS),
        }),
        ProviderKind::Openai => Ok(ProviderConfig::OpenAi {
            api_key: required_secret(args.openai_api_key.as_deref(), "OPENAI_API_KEY")?,
            base_url: required(Some(args.openai_base_url.as_str()), "OPENAI_BASE_URL")?,
            model: non_blank(args.model_id.as_deref())
                .unwrap_or(DEFAULT_OPENAI_MODEL)
                .to_string(),
            dimensions: args.dimensions,
            timeout,
        }),
        ProviderKind::Azure => Ok(ProviderConfig::Azure {
            api_key: required_secret(args.azure_api_key.as_deref(), "AZURE_OPENAI_API_KEY")?,
            endpoint: required(args.azure_endpoint.as_deref(), "AZURE_OPENAI_ENDPOINT")?,
            deployment: required(
                args.azure_deployment.as_deref(),
                "AZURE_OPENAI_EMBEDDING_DEPLOYMENT",
            )?,
            api_version: required(
                Some(args.azure_api_version.as_str()),
                "AZURE_OPENAI_API_VERSION",
            )?,
            dimensions: args.dimensions,
            timeout,
        }),
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn required(value: Option<&str>, env_var: &'static str) -> Result<String, ConfigError> {
    non_blank(value)
        .map(str::to_string)
        .ok_or(ConfigError::MissingCredential { env_var })
}

fn required_secret(value: Option<&str>, env_var: &'static str) -> Result<Secret, ConfigError> {
    required(value, env_var).map(Secret::new)
}
