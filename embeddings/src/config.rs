//! Configuration for the embedding cache and generators.

use serde::{Deserialize, Serialize};

/// Default OpenAI API base URL.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default OpenAI embedding model.
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-ada-002";

/// Configuration for the coalescing cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum keys handed to the generator in one call.
    ///
    /// `None` sends all of a call's missing keys as a single batch.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of keys per generator call.
    ///
    /// A limit of zero is treated as one.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max.max(1));
        self
    }
}

/// Configuration for the OpenAI embedding generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// API key. Requests fail with `ProviderNotConfigured` without one.
    pub api_key: Option<String>,

    /// API base URL.
    pub base_url: String,

    /// Embedding model.
    pub model: String,

    /// Organization sent as `OpenAI-Organization`.
    pub organization: Option<String>,

    /// Output dimensions (only honored by newer models).
    pub dimensions: Option<usize>,

    /// End-user identifier forwarded to the API.
    pub user: Option<String>,
}

impl OpenAIConfig {
    /// Create a configuration with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Build a configuration from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_ORG_ID`.
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            organization: std::env::var("OPENAI_ORG_ID").ok(),
            ..Self::default()
        };
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        config
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the organization.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Set the output dimensions.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Set the end-user identifier.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            organization: None,
            dimensions: None,
            user: None,
        }
    }
}
