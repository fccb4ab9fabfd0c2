//! OpenAI embedding generator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::OpenAIConfig;
use crate::error::{EmbeddingError, Result};
use crate::generator::Generator;
use crate::{Document, Embedding};

/// Generates embeddings with the OpenAI embeddings API, one request per batch.
pub struct OpenAIGenerator {
    config: OpenAIConfig,

    /// HTTP client.
    client: reqwest::Client,
}

impl OpenAIGenerator {
    /// Create a generator from a configuration.
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create a generator configured from the environment.
    pub fn from_env() -> Self {
        Self::new(OpenAIConfig::from_env())
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    /// Check if the generator has an API key.
    pub fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    type Key = Document;
    type Output = Embedding;

    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, documents: &[Document]) -> Result<Vec<Embedding>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        debug!(
            "Generating embeddings for {} documents with model: {}",
            documents.len(),
            self.config.model
        );

        let body = OpenAIEmbeddingRequest {
            input: documents,
            model: &self.config.model,
            dimensions: self.config.dimensions,
            user: self.config.user.as_deref(),
        };

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body);
        if let Some(ref organization) = self.config.organization {
            request = request.header("OpenAI-Organization", organization);
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;

        if result.data.len() != documents.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                documents.len(),
                result.data.len()
            )));
        }

        // The API does not promise to return items in input order.
        result.data.sort_unstable_by_key(|item| item.index);
        if let Some((position, item)) = result
            .data
            .iter()
            .enumerate()
            .find(|(position, item)| item.index != *position)
        {
            return Err(EmbeddingError::InvalidResponse(format!(
                "missing embedding for input {position}, found index {}",
                item.index
            )));
        }

        if let Some(usage) = result.usage {
            debug!("Embedding request used {} tokens", usage.total_tokens);
        }
        info!(
            "Generated {} embeddings with {}",
            result.data.len(),
            result.model
        );

        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// OpenAI API request format.
#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    input: &'a [Document],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    model: String,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator(server: &MockServer) -> OpenAIGenerator {
        OpenAIGenerator::new(OpenAIConfig::new("sk-test").with_base_url(server.uri()))
    }

    fn documents(items: &[&str]) -> Vec<Document> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_is_sent_as_one_request_and_reordered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(json!({
                "input": ["first", "second"],
                "model": "text-embedding-ada-002"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                    { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
                ],
                "model": "text-embedding-ada-002",
                "usage": { "prompt_tokens": 2, "total_tokens": 2 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embeddings = generator(&server)
            .generate(&documents(&["first", "second"]))
            .await
            .unwrap();

        assert_eq!(embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_optional_fields_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("OpenAI-Organization", "org-1"))
            .and(body_json(json!({
                "input": ["text"],
                "model": "text-embedding-3-small",
                "dimensions": 2,
                "user": "tester"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "index": 0, "embedding": [0.5, 0.5] }],
                "model": "text-embedding-3-small"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = OpenAIConfig::new("sk-test")
            .with_base_url(server.uri())
            .with_model("text-embedding-3-small")
            .with_organization("org-1")
            .with_dimensions(2)
            .with_user("tester");
        let embeddings = OpenAIGenerator::new(config)
            .generate(&documents(&["text"]))
            .await
            .unwrap();

        assert_eq!(embeddings, vec![vec![0.5, 0.5]]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(&documents(&["text"]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::RateLimited {
                retry_after_secs: 7
            }
        ));
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(&documents(&["text"]))
            .await
            .unwrap_err();

        match err {
            EmbeddingError::ApiRequest(message) => assert!(message.contains("bad input")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_response_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "index": 0, "embedding": [1.0] }],
                "model": "text-embedding-ada-002"
            })))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(&documents(&["a", "b"]))
            .await
            .unwrap_err();

        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let generator = OpenAIGenerator::new(OpenAIConfig::default());
        assert!(!generator.is_available());

        let err = generator
            .generate(&documents(&["text"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderNotConfigured));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let embeddings = generator(&server).generate(&[]).await.unwrap();
        assert!(embeddings.is_empty());
    }
}
