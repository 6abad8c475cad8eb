use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::tool::ToolDefinition;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a completion provider can do. The core branches on capabilities,
/// never on provider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextCompletion,
    Vision,
    Streaming,
    FunctionCalling,
    Embeddings,
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCompletionResponse {
    pub response: CompletionResponse,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider does not support {0:?}")]
    Unsupported(Capability),
    #[error("provider request failed: {0}")]
    Request(String),
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Contract for AI completion providers. The core never imports a specific
/// provider; implementations live with the external collaborators.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BTreeSet<Capability>;

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Completion with tool definitions available to the model. Providers
    /// without [`Capability::FunctionCalling`] return `Unsupported`.
    async fn complete_with_tools(
        &self,
        request: CompletionRequest,
        tools: &[ToolDefinition],
    ) -> Result<ToolCompletionResponse, ProviderError>;

    /// Lazy, finite stream of response text chunks.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String, ProviderError>>, ProviderError>;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Contract for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    struct FixedProvider;

    #[async_trait]
    impl CompletionProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn capabilities(&self) -> BTreeSet<Capability> {
            [Capability::TextCompletion, Capability::Streaming]
                .into_iter()
                .collect()
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: format!("echo: {}", request.prompt),
                model: "fixed-1".into(),
                usage: TokenUsage {
                    input_tokens: request.prompt.len() as u64,
                    output_tokens: 2,
                },
                stop_reason: Some("end".into()),
            })
        }

        async fn complete_with_tools(
            &self,
            _request: CompletionRequest,
            _tools: &[ToolDefinition],
        ) -> Result<ToolCompletionResponse, ProviderError> {
            Err(ProviderError::Unsupported(Capability::FunctionCalling))
        }

        async fn stream(
            &self,
            request: CompletionRequest,
        ) -> Result<BoxStream<'static, Result<String, ProviderError>>, ProviderError> {
            let chunks = vec![Ok("echo: ".to_string()), Ok(request.prompt)];
            Ok(futures_util::stream::iter(chunks).boxed())
        }
    }

    #[tokio::test]
    async fn capabilities_gate_features() {
        let provider = FixedProvider;
        assert!(provider.supports(Capability::TextCompletion));
        assert!(!provider.supports(Capability::FunctionCalling));

        let err = provider
            .complete_with_tools(CompletionRequest::new("x"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(Capability::FunctionCalling)));
    }

    #[tokio::test]
    async fn stream_is_finite_and_ordered() {
        let provider = FixedProvider;
        let stream = provider.stream(CompletionRequest::new("hello")).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.join(""), "echo: hello");
    }
}
