// src/llm/provider.rs
// LLM provider abstraction layer

use crate::error::{Result, VellumError};
use crate::llm::types::{ChatRequest, LlmStreamEvent, RerankDocument, RerankScore};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

/// Trait every LLM backend must implement. The engine drives providers
/// exclusively through this boundary; the bundled OpenAI-compatible client
/// is one implementation, hosts may plug their own.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a chat completion as typed events. The stream ends with
    /// `Done` or `Error`.
    async fn stream_chat(&self, request: ChatRequest) -> Result<BoxStream<'static, LlmStreamEvent>>;

    /// Embed a single text. The caller knows the expected dimension from
    /// its model configuration.
    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>>;

    /// Optional reranking endpoint. Providers without one keep the default.
    async fn rerank(
        &self,
        _query: &str,
        _documents: Vec<RerankDocument>,
        _top_k: usize,
        _model: &str,
    ) -> Result<Vec<RerankScore>> {
        Err(VellumError::ProviderUnavailable(
            "rerank not supported by this provider".into(),
        ))
    }

    fn supports_rerank(&self) -> bool {
        false
    }

    /// Convenience: run a chat request to completion and return the final
    /// text. Used by background prompts (summaries, titles, extraction)
    /// that have no use for deltas.
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let mut stream = self.stream_chat(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                LlmStreamEvent::TextDelta(delta) => text.push_str(&delta),
                LlmStreamEvent::Error { message } => {
                    return Err(VellumError::ProviderUnavailable(message));
                }
                LlmStreamEvent::Done { .. } => break,
                _ => {}
            }
        }
        Ok(text)
    }
}
