// src/llm/http.rs
// Bundled OpenAI-compatible provider (chat streaming + embeddings + rerank)

use crate::db::types::TokenUsage;
use crate::error::{Result, VellumError};
use crate::llm::provider::LlmProvider;
use crate::llm::types::{
    ChatRequest, ContentPart, LlmStreamEvent, RerankDocument, RerankScore, RequestMessage,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (longer text is truncated).
const MAX_EMBED_CHARS: usize = 8000;

/// Bounded retry for the embeddings endpoint.
const EMBED_RETRY_ATTEMPTS: usize = 2;

const TIMEOUT_SECS: u64 = 60;

/// OpenAI-compatible HTTP provider. Works against any endpoint that speaks
/// the /chat/completions + /embeddings wire shape.
pub struct OpenAiCompatProvider {
    api_key: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Serialize one request message to the wire shape. Text-only messages
    /// collapse to a plain string; multimodal messages become part arrays.
    fn message_json(msg: &RequestMessage) -> Value {
        if msg.content.iter().all(|p| p.is_text()) {
            return json!({
                "role": msg.role.as_str(),
                "content": msg.text(),
            });
        }
        let parts: Vec<Value> = msg
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { media_type, data } => json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data)},
                }),
                ContentPart::File { media_type, data, name } => json!({
                    "type": "file",
                    "file": {
                        "filename": name,
                        "file_data": format!("data:{};base64,{}", media_type, data),
                    },
                }),
            })
            .collect();
        json!({"role": msg.role.as_str(), "content": parts})
    }

    fn chat_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages.iter().map(Self::message_json).collect::<Vec<_>>(),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(control) = &request.output_control {
            if let Some(t) = control.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = control.top_p {
                body["top_p"] = json!(p);
            }
            if let Some(m) = control.max_tokens {
                body["max_tokens"] = json!(m);
            }
        }
        body
    }
}

/// Parse one SSE `data:` payload into stream events. The final usage chunk
/// has an empty choices array.
fn parse_sse_data(data: &str) -> Vec<LlmStreamEvent> {
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    if let Some(error) = json.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error").to_string();
        return vec![LlmStreamEvent::Error { message }];
    }

    let mut events = Vec::new();
    if let Some(delta) = json.pointer("/choices/0/delta") {
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(LlmStreamEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(reasoning) = delta["reasoning_content"].as_str() {
            if !reasoning.is_empty() {
                events.push(LlmStreamEvent::ReasoningDelta(reasoning.to_string()));
            }
        }
    }
    events
}

fn parse_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage::new(
        usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
    ))
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn stream_chat(&self, request: ChatRequest) -> Result<BoxStream<'static, LlmStreamEvent>> {
        let response = self
            .http_client
            .post(self.url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&Self::chat_body(&request))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(VellumError::ProviderRateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VellumError::ProviderUnavailable(format!(
                "chat API error {}: {}",
                status, text
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut usage: Option<TokenUsage> = None;
            let mut errored = false;

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield LlmStreamEvent::Error { message: e.to_string() };
                        errored = true;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    if let Ok(json) = serde_json::from_str::<Value>(data) {
                        if let Some(u) = parse_usage(&json) {
                            usage = Some(u);
                        }
                    }
                    for event in parse_sse_data(data) {
                        if matches!(event, LlmStreamEvent::Error { .. }) {
                            errored = true;
                        }
                        yield event;
                        if errored {
                            break 'outer;
                        }
                    }
                }
            }

            if !errored {
                yield LlmStreamEvent::Done { usage };
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        let text = if text.len() > MAX_EMBED_CHARS {
            debug!("Truncating embedding input from {} chars", text.len());
            &text[..MAX_EMBED_CHARS]
        } else {
            text
        };
        let body = json!({"model": model, "input": text});

        let mut last_error: Option<VellumError> = None;
        for attempt in 0..=EMBED_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let response = match self
                .http_client
                .post(self.url("embeddings"))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };

            if response.status().as_u16() == 429 {
                last_error = Some(VellumError::ProviderRateLimited);
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                last_error = Some(VellumError::ProviderUnavailable(format!(
                    "embeddings API error {}: {}",
                    status, text
                )));
                continue;
            }

            let json: Value = response.json().await?;
            let values = json
                .pointer("/data/0/embedding")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    VellumError::ProviderMalformedResponse("no embedding in response".into())
                })?;
            let embedding: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if embedding.is_empty() {
                return Err(VellumError::ProviderMalformedResponse(
                    "empty embedding in response".into(),
                ));
            }
            return Ok(embedding);
        }

        Err(last_error
            .unwrap_or_else(|| VellumError::ProviderUnavailable("embedding request failed".into())))
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RerankDocument>,
        top_k: usize,
        model: &str,
    ) -> Result<Vec<RerankScore>> {
        let body = json!({
            "model": model,
            "query": query,
            "documents": documents.iter().map(|d| d.text.clone()).collect::<Vec<_>>(),
            "top_n": top_k,
        });
        let response = self
            .http_client
            .post(self.url("rerank"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VellumError::ProviderUnavailable(format!(
                "rerank API error {}: {}",
                status, text
            )));
        }

        let json: Value = response.json().await?;
        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| {
                VellumError::ProviderMalformedResponse("no results in rerank response".into())
            })?;
        let mut scores = Vec::with_capacity(results.len());
        for item in results {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            let score = item
                .get("relevance_score")
                .or_else(|| item.get("score"))
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0) as f32;
            scores.push(RerankScore { index, score });
        }
        Ok(scores)
    }

    fn supports_rerank(&self) -> bool {
        true
    }
}
