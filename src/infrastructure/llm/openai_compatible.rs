//! Streaming chat completions against any OpenAI-compatible endpoint
//! (DeepSeek, OpenAI, local gateways).

use super::sse::SseDecoder;
use crate::domain::errors::InferenceError;
use crate::domain::ports::{InferenceProvider, InferenceRequest, ProviderChunk, ProviderStream};
use crate::infrastructure::core::HttpClientFactory;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

pub struct OpenAiCompatibleProvider {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    /// `transport_retries` retries connection-level failures before any
    /// byte of the response has been read
    pub fn new(base_url: &str, api_key: String, model: String, transport_retries: u32) -> Self {
        Self {
            client: HttpClientFactory::create_streaming_client(transport_retries),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

struct BodyState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<ProviderChunk, InferenceError>>,
    done: bool,
}

/// Turns a response body into provider chunks. The stream ends after the
/// first terminal item: a finish marker, a provider error or an interruption.
fn decode_body(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> ProviderStream {
    let state = BodyState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.pending.extend(state.decoder.push(&bytes));
                    if state.decoder.is_finished() {
                        state.done = true;
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.pending.push_back(Err(InferenceError::StreamInterrupted {
                        reason: e.to_string(),
                    }));
                }
                None => {
                    // no terminal marker: the consumer treats the silence as an interruption
                    state.done = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl InferenceProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn open_stream(&self, request: InferenceRequest) -> Result<ProviderStream, InferenceError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };

        let payload = serde_json::to_vec(&body).map_err(|e| InferenceError::ProviderError {
            reason: format!("request encoding failed: {}", e),
        })?;

        debug!(
            "OpenAiCompatibleProvider: Opening stream for {} with {}",
            request.symbol, request.model
        );
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| InferenceError::ProviderError {
                reason: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                408 | 504 => InferenceError::ProviderTimeout { duration_ms: 0 },
                code => InferenceError::ProviderError {
                    reason: format!("HTTP {}: {}", code, text.chars().take(300).collect::<String>()),
                },
            });
        }

        info!(
            "OpenAiCompatibleProvider: Stream open for {} ({})",
            request.symbol, request.model
        );
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(decode_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: Vec<Result<&'static str, ()>>) -> ProviderStream {
        // reqwest errors can't be built by hand; an error part ends the body early instead
        let items: Vec<Result<Vec<u8>, reqwest::Error>> = parts
            .into_iter()
            .map_while(|p| p.ok())
            .map(|p| Ok(p.as_bytes().to_vec()))
            .collect();
        decode_body(stream::iter(items).boxed())
    }

    #[tokio::test]
    async fn test_body_decoding_stops_at_finish() {
        let stream = body(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n"),
        ]);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(
            items,
            vec![
                Ok(ProviderChunk::Delta("Hel".to_string())),
                Ok(ProviderChunk::Delta("lo".to_string())),
                Ok(ProviderChunk::Finished {
                    reason: Some("stop".to_string())
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_body_has_no_finish_marker() {
        let stream = body(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"),
            Err(()),
        ]);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items, vec![Ok(ProviderChunk::Delta("partial".to_string()))]);
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "deepseek-chat",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.7,
            max_tokens: 4000,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 4000);
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let provider = OpenAiCompatibleProvider::new(
            "https://api.deepseek.com/",
            "sk".to_string(),
            "deepseek-chat".to_string(),
            0,
        );
        assert_eq!(provider.endpoint(), "https://api.deepseek.com/chat/completions");
        assert_eq!(provider.default_model(), "deepseek-chat");
    }
}
