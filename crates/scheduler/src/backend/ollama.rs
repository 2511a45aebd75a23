//! Ollama HTTP backend
//!
//! Streams `/api/chat` as newline-delimited JSON. Models are listed through
//! `/api/tags`, loaded with an empty generate request and unloaded with
//! `keep_alive: 0`. Accelerator usage is read from `/api/ps`.

use super::{
    GenerateRequest, GenerationStats, InferenceBackend, ModelInfo, ResourceMonitor, TokenEvent,
    TokenStream,
};
use async_trait::async_trait;
use llmq_common::config::BackendConfig;
use llmq_common::{LlmqError, Result};
use llmq_proto::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

/// HTTP client for an Ollama-compatible server
#[derive(Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    keep_alive: String,
    request_timeout: Duration,
    load_timeout: Duration,
    total_memory: u64,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    options: WireOptions<'a>,
    keep_alive: &'a str,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize, Default)]
struct WireOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Serialize)]
struct KeepAliveBody<'a, K: Serialize> {
    model: &'a str,
    keep_alive: K,
}

/// One NDJSON line of a streaming chat response
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsEntry>,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(default)]
    size_vram: u64,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn transport_error(err: reqwest::Error) -> LlmqError {
    LlmqError::backend(format!("transport: {}", err))
}

/// Translate one NDJSON line into token events
fn parse_line(line: &[u8]) -> Result<Vec<TokenEvent>> {
    let chunk: ChatChunk = serde_json::from_slice(line)
        .map_err(|e| LlmqError::backend(format!("malformed stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(LlmqError::backend(error));
    }

    let mut events = Vec::with_capacity(2);
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            events.push(TokenEvent::Thinking(thinking));
        }
        if !message.content.is_empty() {
            events.push(TokenEvent::Content(message.content));
        }
    }

    if chunk.done {
        events.push(TokenEvent::Done(GenerationStats {
            prompt_tokens: chunk.prompt_eval_count,
            completion_tokens: chunk.eval_count,
            done_reason: chunk.done_reason,
        }));
    }

    Ok(events)
}

impl OllamaBackend {
    /// Create a backend from configuration
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmqError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            keep_alive: config.keep_alive.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            total_memory: config.accelerator_memory_mb * 1024 * 1024,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LlmqError::backend_status(status.as_u16(), body.trim()))
    }

    async fn post_keep_alive<K: Serialize + Send + Sync>(
        &self,
        model: &str,
        keep_alive: K,
        timeout: Duration,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(timeout)
            .json(&KeepAliveBody { model, keep_alive })
            .send()
            .await
            .map_err(transport_error)?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream> {
        let options = &request.options;
        let body = ChatBody {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: role_name(m.role),
                    content: &m.content,
                })
                .collect(),
            stream: true,
            think: options.think.then_some(true),
            options: WireOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                top_k: options.top_k,
                num_predict: options.max_tokens,
                num_ctx: options.num_ctx,
                stop: &options.stop,
            },
            keep_alive: &self.keep_alive,
        };

        debug!(model = %request.model, probe = request.probe, "Opening chat stream");

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut body = Box::pin(response.bytes_stream());
            let mut pending: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    // receiver dropped: abort the connection
                    _ = tx.closed() => return,
                    chunk = body.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(transport_error(e))).await;
                        return;
                    }
                    None => break,
                };

                pending.extend_from_slice(&bytes);
                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    let line = &line[..line.len() - 1];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    trace!(bytes = line.len(), "Stream chunk");
                    match parse_line(line) {
                        Ok(events) => {
                            for event in events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            // trailing line without newline
            if !pending.iter().all(u8::is_ascii_whitespace) {
                match parse_line(&pending) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Discarding trailing stream bytes: {}", e),
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let tags: TagsResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name,
                size_bytes: m.size,
            })
            .collect())
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        self.post_keep_alive(model, self.keep_alive.as_str(), self.load_timeout)
            .await
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        self.post_keep_alive(model, 0, self.request_timeout).await
    }
}

#[async_trait]
impl ResourceMonitor for OllamaBackend {
    async fn available_memory(&self) -> Result<u64> {
        let response = self
            .client
            .get(self.url("/api/ps"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let ps: PsResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let used: u64 = ps.models.iter().map(|m| m.size_vram).sum();
        Ok(self.total_memory.saturating_sub(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_line() {
        let line = br#"{"model":"llama3","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        let events = parse_line(line).unwrap();

        assert_eq!(events, vec![TokenEvent::Content("Hel".to_string())]);
    }

    #[test]
    fn test_parse_thinking_and_done() {
        let line = br#"{"message":{"role":"assistant","content":"","thinking":"let me see"},"done":true,"done_reason":"stop","prompt_eval_count":12,"eval_count":40}"#;
        let events = parse_line(line).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TokenEvent::Thinking("let me see".to_string()));
        assert_eq!(
            events[1],
            TokenEvent::Done(GenerationStats {
                prompt_tokens: Some(12),
                completion_tokens: Some(40),
                done_reason: Some("stop".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_error_line() {
        let err = parse_line(br#"{"error":"model runner has unexpectedly stopped"}"#).unwrap_err();

        assert!(matches!(err, LlmqError::Backend(_)));
    }

    #[test]
    fn test_parse_malformed_line() {
        assert!(parse_line(b"{not json").is_err());
    }

    #[test]
    fn test_backend_from_config() {
        let config = BackendConfig {
            base_url: "http://gpu-box:11434/".to_string(),
            ..BackendConfig::default()
        };
        let backend = OllamaBackend::new(&config).unwrap();

        assert_eq!(backend.url("/api/chat"), "http://gpu-box:11434/api/chat");
        assert_eq!(backend.total_memory, 24 * 1024 * 1024 * 1024);
    }
}
