//! Inference backend and resource monitor contracts
//!
//! The scheduler talks to the backend only through [`InferenceBackend`]:
//! a streaming generate call plus explicit model management. Accelerator
//! memory is read through [`ResourceMonitor`].

pub mod ollama;
pub mod scripted;

pub use ollama::OllamaBackend;
pub use scripted::{Script, ScriptStep, ScriptedBackend};

use async_trait::async_trait;
use llmq_common::Result;
use llmq_proto::{ChatMessage, GenerationOptions};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Stream of generation events for one request
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenEvent>> + Send>>;

/// Event produced by a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// Answer text
    Content(String),

    /// Reasoning text of thinking models
    Thinking(String),

    /// Explicit end-of-generation marker
    Done(GenerationStats),
}

/// Statistics reported with the end-of-generation marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationStats {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub done_reason: Option<String>,
}

/// A generate call
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,

    /// Minimal one-token generation confirming that a model load succeeded
    pub probe: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, options: GenerationOptions) -> Self {
        Self {
            model: model.into(),
            messages,
            options,
            probe: false,
        }
    }

    /// Verification generation for a freshly loaded model
    pub fn probe(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            options: GenerationOptions {
                max_tokens: Some(1),
                ..GenerationOptions::default()
            },
            probe: true,
        }
    }
}

/// A model installed on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,

    /// Estimated accelerator footprint once loaded
    pub size_bytes: u64,
}

/// Streaming inference backend with explicit model management
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Open a generation stream
    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream>;

    /// Models installed on the backend with their footprint
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Load a model into accelerator memory
    async fn load_model(&self, model: &str) -> Result<()>;

    /// Evict a model from accelerator memory
    async fn unload_model(&self, model: &str) -> Result<()>;
}

/// Read-only view of accelerator memory
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Currently free accelerator memory in bytes
    async fn available_memory(&self) -> Result<u64>;
}

/// Resource monitor reporting a fixed amount of free memory
#[derive(Debug, Clone)]
pub struct StaticResourceMonitor {
    available_bytes: u64,
}

impl StaticResourceMonitor {
    pub fn new(available_bytes: u64) -> Self {
        Self { available_bytes }
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn available_memory(&self) -> Result<u64> {
        Ok(self.available_bytes)
    }
}
