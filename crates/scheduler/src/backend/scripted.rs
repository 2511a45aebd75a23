//! Deterministic in-process backend
//!
//! Plays back queued [`Script`]s instead of running a model. Used for dry
//! runs (`backend.kind: scripted`) and as the backend of every scheduler test.
//! It simulates a single accelerator: loaded models consume their footprint
//! and the backend doubles as the [`ResourceMonitor`] of that memory.

use super::{
    GenerateRequest, GenerationStats, InferenceBackend, ModelInfo, ResourceMonitor, TokenEvent,
    TokenStream,
};
use async_trait::async_trait;
use llmq_common::{LlmqError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// One step of a scripted generation
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Content(String),
    Thinking(String),
    Delay(Duration),

    /// Block until the notify is triggered
    Wait(Arc<Notify>),

    /// Never produce another event while keeping the connection open
    Stall,

    /// Fail the stream with a backend error
    Error(String),

    /// Explicit end-of-generation marker
    Done,
}

/// Scripted answer for one generate call
///
/// A script that ends without [`ScriptStep::Done`] closes the connection
/// without a terminal marker.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script emitting each token followed by the done marker
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script = Self::new();
        for token in tokens {
            script = script.content(token);
        }
        script.done()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Content(text.into()));
        self
    }

    pub fn thinking(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Thinking(text.into()));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    pub fn wait(mut self, gate: Arc<Notify>) -> Self {
        self.steps.push(ScriptStep::Wait(gate));
        self
    }

    pub fn stall(mut self) -> Self {
        self.steps.push(ScriptStep::Stall);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Error(message.into()));
        self
    }

    pub fn done(mut self) -> Self {
        self.steps.push(ScriptStep::Done);
        self
    }
}

#[derive(Default)]
struct ScriptedState {
    /// Installed models and their footprint
    installed: HashMap<String, u64>,

    /// Models currently held in simulated accelerator memory
    loaded: HashSet<String>,

    /// Highest number of simultaneously loaded models seen
    max_loaded: usize,

    /// Scripts queued per model
    scripts: HashMap<String, VecDeque<Script>>,

    /// Remaining forced failures per model load
    load_failures: HashMap<String, u32>,

    /// Remaining forced failures of generate calls
    open_failures: u32,

    load_delay: Duration,
    load_calls: Vec<String>,
    unload_calls: Vec<String>,
    generate_calls: Vec<String>,
}

/// Deterministic backend playing back scripts
pub struct ScriptedBackend {
    total_memory: u64,
    state: Mutex<ScriptedState>,
}

impl ScriptedBackend {
    /// Create a backend simulating `total_memory` bytes of accelerator memory
    pub fn new(total_memory: u64) -> Self {
        Self {
            total_memory,
            state: Mutex::new(ScriptedState::default()),
        }
    }

    /// Register an installed model
    pub fn with_model(self, id: impl Into<String>, size_bytes: u64) -> Self {
        self.state.lock().installed.insert(id.into(), size_bytes);
        self
    }

    /// Queue a script for the next generate call against `model`
    pub fn push_script(&self, model: &str, script: Script) {
        self.state
            .lock()
            .scripts
            .entry(model.to_string())
            .or_default()
            .push_back(script);
    }

    /// Fail the next `count` loads of `model`
    pub fn fail_loads(&self, model: &str, count: u32) {
        self.state.lock().load_failures.insert(model.to_string(), count);
    }

    /// Fail the next `count` generate calls at the transport level
    pub fn fail_opens(&self, count: u32) {
        self.state.lock().open_failures = count;
    }

    /// Delay every model load
    pub fn set_load_delay(&self, delay: Duration) {
        self.state.lock().load_delay = delay;
    }

    pub fn load_calls(&self) -> Vec<String> {
        self.state.lock().load_calls.clone()
    }

    pub fn unload_calls(&self) -> Vec<String> {
        self.state.lock().unload_calls.clone()
    }

    /// Models of non-probe generate calls, in call order
    pub fn generate_calls(&self) -> Vec<String> {
        self.state.lock().generate_calls.clone()
    }

    pub fn loaded_models(&self) -> Vec<String> {
        let mut loaded: Vec<String> = self.state.lock().loaded.iter().cloned().collect();
        loaded.sort();
        loaded
    }

    /// Highest number of models that were ever loaded at the same time
    pub fn max_loaded(&self) -> usize {
        self.state.lock().max_loaded
    }

    fn default_script(model: &str) -> Script {
        Script::tokens(["Hello", " from", " ", model])
    }
}

async fn play(script: Script, tx: mpsc::Sender<Result<TokenEvent>>) {
    for step in script.steps {
        let event = match step {
            ScriptStep::Content(text) => Ok(TokenEvent::Content(text)),
            ScriptStep::Thinking(text) => Ok(TokenEvent::Thinking(text)),
            ScriptStep::Delay(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            ScriptStep::Wait(gate) => {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = tx.closed() => return,
                }
                continue;
            }
            ScriptStep::Stall => {
                // hold the connection open until the receiver goes away
                tx.closed().await;
                return;
            }
            ScriptStep::Error(message) => Err(LlmqError::backend(message)),
            ScriptStep::Done => Ok(TokenEvent::Done(GenerationStats {
                done_reason: Some("stop".to_string()),
                ..GenerationStats::default()
            })),
        };

        let stop = matches!(event, Err(_) | Ok(TokenEvent::Done(_)));
        if tx.send(event).await.is_err() || stop {
            return;
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream> {
        let script = {
            let mut state = self.state.lock();
            if !state.loaded.contains(&request.model) {
                return Err(LlmqError::backend(format!(
                    "model {} is not loaded",
                    request.model
                )));
            }

            if request.probe {
                Script::tokens(["ok"])
            } else {
                if state.open_failures > 0 {
                    state.open_failures -= 1;
                    return Err(LlmqError::backend("connection refused"));
                }
                state.generate_calls.push(request.model.clone());
                state
                    .scripts
                    .get_mut(&request.model)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| Self::default_script(&request.model))
            }
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(play(script, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let state = self.state.lock();
        let mut models: Vec<ModelInfo> = state
            .installed
            .iter()
            .map(|(id, size)| ModelInfo {
                id: id.clone(),
                size_bytes: *size,
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.load_calls.push(model.to_string());
            if !state.installed.contains_key(model) {
                return Err(LlmqError::backend(format!("model {} not found", model)));
            }
            state.load_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.load_failures.get_mut(model) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LlmqError::backend(format!("failed to load {}", model)));
            }
        }

        state.loaded.insert(model.to_string());
        state.max_loaded = state.max_loaded.max(state.loaded.len());
        debug!(model, "Scripted backend loaded model");
        Ok(())
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.unload_calls.push(model.to_string());
        state.loaded.remove(model);
        Ok(())
    }
}

#[async_trait]
impl ResourceMonitor for ScriptedBackend {
    async fn available_memory(&self) -> Result<u64> {
        let state = self.state.lock();
        let used: u64 = state
            .loaded
            .iter()
            .filter_map(|model| state.installed.get(model))
            .sum();
        Ok(self.total_memory.saturating_sub(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_proto::{ChatMessage, GenerationOptions};
    use tokio_stream::StreamExt;

    fn request(model: &str) -> GenerateRequest {
        GenerateRequest::new(model, vec![ChatMessage::user("hi")], GenerationOptions::default())
    }

    #[tokio::test]
    async fn test_scripted_stream_plays_back_script() {
        let backend = ScriptedBackend::new(1000).with_model("a", 100);
        backend.load_model("a").await.unwrap();
        backend.push_script("a", Script::new().thinking("hmm").content("yes"));

        let events: Vec<_> = backend
            .generate(request("a"))
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &TokenEvent::Thinking("hmm".to_string()));
        assert_eq!(events[1].as_ref().unwrap(), &TokenEvent::Content("yes".to_string()));
    }

    #[tokio::test]
    async fn test_generate_requires_loaded_model() {
        let backend = ScriptedBackend::new(1000).with_model("a", 100);

        assert!(backend.generate(request("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_memory() {
        let backend = ScriptedBackend::new(1000).with_model("a", 300);
        assert_eq!(backend.available_memory().await.unwrap(), 1000);

        backend.load_model("a").await.unwrap();
        assert_eq!(backend.available_memory().await.unwrap(), 700);

        backend.unload_model("a").await.unwrap();
        assert_eq!(backend.available_memory().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_forced_load_failures() {
        let backend = ScriptedBackend::new(1000).with_model("a", 100);
        backend.fail_loads("a", 1);

        assert!(backend.load_model("a").await.is_err());
        assert!(backend.load_model("a").await.is_ok());
        assert_eq!(backend.load_calls().len(), 2);
    }
}
