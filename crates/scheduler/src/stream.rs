//! Generation stream coordination
//!
//! Opens the backend stream for a job, retrying transport failures with
//! exponential backoff, and forwards every token into the job's output
//! buffer. Forwarding ends on the first of: the end-of-generation marker,
//! the connection closing, a backend error, the inactivity timer or a cancel.

use crate::backend::{GenerateRequest, InferenceBackend, TokenEvent, TokenStream};
use crate::job::Job;
use crate::subscribers::OutputPublisher;
use llmq_common::{LlmqConfig, LlmqError, Result, METRICS};
use llmq_proto::JobId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How forwarding a stream ended
#[derive(Debug)]
pub enum StreamOutcome {
    /// End marker received, or the connection closed without one
    Completed,

    Cancelled,

    Failed(LlmqError),

    /// The output buffer moved on to a newer attempt of the job
    Superseded,
}

#[derive(Debug, Clone)]
struct StreamSettings {
    inactivity_timeout: Duration,
    open_attempts: u32,
    open_backoff: Duration,
    max_open_backoff: Duration,
}

/// Opens generation streams against the backend
pub struct StreamCoordinator {
    backend: Arc<dyn InferenceBackend>,
    settings: StreamSettings,
}

impl StreamCoordinator {
    pub fn new(config: &LlmqConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            settings: StreamSettings {
                inactivity_timeout: config.inactivity_timeout(),
                open_attempts: config.stream.open_attempts.max(1),
                open_backoff: Duration::from_millis(config.stream.open_backoff_ms),
                max_open_backoff: Duration::from_millis(config.stream.max_open_backoff_ms),
            },
        }
    }

    /// Open the generation stream of a job
    ///
    /// Transient backend errors are retried with exponential backoff up to the
    /// configured number of attempts. Any other error is returned at once.
    /// An attempt that produces no stream within the inactivity window fails
    /// with [`LlmqError::StreamTimeout`].
    pub async fn open(&self, job: &Job) -> Result<ActiveStream> {
        let request = GenerateRequest::new(job.model.clone(), job.messages.clone(), job.options.clone());
        let window = self.settings.inactivity_timeout;
        let mut backoff = self.settings.open_backoff;
        let mut attempt = 1;

        loop {
            let opened = match tokio::time::timeout(window, self.backend.generate(request.clone())).await {
                Ok(opened) => opened,
                Err(_) => {
                    METRICS.streams.timeouts_total.inc();
                    warn!(
                        job_id = %job.id,
                        attempt,
                        timeout_secs = window.as_secs(),
                        "Backend did not answer within the inactivity window"
                    );
                    return Err(LlmqError::StreamTimeout(window));
                }
            };

            match opened {
                Ok(stream) => {
                    debug!(job_id = %job.id, attempt, "Generation stream open");
                    return Ok(ActiveStream {
                        job_id: job.id,
                        stream,
                        opened_at: Instant::now(),
                        inactivity_timeout: self.settings.inactivity_timeout,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.settings.open_attempts => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Opening generation stream failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.max_open_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open and forward a job's stream, honoring `cancel` throughout
    pub async fn run(
        &self,
        job: &Job,
        publisher: &OutputPublisher,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            opened = self.open(job) => opened,
        };

        match opened {
            Ok(stream) => stream.forward(publisher, cancel).await,
            Err(e) => StreamOutcome::Failed(e),
        }
    }
}

/// Decrements the active stream gauge when forwarding ends
struct ActiveGauge;

impl ActiveGauge {
    fn new() -> Self {
        METRICS.streams.active_streams.inc();
        Self
    }
}

impl Drop for ActiveGauge {
    fn drop(&mut self) {
        METRICS.streams.active_streams.dec();
    }
}

/// An open generation stream
pub struct ActiveStream {
    job_id: JobId,
    stream: TokenStream,
    opened_at: Instant,
    inactivity_timeout: Duration,
}

impl ActiveStream {
    /// Forward tokens into `publisher` until the stream ends
    ///
    /// Dropping the backend stream on return closes the connection.
    pub async fn forward(mut self, publisher: &OutputPublisher, cancel: &CancellationToken) -> StreamOutcome {
        let _active = ActiveGauge::new();
        let job_id = self.job_id;
        let mut tokens: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(%job_id, tokens, "Stream cancelled");
                    return StreamOutcome::Cancelled;
                }
                next = tokio::time::timeout(self.inactivity_timeout, self.stream.next()) => next,
            };

            let event = match next {
                Err(_) => {
                    METRICS.streams.timeouts_total.inc();
                    warn!(
                        %job_id,
                        tokens,
                        timeout_secs = self.inactivity_timeout.as_secs(),
                        "No token within the inactivity window, aborting stream"
                    );
                    return StreamOutcome::Failed(LlmqError::StreamTimeout(self.inactivity_timeout));
                }
                Ok(None) => {
                    debug!(%job_id, tokens, "Stream closed without an end marker, treating as complete");
                    return StreamOutcome::Completed;
                }
                Ok(Some(Err(e))) => {
                    warn!(%job_id, tokens, "Backend error mid-stream: {}", e);
                    return StreamOutcome::Failed(e);
                }
                Ok(Some(Ok(event))) => event,
            };

            let accepted = match event {
                TokenEvent::Done(stats) => {
                    debug!(
                        %job_id,
                        tokens,
                        prompt_tokens = stats.prompt_tokens,
                        completion_tokens = stats.completion_tokens,
                        done_reason = stats.done_reason.as_deref(),
                        "Stream finished"
                    );
                    return StreamOutcome::Completed;
                }
                TokenEvent::Content(text) => publisher.push_content(text),
                TokenEvent::Thinking(text) => publisher.push_thinking(text),
            };

            if !accepted {
                info!(%job_id, "Job output superseded by a newer attempt");
                return StreamOutcome::Superseded;
            }

            if tokens == 0 {
                METRICS
                    .streams
                    .time_to_first_token
                    .observe(self.opened_at.elapsed().as_secs_f64());
            }
            tokens += 1;
            METRICS.streams.tokens_total.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Script, ScriptedBackend};
    use crate::subscribers::SubscriberRegistry;
    use llmq_proto::{ChatMessage, SubmitRequest};

    fn config() -> LlmqConfig {
        let mut config = LlmqConfig::default();
        config.stream.inactivity_timeout_secs = 10;
        config
    }

    async fn setup() -> (Arc<ScriptedBackend>, StreamCoordinator, Job) {
        let backend = Arc::new(ScriptedBackend::new(1000).with_model("a", 100));
        backend.load_model("a").await.unwrap();
        let coordinator = StreamCoordinator::new(&config(), backend.clone());
        let job = Job::new(SubmitRequest::new("conv", "a", vec![ChatMessage::user("hi")]));
        (backend, coordinator, job)
    }

    #[tokio::test]
    async fn test_forwards_tokens_until_marker() {
        let (backend, coordinator, job) = setup().await;
        backend.push_script("a", Script::new().thinking("hm").content("Hi").content(" there").done());
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Completed));
        let output = publisher.snapshot();
        assert_eq!(output.content, "Hi there");
        assert_eq!(output.thinking.as_deref(), Some("hm"));
    }

    #[tokio::test]
    async fn test_close_without_marker_completes() {
        let (backend, coordinator, job) = setup().await;
        backend.push_script("a", Script::new().content("partial"));
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Completed));
        assert_eq!(publisher.snapshot().content, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_keeps_partial_output() {
        let (backend, coordinator, job) = setup().await;
        backend.push_script("a", Script::new().content("so far").stall());
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let started = Instant::now();
        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, StreamOutcome::Failed(LlmqError::StreamTimeout(_))));
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
        assert_eq!(publisher.snapshot().content, "so far");
    }

    /// Backend that accepts a generate call and never answers it
    struct SilentBackend;

    #[async_trait::async_trait]
    impl InferenceBackend for SilentBackend {
        async fn generate(&self, _request: GenerateRequest) -> Result<TokenStream> {
            std::future::pending().await
        }

        async fn list_models(&self) -> Result<Vec<crate::backend::ModelInfo>> {
            Ok(Vec::new())
        }

        async fn load_model(&self, _model: &str) -> Result<()> {
            Ok(())
        }

        async fn unload_model(&self, _model: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_open_times_out() {
        let coordinator = StreamCoordinator::new(&config(), Arc::new(SilentBackend));
        let job = Job::new(SubmitRequest::new("conv", "a", vec![ChatMessage::user("hi")]));
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let started = Instant::now();
        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, StreamOutcome::Failed(LlmqError::StreamTimeout(_))));
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    /// Backend answering every generate call with an HTTP error status
    struct RejectingBackend {
        status: u16,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl InferenceBackend for RejectingBackend {
        async fn generate(&self, _request: GenerateRequest) -> Result<TokenStream> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(LlmqError::backend_status(self.status, "rejected"))
        }

        async fn list_models(&self) -> Result<Vec<crate::backend::ModelInfo>> {
            Ok(Vec::new())
        }

        async fn load_model(&self, _model: &str) -> Result<()> {
            Ok(())
        }

        async fn unload_model(&self, _model: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn open_calls_for_status(status: u16) -> (u32, StreamOutcome) {
        let backend = Arc::new(RejectingBackend {
            status,
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let coordinator = StreamCoordinator::new(&config(), backend.clone());
        let job = Job::new(SubmitRequest::new("conv", "a", vec![ChatMessage::user("hi")]));
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;
        (backend.calls.load(std::sync::atomic::Ordering::SeqCst), outcome)
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let (calls, outcome) = open_calls_for_status(404).await;

        assert_eq!(calls, 1);
        assert!(matches!(
            outcome,
            StreamOutcome::Failed(LlmqError::BackendStatus { status: 404, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_retried() {
        let (calls, outcome) = open_calls_for_status(503).await;

        assert_eq!(calls, 3);
        assert!(matches!(
            outcome,
            StreamOutcome::Failed(LlmqError::BackendStatus { status: 503, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tokens_reset_inactivity_timer() {
        let (backend, coordinator, job) = setup().await;
        let mut script = Script::new();
        for _ in 0..5 {
            script = script.delay(Duration::from_secs(8)).content("x");
        }
        backend.push_script("a", script.done());
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Completed));
        assert_eq!(publisher.snapshot().content, "xxxxx");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_stream() {
        let (backend, coordinator, job) = setup().await;
        backend.push_script("a", Script::new().content("one").stall());
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };
        let outcome = coordinator.run(&job, &publisher, &cancel).await;
        canceller.await.unwrap();

        assert!(matches!(outcome, StreamOutcome::Cancelled));
        assert_eq!(publisher.snapshot().content, "one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let (backend, coordinator, job) = setup().await;
        backend.fail_opens(2);
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Completed));
        assert_eq!(backend.generate_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_retries_are_bounded() {
        let (backend, coordinator, job) = setup().await;
        backend.fail_opens(5);
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Failed(LlmqError::Backend(_))));
    }

    #[tokio::test]
    async fn test_mid_stream_error_fails() {
        let (backend, coordinator, job) = setup().await;
        backend.push_script("a", Script::new().content("a").error("runner crashed"));
        let registry = SubscriberRegistry::new();
        let publisher = registry.open(job.id, 0);

        let outcome = coordinator.run(&job, &publisher, &CancellationToken::new()).await;

        assert!(matches!(outcome, StreamOutcome::Failed(LlmqError::Backend(_))));
        assert_eq!(publisher.snapshot().content, "a");
    }
}
