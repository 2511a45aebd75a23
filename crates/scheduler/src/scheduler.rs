//! Scheduler facade
//!
//! Wires the job store, the model lifecycle manager, the stream coordinator
//! and the dispatcher together and exposes the client operations: submit,
//! status, cancel and subscribe.

use crate::backend::{InferenceBackend, ResourceMonitor};
use crate::dispatcher::Dispatcher;
use crate::model::{ModelLifecycleManager, ModelState};
use crate::store::{CancelOutcome, JobStore};
use crate::stream::StreamCoordinator;
use crate::subscribers::{SubscriberRegistry, Subscription};
use llmq_common::{LlmqConfig, LlmqError, Result};
use llmq_proto::{JobId, JobStatus, JobStatusView, SubmitRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Model-aware job queue in front of a single-accelerator backend
pub struct Scheduler {
    store: Arc<JobStore>,
    models: ModelLifecycleManager,
    subscribers: Arc<SubscriberRegistry>,
    dispatcher: Dispatcher,
    preload: Option<String>,
    snapshot_path: Option<PathBuf>,
}

impl Scheduler {
    /// Build a scheduler, restoring the store snapshot when one is configured
    pub fn new(
        config: &LlmqConfig,
        backend: Arc<dyn InferenceBackend>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self> {
        config.validate()?;

        let store = match &config.scheduler.snapshot_path {
            Some(path) => JobStore::restore(config, path)?,
            None => JobStore::new(config),
        };
        let store = Arc::new(store);

        let subscribers = Arc::new(SubscriberRegistry::new());
        let unfinished = store.unfinished();
        for (job_id, attempt) in &unfinished {
            subscribers.register(*job_id, *attempt);
        }
        if !unfinished.is_empty() {
            info!(jobs = unfinished.len(), "Restored unfinished jobs");
        }

        let models = ModelLifecycleManager::new(config, Arc::clone(&backend), monitor);
        let streams = Arc::new(StreamCoordinator::new(config, backend));
        let dispatcher = Dispatcher::new(
            config,
            Arc::clone(&store),
            models.clone(),
            streams,
            Arc::clone(&subscribers),
        );

        Ok(Self {
            store,
            models,
            subscribers,
            dispatcher,
            preload: config.models.preload.clone(),
            snapshot_path: config.scheduler.snapshot_path.clone(),
        })
    }

    /// Discover installed models, preload the configured one and start dispatching
    pub async fn start(&self) {
        match self.models.refresh_installed().await {
            Ok(count) => info!(models = count, "Installed models discovered"),
            Err(e) => warn!("Failed to list installed models: {}", e),
        }

        if let Some(model) = &self.preload {
            match self.models.ensure_active(model).await {
                Ok(_) => info!(model = %model, "Model preloaded"),
                Err(e) => warn!(model = %model, "Preloading model failed: {}", e),
            }
        }

        self.dispatcher.start();
    }

    /// Validate and enqueue a request
    pub fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        if self.dispatcher.is_shutting_down() {
            return Err(LlmqError::ShuttingDown);
        }

        // the buffer must exist before a dispatcher can finish the job
        self.store
            .enqueue_with(request, |job_id| self.subscribers.register(job_id, 0))
    }

    /// Current view of a job, with live output while it streams
    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let job = self.store.get(job_id).ok_or(LlmqError::JobNotFound(job_id))?;

        let output = if job.status.is_in_flight() {
            self.subscribers.output(job_id).unwrap_or(job.output)
        } else {
            job.output
        };
        let queue_position = if job.status == JobStatus::Queued {
            let resident = self.models.active_model();
            self.store.queue_position(job_id, resident.as_deref())
        } else {
            None
        };

        Ok(JobStatusView {
            job_id,
            conversation_id: job.conversation_id,
            model: job.model,
            priority: job.priority,
            status: job.status,
            queue_position,
            output,
            error: job.error,
            retry_count: job.retry_count,
            created_at: job.created_at,
            claimed_at: job.claimed_at,
            completed_at: job.completed_at,
            history: job.history,
        })
    }

    /// Cancel a job
    ///
    /// A queued job is cancelled at once. An in-flight job is signalled and
    /// finalized as cancelled by its executor, keeping the partial output.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(job_id)?;
        match outcome {
            CancelOutcome::Removed => {
                self.subscribers.finish(job_id, JobStatus::Cancelled, None);
            }
            CancelOutcome::Signalled => {
                // a job claimed but not yet running checks the store flag itself
                self.dispatcher.signal_cancel(job_id);
            }
            CancelOutcome::AlreadyFinished(_) => {}
        }
        Ok(outcome)
    }

    /// Follow a job's output until it ends
    ///
    /// Jobs that already ended are replayed from the store.
    pub fn subscribe(&self, job_id: JobId) -> Result<Subscription> {
        if let Some(subscription) = self.subscribers.subscribe(job_id) {
            return Ok(subscription);
        }

        // buffers are retired only after the store records the terminal state
        let job = self.store.get(job_id).ok_or(LlmqError::JobNotFound(job_id))?;
        if !job.status.is_terminal() {
            return Err(LlmqError::internal(format!(
                "job {} is {} but has no output buffer",
                job_id, job.status
            )));
        }
        Ok(Subscription::replay(job.output, job.status, job.error))
    }

    /// Residency state of every known model
    pub fn models(&self) -> Vec<ModelState> {
        self.models.models()
    }

    pub fn queued_len(&self) -> usize {
        self.store.queued_len()
    }

    /// Stop dispatching and persist the store
    ///
    /// Running jobs are aborted without being finalized, so a scheduler
    /// restored from the snapshot delivers them again.
    pub async fn shutdown(&self) -> Result<()> {
        info!(
            queued = self.store.queued_len(),
            in_flight = self.dispatcher.in_flight_count(),
            "Shutting down scheduler"
        );
        self.dispatcher.shutdown().await;

        if let Some(path) = &self.snapshot_path {
            self.store.save_snapshot(path).await?;
            info!(path = %path.display(), "Job store snapshot written");
        }
        Ok(())
    }
}
