//! Dispatcher control loop
//!
//! One loop claims jobs from the [`JobStore`] while a semaphore bounds the
//! number of jobs executing at once. Each claimed job runs in its own task:
//! make its model resident, stream the generation, finalize the record.
//! A failed job is recorded and the loop moves on; nothing is retried in
//! place. A housekeeping task redelivers expired claims, archives old jobs
//! and writes the store snapshot.

use crate::job::{ClaimToken, Job};
use crate::model::ModelLifecycleManager;
use crate::store::{ClaimedJob, FinalizeOutcome, JobStore, Reclaimed};
use crate::stream::{StreamCoordinator, StreamOutcome};
use crate::subscribers::{OutputPublisher, SubscriberRegistry};
use llmq_common::{LlmqConfig, LlmqError};
use llmq_proto::{ErrorKind, JobError, JobId, JobOutput, JobStatus, TerminalState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
struct DispatcherSettings {
    max_concurrent: usize,
    poll_interval: Duration,
    renew_interval: Duration,
    housekeeping_interval: Duration,
    retention: Duration,
    snapshot_path: Option<PathBuf>,
}

struct InFlightJob {
    token: ClaimToken,
    cancel: CancellationToken,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn job_error(err: &LlmqError) -> JobError {
    JobError {
        kind: err.kind().unwrap_or(ErrorKind::Backend),
        message: err.to_string(),
    }
}

/// Claims jobs and drives them to a terminal state
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<JobStore>,
    models: ModelLifecycleManager,
    streams: Arc<StreamCoordinator>,
    subscribers: Arc<SubscriberRegistry>,
    settings: Arc<DispatcherSettings>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<JobId, InFlightJob>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: &LlmqConfig,
        store: Arc<JobStore>,
        models: ModelLifecycleManager,
        streams: Arc<StreamCoordinator>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        let settings = DispatcherSettings {
            max_concurrent: config.scheduler.max_concurrent_streams.max(1),
            poll_interval: config.claim_poll_interval(),
            renew_interval: config.lease_renew_interval(),
            housekeeping_interval: config.housekeeping_interval(),
            retention: config.retention(),
            snapshot_path: config.scheduler.snapshot_path.clone(),
        };

        Self {
            store,
            models,
            streams,
            subscribers,
            permits: Arc::new(Semaphore::new(settings.max_concurrent)),
            settings: Arc::new(settings),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the claim loop and the housekeeping task
    pub fn start(&self) {
        info!(
            max_concurrent = self.settings.max_concurrent,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "Starting dispatcher"
        );
        self.tracker.spawn(self.clone().run());
        self.tracker.spawn(self.clone().housekeeping());
    }

    /// Stop claiming, abort running jobs and wait for their tasks
    ///
    /// Jobs aborted this way are not finalized; their claims stay in the
    /// store so a restored snapshot puts them back in the queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Dispatcher stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Abort the running execution of a job; false if none runs here
    pub fn signal_cancel(&self, job_id: JobId) -> bool {
        match self.in_flight.lock().get(&job_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of jobs currently executing
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn run(self) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.reclaim();
            let resident = self.models.active_model();
            match self.store.claim(resident.as_deref()) {
                Some(claimed) => self.spawn_job(claimed, permit),
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.store.wait_for_work() => {}
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }
        debug!("Claim loop exited");
    }

    async fn housekeeping(self) {
        let mut ticker = tokio::time::interval(self.settings.housekeeping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.reclaim();
            self.store.purge_finalized(self.settings.retention);
            if let Some(path) = &self.settings.snapshot_path {
                if let Err(e) = self.store.save_snapshot(path).await {
                    warn!(path = %path.display(), "Failed to save job store snapshot: {}", e);
                }
            }
        }
    }

    /// Apply expired claims to local executions and subscribers
    fn reclaim(&self) {
        for reclaimed in self.store.reclaim_expired() {
            match reclaimed {
                Reclaimed::Redelivered { job_id, attempt } => {
                    self.abort_local(job_id);
                    self.subscribers.restart(job_id, attempt);
                }
                Reclaimed::Cancelled { job_id } => {
                    self.abort_local(job_id);
                    self.subscribers.finish(job_id, JobStatus::Cancelled, None);
                }
            }
        }
    }

    fn abort_local(&self, job_id: JobId) {
        if let Some(job) = self.in_flight.lock().remove(&job_id) {
            job.cancel.cancel();
        }
    }

    fn spawn_job(&self, claimed: ClaimedJob, permit: OwnedSemaphorePermit) {
        let job_id = claimed.job.id;
        let cancel = self.shutdown.child_token();
        self.in_flight.lock().insert(
            job_id,
            InFlightJob {
                token: claimed.token,
                cancel: cancel.clone(),
            },
        );

        // a cancel may have landed between claim and registration
        if self.store.is_cancel_requested(job_id) {
            cancel.cancel();
        }

        let span = info_span!(
            "job",
            %job_id,
            model = %claimed.job.model,
            attempt = claimed.job.retry_count
        );
        let this = self.clone();
        self.tracker.spawn(
            async move {
                let _permit = permit;
                this.process(claimed, cancel).await;
            }
            .instrument(span),
        );
    }

    async fn process(&self, claimed: ClaimedJob, cancel: CancellationToken) {
        let ClaimedJob { job, token } = claimed;
        let job_id = job.id;
        let started = Instant::now();

        let renewal = self.spawn_lease_renewal(job_id, token, cancel.clone());
        let publisher = self.subscribers.open(job_id, job.retry_count);
        let outcome = self.execute(&job, token, &publisher, &cancel).await;
        drop(renewal);

        let terminal = match outcome {
            StreamOutcome::Completed => Some((TerminalState::Completed, None)),
            StreamOutcome::Cancelled
                if self.shutdown.is_cancelled() && !self.store.is_cancel_requested(job_id) =>
            {
                info!("Execution aborted by shutdown, job left for redelivery");
                None
            }
            StreamOutcome::Cancelled => Some((TerminalState::Cancelled, None)),
            StreamOutcome::Failed(e) => Some((TerminalState::Failed, Some(job_error(&e)))),
            StreamOutcome::Superseded => None,
        };

        if let Some((terminal, error)) = terminal {
            self.finalize(job_id, token, terminal, publisher.snapshot(), error);
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Job processed");
        }
        self.release(job_id, token);
    }

    async fn execute(
        &self,
        job: &Job,
        token: ClaimToken,
        publisher: &OutputPublisher,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        if !self.models.is_active(&job.model) {
            if let Err(e) = self.store.transition(job.id, token, JobStatus::ModelSwitching) {
                return lost_claim(e);
            }
        }

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            lease = self.models.ensure_active(&job.model) => lease,
        };
        // capacity and switch errors fail the job, it is not requeued
        let _lease = match lease {
            Ok(lease) => lease,
            Err(e) => return StreamOutcome::Failed(e),
        };

        if let Err(e) = self.store.transition(job.id, token, JobStatus::Streaming) {
            return lost_claim(e);
        }
        self.streams.run(job, publisher, cancel).await
    }

    fn finalize(
        &self,
        job_id: JobId,
        token: ClaimToken,
        terminal: TerminalState,
        output: JobOutput,
        error: Option<JobError>,
    ) {
        match self.store.finalize(job_id, token, terminal, output, error.clone()) {
            Ok(FinalizeOutcome::Finalized) => {
                self.subscribers.finish(job_id, terminal.as_status(), error);
            }
            Ok(FinalizeOutcome::AlreadyFinalized) => {}
            Err(e @ (LlmqError::StaleClaim(_) | LlmqError::AlreadyFinalized { .. })) => {
                info!("Claim lost before finalization: {}", e);
            }
            Err(e) => error!("Failed to finalize job: {}", e),
        }
    }

    fn release(&self, job_id: JobId, token: ClaimToken) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&job_id).map_or(false, |job| job.token == token) {
            in_flight.remove(&job_id);
        }
    }

    /// Keep the claim alive while the job executes
    fn spawn_lease_renewal(
        &self,
        job_id: JobId,
        token: ClaimToken,
        cancel: CancellationToken,
    ) -> AbortOnDrop {
        let store = Arc::clone(&self.store);
        let every = self.settings.renew_interval;

        AbortOnDrop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                if let Err(e) = store.renew(job_id, token) {
                    warn!(%job_id, "Claim renewal failed, abandoning execution: {}", e);
                    cancel.cancel();
                    return;
                }
            }
        }))
    }
}

fn lost_claim(err: LlmqError) -> StreamOutcome {
    warn!("Claim lost during execution: {}", err);
    StreamOutcome::Superseded
}
