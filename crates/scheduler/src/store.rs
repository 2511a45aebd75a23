//! Job store and admission queue
//!
//! Jobs and their queue slots live behind a single mutex, so position
//! assignment and claiming are atomic with respect to any number of
//! concurrent producers. A claim is a lease: the holder renews it before the
//! visibility timeout runs out or the job is redelivered to the next claim.

use crate::job::{validate_request, ClaimToken, Job, RequestLimits};
use chrono::{DateTime, Utc};
use llmq_common::{LlmqConfig, LlmqError, Result, METRICS};
use llmq_proto::{JobError, JobId, JobOutput, JobStatus, SubmitRequest, TerminalState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Place of a job in the admission queue
#[derive(Debug, Clone)]
pub struct QueueSlot {
    pub job_id: JobId,

    /// Globally unique, strictly increasing enqueue position
    pub position: u64,

    /// Burst group shared by same-model jobs arriving within the burst window
    pub burst_group: u64,

    /// Gapless index of the job inside its burst group
    pub group_index: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Position of the first job of the burst group
    group_rank: u64,
    enqueued_instant: Instant,
    claim: Option<Lease>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: ClaimToken,
    expires_at: Instant,
}

/// A job handed to a dispatcher together with its lease token
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: ClaimToken,
}

/// Result of a successful finalize call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,

    /// The job already carried the same terminal state
    AlreadyFinalized,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled
    Removed,

    /// The job is in flight; its holder has to abort and finalize it
    Signalled,

    /// Nothing to cancel
    AlreadyFinished(JobStatus),
}

/// A lease that expired before its holder finalized the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    /// Back in the queue for another attempt
    Redelivered { job_id: JobId, attempt: u32 },

    /// A cancel was pending, so the job was cancelled instead
    Cancelled { job_id: JobId },
}

struct OpenGroup {
    id: u64,
    opened_at: Instant,
    first_position: u64,
    next_index: u32,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    slots: BTreeMap<u64, QueueSlot>,
    slot_of: HashMap<JobId, u64>,
    open_groups: HashMap<String, OpenGroup>,
    next_position: u64,
    next_group: u64,
}

/// Admission ordering key, smallest first
type AdmissionKey = (u8, i64, u8, u64, u32);

impl StoreInner {
    fn join_burst_group(
        &mut self,
        model: &str,
        position: u64,
        now: Instant,
        window: Duration,
    ) -> (u64, u32, u64) {
        if let Some(group) = self.open_groups.get_mut(model) {
            if now.duration_since(group.opened_at) <= window {
                let index = group.next_index;
                group.next_index += 1;
                return (group.id, index, group.first_position);
            }
        }

        let id = self.next_group;
        self.next_group += 1;
        self.open_groups.insert(
            model.to_string(),
            OpenGroup {
                id,
                opened_at: now,
                first_position: position,
                next_index: 1,
            },
        );
        (id, 0, position)
    }

    /// Positions of unclaimed queued jobs in the order they will be admitted
    fn admission_order(&self, now: Instant, resident: Option<&str>, max_wait: Duration) -> Vec<u64> {
        let mut candidates: Vec<(AdmissionKey, u64)> = self
            .slots
            .values()
            .filter(|slot| slot.claim.is_none())
            .filter_map(|slot| {
                let job = self.jobs.get(&slot.job_id)?;
                (job.status == JobStatus::Queued)
                    .then(|| (admission_key(slot, job, now, resident, max_wait), slot.position))
            })
            .collect();

        candidates.sort_unstable();
        candidates.into_iter().map(|(_, position)| position).collect()
    }

    fn owned_slot_mut(&mut self, job_id: JobId, token: ClaimToken) -> Result<&mut QueueSlot> {
        if !self.jobs.contains_key(&job_id) {
            return Err(LlmqError::JobNotFound(job_id));
        }
        let position = self
            .slot_of
            .get(&job_id)
            .copied()
            .ok_or(LlmqError::StaleClaim(job_id))?;

        match self.slots.get_mut(&position) {
            Some(slot) if slot.claim.map(|lease| lease.token) == Some(token) => Ok(slot),
            _ => Err(LlmqError::StaleClaim(job_id)),
        }
    }

    fn remove_slot(&mut self, job_id: JobId) {
        if let Some(position) = self.slot_of.remove(&job_id) {
            self.slots.remove(&position);
        }
    }

    fn queued_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.claim.is_none()).count()
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            saved_at: Utc::now(),
            next_position: self.next_position,
            next_group: self.next_group,
            jobs: self.jobs.values().cloned().collect(),
            slots: self
                .slots
                .values()
                .map(|slot| SlotRecord {
                    job_id: slot.job_id,
                    position: slot.position,
                    burst_group: slot.burst_group,
                    group_index: slot.group_index,
                    group_rank: slot.group_rank,
                    enqueued_at: slot.enqueued_at,
                })
                .collect(),
        }
    }

    fn load(&mut self, snapshot: StoreSnapshot) {
        let now = Instant::now();
        let wall_now = Utc::now();
        self.next_position = snapshot.next_position;
        self.next_group = snapshot.next_group;

        for mut job in snapshot.jobs {
            if job.status.is_in_flight() {
                // the process holding the claim is gone
                let next = if job.cancel_requested {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Queued
                };
                if let Err(e) = job.transition(next) {
                    warn!(job_id = %job.id, "Skipping restored job: {}", e);
                    continue;
                }
                if next == JobStatus::Queued {
                    job.retry_count += 1;
                    job.output = JobOutput::default();
                }
            }
            self.jobs.insert(job.id, job);
        }

        for record in snapshot.slots {
            let queued = self
                .jobs
                .get(&record.job_id)
                .map_or(false, |job| job.status == JobStatus::Queued);
            if !queued {
                continue;
            }

            let age = (wall_now - record.enqueued_at).to_std().unwrap_or_default();
            self.slot_of.insert(record.job_id, record.position);
            self.slots.insert(
                record.position,
                QueueSlot {
                    job_id: record.job_id,
                    position: record.position,
                    burst_group: record.burst_group,
                    group_index: record.group_index,
                    enqueued_at: record.enqueued_at,
                    group_rank: record.group_rank,
                    enqueued_instant: now.checked_sub(age).unwrap_or(now),
                    claim: None,
                },
            );
        }

        // queued jobs whose slot record went missing go to the back
        let orphans: Vec<(JobId, DateTime<Utc>)> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && !self.slot_of.contains_key(&job.id))
            .map(|job| (job.id, job.created_at))
            .collect();
        for (job_id, created_at) in orphans {
            let position = self.next_position;
            self.next_position += 1;
            let burst_group = self.next_group;
            self.next_group += 1;
            self.slot_of.insert(job_id, position);
            self.slots.insert(
                position,
                QueueSlot {
                    job_id,
                    position,
                    burst_group,
                    group_index: 0,
                    enqueued_at: created_at,
                    group_rank: position,
                    enqueued_instant: now,
                    claim: None,
                },
            );
        }
    }
}

fn admission_key(
    slot: &QueueSlot,
    job: &Job,
    now: Instant,
    resident: Option<&str>,
    max_wait: Duration,
) -> AdmissionKey {
    // starving jobs go first, oldest first
    if now.duration_since(slot.enqueued_instant) >= max_wait {
        return (0, 0, 0, slot.position, 0);
    }

    let affine = resident == Some(job.model.as_str());
    (
        1,
        -i64::from(job.priority),
        u8::from(!affine),
        slot.group_rank,
        slot.group_index,
    )
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    saved_at: DateTime<Utc>,
    next_position: u64,
    next_group: u64,
    jobs: Vec<Job>,
    slots: Vec<SlotRecord>,
}

#[derive(Serialize, Deserialize)]
struct SlotRecord {
    job_id: JobId,
    position: u64,
    burst_group: u64,
    group_index: u32,
    group_rank: u64,
    enqueued_at: DateTime<Utc>,
}

/// Durable job records plus the admission queue
pub struct JobStore {
    inner: Mutex<StoreInner>,
    limits: RequestLimits,
    burst_window: Duration,
    max_wait: Duration,
    visibility_timeout: Duration,
    notify: Notify,
}

impl JobStore {
    pub fn new(config: &LlmqConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            limits: RequestLimits {
                max_prompt_bytes: config.scheduler.max_prompt_bytes,
                max_messages: config.scheduler.max_messages,
            },
            burst_window: config.burst_window(),
            max_wait: config.max_wait(),
            visibility_timeout: config.visibility_timeout(),
            notify: Notify::new(),
        }
    }

    /// Build a store from a snapshot file, or an empty one if none exists
    pub fn restore(config: &LlmqConfig, path: &Path) -> Result<Self> {
        let store = Self::new(config);

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No job store snapshot, starting empty");
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        let saved_at = snapshot.saved_at;
        {
            let mut inner = store.inner.lock();
            inner.load(snapshot);
            METRICS.jobs.queue_depth.set(inner.queued_count() as i64);
            info!(
                path = %path.display(),
                %saved_at,
                jobs = inner.jobs.len(),
                queued = inner.queued_count(),
                "Restored job store snapshot"
            );
        }
        Ok(store)
    }

    /// Write the store to `path` as JSON, replacing the file atomically
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let bytes = {
            let inner = self.inner.lock();
            serde_json::to_vec(&inner.snapshot())?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Saved job store snapshot");
        Ok(())
    }

    /// Validate a request and append it to the queue
    pub fn enqueue(&self, request: SubmitRequest) -> Result<JobId> {
        self.enqueue_with(request, |_| {})
    }

    /// Like [`JobStore::enqueue`], running `on_accepted` once the request is
    /// valid and before any dispatcher can claim the job
    pub fn enqueue_with(&self, request: SubmitRequest, on_accepted: impl FnOnce(JobId)) -> Result<JobId> {
        if let Err(e) = validate_request(&request, &self.limits) {
            METRICS.jobs.rejected_total.inc();
            return Err(e);
        }

        let job = Job::new(request);
        let job_id = job.id;
        on_accepted(job_id);

        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            let position = inner.next_position;
            inner.next_position += 1;
            let (burst_group, group_index, group_rank) =
                inner.join_burst_group(&job.model, position, now, self.burst_window);

            debug!(
                %job_id,
                model = %job.model,
                priority = job.priority,
                position,
                burst_group,
                group_index,
                "Job enqueued"
            );

            inner.slots.insert(
                position,
                QueueSlot {
                    job_id,
                    position,
                    burst_group,
                    group_index,
                    enqueued_at: job.created_at,
                    group_rank,
                    enqueued_instant: now,
                    claim: None,
                },
            );
            inner.slot_of.insert(job_id, position);
            inner.jobs.insert(job_id, job);
            METRICS.jobs.queue_depth.set(inner.queued_count() as i64);
        }

        METRICS.jobs.submitted_total.inc();
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Lease the next job in admission order
    ///
    /// Order: jobs older than the maximum wait (oldest first), then higher
    /// priority, then jobs for the `resident` model, then burst group and
    /// position within the group.
    pub fn claim(&self, resident: Option<&str>) -> Option<ClaimedJob> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let position = inner
            .admission_order(now, resident, self.max_wait)
            .into_iter()
            .next()?;
        let slot = inner.slots.get_mut(&position)?;
        let job = inner.jobs.get_mut(&slot.job_id)?;

        job.transition(JobStatus::Claimed).ok()?;
        let token = ClaimToken::new();
        slot.claim = Some(Lease {
            token,
            expires_at: now + self.visibility_timeout,
        });

        if let Ok(wait) = (Utc::now() - job.created_at).to_std() {
            METRICS.jobs.queue_wait.observe(wait.as_secs_f64());
        }
        debug!(job_id = %job.id, model = %job.model, attempt = job.retry_count, "Job claimed");

        let claimed = ClaimedJob {
            job: job.clone(),
            token,
        };
        METRICS.jobs.queue_depth.set(inner.queued_count() as i64);
        Some(claimed)
    }

    /// Extend a lease by another visibility timeout
    pub fn renew(&self, job_id: JobId, token: ClaimToken) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.owned_slot_mut(job_id, token)?;
        slot.claim = Some(Lease {
            token,
            expires_at: Instant::now() + self.visibility_timeout,
        });
        Ok(())
    }

    /// Advance a claimed job to a non-terminal state
    pub fn transition(&self, job_id: JobId, token: ClaimToken, next: JobStatus) -> Result<()> {
        if next.is_terminal() {
            return Err(LlmqError::internal(format!(
                "terminal state {} must go through finalize",
                next
            )));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.owned_slot_mut(job_id, token)?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(LlmqError::JobNotFound(job_id))?;
        job.transition(next)?;
        debug!(%job_id, status = %next, "Job status changed");
        Ok(())
    }

    /// Record the terminal state of a claimed job
    ///
    /// Repeating the call with the terminal state the job already has is a
    /// no-op. A token that lost its lease yields [`LlmqError::StaleClaim`].
    pub fn finalize(
        &self,
        job_id: JobId,
        token: ClaimToken,
        terminal: TerminalState,
        output: JobOutput,
        error: Option<JobError>,
    ) -> Result<FinalizeOutcome> {
        let status = terminal.as_status();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let current = inner
            .jobs
            .get(&job_id)
            .map(|job| job.status)
            .ok_or(LlmqError::JobNotFound(job_id))?;
        if current.is_terminal() {
            if current == status {
                debug!(%job_id, %status, "Duplicate finalize ignored");
                return Ok(FinalizeOutcome::AlreadyFinalized);
            }
            return Err(LlmqError::AlreadyFinalized {
                job_id,
                status: current,
            });
        }

        inner.owned_slot_mut(job_id, token)?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(LlmqError::JobNotFound(job_id))?;
        job.transition(status)?;
        job.output = output;
        job.error = error;

        if let Some(claimed_at) = job.claimed_at {
            if let Ok(elapsed) = (Utc::now() - claimed_at).to_std() {
                METRICS.jobs.job_duration.observe(elapsed.as_secs_f64());
            }
        }
        match terminal {
            TerminalState::Completed => METRICS.jobs.completed_total.inc(),
            TerminalState::Failed => METRICS.jobs.failed_total.inc(),
            TerminalState::Cancelled => METRICS.jobs.cancelled_total.inc(),
        }
        info!(
            %job_id,
            model = %job.model,
            %status,
            error = job.error.as_ref().map(|e| e.message.as_str()),
            "Job finalized"
        );

        inner.remove_slot(job_id);
        Ok(FinalizeOutcome::Finalized)
    }

    /// Cancel a job
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(LlmqError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Queued => {
                job.transition(JobStatus::Cancelled)?;
                inner.remove_slot(job_id);
                METRICS.jobs.cancelled_total.inc();
                METRICS.jobs.queue_depth.set(inner.queued_count() as i64);
                info!(%job_id, "Queued job cancelled");
                Ok(CancelOutcome::Removed)
            }
            status if status.is_in_flight() => {
                job.cancel_requested = true;
                debug!(%job_id, %status, "Cancel requested for in-flight job");
                Ok(CancelOutcome::Signalled)
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    /// Return jobs whose lease expired to the queue
    pub fn reclaim_expired(&self) -> Vec<Reclaimed> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired: Vec<(u64, JobId)> = inner
            .slots
            .values()
            .filter(|slot| slot.claim.map_or(false, |lease| lease.expires_at <= now))
            .map(|slot| (slot.position, slot.job_id))
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (position, job_id) in expired {
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                inner.slots.remove(&position);
                continue;
            };

            if job.cancel_requested {
                if let Err(e) = job.transition(JobStatus::Cancelled) {
                    warn!(%job_id, "Cannot cancel expired job: {}", e);
                    continue;
                }
                METRICS.jobs.cancelled_total.inc();
                info!(%job_id, "Claim lease expired with a pending cancel");
                inner.remove_slot(job_id);
                reclaimed.push(Reclaimed::Cancelled { job_id });
                continue;
            }

            if let Err(e) = job.transition(JobStatus::Queued) {
                warn!(%job_id, "Cannot redeliver expired job: {}", e);
                continue;
            }
            job.retry_count += 1;
            job.output = JobOutput::default();
            if let Some(slot) = inner.slots.get_mut(&position) {
                slot.claim = None;
            }

            METRICS.jobs.redelivered_total.inc();
            warn!(%job_id, attempt = job.retry_count, "Claim lease expired, redelivering job");
            reclaimed.push(Reclaimed::Redelivered {
                job_id,
                attempt: job.retry_count,
            });
        }

        if !reclaimed.is_empty() {
            METRICS.jobs.queue_depth.set(inner.queued_count() as i64);
            drop(guard);
            self.notify.notify_one();
        }
        reclaimed
    }

    /// Remove terminal jobs finalized longer than `retention` ago
    pub fn purge_finalized(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.map_or(false, |at| at <= cutoff))
        });
        let purged = before - inner.jobs.len();
        if purged > 0 {
            debug!(purged, "Archived finalized jobs");
        }
        purged
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().jobs.get(&job_id).cloned()
    }

    pub fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.inner
            .lock()
            .jobs
            .get(&job_id)
            .map_or(false, |job| job.cancel_requested)
    }

    /// Zero-based admission rank of a queued job
    pub fn queue_position(&self, job_id: JobId, resident: Option<&str>) -> Option<usize> {
        let inner = self.inner.lock();
        let position = *inner.slot_of.get(&job_id)?;
        inner
            .admission_order(Instant::now(), resident, self.max_wait)
            .iter()
            .position(|p| *p == position)
    }

    /// Non-terminal jobs with their current attempt
    pub fn unfinished(&self) -> Vec<(JobId, u32)> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| (job.id, job.retry_count))
            .collect()
    }

    /// Queue slots ordered by position
    pub fn queue_slots(&self) -> Vec<QueueSlot> {
        self.inner.lock().slots.values().cloned().collect()
    }

    /// Number of unclaimed queued jobs
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queued_count()
    }

    /// Number of jobs held by the store
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a job was enqueued or returned to the queue
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_proto::{ChatMessage, ErrorKind};
    use proptest::prelude::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn config() -> LlmqConfig {
        let mut config = LlmqConfig::default();
        config.scheduler.visibility_timeout_secs = 30;
        config.scheduler.max_wait_secs = 60;
        config
    }

    fn request(model: &str, priority: i32) -> SubmitRequest {
        SubmitRequest::new("conv-1", model, vec![ChatMessage::user("hello")])
            .with_priority(priority)
    }

    fn claim_models(store: &JobStore, resident: Option<&str>) -> Vec<String> {
        let mut models = Vec::new();
        while let Some(claimed) = store.claim(resident) {
            models.push(claimed.job.model);
        }
        models
    }

    #[tokio::test]
    async fn test_accept_hook_runs_before_job_is_claimable() {
        let store = JobStore::new(&config());
        let mut seen = None;

        let id = store
            .enqueue_with(request("a", 0), |job_id| {
                seen = Some((job_id, store.get(job_id).is_some(), store.claim(None).is_some()));
            })
            .unwrap();

        assert_eq!(seen, Some((id, false, false)));
        assert_eq!(store.claim(None).map(|c| c.job.id), Some(id));
    }

    #[tokio::test]
    async fn test_accept_hook_skipped_for_rejected_request() {
        let store = JobStore::new(&config());
        let mut called = false;

        let empty = SubmitRequest::new("conv-1", "a", vec![]);
        assert!(store.enqueue_with(empty, |_| called = true).is_err());
        assert!(!called);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_grouping() {
        let store = JobStore::new(&config());

        let a1 = store.enqueue(request("a", 0)).unwrap();
        let b1 = store.enqueue(request("b", 0)).unwrap();
        let a2 = store.enqueue(request("a", 0)).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let a3 = store.enqueue(request("a", 0)).unwrap();

        let slots = store.queue_slots();
        let slot = |id: JobId| slots.iter().find(|s| s.job_id == id).unwrap().clone();

        assert_eq!(slot(a1).burst_group, slot(a2).burst_group);
        assert_eq!(slot(a1).group_index, 0);
        assert_eq!(slot(a2).group_index, 1);
        assert_ne!(slot(a3).burst_group, slot(a1).burst_group);
        assert_ne!(slot(b1).burst_group, slot(a1).burst_group);

        // a2 rides along with a1 ahead of b1
        let order: Vec<JobId> = std::iter::from_fn(|| store.claim(None))
            .map(|c| c.job.id)
            .collect();
        assert_eq!(order, vec![a1, a2, b1, a3]);
    }

    #[test]
    fn test_invalid_request_never_occupies_a_slot() {
        let store = JobStore::new(&config());
        let mut bad = request("a", 0);
        bad.messages.clear();

        let err = store.enqueue(bad).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Validation));
        assert!(store.is_empty());
        assert!(store.queue_slots().is_empty());
    }

    #[test]
    fn test_priority_then_affinity() {
        let store = JobStore::new(&config());
        store.enqueue(request("a", 0)).unwrap();
        store.enqueue(request("b", 0)).unwrap();
        store.enqueue(request("c", 5)).unwrap();

        assert_eq!(claim_models(&store, Some("b")), vec!["c", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starving_job_is_admitted_first() {
        let store = JobStore::new(&config());
        let lonely = store.enqueue(request("a", 0)).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        store.enqueue(request("b", 10)).unwrap();

        assert_eq!(store.queue_position(lonely, Some("b")), Some(0));
        assert_eq!(store.claim(Some("b")).unwrap().job.id, lonely);
    }

    #[test]
    fn test_claimed_job_is_not_claimed_again() {
        let store = JobStore::new(&config());
        store.enqueue(request("a", 0)).unwrap();

        let claimed = store.claim(None).unwrap();
        assert_eq!(claimed.job.status, JobStatus::Claimed);
        assert!(store.claim(None).is_none());
        assert_eq!(store.queued_len(), 0);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let store = JobStore::new(&config());
        let id = store.enqueue(request("a", 0)).unwrap();
        let claimed = store.claim(None).unwrap();
        store.transition(id, claimed.token, JobStatus::Streaming).unwrap();

        let output = JobOutput {
            content: "done".to_string(),
            thinking: None,
        };
        let first = store
            .finalize(id, claimed.token, TerminalState::Completed, output.clone(), None)
            .unwrap();
        let second = store
            .finalize(id, claimed.token, TerminalState::Completed, output, None)
            .unwrap();

        assert_eq!(first, FinalizeOutcome::Finalized);
        assert_eq!(second, FinalizeOutcome::AlreadyFinalized);
        assert!(matches!(
            store.finalize(id, claimed.token, TerminalState::Failed, JobOutput::default(), None),
            Err(LlmqError::AlreadyFinalized { .. })
        ));

        let job = store.get(id).unwrap();
        assert_eq!(job.output.content, "done");
        assert_eq!(
            job.status_sequence(),
            vec![
                JobStatus::Queued,
                JobStatus::Claimed,
                JobStatus::Streaming,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let store = JobStore::new(&config());
        let id = store.enqueue(request("a", 0)).unwrap();
        let stale = store.claim(None).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            store.reclaim_expired(),
            vec![Reclaimed::Redelivered { job_id: id, attempt: 1 }]
        );

        let fresh = store.claim(None).unwrap();
        assert_eq!(fresh.job.id, id);
        assert_eq!(fresh.job.retry_count, 1);

        assert!(matches!(
            store.renew(id, stale.token),
            Err(LlmqError::StaleClaim(_))
        ));
        assert!(matches!(
            store.finalize(id, stale.token, TerminalState::Failed, JobOutput::default(), None),
            Err(LlmqError::StaleClaim(_))
        ));
        assert!(store.renew(id, fresh.token).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_survives() {
        let store = JobStore::new(&config());
        let id = store.enqueue(request("a", 0)).unwrap();
        let claimed = store.claim(None).unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            store.renew(id, claimed.token).unwrap();
        }

        assert!(store.reclaim_expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_with_pending_cancel() {
        let store = JobStore::new(&config());
        let id = store.enqueue(request("a", 0)).unwrap();
        store.claim(None).unwrap();

        assert_eq!(store.cancel(id).unwrap(), CancelOutcome::Signalled);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(store.reclaim_expired(), vec![Reclaimed::Cancelled { job_id: id }]);
        assert_eq!(store.get(id).unwrap().status, JobStatus::Cancelled);
        assert!(store.claim(None).is_none());
    }

    #[test]
    fn test_cancel_queued_job() {
        let store = JobStore::new(&config());
        let id = store.enqueue(request("a", 0)).unwrap();

        assert_eq!(store.cancel(id).unwrap(), CancelOutcome::Removed);
        assert!(store.claim(None).is_none());
        assert_eq!(
            store.cancel(id).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );
        assert!(matches!(
            store.cancel(Uuid::new_v4()),
            Err(LlmqError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_purge_finalized() {
        let store = JobStore::new(&config());
        let done = store.enqueue(request("a", 0)).unwrap();
        let waiting = store.enqueue(request("a", 0)).unwrap();
        store.cancel(done).unwrap();

        assert_eq!(store.purge_finalized(Duration::from_secs(3600)), 0);
        assert_eq!(store.purge_finalized(Duration::ZERO), 1);
        assert!(store.get(done).is_none());
        assert!(store.get(waiting).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = JobStore::new(&config());
        let queued = store.enqueue(request("a", 3)).unwrap();
        let in_flight = store.enqueue(request("b", 5)).unwrap();
        let cancelled = store.enqueue(request("c", 0)).unwrap();
        store.cancel(cancelled).unwrap();
        assert_eq!(store.claim(None).unwrap().job.id, in_flight);
        store.save_snapshot(&path).await.unwrap();

        let restored = JobStore::restore(&config(), &path).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.get(cancelled).unwrap().status, JobStatus::Cancelled);
        assert_eq!(restored.get(queued).unwrap().retry_count, 0);

        let job = restored.get(in_flight).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(restored.queued_len(), 2);

        // priority still wins after a restart
        assert_eq!(restored.claim(None).unwrap().job.id, in_flight);
        assert_eq!(restored.claim(None).unwrap().job.id, queued);

        let next = restored.enqueue(request("d", 0)).unwrap();
        let slots = restored.queue_slots();
        let max_restored = slots
            .iter()
            .filter(|s| s.job_id != next)
            .map(|s| s.position)
            .max()
            .unwrap();
        let next_slot = slots.iter().find(|s| s.job_id == next).unwrap();
        assert!(next_slot.position > max_restored);
    }

    #[test]
    fn test_restore_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::restore(&config(), &dir.path().join("missing.json")).unwrap();
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn prop_concurrent_positions_unique_and_grouped(
            batches in prop::collection::vec(prop::collection::vec(0u8..3, 1..20), 1..6)
        ) {
            let store = Arc::new(JobStore::new(&config()));

            std::thread::scope(|scope| {
                for batch in &batches {
                    let store = Arc::clone(&store);
                    scope.spawn(move || {
                        for model in batch {
                            store.enqueue(request(&format!("m{}", model), 0)).unwrap();
                        }
                    });
                }
            });

            let slots = store.queue_slots();
            let total: usize = batches.iter().map(Vec::len).sum();
            prop_assert_eq!(slots.len(), total);

            // BTreeMap order: strictly increasing, hence unique
            for pair in slots.windows(2) {
                prop_assert!(pair[0].position < pair[1].position);
            }

            let mut groups: HashMap<u64, Vec<&QueueSlot>> = HashMap::new();
            for slot in &slots {
                groups.entry(slot.burst_group).or_default().push(slot);
            }
            for members in groups.values() {
                for (expected, slot) in members.iter().enumerate() {
                    prop_assert_eq!(slot.group_index as usize, expected);
                }
            }
        }
    }
}
