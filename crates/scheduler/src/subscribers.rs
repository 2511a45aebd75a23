//! Subscriber registry
//!
//! Output of a running job is accumulated in a per-job buffer that has a
//! single writer, the [`OutputPublisher`] of the current attempt. Every
//! [`Subscription`] reads the buffer through its own cursor and is woken by a
//! version counter, so a late subscriber first replays the prefix it missed
//! and then follows the live remainder without gaps or duplicates.

use llmq_common::METRICS;
use llmq_proto::{JobError, JobId, JobOutput, JobStatus, StreamEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Content,
    Thinking,
}

#[derive(Debug, Clone)]
struct Chunk {
    kind: ChunkKind,
    text: String,
}

#[derive(Debug, Default)]
struct BufferState {
    attempt: u32,
    chunks: Vec<Chunk>,
    finished: Option<(JobStatus, Option<JobError>)>,
    subscribers: usize,
}

impl BufferState {
    fn output(&self) -> JobOutput {
        let mut output = JobOutput::default();
        for chunk in &self.chunks {
            match chunk.kind {
                ChunkKind::Content => output.content.push_str(&chunk.text),
                ChunkKind::Thinking => output
                    .thinking
                    .get_or_insert_with(String::new)
                    .push_str(&chunk.text),
            }
        }
        output
    }
}

#[derive(Debug)]
struct JobBuffer {
    state: Mutex<BufferState>,
    version: watch::Sender<u64>,
}

impl JobBuffer {
    fn new(attempt: u32) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(BufferState {
                attempt,
                ..BufferState::default()
            }),
            version,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Start over for a new attempt, voiding the previous output
    fn reset(&self, attempt: u32) -> bool {
        {
            let mut state = self.state.lock();
            if state.attempt == attempt || state.finished.is_some() {
                return false;
            }
            state.attempt = attempt;
            state.chunks.clear();
        }
        self.bump();
        true
    }
}

/// Fan-out of job output to any number of subscribers
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    buffers: Mutex<HashMap<JobId, Arc<JobBuffer>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self, job_id: JobId, attempt: u32) -> Arc<JobBuffer> {
        Arc::clone(
            self.buffers
                .lock()
                .entry(job_id)
                .or_insert_with(|| Arc::new(JobBuffer::new(attempt))),
        )
    }

    /// Create the buffer of a job that subscribers may attach to
    pub fn register(&self, job_id: JobId, attempt: u32) {
        self.buffer(job_id, attempt);
    }

    /// Void the output of a redelivered job and announce the new attempt
    pub fn restart(&self, job_id: JobId, attempt: u32) {
        if self.buffer(job_id, attempt).reset(attempt) {
            debug!(%job_id, attempt, "Output buffer reset for redelivery");
        }
    }

    /// Writer handle for one attempt of a job
    pub fn open(&self, job_id: JobId, attempt: u32) -> OutputPublisher {
        let buffer = self.buffer(job_id, attempt);
        buffer.reset(attempt);
        OutputPublisher {
            job_id,
            attempt,
            buffer,
        }
    }

    /// Attach to a job's live output
    pub fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        let buffer = self.buffers.lock().get(&job_id).cloned()?;
        Some(Subscription::attach(buffer))
    }

    /// Deliver the terminal event and retire the buffer
    pub fn finish(&self, job_id: JobId, status: JobStatus, error: Option<JobError>) {
        let Some(buffer) = self.buffers.lock().remove(&job_id) else {
            return;
        };
        buffer.state.lock().finished = Some((status, error));
        buffer.bump();
        debug!(%job_id, %status, "Subscribers notified of job end");
    }

    /// Output accumulated so far by the current attempt
    pub fn output(&self, job_id: JobId) -> Option<JobOutput> {
        let buffer = self.buffers.lock().get(&job_id).cloned()?;
        let output = buffer.state.lock().output();
        Some(output)
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.buffers
            .lock()
            .get(&job_id)
            .map_or(0, |buffer| buffer.state.lock().subscribers)
    }

    /// Number of jobs with a live buffer
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single writer of a job's output for one attempt
pub struct OutputPublisher {
    job_id: JobId,
    attempt: u32,
    buffer: Arc<JobBuffer>,
}

impl OutputPublisher {
    /// Append answer text; false once this attempt was superseded
    pub fn push_content(&self, text: String) -> bool {
        self.push(ChunkKind::Content, text)
    }

    /// Append reasoning text; false once this attempt was superseded
    pub fn push_thinking(&self, text: String) -> bool {
        self.push(ChunkKind::Thinking, text)
    }

    fn push(&self, kind: ChunkKind, text: String) -> bool {
        {
            let mut state = self.buffer.state.lock();
            if state.attempt != self.attempt || state.finished.is_some() {
                return false;
            }
            trace!(job_id = %self.job_id, seq = state.chunks.len(), "Output chunk");
            state.chunks.push(Chunk { kind, text });
        }
        self.buffer.bump();
        true
    }

    /// Output written by this attempt
    pub fn snapshot(&self) -> JobOutput {
        let state = self.buffer.state.lock();
        if state.attempt != self.attempt {
            return JobOutput::default();
        }
        state.output()
    }
}

/// Read-only view of a job's output stream
///
/// Chunks carry their index within the current attempt as `seq`. A
/// [`StreamEvent::Reset`] means the job was redelivered and output received
/// so far is void. The stream ends after [`StreamEvent::Finished`].
pub struct Subscription {
    buffer: Arc<JobBuffer>,
    version: watch::Receiver<u64>,
    attempt: u32,
    cursor: usize,
    done: bool,
}

impl Subscription {
    fn attach(buffer: Arc<JobBuffer>) -> Self {
        let attempt = {
            let mut state = buffer.state.lock();
            state.subscribers += 1;
            state.attempt
        };
        METRICS.streams.subscribers.inc();
        let version = buffer.version.subscribe();
        Self {
            buffer,
            version,
            attempt,
            cursor: 0,
            done: false,
        }
    }

    /// Subscription replaying a job that already ended
    pub fn replay(output: JobOutput, status: JobStatus, error: Option<JobError>) -> Self {
        let buffer = JobBuffer::new(0);
        {
            let mut state = buffer.state.lock();
            if let Some(thinking) = output.thinking.filter(|t| !t.is_empty()) {
                state.chunks.push(Chunk {
                    kind: ChunkKind::Thinking,
                    text: thinking,
                });
            }
            if !output.content.is_empty() {
                state.chunks.push(Chunk {
                    kind: ChunkKind::Content,
                    text: output.content,
                });
            }
            state.finished = Some((status, error));
        }
        Self::attach(Arc::new(buffer))
    }

    /// Next event, waiting for the writer when caught up
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.done {
                return None;
            }

            // mark seen before reading so no write slips between
            self.version.borrow_and_update();
            if let Some(event) = self.poll_buffer() {
                return Some(event);
            }

            // the buffer owns the sender, so this only fails if it is gone
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    fn poll_buffer(&mut self) -> Option<StreamEvent> {
        let state = self.buffer.state.lock();

        if state.attempt != self.attempt {
            self.attempt = state.attempt;
            self.cursor = 0;
            return Some(StreamEvent::Reset {
                attempt: state.attempt,
            });
        }

        if let Some(chunk) = state.chunks.get(self.cursor) {
            let seq = self.cursor as u64;
            self.cursor += 1;
            let text = chunk.text.clone();
            return Some(match chunk.kind {
                ChunkKind::Content => StreamEvent::Content { seq, text },
                ChunkKind::Thinking => StreamEvent::Thinking { seq, text },
            });
        }

        if let Some((status, error)) = &state.finished {
            self.done = true;
            return Some(StreamEvent::Finished {
                status: *status,
                error: error.clone(),
            });
        }

        None
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.buffer.state.lock().subscribers -= 1;
        METRICS.streams.subscribers.dec();
    }
}
