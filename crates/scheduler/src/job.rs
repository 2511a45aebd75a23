//! Job records and request validation

use chrono::{DateTime, Utc};
use llmq_common::{LlmqError, Result};
use llmq_proto::{
    ChatMessage, GenerationOptions, JobError, JobId, JobOutput, JobStatus, StatusTransition,
    SubmitRequest,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Limits a request must satisfy before it may occupy a queue slot
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_prompt_bytes: usize,
    pub max_messages: usize,
}

/// Reject malformed or oversized requests
pub fn validate_request(request: &SubmitRequest, limits: &RequestLimits) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(LlmqError::validation("model must not be empty"));
    }
    if request.conversation_id.trim().is_empty() {
        return Err(LlmqError::validation("conversation_id must not be empty"));
    }
    if request.messages.is_empty() {
        return Err(LlmqError::validation("at least one message is required"));
    }
    if request.messages.len() > limits.max_messages {
        return Err(LlmqError::validation(format!(
            "{} messages exceed the limit of {}",
            request.messages.len(),
            limits.max_messages
        )));
    }
    if request.messages.iter().all(|m| m.content.trim().is_empty()) {
        return Err(LlmqError::validation("all messages are empty"));
    }

    let prompt_bytes = request.prompt_bytes();
    if prompt_bytes > limits.max_prompt_bytes {
        return Err(LlmqError::validation(format!(
            "prompt of {} bytes exceeds the limit of {}",
            prompt_bytes, limits.max_prompt_bytes
        )));
    }

    let options = &request.options;
    if let Some(temperature) = options.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(LlmqError::validation("temperature must be within 0..=2"));
        }
    }
    if let Some(top_p) = options.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(LlmqError::validation("top_p must be within 0..=1"));
        }
    }
    if options.max_tokens == Some(0) {
        return Err(LlmqError::validation("max_tokens must be positive"));
    }

    Ok(())
}

/// Token identifying the lease a dispatcher holds on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Durable record of a submitted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub conversation_id: String,
    pub model: String,
    pub priority: i32,
    pub status: JobStatus,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
    pub output: JobOutput,
    pub error: Option<JobError>,
    pub retry_count: u32,

    /// Set when a cancel arrives while a dispatcher holds the job
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<StatusTransition>,
}

impl Job {
    pub(crate) fn new(request: SubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: request.conversation_id,
            model: request.model,
            priority: request.priority,
            status: JobStatus::Queued,
            messages: request.messages,
            options: request.options,
            output: JobOutput::default(),
            error: None,
            retry_count: 0,
            cancel_requested: false,
            created_at: now,
            claimed_at: None,
            completed_at: None,
            history: vec![StatusTransition {
                status: JobStatus::Queued,
                at: now,
            }],
        }
    }

    /// Move to `next`, recording the transition
    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LlmqError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Claimed => self.claimed_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.history.push(StatusTransition { status: next, at: now });
        Ok(())
    }

    /// Statuses this job went through, oldest first
    pub fn status_sequence(&self) -> Vec<JobStatus> {
        self.history.iter().map(|t| t.status).collect()
    }
}
