//! llmq protocol types
//!
//! Serde types exchanged between the scheduler and the API/UI layer that
//! submits jobs, polls their status and subscribes to their token streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

// Submission types

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message of the conversation sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling and length options forwarded to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Maximum number of tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Context window requested from the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Ask reasoning models to emit a separate thinking segment
    #[serde(default)]
    pub think: bool,
}

/// Request submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Conversation this job answers
    pub conversation_id: String,

    /// Requested model id (e.g. "llama3.1:8b")
    pub model: String,

    /// Higher is more urgent
    #[serde(default)]
    pub priority: i32,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub options: GenerationOptions,
}

impl SubmitRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            model: model.into(),
            priority: 0,
            messages,
            options: GenerationOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Total prompt size in bytes
    pub fn prompt_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

// Job lifecycle types

/// Lifecycle state of a job
///
/// ```text
/// queued -> claimed -> (model_switching) -> streaming -> completed | failed
///    \          \               \               \
///     +----------+---------------+---------------+--> cancelled
/// ```
///
/// In-flight states may also fall back to `queued` when their claim lease
/// expires and the job is redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    ModelSwitching,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a dispatcher currently holds a claim on a job in this state
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            JobStatus::Claimed | JobStatus::ModelSwitching | JobStatus::Streaming
        )
    }

    /// Transition table of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Claimed) | (Queued, Cancelled) => true,
            (Claimed, ModelSwitching) | (Claimed, Streaming) => true,
            (ModelSwitching, Streaming) => true,
            (Streaming, Completed) => true,
            (s, Failed) | (s, Cancelled) if s.is_in_flight() => true,
            // lease expiry redelivers the job
            (s, Queued) if s.is_in_flight() => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::ModelSwitching => "model_switching",
            JobStatus::Streaming => "streaming",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The three ways a job can end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Failed,
    Cancelled,
}

impl TerminalState {
    pub fn as_status(self) -> JobStatus {
        match self {
            TerminalState::Completed => JobStatus::Completed,
            TerminalState::Failed => JobStatus::Failed,
            TerminalState::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Error kinds a job can fail with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or oversized request, rejected before enqueue
    Validation,
    /// Requested model does not fit in accelerator memory
    Capacity,
    /// Model switch failed after bounded retries
    Switch,
    /// No token within the inactivity window
    StreamTimeout,
    /// Error propagated from the inference backend
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Capacity => "capacity_error",
            ErrorKind::Switch => "switch_error",
            ErrorKind::StreamTimeout => "stream_timeout_error",
            ErrorKind::Backend => "backend_error",
        };
        f.write_str(name)
    }
}

/// Human-readable failure recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Output accumulated for a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl JobOutput {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.as_deref().map_or(true, str::is_empty)
    }
}

/// One entry of a job's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// Answer to `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub conversation_id: String,
    pub model: String,
    pub priority: i32,
    pub status: JobStatus,

    /// Zero-based place in the admission order, present while queued
    pub queue_position: Option<usize>,

    pub output: JobOutput,
    pub error: Option<JobError>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<StatusTransition>,
}

// Subscriber stream types

/// Event delivered to a job subscriber
///
/// `seq` numbers the output chunks of one attempt, starting at zero, so a
/// subscriber can verify it saw a gap-free sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content { seq: u64, text: String },
    Thinking { seq: u64, text: String },

    /// A redelivered job started over; previously received output is void
    Reset { attempt: u32 },

    Finished {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<JobError>,
    },
}
