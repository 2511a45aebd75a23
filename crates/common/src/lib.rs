//! llmq common library
//!
//! This crate contains the configuration, error and metrics code shared by
//! the llmq components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::LlmqConfig;
pub use error::{LlmqError, Result};
pub use metrics::{MetricsRegistry, METRICS};
