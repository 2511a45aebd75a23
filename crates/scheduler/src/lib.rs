//! llmq scheduler
//!
//! Model-aware job queue for a single shared accelerator. Jobs are admitted
//! by starvation, priority, residency of their model and burst order; one
//! model is resident at a time and switches are coalesced; tokens are fanned
//! out to subscribers as they stream.

pub mod backend;
pub mod dispatcher;
pub mod job;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod subscribers;

pub use backend::{InferenceBackend, ResourceMonitor, StaticResourceMonitor};
pub use dispatcher::Dispatcher;
pub use job::{validate_request, ClaimToken, Job, RequestLimits};
pub use model::{ModelLifecycleManager, ModelState, ModelStatus, ResidencyLease};
pub use scheduler::Scheduler;
pub use store::{CancelOutcome, FinalizeOutcome, JobStore};
pub use stream::{StreamCoordinator, StreamOutcome};
pub use subscribers::{SubscriberRegistry, Subscription};
