pub mod backend;
pub mod config;
pub mod events;
pub mod job;
pub mod logging;
pub mod scheduler;

pub use backend::{BackendError, CommandBackend, ExecutionBackend};
pub use events::{EventBus, NotificationSink, QueueEvent};
pub use job::{Job, JobId, JobState, OutputSpec};
pub use scheduler::{QueueError, Scheduler};
