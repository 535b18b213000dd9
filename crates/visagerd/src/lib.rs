//! visagerd: photo ingestion and face classification service.
//!
//! Photos are staged into the library Inbox, queued, and classified one at a
//! time by a single worker loop. Recognition runs on a dedicated engine
//! thread that owns the backend; matching and routing run in the service
//! under the identity store lock.

pub mod config;
pub mod dbus_interface;
pub mod engine;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod subprocess;
mod worker;

pub use config::Config;
pub use engine::{spawn_engine, EngineHandle, ExecutorError};
pub use pipeline::{AssignOutcome, Health, IndexReport, Pipeline, PipelineError};
pub use progress::{ProgressState, Status};
pub use subprocess::SubprocessBackend;
