//! Agent runner: wire protocol, orchestrator-side client and the task
//! registry used by the in-container runner binary.

mod client;
mod protocol;
mod registry;

pub use client::{RunnerApi, RunnerClient};
pub use protocol::{
    AgentKind, CreateTaskRequest, HealthResponse, RunnerTask, RunnerTaskStatus, StreamEvent,
    TaskEnvelope, TaskListEnvelope,
};
pub use registry::{TaskRegistry, expand_working_dir, subscriber_stream};
