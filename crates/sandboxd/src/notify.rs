//! Task completion notifications.
//!
//! Delivery transports (web push and friends) live outside this daemon; the
//! pipeline only needs a best-effort fire-and-forget hook.

use async_trait::async_trait;
use log::info;

use crate::agent::AgentTask;

/// Notification sink for finished agent tasks.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Called once per task when it reaches a terminal state. Failures are
    /// the implementation's problem; callers never wait on delivery.
    async fn task_finished(&self, username: &str, task: &AgentTask);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn task_finished(&self, username: &str, task: &AgentTask) {
        info!(
            "task {} for {} finished: {}",
            task.id,
            username,
            task.status.as_str()
        );
    }
}
