//! In-memory task registry for the runner service.
//!
//! Each task is a CLI agent subprocess run under the sandbox user. Output is
//! accumulated in an append-only buffer and fanned out to any number of live
//! stream subscribers; late subscribers first get the buffered text, then
//! deltas. Cancellation is SIGTERM with a SIGKILL escalation after a grace
//! period.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::protocol::{AgentKind, CreateTaskRequest, RunnerTask, RunnerTaskStatus, StreamEvent};

/// How long a cancelled process gets to exit before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 256;

/// Quote a string for POSIX shell splicing.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Expand a leading tilde against the sandbox user's home directory.
pub fn expand_working_dir(dir: &str, user: &str) -> String {
    if dir == "~" {
        format!("/home/{user}")
    } else if let Some(rest) = dir.strip_prefix("~/") {
        format!("/home/{user}/{rest}")
    } else {
        dir.to_string()
    }
}

fn api_key_env(agent: AgentKind) -> &'static str {
    match agent {
        AgentKind::Claude => "ANTHROPIC_API_KEY",
        AgentKind::Codex => "OPENAI_API_KEY",
    }
}

fn agent_invocation(agent: AgentKind, prompt: &str) -> String {
    match agent {
        AgentKind::Claude => format!(
            "claude --print --dangerously-skip-permissions {}",
            shell_quote(prompt)
        ),
        AgentKind::Codex => format!("codex exec --full-auto {}", shell_quote(prompt)),
    }
}

/// Full shell command for one task.
fn build_command(req: &CreateTaskRequest, working_dir: &str) -> String {
    format!(
        "cd {} && {}={} {}",
        shell_quote(working_dir),
        api_key_env(req.agent),
        shell_quote(&req.api_key),
        agent_invocation(req.agent, &req.prompt)
    )
}

struct TaskHandle {
    state: Mutex<RunnerTask>,
    events: broadcast::Sender<StreamEvent>,
    pid: Mutex<Option<i32>>,
}

impl TaskHandle {
    fn snapshot(&self) -> RunnerTask {
        self.state.lock().expect("task state poisoned").clone()
    }

    /// Append a chunk of output and notify subscribers. The lock spans both
    /// so a new subscriber never misses a delta between snapshot and stream.
    fn append(&self, data: &str) {
        let mut state = self.state.lock().expect("task state poisoned");
        state.output.push_str(data);
        let _ = self.events.send(StreamEvent::Output {
            data: data.to_string(),
        });
    }

    /// Move to a terminal state if still running. Returns false if a
    /// terminal state was already recorded.
    fn finish(
        &self,
        status: RunnerTaskStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().expect("task state poisoned");
        if state.status != RunnerTaskStatus::Running {
            return false;
        }
        state.status = status;
        state.exit_code = exit_code;
        state.error = error;
        state.completed_at = Some(Utc::now().to_rfc3339());
        let _ = self.events.send(StreamEvent::Done { status, exit_code });
        true
    }
}

/// Registry of tasks in this runner instance.
pub struct TaskRegistry {
    /// OS user to run agents as. `None` runs them as the current user,
    /// which is how the runner operates when it is itself the sandbox user.
    sandbox_user: Option<String>,
    home_user: String,
    tasks: DashMap<String, Arc<TaskHandle>>,
}

impl TaskRegistry {
    pub fn new(sandbox_user: Option<String>) -> Self {
        let home_user = sandbox_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "sandbox".to_string());
        Self {
            sandbox_user,
            home_user,
            tasks: DashMap::new(),
        }
    }

    /// Spawn an agent subprocess and track it. The task is `running` from
    /// the moment it is visible in the registry.
    pub fn create(&self, req: &CreateTaskRequest) -> Result<RunnerTask> {
        let working_dir = expand_working_dir(&req.working_dir, &self.home_user);
        let command = build_command(req, &working_dir);
        let task = RunnerTask {
            id: Uuid::new_v4().to_string(),
            agent: req.agent,
            prompt: req.prompt.clone(),
            working_dir,
            status: RunnerTaskStatus::Running,
            output: String::new(),
            exit_code: None,
            error: None,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        self.spawn_tracked(task, &command)
    }

    /// Spawn an arbitrary shell command as a tracked task. Exposed for tests.
    #[cfg(test)]
    pub fn create_raw(&self, command: &str) -> Result<RunnerTask> {
        let task = RunnerTask {
            id: Uuid::new_v4().to_string(),
            agent: AgentKind::Claude,
            prompt: command.to_string(),
            working_dir: "/".to_string(),
            status: RunnerTaskStatus::Running,
            output: String::new(),
            exit_code: None,
            error: None,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        self.spawn_tracked(task, command)
    }

    fn spawn_tracked(&self, task: RunnerTask, command: &str) -> Result<RunnerTask> {
        let mut cmd = match &self.sandbox_user {
            Some(user) => {
                let mut c = Command::new("su");
                c.arg("-").arg(user).arg("-c").arg(command);
                c
            }
            None => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(command);
                c
            }
        };

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning agent subprocess")?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = Arc::new(TaskHandle {
            state: Mutex::new(task.clone()),
            events,
            pid: Mutex::new(child.id().map(|pid| pid as i32)),
        });
        self.tasks.insert(task.id.clone(), Arc::clone(&handle));

        info!("task {} started ({})", task.id, task.agent.as_str());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = tokio::spawn(pump_output(stdout, Arc::clone(&handle)));
        let err_reader = tokio::spawn(pump_output(stderr, Arc::clone(&handle)));

        let supervised = Arc::clone(&handle);
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = out_reader.await;
            let _ = err_reader.await;

            *supervised.pid.lock().expect("pid slot poisoned") = None;
            match status {
                Ok(status) => {
                    let code = status.code();
                    let (state, error) = match code {
                        Some(0) => (RunnerTaskStatus::Completed, None),
                        Some(code) => (
                            RunnerTaskStatus::Failed,
                            Some(format!("agent exited with code {code}")),
                        ),
                        None => (
                            RunnerTaskStatus::Failed,
                            Some("agent terminated by signal".to_string()),
                        ),
                    };
                    if supervised.finish(state, code, error) {
                        info!("task {task_id} finished ({code:?})");
                    }
                }
                Err(e) => {
                    supervised.finish(
                        RunnerTaskStatus::Failed,
                        None,
                        Some(format!("waiting for agent failed: {e}")),
                    );
                }
            }
        });

        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<RunnerTask> {
        self.tasks.get(id).map(|h| h.snapshot())
    }

    pub fn list(&self) -> Vec<RunnerTask> {
        let mut tasks: Vec<RunnerTask> = self.tasks.iter().map(|h| h.snapshot()).collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel a task. Terminal tasks are returned unchanged; running ones
    /// are marked cancelled and their process is signalled.
    pub fn cancel(&self, id: &str) -> Option<RunnerTask> {
        let handle = self.tasks.get(id).map(|h| Arc::clone(&h))?;

        if !handle.finish(RunnerTaskStatus::Cancelled, None, None) {
            return Some(handle.snapshot());
        }

        let pid = *handle.pid.lock().expect("pid slot poisoned");
        if let Some(pid) = pid {
            info!("task {id} cancelled, sending SIGTERM to {pid}");
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            tokio::spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                // ESRCH here just means the process already exited.
                let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
                if rc == 0 {
                    warn!("process {pid} survived SIGTERM, killed");
                }
            });
        }

        Some(handle.snapshot())
    }

    /// Subscribe to a task's output stream. Returns the events a late
    /// subscriber must see first (buffered output, and the terminal event if
    /// the task is already done) plus a receiver for live deltas.
    pub fn subscribe(
        &self,
        id: &str,
    ) -> Option<(Vec<StreamEvent>, broadcast::Receiver<StreamEvent>)> {
        let handle = self.tasks.get(id)?;
        let state = handle.state.lock().expect("task state poisoned");
        let receiver = handle.events.subscribe();

        let mut initial = Vec::new();
        if !state.output.is_empty() {
            initial.push(StreamEvent::Output {
                data: state.output.clone(),
            });
        }
        if state.status != RunnerTaskStatus::Running {
            initial.push(StreamEvent::Done {
                status: state.status,
                exit_code: state.exit_code,
            });
        }

        Some((initial, receiver))
    }
}

/// Merge a subscriber's replayed history with live events. The stream ends
/// after a `done` event, live or replayed, or when the sender goes away. A
/// history that already carries `done` yields no live events at all; the
/// registry keeps the sender alive for finished tasks, so waiting on it
/// would hold the connection open forever.
pub fn subscriber_stream(
    initial: Vec<StreamEvent>,
    rx: broadcast::Receiver<StreamEvent>,
) -> impl Stream<Item = StreamEvent> {
    let live_rx = match initial.last() {
        Some(StreamEvent::Done { .. }) => None,
        _ => Some(rx),
    };

    let live = stream::unfold(live_rx, |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let next = if matches!(event, StreamEvent::Done { .. }) {
                        None
                    } else {
                        Some(rx)
                    };
                    return Some((event, next));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    stream::iter(initial).chain(live)
}

async fn pump_output(stream: Option<impl tokio::io::AsyncRead + Unpin>, handle: Arc<TaskHandle>) {
    let Some(mut stream) = stream else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => handle.append(&String::from_utf8_lossy(&buf[..n])),
        }
    }
}
