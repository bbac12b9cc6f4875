//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use chrono::Utc;

use sandboxd::agent::{AgentService, AgentTimings, TaskRepository};
use sandboxd::api::{AppState, create_router};
use sandboxd::auth::AuthState;
use sandboxd::container::{
    ContainerDriver, ContainerStats, DriverResult, SandboxSpec,
};
use sandboxd::db::Database;
use sandboxd::exposure::{DnsApi, RecordOutcome, TunnelApi};
use sandboxd::notify::LogNotifier;
use sandboxd::ports::{PortAllocator, PortRanges};
use sandboxd::runner::{CreateTaskRequest, RunnerApi, RunnerClient, RunnerTask, RunnerTaskStatus};
use sandboxd::session::{SessionRepository, SessionService};
use sandboxd::terminal::{TerminalDeps, TerminalRegistry};
use sandboxd::vault::Vault;

pub const ADMIN_PASSWORD: &str = "admin-password";
pub const DOMAIN: &str = "sandbox.example.com";

const MASTER_KEY: &str = "integration-test-master-key-0123456789";

/// Driver that records calls and always reports containers as running.
#[derive(Default)]
pub struct TestDriver {
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerDriver for TestDriver {
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<String> {
        self.created.lock().unwrap().push(spec.name.clone());
        Ok("container-id".to_string())
    }

    async fn remove(&self, name: &str) -> DriverResult<()> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn stop(&self, _name: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn start(&self, _name: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn restart(&self, _name: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn stats(&self, _name: &str) -> DriverResult<ContainerStats> {
        Ok(ContainerStats::default())
    }

    async fn status(&self, _name: &str) -> String {
        "running".to_string()
    }
}

#[derive(Default)]
pub struct TestDns {
    records: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl DnsApi for TestDns {
    async fn create_record(&self, hostname: &str) -> Result<RecordOutcome> {
        let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records
            .lock()
            .unwrap()
            .insert(hostname.to_string(), id.clone());
        Ok(RecordOutcome::Created(id))
    }

    async fn find_record(&self, hostname: &str) -> Result<Option<String>> {
        Ok(self.records.lock().unwrap().get(hostname).cloned())
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        self.records.lock().unwrap().retain(|_, id| id != record_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestTunnel {
    routes: Mutex<Vec<String>>,
}

#[async_trait]
impl TunnelApi for TestTunnel {
    async fn add_route(&self, hostname: &str, _service: &str) -> Result<()> {
        self.routes.lock().unwrap().push(hostname.to_string());
        Ok(())
    }

    async fn remove_route(&self, hostname: &str) -> Result<()> {
        self.routes.lock().unwrap().retain(|h| h != hostname);
        Ok(())
    }
}

/// Runner that immediately accepts tasks and reports them running.
#[derive(Default)]
pub struct TestRunner {
    pub tasks: Mutex<HashMap<String, RunnerTask>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl RunnerApi for TestRunner {
    async fn create_task(&self, _port: u16, req: &CreateTaskRequest) -> Result<RunnerTask> {
        let id = format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = RunnerTask {
            id: id.clone(),
            agent: req.agent,
            prompt: req.prompt.clone(),
            working_dir: req.working_dir.clone(),
            status: RunnerTaskStatus::Running,
            output: String::new(),
            exit_code: None,
            error: None,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        self.tasks.lock().unwrap().insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, _port: u16, id: &str) -> Result<Option<RunnerTask>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn cancel_task(&self, _port: u16, id: &str) -> Result<Option<RunnerTask>> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(id) {
            task.status = RunnerTaskStatus::Cancelled;
        }
        Ok(tasks.get(id).cloned())
    }
}

/// Create a test application with all services backed by an in-memory
/// database and fakes for everything that would touch the host.
pub async fn test_app() -> Router {
    let db = Database::in_memory().await.unwrap();

    let driver = Arc::new(TestDriver::default());
    let dns = Arc::new(TestDns::default());
    let tunnel = Arc::new(TestTunnel::default());
    let runner = Arc::new(TestRunner::default());

    let ranges = PortRanges {
        ssh_start: 2200,
        range_size: 8,
        agent_start: 9100,
    };
    let allocator = PortAllocator::new(db.pool().clone(), ranges).without_os_probe();
    let session_repo = SessionRepository::new(db.pool().clone());

    let sessions = SessionService::new(
        session_repo.clone(),
        allocator,
        driver,
        dns,
        tunnel,
        DOMAIN.to_string(),
    );

    let vault = Vault::new(MASTER_KEY).unwrap();
    let agent = AgentService::new(
        session_repo.clone(),
        TaskRepository::new(db.pool().clone()),
        vault,
        Arc::new(TestDriver::default()),
        runner,
        Arc::new(LogNotifier),
        AgentTimings::default(),
    );

    let admin_hash = bcrypt::hash(ADMIN_PASSWORD, 4).unwrap();
    let state = AppState {
        sessions,
        agent,
        auth: AuthState::new("integration-test-secret", admin_hash),
        terminal: TerminalDeps {
            sessions: session_repo,
            registry: Arc::new(TerminalRegistry::new()),
        },
        runner: RunnerClient::new(),
        domain: DOMAIN.to_string(),
    };

    create_router(state)
}

/// Create a test application and a valid admin bearer token.
pub async fn test_app_with_token() -> (Router, String) {
    let app = test_app().await;
    let token = login(&app).await;
    (app, token)
}

async fn login(app: &Router) -> String {
    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use tower::ServiceExt;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/auth/login")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(format!(
                    r#"{{"password":"{ADMIN_PASSWORD}"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["token"].as_str().unwrap().to_string()
}
