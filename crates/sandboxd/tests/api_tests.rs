//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{ADMIN_PASSWORD, test_app, test_app_with_token};

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn create_body(username: &str) -> Value {
    json!({ "username": username, "password": "secret1" })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_login_success() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "password": ADMIN_PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].is_string());
}

#[tokio::test]
async fn test_login_invalid_credentials() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_sessions_require_auth() {
    let app = test_app().await;

    let (status, _) = send(&app, Method::GET, "/api/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::GET, "/api/sessions", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    // Create.
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session = &body["session"];
    assert_eq!(session["username"], "alice");
    assert_eq!(session["status"], "running");
    assert_eq!(
        session["subdomain"].as_str().unwrap(),
        "alice-http-sandbox.example.com"
    );
    assert_eq!(
        session["httpPort"].as_i64().unwrap(),
        session["sshPort"].as_i64().unwrap() + 1000
    );
    // The stored password hash never leaves the server.
    assert!(session.get("passwordHash").is_none());
    let ssh_command = body["sshCommand"].as_str().unwrap();
    assert!(ssh_command.starts_with("ssh -p "));
    assert!(ssh_command.ends_with("alice@alice-ssh-sandbox.example.com"));

    // List.
    let (status, body) = send(&app, Method::GET, "/api/sessions", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    // Detail includes live container state.
    let (status, body) = send(&app, Method::GET, "/api/sessions/alice", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["containerStatus"], "running");

    // Restart and stats.
    let (status, body) =
        send(&app, Method::POST, "/api/sessions/alice/restart", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "running");

    let (status, body) = send(&app, Method::GET, "/api/sessions/alice/stats", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["stats"]["memoryUsage"].is_number());

    // Delete, then the session is gone.
    let (status, _) = send(&app, Method::DELETE, "/api/sessions/alice", token, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::GET, "/api/sessions/alice", token, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_session_validation() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    // Username too short.
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(json!({ "username": "a", "password": "secret1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Username with shell metacharacters.
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(json!({ "username": "alice; rm -rf /", "password": "secret1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Password too short.
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(json!({ "username": "alice", "password": "short" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Memory limit out of range.
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(json!({ "username": "alice", "password": "secret1", "memoryLimit": 64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was provisioned by the rejected requests.
    let (_, body) = send(&app, Method::GET, "/api/sessions", token, None).await;
    assert!(body["sessions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_username_conflicts() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_agent_task_flow() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;

    // Enable the agent and store a key.
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/sessions/alice/agent",
        token,
        Some(json!({ "enabled": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);

    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/sessions/alice/agent/keys",
        token,
        Some(json!({ "anthropicApiKey": "sk-ant-test" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"]["anthropic"], true);
    assert_eq!(body["keys"]["openai"], false);

    // Submit a task.
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/sessions/alice/tasks",
        token,
        Some(json!({ "agent": "claude", "prompt": "list files" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["task"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["task"]["status"], "running");
    assert_eq!(body["task"]["agent"], "claude");

    // Fetch and list.
    let uri = format!("/api/sessions/alice/tasks/{task_id}");
    let (status, body) = send(&app, Method::GET, &uri, token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["id"], task_id.as_str());

    let (status, body) = send(&app, Method::GET, "/api/sessions/alice/tasks", token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    // Cancel.
    let (status, body) = send(&app, Method::DELETE, &uri, token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "cancelled");
}

#[tokio::test]
async fn test_submit_task_requires_enabled_agent() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions/alice/tasks",
        token,
        Some(json!({ "agent": "claude", "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_task_requires_api_key() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;
    send(
        &app,
        Method::POST,
        "/api/sessions/alice/agent",
        token,
        Some(json!({ "enabled": true })),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions/alice/tasks",
        token,
        Some(json!({ "agent": "claude", "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_prompt_rejected() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    send(
        &app,
        Method::POST,
        "/api/sessions",
        token,
        Some(create_body("alice")),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions/alice/tasks",
        token,
        Some(json!({ "agent": "claude", "prompt": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_task_endpoints_for_unknown_session() {
    let (app, token) = test_app_with_token().await;
    let token = Some(token.as_str());

    let (status, _) = send(&app, Method::GET, "/api/sessions/ghost/tasks", token, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/sessions/ghost/tasks",
        token,
        Some(json!({ "agent": "claude", "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
