#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use streamspace::api;
use streamspace::config::{Config, HubBackend};
use streamspace::hub::registry::Registry;
use streamspace::hub::{AgentHub, BindHandle, Outbound, RegisterInfo};
use streamspace::model::{AgentCapacity, Platform};
use streamspace::proxy::VncRouter;
use streamspace::store::AppState;

pub const ADMIN_TOKEN: &str = "sspace_test_admin_token";

/// Build a test `AppState` on the given pool.
///
/// - Seeds templates and installs the fixed admin token
/// - Memory hub backend (no valkey required)
/// - Short command timeout so deadline paths are testable
pub async fn test_state(pool: PgPool) -> AppState {
    streamspace::store::bootstrap::run(&pool, Some(ADMIN_TOKEN))
        .await
        .expect("bootstrap failed");

    let config = Config {
        listen: "127.0.0.1:0".into(),
        database_url: String::new(),
        db_max_connections: 5,
        valkey_pool_size: 2,
        replica_id: format!("test-{}", Uuid::new_v4()),
        hub_backend: HubBackend::Memory,
        connection_registry_url: None,
        agent_token: None,
        vnc_token_secret: "test-vnc-secret".into(),
        vnc_token_ttl: Duration::from_secs(60),
        vnc_max_viewers: 1,
        vnc_proxy_idle_timeout: Duration::from_secs(300),
        heartbeat_timeout: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(10),
        command_timeout: Duration::from_secs(300),
        max_sessions_per_agent: 100,
        bootstrap_admin_token: None,
    };

    AppState {
        pool: pool.clone(),
        hub: Arc::new(AgentHub::new(pool, Registry::Memory)),
        vnc: Arc::new(VncRouter::new()),
        config: Arc::new(config),
    }
}

pub fn test_router(state: AppState) -> Router {
    Router::new().merge(api::router()).with_state(state)
}

/// Create an extra API token for a non-admin principal; returns the raw
/// bearer value.
pub async fn add_token(pool: &PgPool, principal: &str) -> String {
    let raw = format!("sspace_test_{principal}");
    let hash = streamspace::auth::token::hash_token(&raw);
    sqlx::query(
        "INSERT INTO api_tokens (id, token_hash, principal, is_active) VALUES ($1, $2, $3, true)",
    )
    .bind(Uuid::new_v4())
    .bind(hash)
    .bind(principal)
    .execute(pool)
    .await
    .expect("token insert failed");
    raw
}

/// Bind a fake agent channel directly on the hub; the returned receiver
/// observes every frame the control plane sends it.
pub async fn connect_fake_agent(
    state: &AppState,
    agent_id: &str,
    platform: Platform,
    max_sessions: i32,
    current_sessions: i32,
) -> (BindHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(16);
    let info = RegisterInfo {
        agent_id: agent_id.to_owned(),
        platform,
        region: Some("us-east-1".into()),
        capacity: AgentCapacity {
            max_sessions,
            current_sessions,
            cpu_limit_millis: None,
            memory_limit_mb: None,
        },
        metadata: None,
        cluster_id: None,
    };
    let (handle, _uuid) = state
        .hub
        .register(&info, tx)
        .await
        .expect("fake agent registration failed");
    (handle, rx)
}

/// Pull the next text frame off a fake agent channel as raw JSON.
pub async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame within deadline")
            .expect("channel closed")
        {
            Outbound::Message(msg) => {
                return serde_json::from_str(&msg.to_json()).unwrap();
            }
            Outbound::Binary(_) | Outbound::Close => {}
        }
    }
}

/// Pull the next `command` frame off a fake agent channel.
pub async fn next_command(rx: &mut mpsc::Receiver<Outbound>) -> (Uuid, Uuid, String, Value) {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no frame within deadline")
            .expect("channel closed")
        {
            Outbound::Message(msg) => {
                let raw: Value = serde_json::from_str(&msg.to_json()).unwrap();
                if raw["type"] == "command" {
                    return (
                        raw["command_id"].as_str().unwrap().parse().unwrap(),
                        raw["session_id"].as_str().unwrap().parse().unwrap(),
                        raw["command_type"].as_str().unwrap().to_owned(),
                        raw["payload"].clone(),
                    );
                }
            }
            Outbound::Binary(_) | Outbound::Close => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn request(
    app: &Router,
    method: &str,
    token: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("authorization", format!("Bearer {token}"));
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

pub async fn get(app: &Router, token: &str, path: &str) -> (StatusCode, Value) {
    request(app, "GET", token, path, None).await
}

pub async fn post_json(app: &Router, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
    request(app, "POST", token, path, Some(body)).await
}

pub async fn patch_json(app: &Router, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
    request(app, "PATCH", token, path, Some(body)).await
}

pub async fn delete(app: &Router, token: &str, path: &str) -> (StatusCode, Value) {
    request(app, "DELETE", token, path, None).await
}
