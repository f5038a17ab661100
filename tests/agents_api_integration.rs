mod helpers;

use axum::http::StatusCode;
use helpers::ADMIN_TOKEN;
use sqlx::PgPool;

use streamspace::model::Platform;

#[sqlx::test(migrations = "./migrations")]
async fn register_is_idempotent_on_agent_id(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    let body = serde_json::json!({
        "agent_id": "k8s-a",
        "platform": "kubernetes",
        "region": "us-east-1",
        "capacity": { "max_sessions": 100 },
        "metadata": { "version": "1.0" }
    });

    let (status, first) =
        helpers::post_json(&app, ADMIN_TOKEN, "/api/agents/register", body.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["ok"], true);

    let (status, second) = helpers::post_json(&app, ADMIN_TOKEN, "/api/agents/register", body).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["agent_uuid"], second["agent_uuid"]);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents")
        .fetch_one(&state.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn register_rejects_bad_capacity(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state);

    let (status, _) = helpers::post_json(
        &app,
        ADMIN_TOKEN,
        "/api/agents/register",
        serde_json::json!({
            "agent_id": "bad",
            "platform": "docker",
            "capacity": { "max_sessions": 0 }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test(migrations = "./migrations")]
async fn list_agents_filters_by_platform_and_status(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    let (_h, _rx) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let (h2, _rx2) = helpers::connect_fake_agent(&state, "docker-b", Platform::Docker, 10, 0).await;
    assert!(state.hub.unregister("docker-b", h2.token).await.unwrap());

    let (status, body) = helpers::get(&app, ADMIN_TOKEN, "/api/agents").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (_, online) = helpers::get(&app, ADMIN_TOKEN, "/api/agents?status=online").await;
    assert_eq!(online["total"], 1);
    assert_eq!(online["items"][0]["agent_id"], "k8s-a");
    assert!(online["items"][0]["last_heartbeat"].is_string());

    let (_, docker) = helpers::get(&app, ADMIN_TOKEN, "/api/agents?platform=docker").await;
    assert_eq!(docker["total"], 1);
    assert_eq!(docker["items"][0]["status"], "offline");
    assert!(docker["items"][0]["connection_id"].is_null());
}

#[sqlx::test(migrations = "./migrations")]
async fn delete_rejects_online_agents(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    let (h, _rx) = helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;

    let (status, _) = helpers::delete(&app, ADMIN_TOKEN, "/api/agents/k8s-a").await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert!(state.hub.unregister("k8s-a", h.token).await.unwrap());
    let (status, body) = helpers::delete(&app, ADMIN_TOKEN, "/api/agents/k8s-a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _) = helpers::get(&app, ADMIN_TOKEN, "/api/agents/k8s-a").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test(migrations = "./migrations")]
async fn agent_surface_requires_admin(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());
    let user_token = helpers::add_token(&state.pool, "u1").await;

    let (status, _) = helpers::post_json(
        &app,
        &user_token,
        "/api/agents/register",
        serde_json::json!({
            "agent_id": "x",
            "platform": "docker",
            "capacity": { "max_sessions": 1 }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = helpers::delete(&app, &user_token, "/api/agents/x").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Reads are open to any authenticated principal.
    let (status, _) = helpers::get(&app, &user_token, "/api/agents").await;
    assert_eq!(status, StatusCode::OK);

    // No token at all is a 401.
    let (status, _) = helpers::get(&app, "not-a-token", "/api/agents").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[sqlx::test(migrations = "./migrations")]
async fn rebind_keeps_latest_connection(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    let (_h1, _rx1) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let first_conn: Option<String> =
        sqlx::query_scalar("SELECT connection_id FROM agents WHERE agent_id = 'k8s-a'")
            .fetch_one(&state.pool)
            .await
            .unwrap();

    // Second connection for the same identity supersedes the first.
    let (_h2, _rx2) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let second_conn: Option<String> =
        sqlx::query_scalar("SELECT connection_id FROM agents WHERE agent_id = 'k8s-a'")
            .fetch_one(&state.pool)
            .await
            .unwrap();

    assert_ne!(first_conn, second_conn);
    let (_, body) = helpers::get(&app, ADMIN_TOKEN, "/api/agents/k8s-a").await;
    assert_eq!(body["status"], "online");
}
