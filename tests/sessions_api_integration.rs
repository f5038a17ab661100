mod helpers;

use axum::http::StatusCode;
use helpers::ADMIN_TOKEN;
use sqlx::PgPool;
use uuid::Uuid;

use streamspace::auth::token;
use streamspace::dispatch;
use streamspace::model::Platform;

#[sqlx::test(migrations = "./migrations")]
async fn create_session_happy_path(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());
    let (_h, mut rx) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let user_token = helpers::add_token(&state.pool, "u1").await;

    let (status, body) = helpers::post_json(
        &app,
        &user_token,
        "/api/sessions",
        serde_json::json!({ "template": "firefox" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["agent_id"], "k8s-a");
    assert_eq!(body["platform"], "kubernetes");
    assert_eq!(body["user"], "u1");
    let session_id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    // Agent finishes provisioning; the session surfaces as running.
    let (command_id, _, _, payload) = helpers::next_command(&mut rx).await;
    assert_eq!(payload["principal"], "u1");
    dispatch::on_ack(&state, command_id).await.unwrap();
    dispatch::on_complete(
        &state,
        command_id,
        Some(serde_json::json!({"pod_name": "session-1", "pod_ip": "10.1.2.3"})),
    )
    .await
    .unwrap();

    let (status, body) =
        helpers::get(&app, &user_token, &format!("/api/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");
    assert_eq!(body["agent_id"], "k8s-a");
    assert_eq!(body["platform_metadata"]["pod_name"], "session-1");
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_template_is_rejected(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state);

    let (status, _) = helpers::post_json(
        &app,
        ADMIN_TOKEN,
        "/api/sessions",
        serde_json::json!({ "template": "does-not-exist" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test(migrations = "./migrations")]
async fn sessions_are_scoped_to_their_owner(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());
    let (_h, mut _rx) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let u1 = helpers::add_token(&state.pool, "u1").await;
    let u2 = helpers::add_token(&state.pool, "u2").await;

    let (_, body) = helpers::post_json(
        &app,
        &u1,
        "/api/sessions",
        serde_json::json!({ "template": "firefox" }),
    )
    .await;
    let session_id = body["id"].as_str().unwrap().to_owned();

    // Another user cannot read it; its owner and the admin can.
    let (status, _) = helpers::get(&app, &u2, &format!("/api/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = helpers::get(&app, &u1, &format!("/api/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = helpers::get(&app, ADMIN_TOKEN, &format!("/api/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::OK);

    // Listing is owner-scoped for non-admins.
    let (_, listed) = helpers::get(&app, &u2, "/api/sessions").await;
    assert_eq!(listed["total"], 0);
    let (_, listed) = helpers::get(&app, &u1, "/api/sessions").await;
    assert_eq!(listed["total"], 1);

    // Only admins may create on behalf of someone else.
    let (status, _) = helpers::post_json(
        &app,
        &u2,
        "/api/sessions",
        serde_json::json!({ "template": "firefox", "user": "u1" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[sqlx::test(migrations = "./migrations")]
async fn state_patch_conflicts(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());
    let (_h, mut rx) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;

    let (_, body) = helpers::post_json(
        &app,
        ADMIN_TOKEN,
        "/api/sessions",
        serde_json::json!({ "template": "firefox" }),
    )
    .await;
    let session_id = body["id"].as_str().unwrap().to_owned();
    let path = format!("/api/sessions/{session_id}/state");

    // Hibernating a pending session conflicts.
    let (status, _) = helpers::patch_json(
        &app,
        ADMIN_TOKEN,
        &path,
        serde_json::json!({ "state": "hibernated" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Run it, then the conflict matrix changes.
    let (command_id, _, _, _) = helpers::next_command(&mut rx).await;
    dispatch::on_ack(&state, command_id).await.unwrap();
    dispatch::on_complete(&state, command_id, None).await.unwrap();

    let (status, _) = helpers::patch_json(
        &app,
        ADMIN_TOKEN,
        &path,
        serde_json::json!({ "state": "running" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Requesting a state outside the PATCH surface is a bad request.
    let (status, _) = helpers::patch_json(
        &app,
        ADMIN_TOKEN,
        &path,
        serde_json::json!({ "state": "terminating" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test(migrations = "./migrations")]
async fn terminate_unscheduled_session_needs_no_agent(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    // Schedule fails (no agents at all), leaving a failed unbound session.
    let (status, _) = helpers::post_json(
        &app,
        ADMIN_TOKEN,
        "/api/sessions",
        serde_json::json!({ "template": "firefox" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let session_id: Uuid = sqlx::query_scalar("SELECT id FROM sessions LIMIT 1")
        .fetch_one(&state.pool)
        .await
        .unwrap();

    let (status, body) = helpers::patch_json(
        &app,
        ADMIN_TOKEN,
        &format!("/api/sessions/{session_id}/state"),
        serde_json::json!({ "state": "terminated" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "terminated");
}

#[sqlx::test(migrations = "./migrations")]
async fn vnc_token_binds_session_and_owner(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());
    let (_h, mut _rx) =
        helpers::connect_fake_agent(&state, "k8s-a", Platform::Kubernetes, 100, 0).await;
    let u1 = helpers::add_token(&state.pool, "u1").await;
    let u2 = helpers::add_token(&state.pool, "u2").await;

    let (_, body) = helpers::post_json(
        &app,
        &u1,
        "/api/sessions",
        serde_json::json!({ "template": "firefox" }),
    )
    .await;
    let session_id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let (status, minted) = helpers::post_json(
        &app,
        &u1,
        &format!("/api/sessions/{session_id}/vnc-token"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let raw = minted["token"].as_str().unwrap();
    let principal =
        token::verify_vnc_token(&state.config.vnc_token_secret, session_id, raw).unwrap();
    assert_eq!(principal, "u1");

    // The token is bound to this session only.
    assert!(token::verify_vnc_token(&state.config.vnc_token_secret, Uuid::new_v4(), raw).is_err());

    // A non-owner cannot mint.
    let (status, _) = helpers::post_json(
        &app,
        &u2,
        &format!("/api/sessions/{session_id}/vnc-token"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[sqlx::test(migrations = "./migrations")]
async fn legacy_sessions_are_served_read_only(pool: PgPool) {
    let state = helpers::test_state(pool).await;
    let app = helpers::test_router(state.clone());

    // A v1-era watch-based row: running with no agent binding.
    let legacy_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO sessions (id, principal, template, state, platform)
         VALUES ($1, 'admin', 'firefox', 'running', 'kubernetes')",
    )
    .bind(legacy_id)
    .execute(&state.pool)
    .await
    .unwrap();

    let (status, body) = helpers::get(&app, ADMIN_TOKEN, &format!("/api/sessions/{legacy_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["agent_id"].is_null());

    // Lifecycle commands cannot route it to an agent.
    let (status, _) = helpers::patch_json(
        &app,
        ADMIN_TOKEN,
        &format!("/api/sessions/{legacy_id}/state"),
        serde_json::json!({ "state": "hibernated" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
