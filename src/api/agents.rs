use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::AuthPrincipal;
use crate::error::ApiError;
use crate::model::{AgentCapacity, AgentRecord, Platform};
use crate::store::AppState;

use super::helpers::{ListResponse, require_admin};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub platform: Platform,
    pub region: Option<String>,
    pub capacity: AgentCapacity,
    pub metadata: Option<serde_json::Value>,
    pub cluster_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsParams {
    pub platform: Option<String>,
    pub status: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub id: Uuid,
    pub agent_id: String,
    pub platform: String,
    pub region: Option<String>,
    pub status: String,
    pub max_sessions: i32,
    pub current_sessions: i32,
    pub connection_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub cluster_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn agent_to_response(record: AgentRecord) -> AgentResponse {
    AgentResponse {
        id: record.id,
        agent_id: record.agent_id,
        platform: record.platform,
        region: record.region,
        status: record.status,
        max_sessions: record.max_sessions,
        current_sessions: record.current_sessions,
        connection_id: record.connection_id,
        last_heartbeat: record.last_heartbeat,
        metadata: record.metadata,
        cluster_id: record.cluster_id,
        created_at: record.created_at,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/agents",
            get(list_agents).post(register_agent),
        )
        .route(
            "/api/agents/register",
            axum::routing::post(register_agent),
        )
        .route(
            "/api/agents/{agent_id}",
            get(get_agent).delete(delete_agent),
        )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Pre-register (or update) an agent identity. Idempotent on `agent_id`;
/// the live channel later flips it online.
#[tracing::instrument(skip(state, auth, body), fields(agent_id = %body.agent_id), err)]
async fn register_agent(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&auth)?;

    if body.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id must not be empty".into()));
    }
    if body.capacity.max_sessions <= 0 {
        return Err(ApiError::BadRequest("max_sessions must be positive".into()));
    }

    let agent_uuid: Uuid = sqlx::query_scalar(
        r"
        INSERT INTO agents (id, agent_id, platform, region, status, max_sessions,
                            cpu_limit_millis, memory_limit_mb, metadata, cluster_id)
        VALUES ($1, $2, $3, $4, 'offline', $5, $6, $7, $8, $9)
        ON CONFLICT (agent_id) DO UPDATE SET
            platform = EXCLUDED.platform,
            region = EXCLUDED.region,
            max_sessions = EXCLUDED.max_sessions,
            cpu_limit_millis = EXCLUDED.cpu_limit_millis,
            memory_limit_mb = EXCLUDED.memory_limit_mb,
            metadata = EXCLUDED.metadata,
            cluster_id = EXCLUDED.cluster_id,
            updated_at = now()
        RETURNING id
        ",
    )
    .bind(Uuid::new_v4())
    .bind(&body.agent_id)
    .bind(body.platform.as_str())
    .bind(&body.region)
    .bind(body.capacity.max_sessions)
    .bind(body.capacity.cpu_limit_millis)
    .bind(body.capacity.memory_limit_mb)
    .bind(&body.metadata)
    .bind(&body.cluster_id)
    .fetch_one(&state.pool)
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "agent_uuid": agent_uuid, "ok": true })),
    ))
}

async fn list_agents(
    State(state): State<AppState>,
    _auth: AuthPrincipal,
    Query(params): Query<ListAgentsParams>,
) -> Result<Json<ListResponse<AgentResponse>>, ApiError> {
    let rows: Vec<AgentRecord> = sqlx::query_as(
        r"
        SELECT * FROM agents
        WHERE ($1::text IS NULL OR platform = $1)
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL OR region = $3)
        ORDER BY agent_id ASC
        ",
    )
    .bind(&params.platform)
    .bind(&params.status)
    .bind(&params.region)
    .fetch_all(&state.pool)
    .await?;

    let total = i64::try_from(rows.len()).unwrap_or(i64::MAX);
    let items = rows.into_iter().map(agent_to_response).collect();
    Ok(Json(ListResponse { items, total }))
}

async fn get_agent(
    State(state): State<AppState>,
    _auth: AuthPrincipal,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentResponse>, ApiError> {
    let record: Option<AgentRecord> = sqlx::query_as("SELECT * FROM agents WHERE agent_id = $1")
        .bind(&agent_id)
        .fetch_optional(&state.pool)
        .await?;

    record
        .map(agent_to_response)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("agent".into()))
}

/// Remove an agent record. Online agents are rejected — drain or disconnect
/// them first.
#[tracing::instrument(skip(state, auth), err)]
async fn delete_agent(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&auth)?;

    let status: Option<String> = sqlx::query_scalar("SELECT status FROM agents WHERE agent_id = $1")
        .bind(&agent_id)
        .fetch_optional(&state.pool)
        .await?;

    match status.as_deref() {
        None => return Err(ApiError::NotFound("agent".into())),
        Some("online") => {
            return Err(ApiError::Conflict(
                "agent is online; disconnect it before deleting".into(),
            ));
        }
        Some(_) => {}
    }

    sqlx::query("DELETE FROM agents WHERE agent_id = $1 AND status <> 'online'")
        .bind(&agent_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(%agent_id, "agent record deleted");
    Ok(Json(serde_json::json!({ "ok": true })))
}
