use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::AuthPrincipal;
use crate::auth::token;
use crate::dispatch;
use crate::error::ApiError;
use crate::model::{CommandType, Platform, SessionRecord, SessionState};
use crate::store::AppState;

use super::helpers::{ListResponse, require_owner};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub template: String,
    pub platform: Option<Platform>,
    pub region: Option<String>,
    pub tags: Option<serde_json::Value>,
    /// Admins may create sessions on behalf of another principal.
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    pub state: Option<String>,
    pub platform: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PatchStateRequest {
    pub state: SessionState,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub user: String,
    pub template: String,
    pub state: String,
    pub agent_id: Option<String>,
    pub platform: String,
    pub region: Option<String>,
    pub cluster_id: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub platform_metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn session_to_response(record: SessionRecord) -> SessionResponse {
    SessionResponse {
        id: record.id,
        user: record.principal,
        template: record.template,
        state: record.state,
        agent_id: record.agent_id,
        platform: record.platform,
        region: record.region,
        cluster_id: record.cluster_id,
        tags: record.tags,
        platform_metadata: record.platform_metadata,
        error_message: record.error_message,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/state", patch(patch_state))
        .route("/api/sessions/{id}/vnc-token", post(mint_vnc_token))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Create a session: row in `pending`, then schedule + dispatch
/// `start_session`. No matching agent resolves to 503 with the session left
/// in `failed`.
#[tracing::instrument(skip(state, auth, body), err)]
async fn create_session(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = match body.user {
        Some(user) if user != auth.principal => {
            if !auth.is_admin() {
                return Err(ApiError::Forbidden);
            }
            user
        }
        _ => auth.principal.clone(),
    };

    if body.template.trim().is_empty() {
        return Err(ApiError::BadRequest("template must not be empty".into()));
    }
    // Reject unknown templates before a row exists.
    dispatch::resolve_template(&state.pool, &body.template).await?;

    let platform = body.platform.unwrap_or(Platform::Kubernetes);
    let session_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO sessions (id, principal, template, state, platform, region, tags)
         VALUES ($1, $2, $3, 'pending', $4, $5, $6)",
    )
    .bind(session_id)
    .bind(&principal)
    .bind(&body.template)
    .bind(platform.as_str())
    .bind(&body.region)
    .bind(&body.tags)
    .execute(&state.pool)
    .await?;

    dispatch::dispatch(&state, session_id, CommandType::StartSession).await?;

    let session = dispatch::fetch_session(&state.pool, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;

    Ok((StatusCode::CREATED, Json(session_to_response(session))))
}

async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<ListResponse<SessionResponse>>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(100);
    let offset = params.offset.unwrap_or(0);
    // Non-admins only see their own sessions.
    let principal_filter = (!auth.is_admin()).then_some(auth.principal.clone());

    let total: i64 = sqlx::query_scalar(
        r"
        SELECT COUNT(*) FROM sessions
        WHERE ($1::text IS NULL OR principal = $1)
          AND ($2::text IS NULL OR state = $2)
          AND ($3::text IS NULL OR platform = $3)
        ",
    )
    .bind(&principal_filter)
    .bind(&params.state)
    .bind(&params.platform)
    .fetch_one(&state.pool)
    .await?;

    let rows: Vec<SessionRecord> = sqlx::query_as(
        r"
        SELECT * FROM sessions
        WHERE ($1::text IS NULL OR principal = $1)
          AND ($2::text IS NULL OR state = $2)
          AND ($3::text IS NULL OR platform = $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        ",
    )
    .bind(&principal_filter)
    .bind(&params.state)
    .bind(&params.platform)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.pool)
    .await?;

    let items = rows.into_iter().map(session_to_response).collect();
    Ok(Json(ListResponse { items, total }))
}

async fn get_session(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = dispatch::fetch_session(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;

    require_owner(&auth, &session.principal)?;
    Ok(Json(session_to_response(session)))
}

/// Drive the session toward a requested state: `running` wakes,
/// `hibernated` parks, `terminated` stops. The command is accepted into the
/// pipeline (202); completion arrives asynchronously from the agent.
#[tracing::instrument(skip(state, auth), fields(%id), err)]
async fn patch_state(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = dispatch::fetch_session(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;
    require_owner(&auth, &session.principal)?;

    let current = session
        .state
        .parse::<SessionState>()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;

    let command_type = match body.state {
        SessionState::Running => match current {
            SessionState::Hibernated => CommandType::WakeSession,
            SessionState::Running => {
                return Err(ApiError::Conflict("session is already running".into()));
            }
            other => {
                return Err(ApiError::Conflict(format!(
                    "cannot wake a session in state {other}"
                )));
            }
        },
        SessionState::Hibernated => match current {
            SessionState::Running => CommandType::HibernateSession,
            SessionState::Hibernated => {
                return Err(ApiError::Conflict("session is already hibernated".into()));
            }
            other => {
                return Err(ApiError::Conflict(format!(
                    "cannot hibernate a session in state {other}"
                )));
            }
        },
        SessionState::Terminated => match current {
            SessionState::Terminated | SessionState::Terminating => {
                return Err(ApiError::Conflict("session is already terminating".into()));
            }
            // A failed or never-scheduled session has nothing left on the
            // platform; terminate it directly.
            _ if session.agent_id.is_none() => {
                sqlx::query(
                    "UPDATE sessions SET state = 'terminated', updated_at = now() WHERE id = $1",
                )
                .bind(id)
                .execute(&state.pool)
                .await?;
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(serde_json::json!({ "state": "terminated" })),
                ));
            }
            _ => CommandType::StopSession,
        },
        other => {
            return Err(ApiError::BadRequest(format!(
                "state {other} cannot be requested"
            )));
        }
    };

    let command_id = dispatch::dispatch(&state, id, command_type).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "command_id": command_id })),
    ))
}

/// Short-lived token for the VNC proxy upgrade, bound to the session and
/// its owning principal.
#[tracing::instrument(skip(state, auth), fields(%id), err)]
async fn mint_vnc_token(
    State(state): State<AppState>,
    auth: AuthPrincipal,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = dispatch::fetch_session(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;
    require_owner(&auth, &session.principal)?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(state.config.vnc_token_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
    let token = token::mint_vnc_token(
        &state.config.vnc_token_secret,
        id,
        &session.principal,
        expires_at,
    );

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "token": token, "expires_at": expires_at })),
    ))
}
