//! VNC proxy: splices an end-user's binary websocket with the owning
//! agent's channel for the same session. The control plane relays opaque
//! bytes — no buffering beyond bounded channels, no transformation.

mod router;
mod viewer;

pub use router::{CloseReason, ViewerEvent, VncRouter};

use axum::extract::ws::{self, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{Html, IntoResponse};
use serde::Deserialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::token::{self, VncTokenError};
use crate::channel::frame::{Direction, VncFrame, session_key};
use crate::dispatch;
use crate::error::ApiError;
use crate::hub::{Delivery, Outbound};
use crate::model::{CommandType, SessionState};
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct VncParams {
    pub token: String,
}

/// Upgrade handler for the browser-side VNC stream.
///
/// The token is short-lived and bound to the session's owning principal;
/// the session must be running and its agent online before the splice is
/// attached.
#[tracing::instrument(skip(state, ws, params), fields(%session_id), err)]
pub async fn vnc_stream(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<VncParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let principal = token::verify_vnc_token(
        &state.config.vnc_token_secret,
        session_id,
        &params.token,
    )
    .map_err(|e| match e {
        VncTokenError::WrongSession => ApiError::Forbidden,
        _ => ApiError::Unauthorized,
    })?;

    let session = dispatch::fetch_session(&state.pool, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;

    if session.principal != principal {
        return Err(ApiError::Forbidden);
    }

    match session.state.parse::<SessionState>() {
        Ok(SessionState::Running) => {}
        Ok(SessionState::Pending) => {
            // Not an error state — the client should retry once running.
            return Err(ApiError::ServiceUnavailable("session not ready yet".into()));
        }
        _ => {
            return Err(ApiError::Conflict(format!(
                "session is {}, not running",
                session.state
            )));
        }
    }

    let agent_id = session
        .agent_id
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("session has no agent".into()))?;

    let agent_online: Option<String> =
        sqlx::query_scalar("SELECT status FROM agents WHERE agent_id = $1")
            .bind(&agent_id)
            .fetch_optional(&state.pool)
            .await?;
    if agent_online.as_deref() != Some("online") {
        return Err(ApiError::ServiceUnavailable("agent is offline".into()));
    }

    Ok(ws.on_upgrade(move |socket| handle_vnc(state, session_id, agent_id, socket)))
}

async fn handle_vnc(state: AppState, session_id: Uuid, agent_id: String, mut socket: WebSocket) {
    let key = session_key(session_id);

    let attached = state.vnc.attach(
        &key,
        session_id,
        &agent_id,
        state.config.vnc_max_viewers,
    );
    let Some((viewer_id, mut rx)) = attached else {
        tracing::warn!(%session_id, "viewer limit reached");
        let _ = socket
            .send(close_message(CloseReason::ViewerLimit))
            .await;
        return;
    };

    // First viewer establishes the agent-side tunnel.
    if state.vnc.viewer_count(&key) == 1
        && let Err(e) = dispatch::dispatch(&state, session_id, CommandType::VncOpen).await
    {
        tracing::error!(error = %e, %session_id, "vnc_open dispatch failed");
        let _ = socket.send(close_message(CloseReason::AgentGone)).await;
        finish(&state, session_id, &key, viewer_id).await;
        return;
    }

    let idle_timeout = state.config.vnc_proxy_idle_timeout;
    let mut reason = CloseReason::ClientClosed;

    loop {
        let deadline = Instant::now() + idle_timeout;
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                reason = CloseReason::IdleTimeout;
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(ws::Message::Binary(data))) => {
                        let frame = VncFrame::new(Direction::ToAgent, &key, data);
                        match state.hub.send(&agent_id, Outbound::Binary(frame.encode())).await {
                            Ok(Delivery::Delivered) => {}
                            Ok(Delivery::NotConnected) => {
                                reason = CloseReason::AgentGone;
                                break;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, %session_id, "agent send failed");
                                reason = CloseReason::AgentGone;
                                break;
                            }
                        }
                    }
                    Some(Ok(ws::Message::Close(_))) | None => {
                        reason = CloseReason::ClientClosed;
                        break;
                    }
                    Some(Ok(_)) => {} // text/ping ignored; noVNC is binary-only
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, %session_id, "client stream error");
                        reason = CloseReason::ClientClosed;
                        break;
                    }
                }
            }
            ev = rx.recv() => {
                match ev {
                    Some(ViewerEvent::Data(bytes)) => {
                        if socket.send(ws::Message::Binary(bytes)).await.is_err() {
                            reason = CloseReason::ClientClosed;
                            break;
                        }
                    }
                    Some(ViewerEvent::Close(r)) => {
                        reason = r;
                        break;
                    }
                    None => {
                        reason = CloseReason::SessionTerminated;
                        break;
                    }
                }
            }
        }
    }

    let _ = socket.send(close_message(reason)).await;
    finish(&state, session_id, &key, viewer_id).await;
    tracing::info!(%session_id, reason = reason.as_str(), "vnc stream closed");
}

/// Detach the viewer; the last one out tears the agent-side tunnel down.
/// The close is fire-and-forget — the client is already gone.
async fn finish(state: &AppState, session_id: Uuid, key: &str, viewer_id: Uuid) {
    let last_viewer = state.vnc.detach(key, viewer_id);
    if last_viewer
        && let Err(e) = dispatch::dispatch(state, session_id, CommandType::VncClose).await
    {
        tracing::debug!(error = %e, %session_id, "vnc_close dispatch failed");
    }
}

fn close_message(reason: CloseReason) -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code: 1000,
        reason: reason.as_str().into(),
    }))
}

// ---------------------------------------------------------------------------
// Viewer page
// ---------------------------------------------------------------------------

/// Static page that opens the proxy stream with the token from its query.
pub async fn vnc_viewer(Path(session_id): Path<Uuid>) -> Html<String> {
    Html(viewer::page(session_id))
}
