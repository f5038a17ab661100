//! Control-plane side of the agent channel.
//!
//! Agents dial in (`GET /agent/ws?agent_id=...`); the control plane never
//! initiates. The first frame must be `register`. After that a single task
//! owns both halves: it is the only writer on the socket and it routes
//! inbound frames to the dispatcher (acks, results, events), the hub
//! (heartbeats) and the VNC proxy (binary frames).

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::channel::frame::{Direction, VncFrame};
use crate::channel::messages::{ChannelMessage, ResultStatus};
use crate::dispatch;
use crate::error::ApiError;
use crate::hub::{Outbound, RegisterInfo};
use crate::proxy::CloseReason;
use crate::store::AppState;

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub agent_id: String,
}

/// Upgrade handler for the agent channel.
pub async fn agent_channel(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    if params.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id required".into()));
    }

    if let Some(expected) = &state.config.agent_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(ApiError::Unauthorized);
        }
    }

    let agent_id = params.agent_id;
    Ok(ws.on_upgrade(move |socket| handle_channel(state, agent_id, socket)))
}

async fn handle_channel(state: AppState, agent_id: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let info = match read_register(&mut ws_rx, &agent_id).await {
        Ok(info) => info,
        Err(reason) => {
            tracing::warn!(%agent_id, %reason, "agent registration rejected");
            let reject = ChannelMessage::RegisterReject { reason };
            let _ = ws_tx.send(Message::Text(reject.to_json().into())).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Outbound>(64);
    let (handle, agent_uuid) = match state.hub.register(&info, tx).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(error = %e, %agent_id, "agent registration failed");
            let reject = ChannelMessage::RegisterReject {
                reason: "registration failed".into(),
            };
            let _ = ws_tx.send(Message::Text(reject.to_json().into())).await;
            return;
        }
    };

    let ack = ChannelMessage::RegisterAck { agent_uuid };
    if ws_tx.send(Message::Text(ack.to_json().into())).await.is_err() {
        teardown(&state, &agent_id, handle.token).await;
        return;
    }

    // Commands stranded while the agent was away go out again first.
    if let Err(e) = dispatch::on_agent_reconnect(&state, &agent_id).await {
        tracing::error!(error = %e, %agent_id, "redelivery after reconnect failed");
    }

    loop {
        tokio::select! {
            out = rx.recv() => {
                match out {
                    Some(Outbound::Message(msg)) => {
                        if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.touch(&agent_id).await;
                        handle_text(&state, &agent_id, &text).await;
                    }
                    Some(Ok(Message::Binary(raw))) => {
                        state.hub.touch(&agent_id).await;
                        handle_binary(&state, &agent_id, &raw).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ping/pong still counts as liveness.
                        state.hub.touch(&agent_id).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, %agent_id, "agent channel transport error");
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &agent_id, handle.token).await;
}

/// The first frame must be a `register` for the agent_id on the upgrade.
async fn read_register(
    ws_rx: &mut SplitStream<WebSocket>,
    agent_id: &str,
) -> Result<RegisterInfo, String> {
    let first = tokio::time::timeout(REGISTER_DEADLINE, ws_rx.next())
        .await
        .map_err(|_| "no register frame before deadline".to_owned())?;

    let Some(Ok(Message::Text(text))) = first else {
        return Err("expected a register frame".into());
    };

    match serde_json::from_str::<ChannelMessage>(&text) {
        Ok(ChannelMessage::Register {
            agent_id: registered_id,
            platform,
            region,
            capacity,
            metadata,
            cluster_id,
        }) => {
            if registered_id != agent_id {
                return Err(format!(
                    "register frame names {registered_id}, upgrade named {agent_id}"
                ));
            }
            Ok(RegisterInfo {
                agent_id: registered_id,
                platform,
                region,
                capacity,
                metadata,
                cluster_id,
            })
        }
        Ok(other) => Err(format!("expected register, got {other:?}")),
        Err(e) => Err(format!("unparseable register frame: {e}")),
    }
}

async fn handle_text(state: &AppState, agent_id: &str, text: &str) {
    let msg = match serde_json::from_str::<ChannelMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Unknown or malformed types are logged and ignored.
            tracing::warn!(error = %e, %agent_id, "ignoring unknown channel message");
            return;
        }
    };

    let outcome = match msg {
        ChannelMessage::Heartbeat { current_sessions } => state
            .hub
            .heartbeat(agent_id, current_sessions)
            .await
            .map_err(anyhow::Error::from),
        ChannelMessage::Ack { command_id } => dispatch::on_ack(state, command_id)
            .await
            .map_err(anyhow::Error::from),
        ChannelMessage::Result {
            command_id,
            status,
            result,
            error,
        } => match status {
            ResultStatus::Completed => dispatch::on_complete(state, command_id, result)
                .await
                .map_err(anyhow::Error::from),
            ResultStatus::Failed => dispatch::on_fail(
                state,
                command_id,
                error.as_deref().unwrap_or("agent reported failure"),
            )
            .await
            .map_err(anyhow::Error::from),
        },
        ChannelMessage::SessionEvent {
            session_id,
            state: session_state,
            message,
        } => dispatch::on_session_event(state, session_id, session_state, message.as_deref())
            .await
            .map_err(anyhow::Error::from),
        other => {
            tracing::warn!(%agent_id, message = ?other, "unexpected message direction, ignoring");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, %agent_id, "channel message handling failed");
    }
}

async fn handle_binary(state: &AppState, agent_id: &str, raw: &[u8]) {
    let frame = match VncFrame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, %agent_id, "dropping malformed binary frame");
            return;
        }
    };

    if frame.direction != Direction::ToControlPlane {
        tracing::warn!(%agent_id, "dropping agent frame with wrong direction");
        return;
    }

    if !state.vnc.deliver(&frame.session_key, frame.payload).await {
        tracing::debug!(%agent_id, session_key = %frame.session_key, "no viewer for frame, dropping");
    }
}

async fn teardown(state: &AppState, agent_id: &str, token: uuid::Uuid) {
    // Only the owner of the live binding runs loss handling; a superseded
    // channel (latest-connection-wins) must not demote the agent.
    match state.hub.unregister(agent_id, token).await {
        Ok(true) => {
            if let Err(e) = dispatch::on_agent_lost(state, agent_id).await {
                tracing::error!(error = %e, %agent_id, "agent-loss handling failed");
            }
            state.vnc.close_for_agent(agent_id, CloseReason::AgentGone);
            tracing::info!(%agent_id, "agent channel closed");
        }
        Ok(false) => {
            tracing::debug!(%agent_id, "stale channel closed, newer binding kept");
        }
        Err(e) => {
            tracing::error!(error = %e, %agent_id, "unregister failed");
        }
    }
}
