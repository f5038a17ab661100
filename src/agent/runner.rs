//! The agent's side of the channel: connect outbound to the control plane,
//! register, heartbeat, execute commands against the platform backend, and
//! relay VNC tunnels. Only the elected leader runs a connection; followers
//! wait on the leadership watch.
//!
//! One task owns the socket: it is the single writer, and spawned command
//! executors hand their frames back through a bounded channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use uuid::Uuid;

use crate::channel::frame::{Direction, VncFrame, session_key};
use crate::channel::messages::{ChannelMessage, ResultStatus};
use crate::model::{AgentCapacity, CommandType, Platform, StartSessionSpec};

use super::backend::{BackendError, SessionBackend, TunnelStream};

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. `ws://cp.example:8080`.
    pub control_plane_url: String,
    pub agent_id: String,
    pub platform: Platform,
    pub region: Option<String>,
    pub cluster_id: Option<String>,
    pub max_sessions: i32,
    pub agent_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub metadata: Option<serde_json::Value>,
}

enum ConnectionEnd {
    Shutdown,
    LeadershipLost,
    Lost { registered: bool },
}

/// Drive the agent until shutdown. Leadership gates the channel: the
/// connection opens when this replica holds the lease and closes when it
/// loses it (a superseding connection elsewhere closes it from the hub
/// side, which lands here as `Lost`).
pub async fn run_agent(
    cfg: AgentConfig,
    backend: Arc<dyn SessionBackend>,
    mut leader_rx: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        while !*leader_rx.borrow() {
            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
        tracing::info!(agent_id = %cfg.agent_id, "leadership acquired, opening channel");

        let mut backoff = BACKOFF_FLOOR;
        while *leader_rx.borrow() {
            match connect_and_run(&cfg, &backend, &mut leader_rx, &mut shutdown).await {
                Ok(ConnectionEnd::Shutdown) => return Ok(()),
                Ok(ConnectionEnd::LeadershipLost) => {
                    tracing::info!(agent_id = %cfg.agent_id, "leadership lost, channel closed");
                    break;
                }
                Ok(ConnectionEnd::Lost { registered }) => {
                    if registered {
                        backoff = BACKOFF_FLOOR;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, agent_id = %cfg.agent_id, "channel attempt failed");
                }
            }

            tracing::info!(agent_id = %cfg.agent_id, ?backoff, "reconnecting after backoff");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

async fn connect_and_run(
    cfg: &AgentConfig,
    backend: &Arc<dyn SessionBackend>,
    leader_rx: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<()>,
) -> anyhow::Result<ConnectionEnd> {
    let url = format!(
        "{}/agent/ws?agent_id={}",
        cfg.control_plane_url.trim_end_matches('/'),
        cfg.agent_id
    );
    let mut request = url.into_client_request()?;
    if let Some(token) = &cfg.agent_token {
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {token}").parse()?,
        );
    }

    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Register first; everything else waits for the ack.
    let current_sessions = backend.session_count().await.unwrap_or(0);
    let register = ChannelMessage::Register {
        agent_id: cfg.agent_id.clone(),
        platform: cfg.platform,
        region: cfg.region.clone(),
        capacity: AgentCapacity {
            max_sessions: cfg.max_sessions,
            current_sessions,
            cpu_limit_millis: None,
            memory_limit_mb: None,
        },
        metadata: cfg.metadata.clone(),
        cluster_id: cfg.cluster_id.clone(),
    };
    ws_tx.send(Message::text(register.to_json())).await?;

    let ack = tokio::time::timeout(REGISTER_DEADLINE, ws_rx.next())
        .await
        .map_err(|_| anyhow::anyhow!("no register ack before deadline"))?;
    match ack {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ChannelMessage>(&text) {
            Ok(ChannelMessage::RegisterAck { agent_uuid }) => {
                tracing::info!(agent_id = %cfg.agent_id, %agent_uuid, "registered with control plane");
            }
            Ok(ChannelMessage::RegisterReject { reason }) => {
                anyhow::bail!("registration rejected: {reason}");
            }
            other => anyhow::bail!("unexpected register response: {other:?}"),
        },
        other => anyhow::bail!("channel closed during registration: {other:?}"),
    }

    // Frames produced off-task (command executors, tunnel relays).
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let mut tunnels: HashMap<String, TunnelHandle> = HashMap::new();
    let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break ConnectionEnd::Shutdown;
            }
            changed = leader_rx.changed() => {
                if changed.is_err() || !*leader_rx.borrow() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break ConnectionEnd::LeadershipLost;
                }
            }
            _ = heartbeat.tick() => {
                let current_sessions = backend.session_count().await.unwrap_or(current_sessions);
                let beat = ChannelMessage::Heartbeat { current_sessions };
                if ws_tx.send(Message::text(beat.to_json())).await.is_err() {
                    break ConnectionEnd::Lost { registered: true };
                }
            }
            out = out_rx.recv() => {
                // Executors hold an out_tx clone, so the channel cannot end
                // while the loop runs.
                if let Some(frame) = out
                    && ws_tx.send(frame).await.is_err()
                {
                    break ConnectionEnd::Lost { registered: true };
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let handled = handle_control_frame(
                            backend,
                            &out_tx,
                            &mut tunnels,
                            &mut ws_tx,
                            &text,
                        )
                        .await;
                        if let Err(e) = handled {
                            tracing::warn!(error = %e, "control frame handling failed");
                            break ConnectionEnd::Lost { registered: true };
                        }
                    }
                    Some(Ok(Message::Binary(raw))) => {
                        deliver_to_tunnel(&tunnels, &raw).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break ConnectionEnd::Lost { registered: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "channel transport error");
                        break ConnectionEnd::Lost { registered: true };
                    }
                }
            }
        }
    };

    // Connection loss tears down every open tunnel on this side too.
    for (_, tunnel) in tunnels.drain() {
        tunnel.task.abort();
    }
    Ok(end)
}

// ---------------------------------------------------------------------------
// Inbound control frames
// ---------------------------------------------------------------------------

async fn handle_control_frame(
    backend: &Arc<dyn SessionBackend>,
    out_tx: &mpsc::Sender<Message>,
    tunnels: &mut HashMap<String, TunnelHandle>,
    ws_tx: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    text: &str,
) -> anyhow::Result<()> {
    let msg = match serde_json::from_str::<ChannelMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unknown channel message");
            return Ok(());
        }
    };

    match msg {
        ChannelMessage::Command {
            command_id,
            session_id,
            command_type,
            payload,
        } => {
            // Ack immediately, before execution starts.
            let ack = ChannelMessage::Ack { command_id };
            ws_tx
                .send(Message::text(ack.to_json()))
                .await
                .map_err(|e| anyhow::anyhow!("ack send failed: {e}"))?;

            match command_type {
                CommandType::VncOpen | CommandType::VncClose => {
                    // Tunnel control has its own frames; a command-wrapped
                    // one is a control-plane bug.
                    send_result(
                        ws_tx,
                        command_id,
                        Err(BackendError::Other(anyhow::anyhow!(
                            "tunnel control must arrive as vnc_open/vnc_close frames"
                        ))),
                    )
                    .await?;
                }
                _ => {
                    // Session lifecycle work can take minutes; run it off
                    // the channel task so heartbeats keep flowing.
                    let backend = backend.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let outcome =
                            execute_command(&backend, command_type, session_id, &payload).await;
                        let result = result_message(command_id, outcome);
                        if out_tx.send(Message::text(result.to_json())).await.is_err() {
                            tracing::warn!(%command_id, "channel gone before result could be sent");
                        }
                    });
                }
            }
        }
        ChannelMessage::VncOpen {
            command_id,
            session_id,
        } => {
            let ack = ChannelMessage::Ack { command_id };
            ws_tx
                .send(Message::text(ack.to_json()))
                .await
                .map_err(|e| anyhow::anyhow!("ack send failed: {e}"))?;

            let outcome = open_tunnel(backend, out_tx, tunnels, session_id).await;
            if let Err(e) = &outcome {
                tracing::warn!(error = %e, %session_id, "tunnel open failed");
            }
            send_result(ws_tx, command_id, outcome.map(|()| None)).await?;
        }
        ChannelMessage::VncClose {
            command_id,
            session_id,
        } => {
            let ack = ChannelMessage::Ack { command_id };
            ws_tx
                .send(Message::text(ack.to_json()))
                .await
                .map_err(|e| anyhow::anyhow!("ack send failed: {e}"))?;

            close_tunnel(tunnels, session_id);
            send_result(ws_tx, command_id, Ok(None)).await?;
        }
        other => {
            tracing::warn!(message = ?other, "unexpected message direction, ignoring");
        }
    }
    Ok(())
}

async fn execute_command(
    backend: &Arc<dyn SessionBackend>,
    command_type: CommandType,
    session_id: Uuid,
    payload: &serde_json::Value,
) -> Result<Option<serde_json::Value>, BackendError> {
    match command_type {
        CommandType::StartSession => {
            let spec: StartSessionSpec = serde_json::from_value(payload.clone())
                .map_err(|e| BackendError::InvalidTemplate(e.to_string()))?;
            backend.start_session(session_id, &spec).await.map(Some)
        }
        CommandType::StopSession => backend.stop_session(session_id).await.map(|()| None),
        CommandType::HibernateSession => {
            backend.hibernate_session(session_id).await.map(|()| None)
        }
        CommandType::WakeSession => backend.wake_session(session_id).await.map(Some),
        // Rejected before reaching the executor.
        CommandType::VncOpen | CommandType::VncClose => Err(BackendError::Other(
            anyhow::anyhow!("tunnel control is not an executor command"),
        )),
    }
}

fn result_message(
    command_id: Uuid,
    outcome: Result<Option<serde_json::Value>, BackendError>,
) -> ChannelMessage {
    match outcome {
        Ok(result) => ChannelMessage::Result {
            command_id,
            status: ResultStatus::Completed,
            result,
            error: None,
        },
        Err(e) => ChannelMessage::Result {
            command_id,
            status: ResultStatus::Failed,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

async fn send_result(
    ws_tx: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    command_id: Uuid,
    outcome: Result<Option<serde_json::Value>, BackendError>,
) -> anyhow::Result<()> {
    let msg = result_message(command_id, outcome);
    ws_tx
        .send(Message::text(msg.to_json()))
        .await
        .map_err(|e| anyhow::anyhow!("result send failed: {e}"))
}

// ---------------------------------------------------------------------------
// Tunnels
// ---------------------------------------------------------------------------

struct TunnelHandle {
    in_tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

async fn open_tunnel(
    backend: &Arc<dyn SessionBackend>,
    out_tx: &mpsc::Sender<Message>,
    tunnels: &mut HashMap<String, TunnelHandle>,
    session_id: Uuid,
) -> Result<(), BackendError> {
    let key = session_key(session_id);
    if tunnels.contains_key(&key) {
        return Ok(());
    }

    let stream = backend.open_tunnel(session_id).await?;
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(32);
    let task = tokio::spawn(relay_tunnel(stream, key.clone(), in_rx, out_tx.clone()));
    tunnels.insert(key, TunnelHandle { in_tx, task });
    tracing::info!(%session_id, "vnc tunnel opened");
    Ok(())
}

fn close_tunnel(tunnels: &mut HashMap<String, TunnelHandle>, session_id: Uuid) {
    if let Some(tunnel) = tunnels.remove(&session_key(session_id)) {
        tunnel.task.abort();
        tracing::info!(%session_id, "vnc tunnel closed");
    }
}

async fn deliver_to_tunnel(tunnels: &HashMap<String, TunnelHandle>, raw: &[u8]) {
    let frame = match VncFrame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed binary frame");
            return;
        }
    };
    if frame.direction != Direction::ToAgent {
        tracing::warn!("dropping frame with wrong direction");
        return;
    }

    match tunnels.get(&frame.session_key) {
        // Bounded send: a slow container write stalls the channel reader,
        // which is exactly the back-pressure contract.
        Some(tunnel) => {
            let _ = tunnel.in_tx.send(frame.payload).await;
        }
        None => {
            tracing::debug!(session_key = %frame.session_key, "no tunnel for frame, dropping");
        }
    }
}

/// Pump bytes both ways between the container's VNC stream and the channel.
async fn relay_tunnel(
    stream: TunnelStream,
    key: String,
    mut in_rx: mpsc::Receiver<Bytes>,
    out_tx: mpsc::Sender<Message>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = VncFrame::new(
                            Direction::ToControlPlane,
                            &key,
                            Bytes::copy_from_slice(&buf[..n]),
                        );
                        if out_tx.send(Message::binary(frame.encode())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            data = in_rx.recv() => {
                match data {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    tracing::debug!(session_key = %key, "tunnel relay finished");
}
