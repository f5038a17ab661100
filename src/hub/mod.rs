//! Agent Hub: the process-wide mapping from agent id to live channel.
//!
//! Reads (send) vastly outnumber writes (register/unregister), so the local
//! map sits behind a reader-writer lock; each bound channel is an mpsc
//! sender feeding that channel's single writer task. Bindings carry a token
//! so a stale close cannot unbind a newer channel.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::model::{AgentCapacity, Platform};
use registry::{Registry, RegistryError, RelayEnvelope};

/// What flows to a channel's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ChannelMessage),
    Binary(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Proof of a live binding; `unregister` is a no-op unless the token still
/// matches the current binding.
#[derive(Debug, Clone)]
pub struct BindHandle {
    pub token: Uuid,
    pub connection_id: String,
}

/// Registration payload from the agent's first frame.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub agent_id: String,
    pub platform: Platform,
    pub region: Option<String>,
    pub capacity: AgentCapacity,
    pub metadata: Option<serde_json::Value>,
    pub cluster_id: Option<String>,
}

struct BoundChannel {
    token: Uuid,
    connection_id: String,
    tx: mpsc::Sender<Outbound>,
    last_frame: Arc<std::sync::Mutex<Instant>>,
}

pub struct AgentHub {
    pool: PgPool,
    channels: RwLock<HashMap<String, BoundChannel>>,
    registry: Registry,
}

impl AgentHub {
    pub fn new(pool: PgPool, registry: Registry) -> Self {
        Self {
            pool,
            channels: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Atomically bind a channel. If the agent is already bound the prior
    /// channel is closed and replaced: the latest connection wins. Upserts
    /// the agent row to `online` and returns the row id for the ack.
    #[tracing::instrument(skip(self, info, tx), fields(agent_id = %info.agent_id), err)]
    pub async fn register(
        &self,
        info: &RegisterInfo,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<(BindHandle, Uuid), HubError> {
        let handle = BindHandle {
            token: Uuid::new_v4(),
            connection_id: format!("conn-{}", Uuid::new_v4()),
        };

        {
            let mut channels = self.channels.write().await;
            let replaced = channels.insert(
                info.agent_id.clone(),
                BoundChannel {
                    token: handle.token,
                    connection_id: handle.connection_id.clone(),
                    tx,
                    last_frame: Arc::new(std::sync::Mutex::new(Instant::now())),
                },
            );
            if let Some(old) = replaced {
                tracing::info!(agent_id = %info.agent_id, "agent rebound, closing prior channel");
                let _ = old.tx.try_send(Outbound::Close);
            }
        }

        let agent_uuid: Uuid = sqlx::query_scalar(
            r"
            INSERT INTO agents (id, agent_id, platform, region, status, max_sessions,
                                current_sessions, cpu_limit_millis, memory_limit_mb,
                                connection_id, last_heartbeat, metadata, cluster_id)
            VALUES ($1, $2, $3, $4, 'online', $5, $6, $7, $8, $9, now(), $10, $11)
            ON CONFLICT (agent_id) DO UPDATE SET
                platform = EXCLUDED.platform,
                region = EXCLUDED.region,
                status = 'online',
                max_sessions = EXCLUDED.max_sessions,
                current_sessions = EXCLUDED.current_sessions,
                cpu_limit_millis = EXCLUDED.cpu_limit_millis,
                memory_limit_mb = EXCLUDED.memory_limit_mb,
                connection_id = EXCLUDED.connection_id,
                last_heartbeat = now(),
                metadata = EXCLUDED.metadata,
                cluster_id = EXCLUDED.cluster_id,
                updated_at = now()
            RETURNING id
            ",
        )
        .bind(Uuid::new_v4())
        .bind(&info.agent_id)
        .bind(info.platform.as_str())
        .bind(&info.region)
        .bind(info.capacity.max_sessions)
        .bind(info.capacity.current_sessions)
        .bind(info.capacity.cpu_limit_millis)
        .bind(info.capacity.memory_limit_mb)
        .bind(&handle.connection_id)
        .bind(&info.metadata)
        .bind(&info.cluster_id)
        .fetch_one(&self.pool)
        .await?;

        // Cross-replica rebind: tell the previous owner to drop its stale
        // binding.
        if let Some(prev_replica) = self
            .registry
            .bind(&info.agent_id, &handle.connection_id)
            .await?
        {
            tracing::info!(agent_id = %info.agent_id, %prev_replica, "agent moved replicas");
            self.registry
                .relay(
                    &prev_replica,
                    &RelayEnvelope::CloseAgent {
                        agent_id: info.agent_id.clone(),
                    },
                )
                .await?;
        }

        tracing::info!(agent_id = %info.agent_id, connection_id = %handle.connection_id, "agent registered");
        Ok((handle, agent_uuid))
    }

    /// Release a binding. Returns true only when the token matched and the
    /// binding was actually removed; a stale token is a no-op so the agent's
    /// newer channel stays bound.
    #[tracing::instrument(skip(self), err)]
    pub async fn unregister(&self, agent_id: &str, token: Uuid) -> Result<bool, HubError> {
        let removed = {
            let mut channels = self.channels.write().await;
            match channels.get(agent_id) {
                Some(bound) if bound.token == token => channels.remove(agent_id),
                _ => None,
            }
        };

        let Some(bound) = removed else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE agents SET status = 'offline', connection_id = NULL, updated_at = now()
             WHERE agent_id = $1 AND connection_id = $2",
        )
        .bind(agent_id)
        .bind(&bound.connection_id)
        .execute(&self.pool)
        .await?;

        self.registry
            .release(agent_id, &bound.connection_id)
            .await?;

        tracing::info!(%agent_id, "agent unregistered");
        Ok(true)
    }

    /// Route a message to the agent's channel: locally if bound here, via
    /// the inter-replica relay if another replica owns it. `NotConnected`
    /// is a signal, not an error — the dispatcher keeps the command pending.
    pub async fn send(&self, agent_id: &str, outbound: Outbound) -> Result<Delivery, HubError> {
        if let Delivery::Delivered = self.send_local(agent_id, outbound.clone()).await {
            return Ok(Delivery::Delivered);
        }

        let Some(entry) = self.registry.lookup(agent_id).await? else {
            return Ok(Delivery::NotConnected);
        };
        if Some(entry.replica_id.as_str()) == self.registry.replica_id() {
            // Registry says it's ours but the local map disagrees: the
            // binding is gone and the TTL just hasn't expired yet.
            return Ok(Delivery::NotConnected);
        }

        let envelope = match outbound {
            Outbound::Message(msg) => RelayEnvelope::Deliver {
                agent_id: agent_id.to_owned(),
                text: Some(msg.to_json()),
                binary: None,
            },
            Outbound::Binary(bytes) => RelayEnvelope::Deliver {
                agent_id: agent_id.to_owned(),
                text: None,
                binary: Some(BASE64.encode(&bytes)),
            },
            Outbound::Close => RelayEnvelope::CloseAgent {
                agent_id: agent_id.to_owned(),
            },
        };
        self.registry.relay(&entry.replica_id, &envelope).await?;
        Ok(Delivery::Delivered)
    }

    /// Deliver to the locally-bound channel only. Used directly by the relay
    /// consumer so forwarded frames never bounce between replicas.
    pub async fn send_local(&self, agent_id: &str, outbound: Outbound) -> Delivery {
        let tx = {
            let channels = self.channels.read().await;
            channels.get(agent_id).map(|bound| bound.tx.clone())
        };
        match tx {
            Some(tx) if tx.send(outbound).await.is_ok() => Delivery::Delivered,
            _ => Delivery::NotConnected,
        }
    }

    /// Record frame arrival for idle detection. Any frame counts.
    pub async fn touch(&self, agent_id: &str) {
        let channels = self.channels.read().await;
        if let Some(bound) = channels.get(agent_id)
            && let Ok(mut last) = bound.last_frame.lock()
        {
            *last = Instant::now();
        }
    }

    /// Heartbeat bookkeeping: agent row freshness + capacity, registry TTL.
    pub async fn heartbeat(&self, agent_id: &str, current_sessions: i32) -> Result<(), HubError> {
        sqlx::query(
            "UPDATE agents SET last_heartbeat = now(), current_sessions = $2, updated_at = now()
             WHERE agent_id = $1",
        )
        .bind(agent_id)
        .bind(current_sessions)
        .execute(&self.pool)
        .await?;

        let connection_id = {
            let channels = self.channels.read().await;
            channels.get(agent_id).map(|b| b.connection_id.clone())
        };
        if let Some(connection_id) = connection_id {
            self.registry.refresh(agent_id, &connection_id).await?;
        }
        Ok(())
    }

    /// Ask a locally-bound channel to close (its socket task then runs the
    /// normal teardown path).
    pub async fn close_local(&self, agent_id: &str) {
        let channels = self.channels.read().await;
        if let Some(bound) = channels.get(agent_id) {
            let _ = bound.tx.try_send(Outbound::Close);
        }
    }

    /// Locally-bound agents whose last frame is older than the timeout.
    pub async fn stale_agents(&self, timeout: Duration) -> Vec<String> {
        let channels = self.channels.read().await;
        channels
            .iter()
            .filter(|(_, bound)| {
                bound
                    .last_frame
                    .lock()
                    .map(|last| last.elapsed() > timeout)
                    .unwrap_or(false)
            })
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    pub async fn is_bound(&self, agent_id: &str) -> bool {
        self.channels.read().await.contains_key(agent_id)
    }

    /// Orderly close of every local channel (graceful shutdown).
    pub async fn shutdown(&self) {
        let channels = self.channels.read().await;
        for bound in channels.values() {
            let _ = bound.tx.try_send(Outbound::Close);
        }
    }
}

/// Background task: close locally-bound channels that have gone silent past
/// `heartbeat_timeout`. The socket task's teardown performs the unregister.
pub async fn run_heartbeat_scanner(
    state: crate::store::AppState,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    let timeout = state.config.heartbeat_timeout;
    let scan_every = Duration::from_secs((timeout.as_secs() / 3).max(1));
    tracing::info!(?timeout, "heartbeat scanner started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("heartbeat scanner shutting down");
                break;
            }
            () = tokio::time::sleep(scan_every) => {
                for agent_id in state.hub.stale_agents(timeout).await {
                    tracing::warn!(%agent_id, "agent missed heartbeat window, closing channel");
                    state.hub.close_local(&agent_id).await;
                }
            }
        }
    }
}

/// Background task (multi-replica mode): consume this replica's delivery
/// channel and write relayed frames to locally-bound channels.
pub async fn run_relay_consumer(
    state: crate::store::AppState,
    valkey: fred::clients::Pool,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    use fred::prelude::*;

    let channel = registry::delivery_channel(&state.config.replica_id);
    let subscriber = valkey.next().clone();
    if let Err(e) = subscriber.subscribe(channel.as_str()).await {
        tracing::error!(error = %e, %channel, "relay subscription failed");
        return;
    }
    let mut rx = subscriber.message_rx();
    tracing::info!(%channel, "relay consumer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = subscriber.unsubscribe(channel.as_str()).await;
                tracing::info!("relay consumer shutting down");
                break;
            }
            msg = rx.recv() => {
                let Ok(message) = msg else { break };
                let Ok(raw) = message.value.convert::<String>() else {
                    continue;
                };
                match serde_json::from_str::<RelayEnvelope>(&raw) {
                    Ok(RelayEnvelope::Deliver { agent_id, text, binary }) => {
                        if let Some(text) = text {
                            match serde_json::from_str::<ChannelMessage>(&text) {
                                Ok(parsed) => {
                                    let _ = state
                                        .hub
                                        .send_local(&agent_id, Outbound::Message(parsed))
                                        .await;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, %agent_id, "relayed text frame unparseable");
                                }
                            }
                        }
                        if let Some(binary) = binary {
                            match BASE64.decode(binary) {
                                Ok(bytes) => {
                                    let _ = state
                                        .hub
                                        .send_local(&agent_id, Outbound::Binary(bytes.into()))
                                        .await;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, %agent_id, "relayed binary frame undecodable");
                                }
                            }
                        }
                    }
                    Ok(RelayEnvelope::CloseAgent { agent_id }) => {
                        state.hub.close_local(&agent_id).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable relay envelope");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(agent_id: &str) -> RegisterInfo {
        RegisterInfo {
            agent_id: agent_id.into(),
            platform: Platform::Kubernetes,
            region: None,
            capacity: AgentCapacity {
                max_sessions: 10,
                current_sessions: 0,
                cpu_limit_millis: None,
                memory_limit_mb: None,
            },
            metadata: None,
            cluster_id: None,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn latest_connection_wins(pool: PgPool) {
        let hub = AgentHub::new(pool, Registry::Memory);

        let (tx1, mut rx1) = mpsc::channel(4);
        let (handle1, _) = hub.register(&info("k8s-a"), tx1).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(4);
        let (handle2, _) = hub.register(&info("k8s-a"), tx2).await.unwrap();
        assert_ne!(handle1.token, handle2.token);

        // The first channel was told to close.
        match rx1.recv().await {
            Some(Outbound::Close) => {}
            other => panic!("expected close, got {other:?}"),
        }

        // The stale token must not unbind the new channel.
        assert!(!hub.unregister("k8s-a", handle1.token).await.unwrap());
        assert!(hub.is_bound("k8s-a").await);

        assert!(hub.unregister("k8s-a", handle2.token).await.unwrap());
        assert!(!hub.is_bound("k8s-a").await);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn send_to_unbound_agent_is_not_connected(pool: PgPool) {
        let hub = AgentHub::new(pool, Registry::Memory);
        let delivery = hub
            .send(
                "ghost",
                Outbound::Message(ChannelMessage::Heartbeat {
                    current_sessions: 0,
                }),
            )
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::NotConnected);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn register_marks_agent_online(pool: PgPool) {
        let hub = AgentHub::new(pool.clone(), Registry::Memory);
        let (tx, _rx) = mpsc::channel(4);
        hub.register(&info("k8s-a"), tx).await.unwrap();

        let (status, connection_id): (String, Option<String>) =
            sqlx::query_as("SELECT status, connection_id FROM agents WHERE agent_id = 'k8s-a'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "online");
        assert!(connection_id.is_some());
    }
}
