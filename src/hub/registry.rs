//! Cross-replica connection registry.
//!
//! In single-replica mode the hub's local map is the whole registry. In
//! multi-replica mode every bound agent also has a valkey key
//! `streamspace:agent:conn:<agent_id>` naming the owning replica; replicas
//! forward frames for remotely-bound agents over per-replica pub/sub
//! delivery channels.

use chrono::{DateTime, Utc};
use fred::prelude::*;
use serde::{Deserialize, Serialize};

/// Registry value: which replica owns the agent's channel right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub replica_id: String,
    pub connection_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Envelope published on a replica's delivery channel. Binary frames are
/// base64 inside the JSON; bulk VNC over the relay works but operators may
/// prefer sticky ingress routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEnvelope {
    Deliver {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<String>,
    },
    /// Tells the replica holding a stale binding to close it after the
    /// agent reconnected elsewhere (latest-connection-wins).
    CloseAgent { agent_id: String },
}

pub fn delivery_channel(replica_id: &str) -> String {
    format!("streamspace:replica:{replica_id}:deliver")
}

fn conn_key(agent_id: &str) -> String {
    format!("streamspace:agent:conn:{agent_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("valkey error: {0}")]
    Valkey(#[from] fred::error::Error),
    #[error("registry serialization: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Where channel ownership is recorded.
pub enum Registry {
    Memory,
    Valkey {
        pool: fred::clients::Pool,
        replica_id: String,
        ttl_secs: i64,
    },
}

impl Registry {
    /// This replica's identity, when running in multi-replica mode.
    pub fn replica_id(&self) -> Option<&str> {
        match self {
            Self::Memory => None,
            Self::Valkey { replica_id, .. } => Some(replica_id),
        }
    }

    /// Record this replica as the agent's owner. Unconditional: the newest
    /// connection wins. Returns the replica that previously owned the agent
    /// if it was a different one, so the caller can tell it to close.
    pub async fn bind(
        &self,
        agent_id: &str,
        connection_id: &str,
    ) -> Result<Option<String>, RegistryError> {
        let Self::Valkey {
            pool,
            replica_id,
            ttl_secs,
        } = self
        else {
            return Ok(None);
        };

        let key = conn_key(agent_id);
        let prev: Option<String> = pool.get(&key).await?;
        let prev_replica = prev
            .and_then(|raw| serde_json::from_str::<RegistryEntry>(&raw).ok())
            .map(|e| e.replica_id)
            .filter(|owner| owner != replica_id);

        let entry = RegistryEntry {
            replica_id: replica_id.clone(),
            connection_id: connection_id.to_owned(),
            last_seen: Utc::now(),
        };
        pool.set::<(), _, _>(
            &key,
            serde_json::to_string(&entry)?,
            Some(Expiration::EX(*ttl_secs)),
            None,
            false,
        )
        .await?;

        Ok(prev_replica)
    }

    /// Refresh the TTL on heartbeat.
    pub async fn refresh(&self, agent_id: &str, connection_id: &str) -> Result<(), RegistryError> {
        let Self::Valkey {
            pool,
            replica_id,
            ttl_secs,
        } = self
        else {
            return Ok(());
        };

        let entry = RegistryEntry {
            replica_id: replica_id.clone(),
            connection_id: connection_id.to_owned(),
            last_seen: Utc::now(),
        };
        pool.set::<(), _, _>(
            conn_key(agent_id),
            serde_json::to_string(&entry)?,
            Some(Expiration::EX(*ttl_secs)),
            None,
            false,
        )
        .await?;
        Ok(())
    }

    /// Drop the entry, but only if it still names our connection — a stale
    /// release must not unbind a newer channel registered elsewhere.
    pub async fn release(&self, agent_id: &str, connection_id: &str) -> Result<(), RegistryError> {
        let Self::Valkey { pool, .. } = self else {
            return Ok(());
        };

        let key = conn_key(agent_id);
        let current: Option<String> = pool.get(&key).await?;
        let ours = current
            .and_then(|raw| serde_json::from_str::<RegistryEntry>(&raw).ok())
            .is_some_and(|e| e.connection_id == connection_id);
        if ours {
            pool.del::<(), _>(&key).await?;
        }
        Ok(())
    }

    /// Which replica owns the agent, if any.
    pub async fn lookup(&self, agent_id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let Self::Valkey { pool, .. } = self else {
            return Ok(None);
        };

        let raw: Option<String> = pool.get(conn_key(agent_id)).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Publish an envelope on another replica's delivery channel.
    pub async fn relay(
        &self,
        target_replica: &str,
        envelope: &RelayEnvelope,
    ) -> Result<(), RegistryError> {
        let Self::Valkey { pool, .. } = self else {
            return Ok(());
        };

        let payload = serde_json::to_string(envelope)?;
        pool.next()
            .publish::<(), _, _>(delivery_channel(target_replica), payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_envelope_wire_shape() {
        let env = RelayEnvelope::Deliver {
            agent_id: "k8s-a".into(),
            text: Some("{\"type\":\"heartbeat\"}".into()),
            binary: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(json["kind"], "deliver");
        assert_eq!(json["agent_id"], "k8s-a");
        assert!(json.get("binary").is_none());
    }

    #[test]
    fn delivery_channel_is_replica_scoped() {
        assert_eq!(
            delivery_channel("replica-1"),
            "streamspace:replica:replica-1:deliver"
        );
    }
}
