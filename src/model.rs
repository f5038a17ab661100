//! Shared domain types: the enumerations driving the agent, session, and
//! command state machines, and the row structs they persist to.
//!
//! Enum values travel as snake_case strings both on the wire (serde) and in
//! the database (TEXT columns); rows keep the raw strings and callers parse
//! where a typed value matters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Kubernetes,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Hibernated,
    Terminating,
    Terminated,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StartSession,
    StopSession,
    HibernateSession,
    WakeSession,
    VncOpen,
    VncClose,
}

impl CommandType {
    /// Commands whose timeout or failure takes the session down with them.
    pub fn is_session_critical(self) -> bool {
        matches!(self, Self::StartSession | Self::WakeSession)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    )),
                }
            }
        }
    };
}

text_enum!(Platform {
    Kubernetes => "kubernetes",
    Docker => "docker",
});

text_enum!(AgentStatus {
    Online => "online",
    Offline => "offline",
    Draining => "draining",
});

text_enum!(SessionState {
    Pending => "pending",
    Running => "running",
    Hibernated => "hibernated",
    Terminating => "terminating",
    Terminated => "terminated",
    Failed => "failed",
});

text_enum!(CommandType {
    StartSession => "start_session",
    StopSession => "stop_session",
    HibernateSession => "hibernate_session",
    WakeSession => "wake_session",
    VncOpen => "vnc_open",
    VncClose => "vnc_close",
});

text_enum!(CommandStatus {
    Pending => "pending",
    Sent => "sent",
    Acked => "acked",
    Completed => "completed",
    Failed => "failed",
    Timeout => "timeout",
});

/// Capacity an agent advertises at register time; `current_sessions` is
/// refreshed by every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapacity {
    pub max_sessions: i32,
    #[serde(default)]
    pub current_sessions: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit_millis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub platform: String,
    pub region: Option<String>,
    pub status: String,
    pub max_sessions: i32,
    pub current_sessions: i32,
    pub cpu_limit_millis: Option<i64>,
    pub memory_limit_mb: Option<i64>,
    pub connection_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub cluster_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: Uuid,
    pub principal: String,
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

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandRecord {
    pub id: Uuid,
    pub agent_id: Option<String>,
    pub session_id: Uuid,
    pub command_type: String,
    pub command_data: serde_json::Value,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub late_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A resolved template definition. The control plane embeds this in
/// `start_session` payloads; agents validate it again before provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTemplate {
    pub name: String,
    pub image: String,
    pub vnc_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit_millis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<i64>,
    #[serde(default)]
    pub persistent_home: bool,
}

impl SessionTemplate {
    /// Reject templates that cannot possibly provision.
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err(format!("template {}: missing image", self.name));
        }
        if self.vnc_port == 0 {
            return Err(format!("template {}: invalid VNC port", self.name));
        }
        Ok(())
    }
}

/// Payload of a `start_session` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionSpec {
    pub template: SessionTemplate,
    pub principal: String,
}
