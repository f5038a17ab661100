use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AgentCapacity, CommandType, Platform, SessionState};

/// Outcome an agent reports for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Control messages carried as JSON text frames on the agent channel.
/// The `type` field is the discriminator; unknown types are logged and
/// ignored by both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// agent → cp, first frame on every connection.
    Register {
        agent_id: String,
        platform: Platform,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        capacity: AgentCapacity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cluster_id: Option<String>,
    },
    RegisterAck {
        agent_uuid: Uuid,
    },
    RegisterReject {
        reason: String,
    },
    /// agent → cp, periodic; refreshes liveness and capacity.
    Heartbeat {
        current_sessions: i32,
    },
    /// cp → agent.
    Command {
        command_id: Uuid,
        session_id: Uuid,
        command_type: CommandType,
        payload: serde_json::Value,
    },
    /// agent → cp, immediately on command receipt.
    Ack {
        command_id: Uuid,
    },
    /// agent → cp, when a command finishes either way.
    Result {
        command_id: Uuid,
        status: ResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// agent → cp, unsolicited session state change (e.g. pod crashed).
    SessionEvent {
        session_id: Uuid,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// cp → agent: establish the VNC tunnel for a session. Tunnel control
    /// travels as these dedicated frames, not `command`-wrapped; the rows
    /// are persisted commands, so the id lets the agent ack and report
    /// through the same lifecycle.
    VncOpen {
        command_id: Uuid,
        session_id: Uuid,
    },
    /// cp → agent: tear the session's VNC tunnel down.
    VncClose {
        command_id: Uuid,
        session_id: Uuid,
    },
}

impl ChannelMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_wire_shape() {
        let msg = ChannelMessage::Register {
            agent_id: "k8s-a".into(),
            platform: Platform::Kubernetes,
            region: Some("us-east-1".into()),
            capacity: AgentCapacity {
                max_sessions: 100,
                current_sessions: 0,
                cpu_limit_millis: None,
                memory_limit_mb: None,
            },
            metadata: None,
            cluster_id: None,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["agent_id"], "k8s-a");
        assert_eq!(json["platform"], "kubernetes");
        assert_eq!(json["capacity"]["max_sessions"], 100);
    }

    #[test]
    fn command_round_trips() {
        let msg = ChannelMessage::Command {
            command_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            command_type: CommandType::StartSession,
            payload: serde_json::json!({"template": {"name": "firefox"}}),
        };
        let parsed: ChannelMessage = serde_json::from_str(&msg.to_json()).unwrap();
        match parsed {
            ChannelMessage::Command { command_type, .. } => {
                assert_eq!(command_type, CommandType::StartSession);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn tunnel_control_is_a_dedicated_frame() {
        let command_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let msg = ChannelMessage::VncOpen {
            command_id,
            session_id,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "vnc_open");
        assert_eq!(json["command_id"], command_id.to_string());
        assert_eq!(json["session_id"], session_id.to_string());
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn unknown_type_fails_parse() {
        let err = serde_json::from_str::<ChannelMessage>(r#"{"type":"mystery"}"#);
        assert!(err.is_err());
    }
}
