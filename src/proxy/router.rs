//! The stream table pairing agent-side binary frames with browser-side
//! viewers, keyed by the 14-byte session key carried in frame headers.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::frame::session_key;

/// Categorized close reasons surfaced to the client so the UI can react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AgentGone,
    AgentRejected,
    SessionTerminated,
    IdleTimeout,
    ClientClosed,
    ViewerLimit,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentGone => "agent_gone",
            Self::AgentRejected => "agent_rejected",
            Self::SessionTerminated => "session_terminated",
            Self::IdleTimeout => "idle_timeout",
            Self::ClientClosed => "client_closed",
            Self::ViewerLimit => "viewer_limit",
        }
    }
}

#[derive(Debug)]
pub enum ViewerEvent {
    Data(Bytes),
    Close(CloseReason),
}

struct Viewer {
    id: Uuid,
    tx: mpsc::Sender<ViewerEvent>,
}

struct SessionStreams {
    session_id: Uuid,
    agent_id: String,
    viewers: Vec<Viewer>,
}

/// Process-wide table of open proxy streams. Reads happen on every binary
/// frame off every agent channel, so the map is a sharded concurrent map;
/// senders are cloned out before any await.
#[derive(Default)]
pub struct VncRouter {
    streams: DashMap<String, SessionStreams>,
}

impl VncRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a viewer to the session's stream entry. `None` when the
    /// configured viewer limit is already reached.
    pub fn attach(
        &self,
        key: &str,
        session_id: Uuid,
        agent_id: &str,
        max_viewers: usize,
    ) -> Option<(Uuid, mpsc::Receiver<ViewerEvent>)> {
        let (tx, rx) = mpsc::channel(32);
        let viewer_id = Uuid::new_v4();

        let mut entry = self
            .streams
            .entry(key.to_owned())
            .or_insert_with(|| SessionStreams {
                session_id,
                agent_id: agent_id.to_owned(),
                viewers: Vec::new(),
            });

        if entry.viewers.len() >= max_viewers {
            return None;
        }
        entry.viewers.push(Viewer { id: viewer_id, tx });
        Some((viewer_id, rx))
    }

    /// Remove one viewer. Returns true when it was the last, meaning the
    /// agent-side tunnel should close too.
    pub fn detach(&self, key: &str, viewer_id: Uuid) -> bool {
        let mut last = false;
        if let Some(mut entry) = self.streams.get_mut(key) {
            entry.viewers.retain(|v| v.id != viewer_id);
            last = entry.viewers.is_empty();
        }
        if last {
            self.streams.remove(key);
        }
        last
    }

    pub fn viewer_count(&self, key: &str) -> usize {
        self.streams.get(key).map_or(0, |e| e.viewers.len())
    }

    /// Forward an agent→client payload to every viewer of the session.
    /// Bounded sends: a stalled viewer stalls its own channel, which stalls
    /// the agent channel reader — flow control carries end to end. Returns
    /// false when the session has no viewers.
    pub async fn deliver(&self, key: &str, payload: Bytes) -> bool {
        let senders: Vec<mpsc::Sender<ViewerEvent>> = match self.streams.get(key) {
            Some(entry) => entry.viewers.iter().map(|v| v.tx.clone()).collect(),
            None => return false,
        };
        if senders.is_empty() {
            return false;
        }
        for tx in senders {
            let _ = tx.send(ViewerEvent::Data(payload.clone())).await;
        }
        true
    }

    /// Close every viewer of a session with a categorized reason.
    pub fn close_session(&self, session_id: Uuid, reason: CloseReason) {
        let key = session_key(session_id);
        if let Some((_, entry)) = self.streams.remove(&key) {
            for viewer in entry.viewers {
                let _ = viewer.tx.try_send(ViewerEvent::Close(reason));
            }
        }
    }

    /// Close every stream routed at the given agent (channel loss). The
    /// session's `agent_id` was resolved once at open; clients must
    /// reconnect and may land on a rescheduled agent.
    pub fn close_for_agent(&self, agent_id: &str, reason: CloseReason) {
        let keys: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| entry.agent_id == agent_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.streams.remove(&key) {
                tracing::info!(session_id = %entry.session_id, %agent_id, "closing vnc stream, agent lost");
                for viewer in entry.viewers {
                    let _ = viewer.tx.try_send(ViewerEvent::Close(reason));
                }
            }
        }
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}
