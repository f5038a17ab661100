use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::model::StartSessionSpec;

/// Byte stream to a session container's VNC port, relayed frame-by-frame
/// over the agent channel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("session {0} has no platform resources")]
    SessionNotFound(Uuid),

    #[error("session {0} is not in a tunnelable state")]
    NotReady(Uuid),

    #[error("provisioning timed out: {0}")]
    Timeout(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The abstract contract both platform agents implement. Start/wake return
/// the platform metadata reported back with the command result (pod name,
/// container id, addresses).
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Provision the session's native resources and wait until they serve.
    async fn start_session(
        &self,
        session_id: Uuid,
        spec: &StartSessionSpec,
    ) -> Result<serde_json::Value, BackendError>;

    /// Tear down compute resources. Per-user persistent data survives.
    async fn stop_session(&self, session_id: Uuid) -> Result<(), BackendError>;

    /// Park the session without releasing its resources.
    async fn hibernate_session(&self, session_id: Uuid) -> Result<(), BackendError>;

    /// Resume a hibernated session; returns refreshed platform metadata.
    async fn wake_session(&self, session_id: Uuid) -> Result<serde_json::Value, BackendError>;

    /// Dial the session's VNC port.
    async fn open_tunnel(&self, session_id: Uuid) -> Result<TunnelStream, BackendError>;

    /// Sessions this agent currently hosts (running or hibernated); reported
    /// in every heartbeat so the scheduler sees real occupancy.
    async fn session_count(&self) -> Result<i32, BackendError>;
}
