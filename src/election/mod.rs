//! Leader election for replicated agents: among N replicas watching the
//! same platform scope, exactly one holds the lease and opens the channel.
//!
//! The lease value is the only authority. Split-brain from clock skew is
//! resolved upstream by the hub's latest-connection-wins: a superseded
//! leader's channel is closed and it must not resume work until it
//! re-acquires.

pub mod file;
pub mod kubernetes;
pub mod redis;
pub mod swarm;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Acquired,
    NotLeader { holder: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The abstract lease contract. A leader must renew within
/// `renew_deadline`; followers poll every `retry_period`.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn acquire_or_renew(
        &self,
        identity: &str,
        lease_name: &str,
        duration: Duration,
    ) -> Result<LeaseState, ElectionError>;

    /// Explicit release on orderly shutdown so a follower takes over
    /// immediately instead of waiting out the TTL.
    async fn release(&self, identity: &str, lease_name: &str) -> Result<(), ElectionError>;
}

/// Poll the lease and publish leadership over the watch channel. A leader
/// that cannot renew within `renew_deadline` demotes itself even if the
/// backend is merely unreachable.
pub async fn run_elector(
    backend: Arc<dyn LeaseBackend>,
    identity: String,
    lease_name: String,
    cfg: LeaseConfig,
    leader_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut is_leader = false;
    let mut last_renewed = Instant::now();
    tracing::info!(%identity, %lease_name, "elector started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(cfg.retry_period) => {
                match backend
                    .acquire_or_renew(&identity, &lease_name, cfg.duration)
                    .await
                {
                    Ok(LeaseState::Acquired) => {
                        last_renewed = Instant::now();
                        if !is_leader {
                            tracing::info!(%identity, %lease_name, "lease acquired");
                            is_leader = true;
                            let _ = leader_tx.send(true);
                        }
                    }
                    Ok(LeaseState::NotLeader { holder }) => {
                        if is_leader {
                            tracing::warn!(%identity, ?holder, "lease lost");
                            is_leader = false;
                            let _ = leader_tx.send(false);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, %lease_name, "lease backend unreachable");
                        if is_leader && last_renewed.elapsed() > cfg.renew_deadline {
                            tracing::warn!(%identity, "renew deadline missed, stepping down");
                            is_leader = false;
                            let _ = leader_tx.send(false);
                        }
                    }
                }
            }
        }
    }

    if is_leader {
        if let Err(e) = backend.release(&identity, &lease_name).await {
            tracing::warn!(error = %e, %lease_name, "lease release failed");
        } else {
            tracing::info!(%identity, %lease_name, "lease released");
        }
        let _ = leader_tx.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted backend: pops one state per poll.
    struct Scripted {
        states: Mutex<Vec<LeaseState>>,
        released: Mutex<bool>,
    }

    #[async_trait]
    impl LeaseBackend for Scripted {
        async fn acquire_or_renew(
            &self,
            _identity: &str,
            _lease_name: &str,
            _duration: Duration,
        ) -> Result<LeaseState, ElectionError> {
            let mut states = self.states.lock().unwrap();
            if states.is_empty() {
                Ok(LeaseState::Acquired)
            } else {
                Ok(states.remove(0))
            }
        }

        async fn release(&self, _identity: &str, _lease_name: &str) -> Result<(), ElectionError> {
            *self.released.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elector_promotes_demotes_and_releases() {
        let backend = Arc::new(Scripted {
            states: Mutex::new(vec![
                LeaseState::NotLeader { holder: Some("other".into()) },
                LeaseState::Acquired,
                LeaseState::NotLeader { holder: Some("other".into()) },
                LeaseState::Acquired,
            ]),
            released: Mutex::new(false),
        });
        let (leader_tx, mut leader_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let cfg = LeaseConfig {
            duration: Duration::from_millis(150),
            renew_deadline: Duration::from_millis(100),
            retry_period: Duration::from_millis(10),
        };
        let task = tokio::spawn(run_elector(
            backend.clone(),
            "me".into(),
            "agent-x".into(),
            cfg,
            leader_tx,
            shutdown_rx,
        ));

        // follower → leader
        leader_rx.changed().await.unwrap();
        assert!(*leader_rx.borrow());
        // leader → follower (lease taken by someone else)
        leader_rx.changed().await.unwrap();
        assert!(!*leader_rx.borrow());
        // follower → leader again
        leader_rx.changed().await.unwrap();
        assert!(*leader_rx.borrow());

        // orderly shutdown releases the held lease
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(*backend.released.lock().unwrap());
        assert!(!*leader_rx.borrow());
    }
}
