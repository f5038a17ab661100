//! Swarm-mode election: the orchestrator schedules exactly one task for the
//! agent service, so being the scheduled replica IS holding the lease. The
//! backend reports leadership unconditionally and leaves failover to
//! Swarm's rescheduling; the hub's latest-connection-wins covers the
//! overlap window while an old task drains.

use std::time::Duration;

use async_trait::async_trait;

use super::{ElectionError, LeaseBackend, LeaseState};

pub struct SwarmLease;

impl SwarmLease {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwarmLease {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseBackend for SwarmLease {
    async fn acquire_or_renew(
        &self,
        _identity: &str,
        _lease_name: &str,
        _duration: Duration,
    ) -> Result<LeaseState, ElectionError> {
        Ok(LeaseState::Acquired)
    }

    async fn release(&self, _identity: &str, _lease_name: &str) -> Result<(), ElectionError> {
        Ok(())
    }
}
