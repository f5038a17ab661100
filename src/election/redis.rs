//! Lease election backed by a single redis/valkey key with TTL.
//! Acquisition is atomic set-if-absent with expiry; renewal re-sets the
//! key only while it still names this identity.

use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::SetOptions;

use super::{ElectionError, LeaseBackend, LeaseState};

pub struct RedisLease {
    pool: fred::clients::Pool,
}

impl RedisLease {
    pub async fn connect(url: &str) -> Result<Self, ElectionError> {
        // Lease traffic is a single key polled every couple of seconds; two
        // connections cover the poll and the release.
        let pool = crate::store::valkey::connect(url, 2)
            .await
            .map_err(ElectionError::Other)?;
        Ok(Self { pool })
    }

    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

fn lease_key(lease_name: &str) -> String {
    format!("streamspace:lease:{lease_name}")
}

#[async_trait]
impl LeaseBackend for RedisLease {
    async fn acquire_or_renew(
        &self,
        identity: &str,
        lease_name: &str,
        duration: Duration,
    ) -> Result<LeaseState, ElectionError> {
        let key = lease_key(lease_name);
        let ttl_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);

        // SET NX PX: succeeds only when no one holds the lease.
        let acquired: Option<String> = self
            .pool
            .set(
                &key,
                identity,
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        if acquired.is_some() {
            return Ok(LeaseState::Acquired);
        }

        let holder: Option<String> = self.pool.get(&key).await?;
        if holder.as_deref() == Some(identity) {
            // Still ours: re-set with a fresh TTL. XX guards against the key
            // having just expired under us.
            let renewed: Option<String> = self
                .pool
                .set(
                    &key,
                    identity,
                    Some(Expiration::PX(ttl_ms)),
                    Some(SetOptions::XX),
                    false,
                )
                .await?;
            if renewed.is_some() {
                return Ok(LeaseState::Acquired);
            }
        }

        Ok(LeaseState::NotLeader { holder })
    }

    async fn release(&self, identity: &str, lease_name: &str) -> Result<(), ElectionError> {
        let key = lease_key(lease_name);
        let holder: Option<String> = self.pool.get(&key).await?;
        if holder.as_deref() == Some(identity) {
            self.pool.del::<(), _>(&key).await?;
        }
        Ok(())
    }
}
