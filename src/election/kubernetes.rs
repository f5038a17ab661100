//! Lease election backed by a coordination/v1 Lease object. The object's
//! holder identity and renew time are the source of truth; writes go
//! through `replace` so the resource version arbitrates concurrent
//! acquisition attempts.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Api;
use kube::api::PostParams;

use super::{ElectionError, LeaseBackend, LeaseState};

pub struct KubernetesLease {
    api: Api<Lease>,
}

impl KubernetesLease {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseBackend for KubernetesLease {
    async fn acquire_or_renew(
        &self,
        identity: &str,
        lease_name: &str,
        duration: Duration,
    ) -> Result<LeaseState, ElectionError> {
        let now = MicroTime(k8s_openapi::jiff::Timestamp::now());
        let duration_secs =
            i32::try_from(duration.as_secs()).map_err(|e| ElectionError::Other(e.into()))?;

        let existing = match self.api.get(lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let fresh = Lease {
                    metadata: ObjectMeta {
                        name: Some(lease_name.to_owned()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(identity.to_owned()),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_duration_seconds: Some(duration_secs),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                return match self.api.create(&PostParams::default(), &fresh).await {
                    Ok(_) => Ok(LeaseState::Acquired),
                    // Lost the creation race.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        Ok(LeaseState::NotLeader { holder: None })
                    }
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone();
        let held_by_us = holder.as_deref() == Some(identity);

        let expired = spec.renew_time.as_ref().is_none_or(|renew| {
            let age = k8s_openapi::jiff::Timestamp::now().duration_since(renew.0);
            age.as_secs() >= i64::from(spec.lease_duration_seconds.unwrap_or(duration_secs))
        });

        if !held_by_us && !expired {
            return Ok(LeaseState::NotLeader { holder });
        }

        let transitions = if held_by_us {
            spec.lease_transitions
        } else {
            Some(spec.lease_transitions.unwrap_or(0) + 1)
        };
        let acquire_time = if held_by_us {
            spec.acquire_time
        } else {
            Some(now.clone())
        };

        let mut updated = existing;
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(identity.to_owned()),
            acquire_time,
            renew_time: Some(now),
            lease_duration_seconds: Some(duration_secs),
            lease_transitions: transitions,
            ..Default::default()
        });

        match self
            .api
            .replace(lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(LeaseState::Acquired),
            // Resource version conflict: another replica won this round.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Ok(LeaseState::NotLeader { holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, identity: &str, lease_name: &str) -> Result<(), ElectionError> {
        let mut lease = match self.api.get(lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(identity) {
            return Ok(());
        }

        lease.spec = Some(LeaseSpec {
            holder_identity: None,
            renew_time: None,
            ..spec
        });
        match self
            .api
            .replace(lease_name, &PostParams::default(), &lease)
            .await
        {
            // A concurrent takeover already owns it; nothing to release.
            Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
