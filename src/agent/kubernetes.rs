//! Kubernetes session backend: each session is a Deployment (replicas 1)
//! plus a ClusterIP Service on the template's VNC port, with an optional
//! per-user PersistentVolumeClaim that outlives the session. Hibernate and
//! wake scale the Deployment; session pods belong to the cluster, not to
//! the agent process, so agent failover leaves them untouched.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Api;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use async_trait::async_trait;

use crate::model::StartSessionSpec;

use super::backend::{BackendError, SessionBackend, TunnelStream};

const SESSION_LABEL: &str = "app=streamspace-session";
const READY_TIMEOUT: Duration = Duration::from_secs(180);
const READY_POLL: Duration = Duration::from_secs(2);

pub struct KubernetesBackend {
    client: kube::Client,
    namespace: String,
}

impl KubernetesBackend {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Scale the session Deployment; hibernate is 0, wake is 1.
    async fn scale(&self, session_id: Uuid, replicas: i32) -> Result<(), BackendError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(
                &resource_name(session_id),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref ae) if ae.code == 404 => {
                    BackendError::SessionNotFound(session_id)
                }
                other => other.into(),
            })?;
        Ok(())
    }

    /// Poll until the Deployment has an available replica and its pod is
    /// running with an address, then report the pod identity.
    async fn wait_ready(&self, session_id: Uuid) -> Result<(String, String), BackendError> {
        let name = resource_name(session_id);
        let deployments = self.deployments();
        let pods = self.pods();
        let selector = format!("streamspace.dev/session-id={session_id}");
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() > READY_TIMEOUT {
                return Err(BackendError::Timeout(format!(
                    "deployment {name} not ready after {}s",
                    READY_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;

            let deploy = match deployments.get(&name).await {
                Ok(d) => d,
                Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
                Err(e) => return Err(e.into()),
            };

            let available = deploy
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0)
                >= 1;
            if !available {
                continue;
            }

            let pod_list = pods
                .list(&ListParams::default().labels(&selector))
                .await?;
            let running = pod_list.items.into_iter().find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    == Some("Running")
            });
            if let Some(pod) = running {
                let pod_name = pod.metadata.name.clone().unwrap_or_default();
                let pod_ip = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .unwrap_or_default();
                if !pod_name.is_empty() && !pod_ip.is_empty() {
                    return Ok((pod_name, pod_ip));
                }
            }
        }
    }

    /// Per-user claim reused across sessions; intentionally orphaned from
    /// session lifetime so home data survives stop.
    async fn ensure_home_pvc(&self, principal: &str) -> Result<String, BackendError> {
        let name = home_claim_name(principal);
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    "app".to_owned(),
                    "streamspace-home".to_owned(),
                )])),
                annotations: Some(BTreeMap::from([(
                    "streamspace.dev/principal".to_owned(),
                    principal.to_owned(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_owned(),
                        Quantity("5Gi".to_owned()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.pvcs().create(&PostParams::default(), &claim).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(name)
    }
}

#[async_trait]
impl SessionBackend for KubernetesBackend {
    #[tracing::instrument(skip(self, spec), fields(%session_id), err)]
    async fn start_session(
        &self,
        session_id: Uuid,
        spec: &StartSessionSpec,
    ) -> Result<serde_json::Value, BackendError> {
        spec.template
            .validate()
            .map_err(BackendError::InvalidTemplate)?;

        let claim = if spec.template.persistent_home {
            Some(self.ensure_home_pvc(&spec.principal).await?)
        } else {
            None
        };

        let deployment = build_deployment(session_id, spec, claim.as_deref());
        let name = resource_name(session_id);

        let created = match self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
        {
            Ok(d) => d,
            // Redelivered command: the resources already exist, converge on
            // them instead of failing.
            Err(kube::Error::Api(ae)) if ae.code == 409 => self.deployments().get(&name).await?,
            Err(e) => return Err(e.into()),
        };

        let service = build_service(session_id, spec, created.metadata.uid.as_deref());
        match self.services().create(&PostParams::default(), &service).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(e.into()),
        }

        let (pod_name, pod_ip) = self.wait_ready(session_id).await?;

        tracing::info!(%session_id, %pod_name, "session pod ready");
        Ok(serde_json::json!({
            "pod_name": pod_name,
            "pod_ip": pod_ip,
            "deployment": name,
            "service": name,
            "namespace": self.namespace,
        }))
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn stop_session(&self, session_id: Uuid) -> Result<(), BackendError> {
        let name = resource_name(session_id);

        // The Service is owner-referenced to the Deployment, so garbage
        // collection would remove it anyway; explicit deletes make teardown
        // immediate. The home claim is deliberately left behind.
        match self.deployments().delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        match self.services().delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn hibernate_session(&self, session_id: Uuid) -> Result<(), BackendError> {
        self.scale(session_id, 0).await
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn wake_session(&self, session_id: Uuid) -> Result<serde_json::Value, BackendError> {
        self.scale(session_id, 1).await?;
        let (pod_name, pod_ip) = self.wait_ready(session_id).await?;
        Ok(serde_json::json!({
            "pod_name": pod_name,
            "pod_ip": pod_ip,
            "deployment": resource_name(session_id),
            "service": resource_name(session_id),
            "namespace": self.namespace,
        }))
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn open_tunnel(&self, session_id: Uuid) -> Result<TunnelStream, BackendError> {
        let deploy = self
            .deployments()
            .get(&resource_name(session_id))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref ae) if ae.code == 404 => {
                    BackendError::SessionNotFound(session_id)
                }
                other => other.into(),
            })?;

        let port = deploy
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.ports.as_ref())
            .and_then(|p| p.first())
            .map(|p| p.container_port)
            .ok_or(BackendError::NotReady(session_id))?;
        let port = u16::try_from(port).map_err(|_| BackendError::NotReady(session_id))?;

        let selector = format!("streamspace.dev/session-id={session_id}");
        let pod_list = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;
        let pod_name = pod_list
            .items
            .into_iter()
            .find(|pod| {
                pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .and_then(|pod| pod.metadata.name)
            .ok_or(BackendError::NotReady(session_id))?;

        let mut forwarder = self.pods().portforward(&pod_name, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or(BackendError::NotReady(session_id))?;

        // The forwarder owns the upgrade; keep it driven for the life of
        // the stream.
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::debug!(error = %e, "port-forward driver finished with error");
            }
        });

        Ok(Box::new(stream))
    }

    async fn session_count(&self) -> Result<i32, BackendError> {
        let list = self
            .deployments()
            .list(&ListParams::default().labels(SESSION_LABEL))
            .await?;
        Ok(i32::try_from(list.items.len()).unwrap_or(i32::MAX))
    }
}

// ---------------------------------------------------------------------------
// Resource construction
// ---------------------------------------------------------------------------

fn resource_name(session_id: Uuid) -> String {
    format!("session-{}", session_id.simple())
}

fn home_claim_name(principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("home-{}", &digest[..12])
}

fn session_labels(session_id: Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_owned(), "streamspace-session".to_owned()),
        (
            "streamspace.dev/session-id".to_owned(),
            session_id.to_string(),
        ),
    ])
}

fn build_deployment(
    session_id: Uuid,
    spec: &StartSessionSpec,
    home_claim: Option<&str>,
) -> Deployment {
    let labels = session_labels(session_id);
    let template = &spec.template;

    let mut limits = BTreeMap::new();
    if let Some(cpu) = template.cpu_limit_millis {
        limits.insert("cpu".to_owned(), Quantity(format!("{cpu}m")));
    }
    if let Some(mem) = template.memory_limit_mb {
        limits.insert("memory".to_owned(), Quantity(format!("{mem}Mi")));
    }

    let env: Vec<EnvVar> = template
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();
    if let Some(claim) = home_claim {
        volume_mounts.push(VolumeMount {
            name: "home".to_owned(),
            mount_path: "/home/streamspace".to_owned(),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "home".to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: "session".to_owned(),
        image: Some(template.image.clone()),
        env: if env.is_empty() { None } else { Some(env) },
        ports: Some(vec![ContainerPort {
            container_port: i32::from(template.vnc_port),
            name: Some("vnc".to_owned()),
            ..Default::default()
        }]),
        resources: if limits.is_empty() {
            None
        } else {
            Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            })
        },
        volume_mounts: if volume_mounts.is_empty() {
            None
        } else {
            Some(volume_mounts)
        },
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(resource_name(session_id)),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: if volumes.is_empty() { None } else { Some(volumes) },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(session_id: Uuid, spec: &StartSessionSpec, owner_uid: Option<&str>) -> Service {
    let labels = session_labels(session_id);
    let name = resource_name(session_id);

    let owner_references = owner_uid.map(|uid| {
        vec![OwnerReference {
            api_version: "apps/v1".to_owned(),
            kind: "Deployment".to_owned(),
            name: name.clone(),
            uid: uid.to_owned(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.clone()),
            owner_references,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("vnc".to_owned()),
                port: i32::from(spec.template.vnc_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionTemplate;
    use std::collections::BTreeMap as Map;

    fn spec() -> StartSessionSpec {
        StartSessionSpec {
            template: SessionTemplate {
                name: "firefox".into(),
                image: "streamspace/firefox:latest".into(),
                vnc_port: 5901,
                env: Map::from([("TZ".to_owned(), "UTC".to_owned())]),
                cpu_limit_millis: Some(500),
                memory_limit_mb: Some(512),
                persistent_home: true,
            },
            principal: "u1".into(),
        }
    }

    #[test]
    fn deployment_shape() {
        let session_id = Uuid::new_v4();
        let deploy = build_deployment(session_id, &spec(), Some("home-abc"));

        assert_eq!(
            deploy.metadata.name.as_deref(),
            Some(resource_name(session_id).as_str())
        );
        let dspec = deploy.spec.unwrap();
        assert_eq!(dspec.replicas, Some(1));

        let pod = dspec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("streamspace/firefox:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 5901);
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"].0, "500m");
        assert_eq!(limits["memory"].0, "512Mi");
        assert_eq!(
            pod.volumes.as_ref().unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "home-abc"
        );
    }

    #[test]
    fn service_owned_by_deployment() {
        let session_id = Uuid::new_v4();
        let svc = build_service(session_id, &spec(), Some("uid-123"));
        let owners = svc.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "Deployment");
        assert_eq!(owners[0].uid, "uid-123");
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 5901);
    }

    #[test]
    fn home_claim_is_stable_per_principal() {
        assert_eq!(home_claim_name("u1"), home_claim_name("u1"));
        assert_ne!(home_claim_name("u1"), home_claim_name("u2"));
        assert!(home_claim_name("u1").starts_with("home-"));
    }
}
