//! Docker session backend: each session is one container created from the
//! template image, with the VNC port published on the host loopback and an
//! optional per-user named volume that outlives the session. Hibernate and
//! wake stop and restart the container without removing it.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::volume::CreateVolumeOptions;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::model::StartSessionSpec;

use super::backend::{BackendError, SessionBackend, TunnelStream};

const SESSION_LABEL: &str = "streamspace.session-id";

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self, BackendError> {
        Ok(Self {
            docker: Docker::connect_with_socket_defaults()?,
        })
    }

    /// The published loopback port for the container's VNC endpoint.
    async fn published_port(&self, name: &str) -> Result<u16, BackendError> {
        let inspect = self.docker.inspect_container(name, None).await?;
        let ports = inspect
            .network_settings
            .and_then(|net| net.ports)
            .unwrap_or_default();

        ports
            .values()
            .flatten()
            .flatten()
            .find_map(|binding: &PortBinding| {
                binding.host_port.as_deref().and_then(|p| p.parse().ok())
            })
            .ok_or_else(|| anyhow::anyhow!("container {name} publishes no port").into())
    }

    async fn ensure_home_volume(&self, principal: &str) -> Result<String, BackendError> {
        let name = home_volume_name(principal);
        // Volume creation is idempotent on the daemon side.
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.clone(),
                labels: HashMap::from([(
                    "streamspace.principal".to_owned(),
                    principal.to_owned(),
                )]),
                ..Default::default()
            })
            .await?;
        Ok(name)
    }
}

#[async_trait]
impl SessionBackend for DockerBackend {
    #[tracing::instrument(skip(self, spec), fields(%session_id), err)]
    async fn start_session(
        &self,
        session_id: Uuid,
        spec: &StartSessionSpec,
    ) -> Result<serde_json::Value, BackendError> {
        spec.template
            .validate()
            .map_err(BackendError::InvalidTemplate)?;

        let template = &spec.template;
        let name = container_name(session_id);
        let port_key = format!("{}/tcp", template.vnc_port);

        let volume = if template.persistent_home {
            Some(self.ensure_home_volume(&spec.principal).await?)
        } else {
            None
        };

        let env: Vec<String> = template
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_owned()),
                    host_port: None,
                }]),
            )])),
            memory: template.memory_limit_mb.map(|mb| mb * 1024 * 1024),
            nano_cpus: template.cpu_limit_millis.map(|millis| millis * 1_000_000),
            binds: volume.map(|v| vec![format!("{v}:/home/streamspace")]),
            ..Default::default()
        };

        let config = Config {
            image: Some(template.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(HashMap::from([
                ("app".to_owned(), "streamspace-session".to_owned()),
                (SESSION_LABEL.to_owned(), session_id.to_string()),
            ])),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        match self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
        {
            Ok(_) => {}
            // Redelivered command: converge on the existing container.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        match self.docker.start_container::<String>(&name, None).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let inspect = self.docker.inspect_container(&name, None).await?;
        let container_id = inspect.id.unwrap_or_default();
        let host_port = self.published_port(&name).await?;

        tracing::info!(%session_id, %container_id, host_port, "session container started");
        Ok(serde_json::json!({
            "container_id": container_id,
            "container_name": name,
            "host_port": host_port,
        }))
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn stop_session(&self, session_id: Uuid) -> Result<(), BackendError> {
        let name = container_name(session_id);

        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        // v: false keeps the per-user named volume.
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn hibernate_session(&self, session_id: Uuid) -> Result<(), BackendError> {
        let name = container_name(session_id);
        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(BackendError::SessionNotFound(session_id)),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn wake_session(&self, session_id: Uuid) -> Result<serde_json::Value, BackendError> {
        let name = container_name(session_id);
        match self.docker.start_container::<String>(&name, None).await {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(BackendError::SessionNotFound(session_id)),
            Err(e) => return Err(e.into()),
        }

        let inspect = self.docker.inspect_container(&name, None).await?;
        // The loopback port can move across restarts; report it fresh.
        let host_port = self.published_port(&name).await?;
        Ok(serde_json::json!({
            "container_id": inspect.id.unwrap_or_default(),
            "container_name": name,
            "host_port": host_port,
        }))
    }

    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn open_tunnel(&self, session_id: Uuid) -> Result<TunnelStream, BackendError> {
        let name = container_name(session_id);

        let inspect = match self.docker.inspect_container(&name, None).await {
            Ok(i) => i,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(BackendError::SessionNotFound(session_id)),
            Err(e) => return Err(e.into()),
        };
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(BackendError::NotReady(session_id));
        }

        let host_port = self.published_port(&name).await?;
        let stream = TcpStream::connect(("127.0.0.1", host_port)).await?;
        Ok(Box::new(stream))
    }

    async fn session_count(&self) -> Result<i32, BackendError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([("label".to_owned(), vec![SESSION_LABEL.to_owned()])]),
                ..Default::default()
            }))
            .await?;
        Ok(i32::try_from(containers.len()).unwrap_or(i32::MAX))
    }
}

fn container_name(session_id: Uuid) -> String {
    format!("streamspace-session-{}", session_id.simple())
}

fn home_volume_name(principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("streamspace-home-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_distinct_and_stable() {
        let a = Uuid::new_v4();
        assert_eq!(container_name(a), container_name(a));
        assert_ne!(container_name(a), container_name(Uuid::new_v4()));
        assert!(container_name(a).starts_with("streamspace-session-"));
    }

    #[test]
    fn home_volume_hashes_principal() {
        assert_eq!(home_volume_name("u1"), home_volume_name("u1"));
        assert_ne!(home_volume_name("u1"), home_volume_name("u2"));
    }
}
