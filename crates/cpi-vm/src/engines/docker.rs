//! Docker engine using bollard
//!
//! Every call is bounded by one of the timeouts in [`crate::engine`] so a
//! hung daemon surfaces as [`EngineError::Timeout`] instead of stalling the
//! CPI process.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, EndpointSettings, Ipam, IpamConfig,
    NetworkConnectRequest, NetworkCreateRequest, NetworkingConfig, VolumeCreateRequest,
};
use bollard::query_parameters::{
    CreateContainerOptions, DownloadFromContainerOptionsBuilder, KillContainerOptionsBuilder,
    ListVolumesOptions, LogsOptions, RemoveContainerOptions, RemoveImageOptionsBuilder,
    RemoveVolumeOptionsBuilder,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptionsBuilder,
    WaitContainerOptions,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

use crate::container::NODE_CONSTRAINT_PREFIX;
use crate::engine::{
    ContainerSpec, Engine, EngineError, EngineResult, ExecState, HostResources, NetworkRequest,
    Platform, DEFAULT_TIMEOUT, LONG_TIMEOUT, SHORT_TIMEOUT,
};

/// [`Engine`] backed by a Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine").finish_non_exhaustive()
    }
}

impl DockerEngine {
    /// Wrap an already connected client; see [`crate::connect`] for endpoint
    /// discovery.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> EngineResult<T>
where
    F: Future<Output = Result<T, BollardError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(map_error),
        Err(_) => Err(EngineError::Timeout { operation, limit }),
    }
}

fn map_error(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Transport(other.to_string()),
    }
}

/// Rebuild a creatable spec from an inspect response.
///
/// The inspected `Config` shares its wire names with the create body, so it
/// is carried over through JSON rather than field by field.
/// Node holding an inspected container.
///
/// Clustered engines report names as `/<node>/<name>`; otherwise the node
/// constraint the container was created with is the best record.
fn node_from_inspect(name: Option<&str>, env: &[String]) -> Option<String> {
    let from_name = name
        .map(|name| name.trim_start_matches('/'))
        .and_then(|name| name.split_once('/'))
        .map(|(node, _)| node)
        .filter(|node| !node.is_empty());
    let from_env = || {
        env.iter()
            .find_map(|entry| entry.strip_prefix(NODE_CONSTRAINT_PREFIX))
            .filter(|node| !node.is_empty())
    };
    from_name.or_else(from_env).map(str::to_string)
}

pub(crate) fn spec_from_inspect(inspect: ContainerInspectResponse) -> EngineResult<ContainerSpec> {
    let mut config: ContainerCreateBody = match inspect.config {
        Some(config) => serde_json::to_value(config)
            .and_then(serde_json::from_value)
            .map_err(|e| EngineError::Malformed(format!("container config: {e}")))?,
        None => ContainerCreateBody::default(),
    };
    config.host_config = inspect.host_config;
    config.networking_config = None;

    let endpoints = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default();

    let node = node_from_inspect(
        inspect.name.as_deref(),
        config.env.as_deref().unwrap_or_default(),
    );
    let mut spec = ContainerSpec {
        config,
        endpoints,
        platform: Platform::default(),
        node,
    };
    spec.platform = spec
        .recorded_platform()
        .or_else(|| inspect.platform.as_deref().and_then(Platform::parse))
        .unwrap_or_default();
    Ok(spec)
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        bounded("ping", SHORT_TIMEOUT, self.docker.ping())
            .await
            .map(|_| ())
    }

    async fn host_resources(&self) -> EngineResult<HostResources> {
        let info = bounded("info", SHORT_TIMEOUT, self.docker.info()).await?;
        Ok(HostResources {
            total_memory: info.mem_total.unwrap_or(0),
            cpus: info.ncpu.unwrap_or(0),
        })
    }

    #[instrument(skip(self), fields(otel.name = "container.inspect", container.id = %name))]
    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerSpec> {
        let inspect = bounded(
            "inspect_container",
            SHORT_TIMEOUT,
            self.docker.inspect_container(name, None),
        )
        .await?;
        spec_from_inspect(inspect)
    }

    #[instrument(
        skip(self, spec),
        fields(
            otel.name = "container.create",
            container.id = name.unwrap_or("<generated>"),
            container.image.name = spec.image().unwrap_or_default(),
            platform = %spec.platform,
        )
    )]
    async fn create_container(
        &self,
        name: Option<&str>,
        spec: &ContainerSpec,
    ) -> EngineResult<String> {
        let mut body = spec.config.clone();
        if !spec.endpoints.is_empty() {
            body.networking_config = Some(NetworkingConfig {
                endpoints_config: Some(spec.endpoints.clone()),
            });
        }

        let options = CreateContainerOptions {
            name: name.map(str::to_string),
            platform: spec.platform.to_string(),
        };

        let created = bounded(
            "create_container",
            DEFAULT_TIMEOUT,
            self.docker.create_container(Some(options), body),
        )
        .await?;

        tracing::debug!(container = ?name, id = %created.id, "container created");
        Ok(created.id)
    }

    #[instrument(skip(self), fields(otel.name = "container.start", container.id = %name))]
    async fn start_container(&self, name: &str) -> EngineResult<()> {
        bounded(
            "start_container",
            DEFAULT_TIMEOUT,
            self.docker
                .start_container(name, None::<StartContainerOptions>),
        )
        .await
    }

    #[instrument(skip(self), fields(otel.name = "container.kill", container.id = %name))]
    async fn kill_container(&self, name: &str, signal: &str) -> EngineResult<()> {
        let options = KillContainerOptionsBuilder::new().signal(signal).build();
        bounded(
            "kill_container",
            SHORT_TIMEOUT,
            self.docker.kill_container(name, Some(options)),
        )
        .await
    }

    #[instrument(
        skip(self),
        fields(otel.name = "container.stop", container.id = %name, grace_ms = %grace.as_millis())
    )]
    async fn stop_container(&self, name: &str, grace: Duration) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            signal: None,
        };
        bounded(
            "stop_container",
            DEFAULT_TIMEOUT,
            self.docker.stop_container(name, Some(options)),
        )
        .await
    }

    #[instrument(skip(self), fields(otel.name = "container.remove", container.id = %name))]
    async fn remove_container(&self, name: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        bounded(
            "remove_container",
            SHORT_TIMEOUT,
            self.docker.remove_container(name, Some(options)),
        )
        .await
    }

    async fn wait_container(&self, name: &str) -> EngineResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(name, Some(options));

        let next = tokio::time::timeout(LONG_TIMEOUT, stream.next())
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "wait_container",
                limit: LONG_TIMEOUT,
            })?;

        match next {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(e)),
            None => Err(EngineError::Transport(format!(
                "wait stream for '{name}' closed unexpectedly"
            ))),
        }
    }

    async fn container_logs(&self, name: &str) -> EngineResult<String> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            timestamps: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));

        bounded("container_logs", SHORT_TIMEOUT, async move {
            let mut output = String::new();
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk?.to_string());
            }
            Ok::<_, BollardError>(output)
        })
        .await
    }

    #[instrument(
        skip(self, request),
        fields(otel.name = "network.create", network = %request.name, driver = %request.driver)
    )]
    async fn create_network(&self, request: &NetworkRequest) -> EngineResult<()> {
        let ipam = request.subnet.map(|subnet| Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![IpamConfig {
                subnet: Some(subnet.to_string()),
                gateway: request.gateway.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let body = NetworkCreateRequest {
            name: request.name.clone(),
            driver: Some(request.driver.clone()),
            enable_ipv6: Some(request.enable_ipv6),
            internal: Some(false),
            attachable: Some(false),
            ipam,
            ..Default::default()
        };

        bounded(
            "create_network",
            DEFAULT_TIMEOUT,
            self.docker.create_network(body),
        )
        .await
        .map(|_| ())
    }

    #[instrument(
        skip(self, endpoint),
        fields(otel.name = "network.connect", network = %network, container.id = %container)
    )]
    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSettings,
    ) -> EngineResult<()> {
        let body = NetworkConnectRequest {
            container: container.to_string(),
            endpoint_config: Some(endpoint.clone()),
        };
        bounded(
            "connect_network",
            DEFAULT_TIMEOUT,
            self.docker.connect_network(network, body),
        )
        .await
    }

    #[instrument(skip(self), fields(otel.name = "volume.create", volume = %name))]
    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<()> {
        let options = VolumeCreateRequest {
            name: Some(name.to_string()),
            driver: Some(driver.to_string()),
            ..Default::default()
        };
        bounded(
            "create_volume",
            DEFAULT_TIMEOUT,
            self.docker.create_volume(options),
        )
        .await
        .map(|_| ())
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<()> {
        bounded(
            "inspect_volume",
            SHORT_TIMEOUT,
            self.docker.inspect_volume(name),
        )
        .await
        .map(|_| ())
    }

    async fn list_volumes(&self) -> EngineResult<Vec<String>> {
        let response = bounded(
            "list_volumes",
            SHORT_TIMEOUT,
            self.docker.list_volumes(None::<ListVolumesOptions>),
        )
        .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    #[instrument(skip(self), fields(otel.name = "volume.remove", volume = %name))]
    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()> {
        let options = RemoveVolumeOptionsBuilder::new().force(force).build();
        bounded(
            "remove_volume",
            SHORT_TIMEOUT,
            self.docker.remove_volume(name, Some(options)),
        )
        .await
    }

    #[instrument(skip(self), fields(otel.name = "image.remove", container.image.name = %name))]
    async fn remove_image(&self, name: &str) -> EngineResult<()> {
        let options = RemoveImageOptionsBuilder::new().force(true).build();
        bounded(
            "remove_image",
            DEFAULT_TIMEOUT,
            self.docker.remove_image(name, Some(options), None),
        )
        .await
        .map(|_| ())
    }

    async fn copy_from_container(&self, name: &str, path: &str) -> EngineResult<Vec<u8>> {
        let options = DownloadFromContainerOptionsBuilder::new().path(path).build();
        let mut stream = self.docker.download_from_container(name, Some(options));

        bounded("copy_from_container", DEFAULT_TIMEOUT, async move {
            let mut archive = Vec::new();
            while let Some(chunk) = stream.next().await {
                archive.extend_from_slice(&chunk?);
            }
            Ok::<_, BollardError>(archive)
        })
        .await
    }

    async fn copy_to_container(
        &self,
        name: &str,
        dir: &str,
        archive: Vec<u8>,
    ) -> EngineResult<()> {
        let options = UploadToContainerOptionsBuilder::new().path(dir).build();
        bounded(
            "copy_to_container",
            DEFAULT_TIMEOUT,
            self.docker.upload_to_container(
                name,
                Some(options),
                bollard::body_full(Bytes::from(archive)),
            ),
        )
        .await
    }

    async fn create_exec(&self, name: &str, cmd: Vec<String>) -> EngineResult<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        bounded(
            "create_exec",
            SHORT_TIMEOUT,
            self.docker.create_exec(name, options),
        )
        .await
        .map(|created| created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<()> {
        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        bounded(
            "start_exec",
            SHORT_TIMEOUT,
            self.docker.start_exec(exec_id, Some(options)),
        )
        .await
        .map(|_| ())
    }

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecState> {
        let inspect = bounded(
            "inspect_exec",
            SHORT_TIMEOUT,
            self.docker.inspect_exec(exec_id),
        )
        .await?;
        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, HostConfig, NetworkSettings};
    use std::collections::HashMap;

    #[test]
    fn test_map_error_by_status() {
        let not_found = map_error(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: c-1".to_string(),
        });
        assert!(not_found.is_not_found());

        let conflict = map_error(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Container c-1 is not running".to_string(),
        });
        assert!(matches!(conflict, EngineError::Conflict(_)));
        assert!(conflict.is_not_running());

        let api = map_error(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(matches!(api, EngineError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_bounded_reports_timeout() {
        let result: EngineResult<()> = bounded("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(EngineError::Timeout {
                operation: "slow",
                ..
            })
        ));
    }

    #[test]
    fn test_spec_from_inspect_carries_config_binds_and_networks() {
        let mut labels = HashMap::new();
        labels.insert("cpi.platform".to_string(), "linux/arm64".to_string());

        let mut networks = HashMap::new();
        networks.insert("netA".to_string(), EndpointSettings::default());
        networks.insert("netB".to_string(), EndpointSettings::default());

        let inspect = ContainerInspectResponse {
            config: Some(ContainerConfig {
                image: Some("stemcell:latest".to_string()),
                env: Some(vec!["reschedule:on-node-failure".to_string()]),
                entrypoint: Some(vec!["/sbin/init".to_string()]),
                labels: Some(labels),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                binds: Some(vec!["vol-eph-c-1:/var/vcap/data/".to_string()]),
                privileged: Some(true),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            platform: Some("linux".to_string()),
            ..Default::default()
        };

        let spec = spec_from_inspect(inspect).unwrap();
        assert_eq!(spec.image(), Some("stemcell:latest"));
        assert_eq!(spec.env(), ["reschedule:on-node-failure".to_string()]);
        assert_eq!(spec.binds(), ["vol-eph-c-1:/var/vcap/data/".to_string()]);
        assert_eq!(spec.endpoints.len(), 2);
        assert_eq!(spec.platform.to_string(), "linux/arm64");
        assert!(spec.config.networking_config.is_none());
    }

    #[test]
    fn test_spec_from_inspect_without_label_uses_reported_os() {
        let inspect = ContainerInspectResponse {
            platform: Some("linux".to_string()),
            ..Default::default()
        };
        let spec = spec_from_inspect(inspect).unwrap();
        assert_eq!(spec.platform, Platform::default());
        assert!(spec.endpoints.is_empty());
    }

    #[test]
    fn test_node_from_inspect() {
        let env = vec![
            "reschedule:on-node-failure".to_string(),
            "constraint:node==node2".to_string(),
        ];
        assert_eq!(node_from_inspect(Some("/node1/c-1"), &env).as_deref(), Some("node1"));
        assert_eq!(node_from_inspect(Some("/c-1"), &env).as_deref(), Some("node2"));
        assert_eq!(node_from_inspect(Some("/c-1"), &[]), None);
        assert_eq!(node_from_inspect(None, &[]), None);
    }
}
