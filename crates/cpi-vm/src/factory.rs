//! Creating and finding VMs

use bollard::models::{ContainerCreateBody, EndpointSettings, HostConfig, HostConfigCgroupnsModeEnum};
use cpi_spec::{paths, AgentEnv, AgentId, AgentOptions, DiskHint, DiskId, Networks, StemcellId, VmId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::config::CpiConfig;
use crate::container::{Container, Vm, NODE_CONSTRAINT_PREFIX};
use crate::disk::VOLUME_DRIVER;
use crate::engine::{ContainerSpec, Engine};
use crate::error::{CpiError, Phase, Result};
use crate::files::FileService;
use crate::init_system::InitSystem;
use crate::locator::VolumeLocator;
use crate::network::{split_endpoints, NetworkManager};
use crate::props::VmProps;
use crate::resources::ResourceValidator;

/// Asks a clustered engine to move the container when its node fails
pub const RESCHEDULE_MARKER: &str = "reschedule:on-node-failure";

/// Required for nested process supervision
pub const UNCONFINED_SECCOMP: &str = "seccomp=unconfined";

/// Grace period when stopping a container that failed to come up
const CLEANUP_STOP_GRACE: Duration = Duration::from_secs(5);
const CLEANUP_REMOVE_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Whether `bind` mounts onto the ephemeral scratch path.
fn targets_scratch(bind: &str) -> bool {
    let scratch = paths::EPHEMERAL_MOUNT.trim_end_matches('/');
    bind.split(':')
        .nth(1)
        .is_some_and(|dest| dest.trim_end_matches('/') == scratch)
}

/// Host configuration for a new VM: caller settings plus the privileges and
/// binds every VM needs.
fn vm_host_config(props: &VmProps, id: &VmId) -> HostConfig {
    let mut host = props.host_config.clone();
    host.privileged = Some(true);
    host.publish_all_ports = Some(true);

    let security_opt = host.security_opt.get_or_insert_with(Vec::new);
    if !security_opt.iter().any(|opt| opt == UNCONFINED_SECCOMP) {
        security_opt.push(UNCONFINED_SECCOMP.to_string());
    }

    if props.private_cgroupns {
        host.cgroupns_mode = Some(HostConfigCgroupnsModeEnum::PRIVATE);
    }

    let binds = host.binds.get_or_insert_with(Vec::new);
    binds.retain(|bind| {
        let keep = !targets_scratch(bind);
        if !keep {
            tracing::warn!(bind = %bind, "dropping bind over the ephemeral disk path");
        }
        keep
    });
    binds.push(format!("{}:{}", id.ephemeral_disk_id(), paths::EPHEMERAL_MOUNT));
    host
}

/// Builds [`Container`]s
pub struct VmFactory {
    engine: Arc<dyn Engine>,
    agent: AgentOptions,
    start_with_systemd: bool,
    networks: NetworkManager,
    locator: VolumeLocator,
}

impl std::fmt::Debug for VmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmFactory")
            .field("start_with_systemd", &self.start_with_systemd)
            .finish_non_exhaustive()
    }
}

impl VmFactory {
    pub fn new(engine: Arc<dyn Engine>, config: &CpiConfig) -> Self {
        Self {
            networks: NetworkManager::new(engine.clone()),
            locator: VolumeLocator::new(engine.clone()),
            agent: config.actions.agent.clone(),
            start_with_systemd: config.start_containers_with_systemd,
            engine,
        }
    }

    /// Handle for an existing VM; existence is not checked.
    pub fn find(&self, id: VmId) -> Container {
        Container::new(id, self.engine.clone())
    }

    /// Create and start a VM from `stemcell`.
    ///
    /// Validation failures leave no engine objects behind. Once the
    /// ephemeral volume exists, any failure removes the half-built VM before
    /// the error is returned.
    #[instrument(
        skip(self, cloud_props, networks, disk_ids, env),
        fields(otel.name = "vm.create", agent = %agent_id, stemcell = %stemcell, vm = tracing::field::Empty)
    )]
    pub async fn create(
        &self,
        agent_id: AgentId,
        stemcell: &StemcellId,
        cloud_props: &Value,
        mut networks: Networks,
        disk_ids: &[DiskId],
        env: Map<String, Value>,
    ) -> Result<Container> {
        let mut props = VmProps::decode(cloud_props)?;
        props.clean_mounts()?;
        ResourceValidator::for_engine(&self.engine)
            .await
            .validate(&mut props)?;

        let platform = props.platform();
        let init = match props.init_system {
            Some(init) => init,
            None if self.start_with_systemd => InitSystem::Systemd,
            None => InitSystem::detect(&self.engine, stemcell.as_str(), &platform).await,
        };

        let setup = self.networks.enable(&mut networks).await?;

        let id = VmId::generate();
        tracing::Span::current().record("vm", tracing::field::display(&id));

        let mut env_markers = vec![RESCHEDULE_MARKER.to_string()];
        if let Some(disk) = disk_ids.first() {
            if let Some(node) = self.locator.locate(disk).await?.node() {
                env_markers.push(format!("{NODE_CONSTRAINT_PREFIX}{node}"));
            }
        }

        let split = split_endpoints(setup.endpoints);
        let mut spec = ContainerSpec {
            config: ContainerCreateBody {
                image: Some(stemcell.to_string()),
                env: Some(env_markers),
                exposed_ports: if props.exposed_ports.is_empty() {
                    None
                } else {
                    Some(props.exposed_ports.clone())
                },
                entrypoint: init.entrypoint(),
                cmd: init.command(&setup.init_script),
                host_config: Some(vm_host_config(&props, &id)),
                ..Default::default()
            },
            endpoints: split.primary,
            platform,
            node: None,
        };
        spec.record_platform();

        let ephemeral = id.ephemeral_disk_id();
        self.engine
            .create_volume(ephemeral.as_str(), VOLUME_DRIVER)
            .await
            .map_err(CpiError::engine(Phase::CreateEphemeralVolume))?;

        let mut agent_env = AgentEnv::for_vm(agent_id, &id, networks, env, &self.agent);
        agent_env.attach_system_disk(DiskHint::empty());

        let container = self.find(id.clone());
        if let Err(e) = self
            .launch(&container, &spec, &split.additional, init, &agent_env)
            .await
        {
            tracing::error!(error = %e, "VM creation failed, cleaning up");
            self.clean_up(&id).await;
            return Err(e);
        }

        tracing::info!(%init, "created VM");
        Ok(container)
    }

    async fn launch(
        &self,
        container: &Container,
        spec: &ContainerSpec,
        additional: &BTreeMap<String, EndpointSettings>,
        init: InitSystem,
        agent_env: &AgentEnv,
    ) -> Result<()> {
        let vm = container.id();
        let id = vm.as_str();

        self.engine
            .create_container(Some(id), spec)
            .await
            .map_err(CpiError::engine(Phase::CreateContainer))?;

        for (network, endpoint) in additional {
            self.engine
                .connect_network(network, id, endpoint)
                .await
                .map_err(CpiError::engine(Phase::ConnectNetwork))?;
        }

        self.engine
            .start_container(id)
            .await
            .map_err(CpiError::engine(Phase::StartContainer))?;

        if let Some(cmd) = init.post_start() {
            let files = FileService::new(self.engine.clone(), vm.clone());
            if let Err(e) = files.exec(&cmd).await {
                tracing::warn!(vm = %vm, error = %e, "post-start command failed");
            }
        }

        container.agent_env().update(agent_env).await
    }

    /// Best-effort removal of a VM that failed to come up.
    async fn clean_up(&self, id: &VmId) {
        if let Err(e) = self.engine.stop_container(id.as_str(), CLEANUP_STOP_GRACE).await {
            tracing::debug!(vm = %id, error = %e, "stop during cleanup failed");
        }

        let mut attempt = 1;
        loop {
            match self.engine.remove_container(id.as_str(), true).await {
                Ok(()) => break,
                Err(e) if e.is_not_found() => break,
                Err(e) if attempt >= CLEANUP_REMOVE_ATTEMPTS => {
                    tracing::error!(vm = %id, error = %e, "failed to remove container during cleanup");
                    break;
                }
                Err(e) => {
                    tracing::debug!(vm = %id, attempt, error = %e, "remove during cleanup failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                }
            }
        }

        let ephemeral = id.ephemeral_disk_id();
        match self.engine.remove_volume(ephemeral.as_str(), true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::error!(vm = %id, volume = %ephemeral, error = %e, "failed to remove ephemeral volume during cleanup");
            }
        }
    }
}
