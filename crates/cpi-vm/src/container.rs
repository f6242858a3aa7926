//! VMs backed by containers
//!
//! The engine binds volumes only at creation time, so attaching or detaching
//! a disk rebuilds the container:
//!
//! 1. inspect the live container and locate the disk
//! 2. change the bind list (and node affinity) of the captured spec
//! 3. remove the old container
//! 4. create its successor under the same name, connect the remaining
//!    networks and start it
//!
//! Between steps 3 and 4 the VM does not exist. A failure there is reported
//! as [`CpiError::PartialRecreate`] and never retried here.

use async_trait::async_trait;
use cpi_spec::{paths, DiskHint, DiskId, VmId};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::agent_env::{AgentEnvService, FsAgentEnvService};
use crate::disk::Disk;
use crate::engine::{ContainerSpec, Engine};
use crate::error::{CpiError, Phase, Result};
use crate::files::FileService;
use crate::init_system::InitSystem;
use crate::locator::VolumeLocator;
use crate::network::split_endpoints;

/// Kill attempts before giving up
pub const KILL_ATTEMPTS: u32 = 20;

/// Delay between kill attempts
pub const KILL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Environment marker pinning a container to a node
pub const NODE_CONSTRAINT_PREFIX: &str = "constraint:node==";

const KILL_SIGNAL: &str = "KILL";

/// Group owning the agent's DNS records
const VCAP_GROUP: &str = "vcap";

/// A VM as seen by the director
#[async_trait]
pub trait Vm: Send + Sync {
    fn id(&self) -> &VmId;

    async fn exists(&self) -> Result<bool>;

    /// Remove the VM and its ephemeral disk. Safe on a VM that is already
    /// partly or entirely gone.
    async fn delete(&self) -> Result<()>;

    /// Bind `disk` into the VM, returning its mount path.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] or [`CpiError::DiskNotFound`] before
    /// anything is changed, and [`CpiError::PartialRecreate`] if the
    /// container was removed but its successor could not be started.
    async fn attach_disk(&self, disk: &dyn Disk) -> Result<DiskHint>;

    async fn detach_disk(&self, disk: &dyn Disk) -> Result<()>;
}

/// How a recreate changes the bind list
#[derive(Debug, Clone, Copy)]
enum BindChange<'a> {
    Attach { path: &'a str },
    Detach,
}

/// Add or remove the bind for `disk`. At most one bind per disk survives.
fn apply_bind_change(binds: &mut Vec<String>, disk: &DiskId, change: BindChange<'_>) -> Result<()> {
    let prefix = format!("{disk}:");
    let existing = binds.iter().position(|bind| bind.starts_with(&prefix));

    match change {
        BindChange::Attach { path } => {
            if path.is_empty() {
                return Err(CpiError::Validation(format!(
                    "Mount path for disk '{disk}' must not be empty"
                )));
            }
            let entry = format!("{disk}:{path}");
            match existing {
                Some(index) => binds[index] = entry,
                None => binds.push(entry),
            }
        }
        BindChange::Detach => {
            if let Some(index) = existing {
                binds.remove(index);
            }
        }
    }
    Ok(())
}

/// Replace any node constraint with one for `node`.
fn set_affinity(env: &mut Vec<String>, node: &str) {
    env.retain(|entry| !entry.starts_with(NODE_CONSTRAINT_PREFIX));
    env.push(format!("{NODE_CONSTRAINT_PREFIX}{node}"));
}

/// Agent state that lives only in the container's writable layer
#[derive(Debug, Default)]
struct PreservedState {
    update_settings: Option<Vec<u8>>,
    dns_records: Option<Vec<u8>>,
}

/// Container-backed [`Vm`]
pub struct Container {
    id: VmId,
    engine: Arc<dyn Engine>,
    files: FileService,
    agent_env: Arc<dyn AgentEnvService>,
    locator: VolumeLocator,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Handle keeping the agent environment in the VM's filesystem.
    pub fn new(id: VmId, engine: Arc<dyn Engine>) -> Self {
        let files = FileService::new(engine.clone(), id.clone());
        let agent_env = Arc::new(FsAgentEnvService::new(files.clone()));
        Self::with_agent_env(id, engine, agent_env)
    }

    pub fn with_agent_env(
        id: VmId,
        engine: Arc<dyn Engine>,
        agent_env: Arc<dyn AgentEnvService>,
    ) -> Self {
        Self {
            files: FileService::new(engine.clone(), id.clone()),
            locator: VolumeLocator::new(engine.clone()),
            id,
            engine,
            agent_env,
        }
    }

    pub fn agent_env(&self) -> &Arc<dyn AgentEnvService> {
        &self.agent_env
    }

    async fn ensure_exists(&self) -> Result<()> {
        if self.exists().await? {
            Ok(())
        } else {
            Err(CpiError::VmNotFound(self.id.clone()))
        }
    }

    /// Kill the container, retrying transient failures. A container that
    /// is not running counts as killed.
    async fn kill_with_retry(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.engine.kill_container(self.id.as_str(), KILL_SIGNAL).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_running() || e.is_not_found() => return Ok(()),
                Err(e) if attempt >= KILL_ATTEMPTS => {
                    return Err(CpiError::engine(Phase::KillContainer)(e));
                }
                Err(e) => {
                    tracing::debug!(vm = %self.id, attempt, error = %e, "kill failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(KILL_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Kill and remove the container, leaving its volumes alone.
    async fn remove_container(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        self.kill_with_retry().await?;

        match self.engine.remove_container(self.id.as_str(), true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_rootfs_busy() => {
                tracing::warn!(vm = %self.id, error = %e, "root filesystem busy, engine will reclaim it");
                Ok(())
            }
            Err(e) => Err(CpiError::engine(Phase::RemoveContainer)(e)),
        }
    }

    async fn preserve_state(&self) -> PreservedState {
        PreservedState {
            update_settings: self.download_optional(paths::UPDATE_SETTINGS).await,
            dns_records: self.download_optional(paths::DNS_RECORDS).await,
        }
    }

    async fn download_optional(&self, path: &str) -> Option<Vec<u8>> {
        match self.files.download(path).await {
            Ok(contents) if !contents.is_empty() => Some(contents),
            Ok(_) => None,
            Err(CpiError::FileNotFound(_)) => None,
            Err(e) => {
                tracing::warn!(vm = %self.id, path, error = %e, "unable to preserve file, skipping");
                None
            }
        }
    }

    /// Put preserved files back. The agent regenerates both, so failures
    /// only warn.
    async fn restore_state(&self, state: PreservedState) {
        if let Some(contents) = state.update_settings {
            if let Err(e) = self.files.upload(paths::UPDATE_SETTINGS, &contents).await {
                tracing::warn!(vm = %self.id, path = paths::UPDATE_SETTINGS, error = %e, "failed to restore file");
            }
        }

        if let Some(contents) = state.dns_records {
            if let Err(e) = self.restore_dns_records(&contents).await {
                tracing::warn!(vm = %self.id, path = paths::DNS_RECORDS, error = %e, "failed to restore file");
            }
        }
    }

    async fn restore_dns_records(&self, contents: &[u8]) -> Result<()> {
        let dir = paths::DNS_RECORDS
            .rsplit_once('/')
            .map_or("/", |(dir, _)| dir);
        let owner = format!("root:{VCAP_GROUP}");

        self.files.exec(&["mkdir", "-p", dir]).await?;
        self.files.exec(&["chown", owner.as_str(), dir]).await?;
        self.files.upload(paths::DNS_RECORDS, contents).await?;
        self.files.exec(&["chgrp", VCAP_GROUP, paths::DNS_RECORDS]).await
    }

    /// Rebuild the container with the bind for `disk` changed.
    async fn recreate(&self, disk: &DiskId, change: BindChange<'_>) -> Result<()> {
        let mut spec = self
            .engine
            .inspect_container(self.id.as_str())
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CpiError::VmNotFound(self.id.clone())
                } else {
                    CpiError::engine(Phase::InspectContainer)(e)
                }
            })?;

        let location = self.locator.require(disk).await?;
        if let Some(node) = location.node() {
            set_affinity(spec.env_mut(), node);
        }
        apply_bind_change(spec.binds_mut(), disk, change)?;

        self.remove_container().await?;

        if let Err(source) = self.rebuild(spec).await {
            tracing::error!(vm = %self.id, error = %source, "recreate failed after removing the previous container");
            if let Err(e) = self.engine.remove_container(self.id.as_str(), true).await {
                if !e.is_not_found() {
                    tracing::warn!(vm = %self.id, error = %e, "failed to remove half-built container");
                }
            }
            return Err(CpiError::PartialRecreate {
                vm: self.id.clone(),
                phase: source.phase().unwrap_or(Phase::CreateContainer),
                source: Box::new(source),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(otel.name = "container.recreate", vm = %self.id))]
    async fn rebuild(&self, mut spec: ContainerSpec) -> Result<()> {
        let split = split_endpoints(std::mem::take(&mut spec.endpoints));
        spec.endpoints = split.primary;

        self.engine
            .create_container(Some(self.id.as_str()), &spec)
            .await
            .map_err(CpiError::engine(Phase::CreateContainer))?;

        for (network, endpoint) in &split.additional {
            self.engine
                .connect_network(network, self.id.as_str(), endpoint)
                .await
                .map_err(CpiError::engine(Phase::ConnectNetwork))?;
        }

        self.engine
            .start_container(self.id.as_str())
            .await
            .map_err(CpiError::engine(Phase::StartContainer))?;

        if spec.config.entrypoint == InitSystem::Systemd.entrypoint() {
            if let Some(cmd) = InitSystem::Systemd.post_start() {
                if let Err(e) = self.files.exec(&cmd).await {
                    tracing::warn!(vm = %self.id, error = %e, "post-start command failed");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Vm for Container {
    fn id(&self) -> &VmId {
        &self.id
    }

    async fn exists(&self) -> Result<bool> {
        match self.engine.inspect_container(self.id.as_str()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(CpiError::engine(Phase::InspectContainer)(e)),
        }
    }

    #[instrument(skip(self), fields(otel.name = "container.delete", vm = %self.id))]
    async fn delete(&self) -> Result<()> {
        self.remove_container().await?;

        let ephemeral = self.id.ephemeral_disk_id();
        match self.engine.remove_volume(ephemeral.as_str(), true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(CpiError::engine(Phase::RemoveEphemeralVolume)(e)),
        }
        tracing::info!("deleted VM");
        Ok(())
    }

    #[instrument(skip(self, disk), fields(otel.name = "container.attach_disk", vm = %self.id, disk = %disk.id()))]
    async fn attach_disk(&self, disk: &dyn Disk) -> Result<DiskHint> {
        let disk_id = disk.id();
        if disk_id.is_ephemeral() {
            return Err(CpiError::Validation(format!(
                "Ephemeral disk '{disk_id}' cannot be attached"
            )));
        }

        self.ensure_exists().await?;
        let mut env = self.agent_env.fetch().await?;
        let preserved = self.preserve_state().await;

        let hint = DiskHint::for_disk(disk_id);
        env.attach_persistent_disk(disk_id, hint.clone());

        self.recreate(disk_id, BindChange::Attach { path: hint.path() })
            .await?;
        self.agent_env.update(&env).await?;
        self.restore_state(preserved).await;

        tracing::info!(hint = %hint, "attached disk");
        Ok(hint)
    }

    #[instrument(skip(self, disk), fields(otel.name = "container.detach_disk", vm = %self.id, disk = %disk.id()))]
    async fn detach_disk(&self, disk: &dyn Disk) -> Result<()> {
        let disk_id = disk.id();
        if disk_id.is_ephemeral() {
            return Err(CpiError::Validation(format!(
                "Ephemeral disk '{disk_id}' cannot be detached"
            )));
        }

        self.ensure_exists().await?;
        let mut env = self.agent_env.fetch().await?;
        let preserved = self.preserve_state().await;

        if !env.detach_persistent_disk(disk_id) {
            tracing::debug!("disk not listed in agent env");
        }

        self.recreate(disk_id, BindChange::Detach).await?;
        self.agent_env.update(&env).await?;
        self.restore_state(preserved).await;

        tracing::info!("detached disk");
        Ok(())
    }
}
