//! Operation set exposed to the director

use cpi_spec::{AgentId, DiskHint, DiskId, Networks, StemcellId, VmId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::CpiConfig;
use crate::container::Vm;
use crate::disk::{Disk, DiskFactory};
use crate::engine::Engine;
use crate::error::{CpiError, Phase, Result};
use crate::factory::VmFactory;

/// Stemcell formats this CPI boots
pub const STEMCELL_FORMATS: &[&str] = &["warden-tar", "general-tar"];

/// Highest CPI API version understood
pub const API_VERSION: u32 = 2;

/// Answer to the `info` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpiInfo {
    pub stemcell_formats: Vec<String>,
    pub api_version: u32,
}

impl Default for CpiInfo {
    fn default() -> Self {
        Self {
            stemcell_formats: STEMCELL_FORMATS.iter().map(|f| f.to_string()).collect(),
            api_version: API_VERSION,
        }
    }
}

/// Entry point for every CPI operation
pub struct Cpi {
    engine: Arc<dyn Engine>,
    vms: VmFactory,
    disks: DiskFactory,
}

impl std::fmt::Debug for Cpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpi").finish_non_exhaustive()
    }
}

impl Cpi {
    pub fn new(engine: Arc<dyn Engine>, config: &CpiConfig) -> Self {
        Self {
            vms: VmFactory::new(engine.clone(), config),
            disks: DiskFactory::new(engine.clone()),
            engine,
        }
    }

    pub fn info(&self) -> CpiInfo {
        CpiInfo::default()
    }

    /// Create and start a VM, returning its id.
    ///
    /// # Errors
    ///
    /// Returns a validation error for undecodable or unsatisfiable cloud
    /// properties, [`CpiError::NetworkConflict`] when a requested network
    /// collides with an existing one, and an engine error tagged with the
    /// failing [`Phase`] otherwise. No engine objects survive a failure.
    pub async fn create_vm(
        &self,
        agent_id: AgentId,
        stemcell: &StemcellId,
        cloud_props: &Value,
        networks: Networks,
        disk_ids: &[DiskId],
        env: Map<String, Value>,
    ) -> Result<VmId> {
        let vm = self
            .vms
            .create(agent_id, stemcell, cloud_props, networks, disk_ids, env)
            .await?;
        Ok(vm.id().clone())
    }

    /// Remove the VM and its ephemeral disk. Deleting a missing VM succeeds.
    pub async fn delete_vm(&self, id: VmId) -> Result<()> {
        self.vms.find(id).delete().await
    }

    pub async fn has_vm(&self, id: VmId) -> Result<bool> {
        self.vms.find(id).exists().await
    }

    pub async fn reboot_vm(&self, id: VmId) -> Result<()> {
        tracing::debug!(vm = %id, "reboot is a no-op");
        Ok(())
    }

    pub async fn set_vm_metadata(&self, id: VmId, _metadata: &Value) -> Result<()> {
        tracing::debug!(vm = %id, "VM metadata ignored");
        Ok(())
    }

    /// No VM-type specific requirements exist, so the result is always `{}`.
    pub fn calculate_vm_cloud_properties(&self, _requirements: &Value) -> Value {
        Value::Object(Map::new())
    }

    pub async fn create_disk(
        &self,
        size_mb: u64,
        _cloud_props: &Value,
        vm: Option<&VmId>,
    ) -> Result<DiskId> {
        let disk = self.disks.create(size_mb, vm).await?;
        Ok(disk.id().clone())
    }

    pub async fn delete_disk(&self, id: DiskId) -> Result<()> {
        self.disks.find(id).delete().await
    }

    pub async fn has_disk(&self, id: DiskId) -> Result<bool> {
        self.disks.find(id).exists().await
    }

    pub async fn attach_disk(&self, vm: VmId, disk: DiskId) -> Result<DiskHint> {
        let disk = self.disks.find(disk);
        self.vms.find(vm).attach_disk(&disk).await
    }

    pub async fn detach_disk(&self, vm: VmId, disk: DiskId) -> Result<()> {
        let disk = self.disks.find(disk);
        self.vms.find(vm).detach_disk(&disk).await
    }

    pub async fn set_disk_metadata(&self, id: DiskId, _metadata: &Value) -> Result<()> {
        tracing::debug!(disk = %id, "disk metadata ignored");
        Ok(())
    }

    /// Snapshots are not supported; the empty id tells the director none was taken.
    pub async fn snapshot_disk(&self, disk: DiskId, _metadata: &Value) -> Result<String> {
        tracing::debug!(disk = %disk, "snapshot skipped");
        Ok(String::new())
    }

    pub async fn delete_snapshot(&self, snapshot: &str) -> Result<()> {
        tracing::debug!(snapshot, "no snapshot to delete");
        Ok(())
    }

    /// Remove the stemcell image. A missing image counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the image exists but cannot be removed.
    pub async fn delete_stemcell(&self, stemcell: &StemcellId) -> Result<()> {
        match self.engine.remove_image(stemcell.as_str()).await {
            Ok(()) => {
                tracing::info!(stemcell = %stemcell, "deleted stemcell");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(stemcell = %stemcell, "stemcell already gone");
                Ok(())
            }
            Err(e) => Err(CpiError::engine(Phase::RemoveImage)(e)),
        }
    }

    /// Attached disks are not tracked outside the agent env; always empty.
    pub async fn get_disks(&self, _vm: VmId) -> Result<Vec<DiskId>> {
        Ok(Vec::new())
    }
}
