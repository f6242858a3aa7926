//! Persistent disks backed by engine volumes

use async_trait::async_trait;
use cpi_spec::{DiskId, VmId};
use std::sync::Arc;
use tracing::instrument;

use crate::engine::Engine;
use crate::error::{CpiError, Phase, Result};

/// Driver for volumes created by the CPI
pub const VOLUME_DRIVER: &str = "local";

/// A persistent disk
#[async_trait]
pub trait Disk: Send + Sync {
    fn id(&self) -> &DiskId;

    async fn exists(&self) -> Result<bool>;

    /// Remove the disk; a missing disk is not an error.
    async fn delete(&self) -> Result<()>;
}

/// Disk backed by a named volume
#[derive(Clone)]
pub struct Volume {
    id: DiskId,
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Volume {
    pub fn new(id: DiskId, engine: Arc<dyn Engine>) -> Self {
        Self { id, engine }
    }
}

#[async_trait]
impl Disk for Volume {
    fn id(&self) -> &DiskId {
        &self.id
    }

    async fn exists(&self) -> Result<bool> {
        match self.engine.inspect_volume(self.id.as_str()).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(CpiError::engine(Phase::InspectVolume)(e)),
        }
    }

    #[instrument(skip(self), fields(otel.name = "volume.delete", disk = %self.id))]
    async fn delete(&self) -> Result<()> {
        match self.engine.remove_volume(self.id.as_str(), true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("volume already gone");
                Ok(())
            }
            Err(e) => Err(CpiError::engine(Phase::RemoveVolume)(e)),
        }
    }
}

/// Creates and finds [`Volume`]s
#[derive(Clone)]
pub struct DiskFactory {
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for DiskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFactory").finish_non_exhaustive()
    }
}

impl DiskFactory {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Create a fresh volume. Local volumes grow on demand, so the size is
    /// only recorded in the logs.
    ///
    /// When `vm` runs on a known node the volume is created there as
    /// `<node>/<id>`, so a later attach keeps the VM on that node.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::VmNotFound`] if `vm` does not exist, or an engine
    /// error if inspecting it or creating the volume fails.
    #[instrument(skip(self), fields(otel.name = "volume.create"))]
    pub async fn create(&self, size_mb: u64, vm: Option<&VmId>) -> Result<Volume> {
        let id = DiskId::generate();
        let node = match vm {
            Some(vm) => self.node_of(vm).await?,
            None => None,
        };
        let name = match &node {
            Some(node) => format!("{node}/{id}"),
            None => id.to_string(),
        };

        self.engine
            .create_volume(&name, VOLUME_DRIVER)
            .await
            .map_err(CpiError::engine(Phase::CreateVolume))?;
        tracing::info!(disk = %id, size_mb, node = ?node, "created disk");
        Ok(self.find(id))
    }

    async fn node_of(&self, vm: &VmId) -> Result<Option<String>> {
        let spec = self
            .engine
            .inspect_container(vm.as_str())
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CpiError::VmNotFound(vm.clone())
                } else {
                    CpiError::engine(Phase::InspectContainer)(e)
                }
            })?;
        Ok(spec.node)
    }

    /// Handle for `id` without checking that the volume exists.
    pub fn find(&self, id: DiskId) -> Volume {
        Volume::new(id, self.engine.clone())
    }
}
