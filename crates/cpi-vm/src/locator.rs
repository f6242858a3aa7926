//! Finding the node that holds a volume
//!
//! Clustered engines list volumes as `<node>/<name>`; a single host lists
//! them bare.

use cpi_spec::DiskId;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{CpiError, Phase, Result};

/// Where a volume lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskLocation {
    /// Held by the named node
    Node(String),
    /// Listed without a node prefix
    Local,
    Missing,
}

impl DiskLocation {
    /// Node to pin a container to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            DiskLocation::Node(node) => Some(node),
            DiskLocation::Local | DiskLocation::Missing => None,
        }
    }
}

pub struct VolumeLocator {
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for VolumeLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeLocator").finish_non_exhaustive()
    }
}

/// Match one listed volume name against `disk`.
fn match_volume(volume: &str, disk: &DiskId) -> Option<DiskLocation> {
    match volume.split_once('/') {
        Some((node, name)) if name == disk.as_str() && !node.is_empty() => {
            Some(DiskLocation::Node(node.to_string()))
        }
        None if volume == disk.as_str() => Some(DiskLocation::Local),
        _ => None,
    }
}

impl VolumeLocator {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Scan the engine's volume list for `disk`; the first match wins.
    pub async fn locate(&self, disk: &DiskId) -> Result<DiskLocation> {
        let volumes = self
            .engine
            .list_volumes()
            .await
            .map_err(CpiError::engine(Phase::LocateDisk))?;

        let location = volumes
            .iter()
            .find_map(|volume| match_volume(volume, disk))
            .unwrap_or(DiskLocation::Missing);
        tracing::debug!(disk = %disk, ?location, "located disk");
        Ok(location)
    }

    /// Like [`VolumeLocator::locate`] but a missing disk is an error.
    pub async fn require(&self, disk: &DiskId) -> Result<DiskLocation> {
        match self.locate(disk).await? {
            DiskLocation::Missing => Err(CpiError::DiskNotFound(disk.clone())),
            location => Ok(location),
        }
    }
}
