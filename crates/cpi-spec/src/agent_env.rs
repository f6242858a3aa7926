//! Agent environment document read by the in-VM agent

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::ids::{AgentId, DiskHint, DiskId, VmId};
use crate::network::Networks;

/// Agent connectivity defaults supplied by CPI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Message bus URL the agent connects to
    pub mbus: String,

    #[serde(default)]
    pub ntp: Vec<String>,

    #[serde(default)]
    pub blobstore: BlobstoreOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobstoreOptions {
    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmRef {
    pub name: String,
    pub id: String,
}

/// Disk hints as the agent expects them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisksSpec {
    #[serde(default)]
    pub system: DiskHint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<DiskHint>,

    #[serde(default)]
    pub persistent: BTreeMap<String, DiskHint>,
}

/// The JSON document at [`crate::paths::AGENT_ENV`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnv {
    pub agent_id: AgentId,

    pub vm: VmRef,

    #[serde(default)]
    pub mbus: String,

    #[serde(default)]
    pub ntp: Vec<String>,

    #[serde(default)]
    pub blobstore: BlobstoreOptions,

    #[serde(default)]
    pub networks: Networks,

    #[serde(default)]
    pub disks: DisksSpec,

    #[serde(default)]
    pub env: Map<String, Value>,
}

impl AgentEnv {
    /// Environment for a freshly created VM.
    pub fn for_vm(
        agent_id: AgentId,
        vm_id: &VmId,
        networks: Networks,
        env: Map<String, Value>,
        options: &AgentOptions,
    ) -> Self {
        Self {
            agent_id,
            vm: VmRef {
                name: vm_id.to_string(),
                id: vm_id.to_string(),
            },
            mbus: options.mbus.clone(),
            ntp: options.ntp.clone(),
            blobstore: options.blobstore.clone(),
            networks,
            disks: DisksSpec::default(),
            env,
        }
    }

    pub fn attach_system_disk(&mut self, hint: DiskHint) {
        self.disks.system = hint;
    }

    pub fn attach_persistent_disk(&mut self, disk: &DiskId, hint: DiskHint) {
        self.disks.persistent.insert(disk.to_string(), hint);
    }

    /// Returns whether the disk was listed.
    pub fn detach_persistent_disk(&mut self, disk: &DiskId) -> bool {
        self.disks.persistent.remove(disk.as_str()).is_some()
    }

    pub fn persistent_disk(&self, disk: &DiskId) -> Option<&DiskHint> {
        self.disks.persistent.get(disk.as_str())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
