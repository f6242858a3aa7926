//! Director-visible identities

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SpecError};
use crate::paths;

pub const VM_ID_PREFIX: &str = "c-";
pub const DISK_ID_PREFIX: &str = "vol-";
pub const EPHEMERAL_DISK_ID_PREFIX: &str = "vol-eph-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// VM identity; doubles as the container name
    VmId
);

string_id!(
    /// Disk identity; doubles as the volume name
    DiskId
);

string_id!(
    /// Identity of the in-VM agent, chosen by the director
    AgentId
);

string_id!(
    /// Image reference of an imported stemcell
    StemcellId
);

impl VmId {
    /// Fresh `c-<uuid>` identity.
    pub fn generate() -> Self {
        Self(format!("{VM_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Parse a director-supplied VM id, checking the prefix.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() > VM_ID_PREFIX.len() && value.starts_with(VM_ID_PREFIX) {
            Ok(Self(value.to_string()))
        } else {
            Err(SpecError::InvalidId {
                kind: "vm",
                value: value.to_string(),
                prefix: VM_ID_PREFIX,
            })
        }
    }

    /// Scratch volume owned by this VM.
    pub fn ephemeral_disk_id(&self) -> DiskId {
        DiskId(format!("{EPHEMERAL_DISK_ID_PREFIX}{}", self.0))
    }
}

impl DiskId {
    /// Fresh `vol-<uuid>` identity.
    pub fn generate() -> Self {
        Self(format!("{DISK_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Parse a director-supplied disk id. Ephemeral ids are never addressable
    /// by the director and are rejected.
    pub fn parse(value: &str) -> Result<Self> {
        let id = Self(value.to_string());
        if value.len() > DISK_ID_PREFIX.len() && value.starts_with(DISK_ID_PREFIX) && !id.is_ephemeral() {
            Ok(id)
        } else {
            Err(SpecError::InvalidId {
                kind: "disk",
                value: value.to_string(),
                prefix: DISK_ID_PREFIX,
            })
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.0.starts_with(EPHEMERAL_DISK_ID_PREFIX)
    }
}

/// Mount path handed back to the director on attach
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskHint(String);

impl DiskHint {
    /// Deterministic in-VM mount path for a persistent disk.
    pub fn for_disk(disk: &DiskId) -> Self {
        Self(format!("{}/{}", paths::PERSISTENT_DISK_ROOT, disk))
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DiskHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
