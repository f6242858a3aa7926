//! VM cloud properties
//!
//! The director passes arbitrary JSON per VM. Everything the engine accepts
//! in a host configuration is accepted here under the engine's own field
//! names (`Memory`, `Binds`, `Mounts`, ...), alongside a few CPI-level keys.

use bollard::models::{HostConfig, MountTypeEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Platform;
use crate::error::{CpiError, Result};
use crate::init_system::InitSystem;

const UNIX_SOCKET_SCHEME: &str = "unix://";

/// Decoded VM cloud properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmProps {
    /// Ports to expose, e.g. `6868/tcp`
    #[serde(rename = "ports", default)]
    pub exposed_ports: Vec<String>,

    #[serde(flatten)]
    pub host_config: HostConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Forces the init style instead of probing the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_system: Option<InitSystem>,

    /// Run the container in a private cgroup namespace
    #[serde(default)]
    pub private_cgroupns: bool,
}

impl VmProps {
    /// Decode properties; `null` yields the defaults.
    pub fn decode(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| CpiError::InvalidProperties(e.to_string()))
    }

    pub fn platform(&self) -> Platform {
        let default = Platform::default();
        Platform {
            os: self.os.clone().filter(|os| !os.is_empty()).unwrap_or(default.os),
            architecture: self
                .architecture
                .clone()
                .filter(|arch| !arch.is_empty())
                .unwrap_or(default.architecture),
        }
    }

    /// Strip the `unix://` scheme from bind sources and reject relative
    /// bind-mount sources.
    pub fn clean_mounts(&mut self) -> Result<()> {
        if let Some(mounts) = self.host_config.mounts.as_mut() {
            for mount in mounts.iter_mut() {
                if mount.typ != Some(MountTypeEnum::BIND) {
                    continue;
                }
                let source = mount.source.get_or_insert_with(String::new);
                if let Some(stripped) = source.strip_prefix(UNIX_SOCKET_SCHEME) {
                    *source = stripped.to_string();
                }
                if !source.starts_with('/') {
                    return Err(CpiError::Validation(format!(
                        "Bind mount source '{source}' must be an absolute path"
                    )));
                }
            }
        }

        if let Some(binds) = self.host_config.binds.as_mut() {
            for bind in binds.iter_mut() {
                if let Some(stripped) = bind.strip_prefix(UNIX_SOCKET_SCHEME) {
                    *bind = stripped.to_string();
                }
            }
        }
        Ok(())
    }
}
