//! Container engine seam
//!
//! Every component talks to the engine through [`Engine`] so the recreate
//! protocol, network setup and file transfer can be driven against
//! [`crate::engines::MockEngine`] in tests.

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, EndpointSettings};
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Inspect, kill, list, remove and ping
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Create, start, network and copy operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Waiting on a container
pub const LONG_TIMEOUT: Duration = Duration::from_secs(300);

/// Label recording the platform a container was created for
pub const PLATFORM_LABEL: &str = "cpi.platform";

/// Errors reported by an [`Engine`]
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine call '{operation}' timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("engine transport error: {0}")]
    Transport(String),

    #[error("malformed engine response: {0}")]
    Malformed(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    /// Kill against a stopped container.
    pub fn is_not_running(&self) -> bool {
        self.to_string().contains("is not running")
    }

    /// Storage drivers occasionally fail to unmount a container's root
    /// filesystem on removal; the engine reclaims it later.
    pub fn is_rootfs_busy(&self) -> bool {
        let message = self.to_string();
        message.contains("failed to remove root filesystem")
            || message.contains("device or resource busy")
    }

    pub fn is_already_exists(&self) -> bool {
        self.to_string().contains("already exists")
    }

    /// Creating a network that shadows one of the engine's built-in networks.
    pub fn is_predefined_network(&self) -> bool {
        let message = self.to_string();
        message.contains("not permitted on predefined")
            || message.contains("is a pre-defined network")
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Target OS and architecture of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
        }
    }
}

impl Platform {
    /// Parse `os/architecture`; a bare OS keeps the default architecture.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        match value.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Some(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
            }),
            Some(_) => None,
            None => Some(Self {
                os: value.to_string(),
                ..Default::default()
            }),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Full configuration of a container at a point in time.
///
/// Produced by inspecting a live container and replayed, after mutation, to
/// create its successor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Image, command, environment, labels and host configuration
    pub config: ContainerCreateBody,

    /// Endpoint settings keyed by engine network name
    pub endpoints: HashMap<String, EndpointSettings>,

    pub platform: Platform,

    /// Node running the container on a clustered engine. Reported by
    /// inspect only; placement on create comes from the node constraint.
    pub node: Option<String>,
}

impl ContainerSpec {
    pub fn image(&self) -> Option<&str> {
        self.config.image.as_deref()
    }

    pub fn binds(&self) -> &[String] {
        self.config
            .host_config
            .as_ref()
            .and_then(|host| host.binds.as_deref())
            .unwrap_or(&[])
    }

    pub fn binds_mut(&mut self) -> &mut Vec<String> {
        self.config
            .host_config
            .get_or_insert_with(Default::default)
            .binds
            .get_or_insert_with(Vec::new)
    }

    pub fn env(&self) -> &[String] {
        self.config.env.as_deref().unwrap_or(&[])
    }

    pub fn env_mut(&mut self) -> &mut Vec<String> {
        self.config.env.get_or_insert_with(Vec::new)
    }

    /// Store the platform in a label so a later inspect can recover it.
    pub fn record_platform(&mut self) {
        self.config
            .labels
            .get_or_insert_with(HashMap::new)
            .insert(PLATFORM_LABEL.to_string(), self.platform.to_string());
    }

    /// Platform stored by [`ContainerSpec::record_platform`], if any.
    pub fn recorded_platform(&self) -> Option<Platform> {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(PLATFORM_LABEL))
            .and_then(|value| Platform::parse(value))
    }
}

/// Capacity reported by the engine host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    /// Total memory in bytes
    pub total_memory: i64,
    pub cpus: i64,
}

/// Network to create on the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub name: String,
    pub driver: String,
    pub enable_ipv6: bool,
    /// Fixed subnet handed to the default IPAM driver; `None` for dynamic networks
    pub subnet: Option<IpNet>,
    pub gateway: Option<String>,
}

/// Progress of an exec instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Container engine operations used by the CPI
#[async_trait]
pub trait Engine: Send + Sync {
    async fn ping(&self) -> EngineResult<()>;

    async fn host_resources(&self) -> EngineResult<HostResources>;

    /// Inspect a container by name.
    ///
    /// Fails with [`EngineError::NotFound`] when no such container exists.
    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerSpec>;

    /// Create a container, returning its engine id. `None` lets the engine
    /// pick a name.
    async fn create_container(&self, name: Option<&str>, spec: &ContainerSpec)
        -> EngineResult<String>;

    async fn start_container(&self, name: &str) -> EngineResult<()>;

    async fn kill_container(&self, name: &str, signal: &str) -> EngineResult<()>;

    async fn stop_container(&self, name: &str, grace: Duration) -> EngineResult<()>;

    async fn remove_container(&self, name: &str, force: bool) -> EngineResult<()>;

    /// Block until the container exits, returning its status code.
    async fn wait_container(&self, name: &str) -> EngineResult<i64>;

    /// Combined stdout and stderr.
    async fn container_logs(&self, name: &str) -> EngineResult<String>;

    async fn create_network(&self, request: &NetworkRequest) -> EngineResult<()>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSettings,
    ) -> EngineResult<()>;

    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<()>;

    async fn inspect_volume(&self, name: &str) -> EngineResult<()>;

    /// Names of every volume known to the engine.
    async fn list_volumes(&self) -> EngineResult<Vec<String>>;

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()>;

    /// Force-remove an image by name or id.
    async fn remove_image(&self, name: &str) -> EngineResult<()>;

    /// Tar archive of `path` inside the container.
    async fn copy_from_container(&self, name: &str, path: &str) -> EngineResult<Vec<u8>>;

    /// Extract a tar archive into directory `dir` inside the container.
    async fn copy_to_container(&self, name: &str, dir: &str, archive: Vec<u8>)
        -> EngineResult<()>;

    /// Create an exec instance, returning its id.
    async fn create_exec(&self, name: &str, cmd: Vec<String>) -> EngineResult<String>;

    /// Start an exec instance detached.
    async fn start_exec(&self, exec_id: &str) -> EngineResult<()>;

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EngineError::Conflict(
            "Cannot kill container: c-1: Container c-1 is not running".to_string(),
        );
        assert!(err.is_not_running());
        assert!(!err.is_not_found());

        let err = EngineError::Api {
            status: 500,
            message: "Driver aufs failed to remove root filesystem abc: device or resource busy"
                .to_string(),
        };
        assert!(err.is_rootfs_busy());

        let err = EngineError::Conflict("network with name netA already exists".to_string());
        assert!(err.is_already_exists());

        let err = EngineError::Api {
            status: 403,
            message: "operation is not permitted on predefined bridge network".to_string(),
        };
        assert!(err.is_predefined_network());

        assert!(EngineError::NotFound("no such container".to_string()).is_not_found());
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!(Platform::parse("linux/arm64").unwrap().architecture, "arm64");
        assert_eq!(Platform::parse("linux").unwrap(), Platform::default());
        assert!(Platform::parse("").is_none());
        assert!(Platform::parse("/amd64").is_none());
        assert_eq!(Platform::default().to_string(), "linux/amd64");
    }

    #[test]
    fn test_spec_accessors_create_missing_sections() {
        let mut spec = ContainerSpec::default();
        assert!(spec.binds().is_empty());
        spec.binds_mut().push("vol-1:/data".to_string());
        assert_eq!(spec.binds(), ["vol-1:/data".to_string()]);

        spec.env_mut().push("A=1".to_string());
        assert_eq!(spec.env(), ["A=1".to_string()]);
    }

    #[test]
    fn test_platform_label_round_trip() {
        let mut spec = ContainerSpec {
            platform: Platform::parse("linux/arm64").unwrap(),
            ..Default::default()
        };
        assert!(spec.recorded_platform().is_none());
        spec.record_platform();
        assert_eq!(spec.recorded_platform(), Some(Platform::parse("linux/arm64").unwrap()));
    }
}
