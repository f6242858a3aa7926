//! Error types for the CPI core

use cpi_spec::{DiskId, SpecError, VmId};
use std::fmt;
use thiserror::Error;

use crate::engine::EngineError;

/// Step of an operation an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    HostResources,
    DetectInitSystem,
    EnableNetworks,
    CreateEphemeralVolume,
    CreateContainer,
    ConnectNetwork,
    StartContainer,
    PostStart,
    InspectContainer,
    KillContainer,
    RemoveContainer,
    RemoveEphemeralVolume,
    LocateDisk,
    FetchAgentEnv,
    WriteAgentEnv,
    CreateVolume,
    InspectVolume,
    RemoveVolume,
    RemoveImage,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::HostResources => "host_resources",
            Phase::DetectInitSystem => "detect_init_system",
            Phase::EnableNetworks => "enable_networks",
            Phase::CreateEphemeralVolume => "create_ephemeral_volume",
            Phase::CreateContainer => "create_container",
            Phase::ConnectNetwork => "connect_network",
            Phase::StartContainer => "start_container",
            Phase::PostStart => "post_start",
            Phase::InspectContainer => "inspect_container",
            Phase::KillContainer => "kill_container",
            Phase::RemoveContainer => "remove_container",
            Phase::RemoveEphemeralVolume => "remove_ephemeral_volume",
            Phase::LocateDisk => "locate_disk",
            Phase::FetchAgentEnv => "fetch_agent_env",
            Phase::WriteAgentEnv => "write_agent_env",
            Phase::CreateVolume => "create_volume",
            Phase::InspectVolume => "inspect_volume",
            Phase::RemoveVolume => "remove_volume",
            Phase::RemoveImage => "remove_image",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`CpiError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Engine,
    PartialRecreate,
    NetworkConflict,
    FileTransfer,
    Configuration,
}

/// Errors returned by CPI operations
#[derive(Debug, Error)]
pub enum CpiError {
    /// Requested resources or mounts failed pre-flight checks
    #[error("validation failed: {0}")]
    Validation(String),

    /// VM cloud properties did not decode
    #[error("invalid VM cloud properties: {0}")]
    InvalidProperties(String),

    #[error("VM '{0}' does not exist")]
    VmNotFound(VmId),

    #[error("disk '{0}' not found on any node")]
    DiskNotFound(DiskId),

    #[error("{phase} failed: {source}")]
    Engine {
        phase: Phase,
        #[source]
        source: EngineError,
    },

    /// The old container is gone and its replacement never started.
    /// The VM no longer exists under its id; retrying is an operator decision.
    #[error("recreating VM '{vm}' failed at {phase} after the previous container was removed: {source}")]
    PartialRecreate {
        vm: VmId,
        phase: Phase,
        #[source]
        source: Box<CpiError>,
    },

    #[error(
        "network '{existing}' already has subnet '{subnet}' requested for network '{requested}'"
    )]
    NetworkConflict {
        requested: String,
        existing: String,
        subnet: String,
    },

    #[error("file '{0}' does not exist in the VM")]
    FileNotFound(String),

    #[error("transferring file '{path}' failed: {reason}")]
    FileTransfer { path: String, reason: String },

    /// A command run inside the VM failed
    #[error("command '{command}' failed in the VM: {reason}")]
    Exec { command: String, reason: String },

    #[error("agent env error: {0}")]
    AgentEnv(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Spec(#[from] SpecError),
}

impl CpiError {
    /// `map_err` adapter tagging an engine failure with its phase.
    pub fn engine(phase: Phase) -> impl FnOnce(EngineError) -> CpiError {
        move |source| CpiError::Engine { phase, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CpiError::Validation(_) | CpiError::InvalidProperties(_) | CpiError::Spec(_) => {
                ErrorKind::Validation
            }
            CpiError::VmNotFound(_) | CpiError::DiskNotFound(_) => ErrorKind::NotFound,
            CpiError::Engine { .. } => ErrorKind::Engine,
            CpiError::PartialRecreate { .. } => ErrorKind::PartialRecreate,
            CpiError::NetworkConflict { .. } => ErrorKind::NetworkConflict,
            CpiError::FileNotFound(_)
            | CpiError::FileTransfer { .. }
            | CpiError::Exec { .. }
            | CpiError::AgentEnv(_) => ErrorKind::FileTransfer,
            CpiError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Phase the failure originated from, when known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            CpiError::Engine { phase, .. } | CpiError::PartialRecreate { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }

    /// Whether the director may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            CpiError::Engine { source, .. } => matches!(
                source,
                EngineError::Timeout { .. } | EngineError::Transport(_)
            ),
            CpiError::FileTransfer { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T, E = CpiError> = std::result::Result<T, E>;
