//! Errors raised while decoding identities, networks and agent settings

use thiserror::Error;

/// Errors raised while interpreting director-supplied data
#[derive(Debug, Error)]
pub enum SpecError {
    /// Identity string does not carry the expected prefix
    #[error("invalid {kind} id '{value}': expected prefix '{prefix}'")]
    InvalidId {
        kind: &'static str,
        value: String,
        prefix: &'static str,
    },

    /// Network address, netmask or subnet could not be interpreted
    #[error("invalid network '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    /// Network cloud properties did not decode
    #[error("invalid cloud properties for network '{network}': {source}")]
    NetworkProperties {
        network: String,
        #[source]
        source: serde_json::Error,
    },

    /// Agent environment could not be encoded or decoded
    #[error("agent env JSON error: {0}")]
    AgentEnv(#[from] serde_json::Error),
}

pub type Result<T, E = SpecError> = std::result::Result<T, E>;
