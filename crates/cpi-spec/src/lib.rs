//! Shared data model for the Docker CPI
//!
//! Everything in this crate is plain data: identities handed out to the
//! director, the network descriptions it sends, and the agent environment
//! document written into every VM.

mod agent_env;
mod error;
mod ids;
mod network;

pub use agent_env::*;
pub use error::*;
pub use ids::*;
pub use network::*;

/// Fixed locations shared with the in-VM agent.
pub mod paths {
    /// Agent environment document, written on create and on every disk change
    pub const AGENT_ENV: &str = "/var/vcap/bosh/warden-cpi-agent-env.json";

    /// Settings the agent rewrites at runtime
    pub const UPDATE_SETTINGS: &str = "/var/vcap/bosh/update_settings.json";

    /// DNS records maintained by the agent
    pub const DNS_RECORDS: &str = "/var/vcap/instance/dns/records.json";

    /// Mount point of the ephemeral volume
    pub const EPHEMERAL_MOUNT: &str = "/var/vcap/data/";

    /// Parent directory of persistent disk mount points
    pub const PERSISTENT_DISK_ROOT: &str = "/warden-cpi-dev";
}
