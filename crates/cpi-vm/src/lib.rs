//! VM-as-container core of the Docker CPI
//!
//! A director VM is a running container whose name is the VM id. Disk
//! attach and detach rebuild that container with a changed bind list while
//! keeping the id, networks and agent state intact (see [`container`]).
//!
//! Every component receives the engine as an explicit `Arc<dyn Engine>`;
//! [`engines::DockerEngine`] talks to a real daemon and
//! [`engines::MockEngine`] keeps everything in memory for tests.

pub mod agent_env;
pub mod config;
pub mod connect;
pub mod container;
pub mod cpi;
pub mod disk;
pub mod engine;
pub mod engines;
pub mod error;
pub mod factory;
pub mod files;
pub mod init_system;
pub mod locator;
pub mod network;
pub mod props;
pub mod resources;

pub use agent_env::{AgentEnvService, FsAgentEnvService};
pub use config::{ActionsConfig, AgentConfig, CpiConfig, DockerOpts, TlsOpts};
pub use container::{Container, Vm};
pub use cpi::{Cpi, CpiInfo, API_VERSION, STEMCELL_FORMATS};
pub use disk::{Disk, DiskFactory, Volume};
pub use engine::{ContainerSpec, Engine, EngineError, EngineResult, HostResources, Platform};
pub use error::{CpiError, ErrorKind, Phase, Result};
pub use factory::VmFactory;
pub use files::FileService;
pub use init_system::InitSystem;
pub use locator::{DiskLocation, VolumeLocator};
pub use network::{split_endpoints, EndpointSplit, NetworkManager, NetworkSetup};
pub use props::VmProps;
pub use resources::ResourceValidator;
