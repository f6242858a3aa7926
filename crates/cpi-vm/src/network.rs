//! Per-VM network setup
//!
//! Every director network maps onto an engine network that is created on
//! first use and reused afterwards. Fixed-subnet networks that collide with
//! an existing engine network adopt it when the director did not insist on a
//! name.

use bollard::models::{EndpointIpamConfig, EndpointSettings};
use cpi_spec::{Network, Networks};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use crate::engine::{Engine, NetworkRequest};
use crate::error::{CpiError, Phase, Result};

/// Engine message for a subnet already claimed by another network
static SUBNET_CONFLICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"conflicts with network (\S+) \(.+\): networks have overlapping IPv[46]")
        .expect("subnet conflict pattern is valid")
});

/// Engines attach an IPv4 address even to IPv6-only networks; drop the
/// global ones from every interface but loopback.
const STRIP_IPV4_SCRIPT: &str = "for i in $(ls /sys/class/net); do if [ \"$i\" != \"lo\" ]; then ip -4 addr flush dev \"$i\" scope global; fi; done";

const NOOP_SCRIPT: &str = "true";

/// Result of enabling a VM's networks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSetup {
    /// Shell snippet run inside the VM before services start
    pub init_script: String,

    /// Endpoint settings keyed by engine network name
    pub endpoints: HashMap<String, EndpointSettings>,
}

/// Endpoints divided into the one passed at creation and the rest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointSplit {
    /// At most one entry
    pub primary: HashMap<String, EndpointSettings>,

    /// Connected after creation, in name order
    pub additional: BTreeMap<String, EndpointSettings>,
}

/// Pick the endpoint with the smallest network name as primary.
pub fn split_endpoints(endpoints: HashMap<String, EndpointSettings>) -> EndpointSplit {
    let mut additional: BTreeMap<_, _> = endpoints.into_iter().collect();
    let primary = additional.pop_first().into_iter().collect();
    EndpointSplit {
        primary,
        additional,
    }
}

/// Creates or reuses engine networks
pub struct NetworkManager {
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager").finish_non_exhaustive()
    }
}

impl NetworkManager {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Ensure an engine network exists for each director network and build
    /// the endpoint settings for the VM. Marks every network preconfigured.
    ///
    /// # Errors
    ///
    /// Returns [`CpiError::Validation`] for an empty network set or an
    /// unnamed dynamic network, [`CpiError::Spec`] for an unparsable address
    /// or netmask, [`CpiError::NetworkConflict`] when an explicitly
    /// named network overlaps an existing subnet under another name, and an
    /// engine error if creating a network fails for any other reason.
    pub async fn enable(&self, networks: &mut Networks) -> Result<NetworkSetup> {
        if networks.is_empty() {
            return Err(CpiError::Validation(
                "Expected at least one network; received zero".to_string(),
            ));
        }

        let mut endpoints = HashMap::with_capacity(networks.len());
        let mut ipv6_only = true;

        for (name, network) in networks.iter_mut() {
            network.preconfigured = true;

            let (engine_name, ipv6) = if network.is_dynamic() {
                self.create_dynamic(name, network).await?
            } else {
                self.create_manual(name, network).await?
            };
            ipv6_only &= ipv6;

            endpoints.insert(engine_name, endpoint_settings(name, network)?);
        }

        Ok(NetworkSetup {
            init_script: if ipv6_only { STRIP_IPV4_SCRIPT } else { NOOP_SCRIPT }.to_string(),
            endpoints,
        })
    }

    /// Returns the engine network name and whether it is IPv6-only.
    async fn create_dynamic(&self, name: &str, network: &Network) -> Result<(String, bool)> {
        let props = network.net_props(name)?;
        if props.name.is_empty() {
            return Err(CpiError::Validation(format!(
                "Expected dynamic network '{name}' to specify 'name'"
            )));
        }

        let request = NetworkRequest {
            name: props.name.clone(),
            driver: props.driver,
            enable_ipv6: props.enable_ipv6,
            subnet: None,
            gateway: None,
        };
        match self.engine.create_network(&request).await {
            Ok(()) => tracing::debug!(network = %request.name, "created dynamic network"),
            Err(e) if e.is_already_exists() || e.is_predefined_network() => {
                tracing::debug!(network = %request.name, "reusing dynamic network");
            }
            Err(e) => return Err(CpiError::engine(Phase::EnableNetworks)(e)),
        }
        Ok((request.name, props.enable_ipv6))
    }

    async fn create_manual(&self, name: &str, network: &Network) -> Result<(String, bool)> {
        let props = network.net_props(name)?;
        let subnet = network.subnet(name)?;
        let ipv6 = subnet.addr().is_ipv6();
        let engine_name = if props.name.is_empty() {
            subnet.to_string()
        } else {
            props.name.clone()
        };

        let request = NetworkRequest {
            name: engine_name.clone(),
            driver: props.driver,
            enable_ipv6: ipv6 || props.enable_ipv6,
            subnet: Some(subnet),
            gateway: Some(network.gateway.clone()).filter(|gw| !gw.is_empty()),
        };

        let err = match self.engine.create_network(&request).await {
            Ok(()) => {
                tracing::debug!(network = %engine_name, %subnet, "created manual network");
                return Ok((engine_name, ipv6));
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(network = %engine_name, "reusing manual network");
                return Ok((engine_name, ipv6));
            }
            Err(e) => e,
        };

        let message = err.to_string();
        let Some(existing) = SUBNET_CONFLICT
            .captures(&message)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
        else {
            return Err(CpiError::engine(Phase::EnableNetworks)(err));
        };

        if !props.name.is_empty() && props.name != existing {
            return Err(CpiError::NetworkConflict {
                requested: props.name,
                existing,
                subnet: subnet.to_string(),
            });
        }

        tracing::warn!(
            network = name,
            existing = %existing,
            %subnet,
            "subnet already in use, adopting existing network"
        );
        Ok((existing, ipv6))
    }
}

fn endpoint_settings(name: &str, network: &Network) -> Result<EndpointSettings> {
    let mut settings = EndpointSettings {
        mac_address: network.mac.clone().filter(|mac| !mac.is_empty()),
        ..Default::default()
    };
    if network.is_dynamic() {
        return Ok(settings);
    }

    let ipam = match network.address(name)? {
        IpAddr::V4(addr) => EndpointIpamConfig {
            ipv4_address: Some(addr.to_string()),
            ..Default::default()
        },
        IpAddr::V6(addr) => EndpointIpamConfig {
            ipv6_address: Some(addr.to_string()),
            ..Default::default()
        },
    };
    settings.ipam_config = Some(ipam);
    Ok(settings)
}
