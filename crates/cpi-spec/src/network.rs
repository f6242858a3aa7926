//! Director network descriptions

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::{Result, SpecError};

/// Networks keyed by the director's network name
pub type Networks = BTreeMap<String, Network>;

/// One network as described by the director
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netmask: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default)]
    pub preconfigured: bool,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub cloud_properties: Map<String, Value>,
}

impl Network {
    /// A network without a netmask gets its address from the engine.
    pub fn is_dynamic(&self) -> bool {
        self.netmask.is_empty()
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip
            .parse::<IpAddr>()
            .map(|addr| addr.is_ipv6())
            .unwrap_or(false)
    }

    pub fn address(&self, name: &str) -> Result<IpAddr> {
        self.ip.parse().map_err(|_| SpecError::InvalidNetwork {
            network: name.to_string(),
            reason: format!("'{}' is not an IP address", self.ip),
        })
    }

    /// Subnet derived from `ip` and `netmask`.
    ///
    /// The netmask may be dotted (`255.255.255.0`, `ffff:ffff::`) or a bare
    /// prefix length (`24`).
    pub fn subnet(&self, name: &str) -> Result<IpNet> {
        let addr = self.address(name)?;
        let invalid = |reason: String| SpecError::InvalidNetwork {
            network: name.to_string(),
            reason,
        };

        let prefix = match self.netmask.parse::<u8>() {
            Ok(prefix) => prefix,
            Err(_) => {
                let mask: IpAddr = self
                    .netmask
                    .parse()
                    .map_err(|_| invalid(format!("'{}' is not a netmask", self.netmask)))?;
                let prefix = match (addr, mask) {
                    (IpAddr::V4(_), IpAddr::V4(mask)) => ipnet::ipv4_mask_to_prefix(mask),
                    (IpAddr::V6(_), IpAddr::V6(mask)) => ipnet::ipv6_mask_to_prefix(mask),
                    _ => {
                        return Err(invalid(format!(
                            "address '{}' and netmask '{}' differ in family",
                            self.ip, self.netmask
                        )))
                    }
                };
                prefix.map_err(|_| invalid(format!("'{}' is not contiguous", self.netmask)))?
            }
        };

        IpNet::new(addr, prefix)
            .map(|net| net.trunc())
            .map_err(|_| invalid(format!("prefix length {prefix} out of range")))
    }

    /// Driver-level properties from `cloud_properties`.
    pub fn net_props(&self, name: &str) -> Result<NetProps> {
        serde_json::from_value(Value::Object(self.cloud_properties.clone())).map_err(|source| {
            SpecError::NetworkProperties {
                network: name.to_string(),
                source,
            }
        })
    }
}

/// Engine-side properties of a director network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetProps {
    /// Engine network name; empty means "derive one"
    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default = "default_driver", alias = "Driver")]
    pub driver: String,

    /// Dynamic networks carry no subnet, so IPv6 intent is explicit here
    #[serde(default)]
    pub enable_ipv6: bool,
}

fn default_driver() -> String {
    "bridge".to_string()
}

impl Default for NetProps {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: default_driver(),
            enable_ipv6: false,
        }
    }
}
