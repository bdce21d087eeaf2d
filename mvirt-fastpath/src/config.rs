//! Fast path configuration.
//!
//! One configuration per attached hook. The hook kind decides which
//! direction-dependent branches of the pipeline apply; everything else is
//! node-wide and normally identical across hooks.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Well-known VXLAN port.
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// VNI used for node-to-node forwarding of service traffic.
pub const DEFAULT_VXLAN_VNI: u32 = 0xca11c0;

/// Inner MTU available once VXLAN overhead is subtracted from 1500.
pub const DEFAULT_TUNNEL_MTU: u16 = 1450;

/// Smallest MTU every IPv4 host must accept.
const MIN_TUNNEL_MTU: u16 = 576;

/// Where the hook is attached, seen from the host namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Ingress from a workload (packets towards the host)
    #[default]
    FromWorkload,
    /// Egress to a workload
    ToWorkload,
    /// Ingress on a host interface
    FromHost,
    /// Egress on a host interface
    ToHost,
}

/// Verdict for new workload-to-host flows after policy allowed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointToHostAction {
    #[default]
    Accept,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    pub hook: Hook,
    /// Host device is an IPIP tunnel device
    pub tunnel: bool,
    /// Host device is a wireguard device
    pub wireguard: bool,
    /// XDP entry mode, no ethertype hint from the stack
    pub xdp: bool,
    /// Direct server return for node ports
    pub dsr: bool,
    pub host_ip: Ipv4Addr,
    pub vxlan_port: u16,
    pub vxlan_vni: u32,
    pub tunnel_mtu: u16,
    pub endpoint_to_host_action: EndpointToHostAction,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            hook: Hook::default(),
            tunnel: false,
            wireguard: false,
            xdp: false,
            dsr: false,
            host_ip: Ipv4Addr::UNSPECIFIED,
            vxlan_port: DEFAULT_VXLAN_PORT,
            vxlan_vni: DEFAULT_VXLAN_VNI,
            tunnel_mtu: DEFAULT_TUNNEL_MTU,
            endpoint_to_host_action: EndpointToHostAction::default(),
        }
    }
}

impl FastPathConfig {
    pub fn new(hook: Hook, host_ip: Ipv4Addr) -> Self {
        Self {
            hook,
            host_ip,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_ip.is_unspecified() {
            return Err(ConfigError::Invalid("host_ip must be set".into()));
        }
        if self.vxlan_port == 0 {
            return Err(ConfigError::Invalid("vxlan_port must not be 0".into()));
        }
        if self.vxlan_vni > 0x00ff_ffff {
            return Err(ConfigError::Invalid(format!(
                "vxlan_vni {:#x} does not fit in 24 bits",
                self.vxlan_vni
            )));
        }
        if self.tunnel_mtu < MIN_TUNNEL_MTU {
            return Err(ConfigError::Invalid(format!(
                "tunnel_mtu {} below minimum {}",
                self.tunnel_mtu, MIN_TUNNEL_MTU
            )));
        }
        if (self.tunnel || self.wireguard) && !self.hep() {
            return Err(ConfigError::Invalid(
                "tunnel/wireguard only apply to host hooks".into(),
            ));
        }
        Ok(())
    }

    pub fn from_wep(&self) -> bool {
        self.hook == Hook::FromWorkload
    }

    pub fn to_wep(&self) -> bool {
        self.hook == Hook::ToWorkload
    }

    pub fn from_hep(&self) -> bool {
        self.hook == Hook::FromHost
    }

    pub fn to_hep(&self) -> bool {
        self.hook == Hook::ToHost
    }

    pub fn wep(&self) -> bool {
        self.from_wep() || self.to_wep()
    }

    pub fn hep(&self) -> bool {
        self.from_hep() || self.to_hep()
    }

    /// Packet is moving towards the host namespace.
    pub fn to_host(&self) -> bool {
        self.from_wep() || self.from_hep()
    }

    /// Packet is leaving the host namespace; routing already happened.
    pub fn from_host(&self) -> bool {
        self.to_wep() || self.to_hep()
    }

    fn plain_hep(&self) -> bool {
        !self.tunnel && !self.wireguard
    }

    /// Node port traffic arriving on a data interface.
    pub fn dnat_should_encap(&self) -> bool {
        self.from_hep() && self.plain_hep()
    }

    pub fn dnat_should_decap(&self) -> bool {
        self.from_hep() && self.plain_hep()
    }

    /// Return traffic of a forwarded node port flow leaving a local backend.
    pub fn dnat_return_should_encap(&self) -> bool {
        self.from_wep() && self.plain_hep()
    }

    pub fn drop_workload_to_host(&self) -> bool {
        self.endpoint_to_host_action == EndpointToHostAction::Drop
    }
}
