//! Network setup for unikernel sandboxes
//!
//! Provides:
//! - TAP device creation with sandbox ownership
//! - Full-duplex tc mirroring between the physical interface and the TAP
//! - Masquerade NAT and IPv4 forwarding for the static scheme
//! - Interface introspection for the sandbox boot configuration
//! - Static and dynamic addressing strategies with symmetric cleanup

pub mod host;
pub mod introspect;
pub mod ip;
pub mod kernel;
pub mod manager;
pub mod mirror;
pub mod nat;
pub mod tap;

#[cfg(test)]
pub(crate) mod fake;

pub use host::HostKernel;
pub use introspect::{ensure_eth0_exists, get_interface_info};
pub use ip::{AddressPlan, get_tap_index};
pub use kernel::{Filter, Link, LinkAddrs, NatRule, NetKernel, Qdisc, Route, TapSpec, TcHandle};
pub use manager::{
    DynamicNetwork, Manager, NetworkKind, StaticNetwork, cleanup, cleanup_with,
    new_network_manager, new_network_manager_with,
};

use serde::Serialize;

/// Physical interface every sandbox is mirrored onto
pub const DEFAULT_INTERFACE: &str = "eth0";

/// TAP device name template; `X` is replaced by the index
pub const DEFAULT_TAP: &str = "tapX_urunc";

/// Prefix shared by every TAP device counted by the allocator
pub const TAP_PREFIX: &str = "tap";

/// Gateway-side address of the static scheme
pub const STATIC_NETWORK_TAP_IP: &str = "172.16.1.1";

/// Sandbox address of the static scheme
pub const STATIC_NETWORK_UNIKERNEL_IP: &str = "172.16.1.2";

/// Gateway-side address of the static scheme with its prefix
pub const STATIC_IP_ADDR: &str = "172.16.1.1/24";

/// Sandbox address template of the dynamic scheme; `X` is index + 1
pub const DYNAMIC_NETWORK_TAP_IP: &str = "172.16.X.2";

/// Address material handed to a sandbox's network stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Interface {
    #[serde(rename = "IP")]
    pub ip: String,
    pub default_gateway: String,
    pub mask: String,
    pub interface: String,
    #[serde(rename = "MAC")]
    pub mac: String,
}

impl Interface {
    /// True when no field is empty
    pub fn is_complete(&self) -> bool {
        !self.ip.is_empty()
            && !self.default_gateway.is_empty()
            && !self.mask.is_empty()
            && !self.interface.is_empty()
            && !self.mac.is_empty()
    }
}

/// Result of a successful network setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnikernelNetworkInfo {
    pub tap_device: String,
    pub eth_device: Interface,
}
