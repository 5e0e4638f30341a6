//! Addressing strategies and teardown
//!
//! A [`Manager`] turns a sandbox's uid/gid into a ready TAP device plus
//! the addressing the sandbox should boot with. Two strategies exist:
//!
//! - [`StaticNetwork`]: fixed 172.16.1.0/24 subnet, NAT out of eth0
//! - [`DynamicNetwork`]: subnet derived from the TAP index, no NAT, one
//!   sandbox per network namespace
//!
//! Setup never rolls back. On failure the caller runs [`cleanup`] with
//! the TAP name to reclaim whatever was created.

use crate::error::{Error, Result};
use crate::network::host::HostKernel;
use crate::network::introspect::{ensure_eth0_exists, get_interface_info};
use crate::network::ip::{AddressPlan, get_tap_index};
use crate::network::kernel::{Link, NetKernel};
use crate::network::{
    DEFAULT_INTERFACE, Interface, STATIC_NETWORK_TAP_IP, STATIC_NETWORK_UNIKERNEL_IP,
    UnikernelNetworkInfo, mirror, nat, tap,
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of TAP queues
pub const DEFAULT_QUEUES: u32 = 1;

/// Network setup strategy for one sandbox
pub trait Manager: fmt::Debug + Send + Sync {
    /// Create and wire the sandbox's TAP device, owned by `uid`/`gid`
    fn network_setup(&self, uid: u32, gid: u32) -> Result<UnikernelNetworkInfo>;

    fn kind(&self) -> NetworkKind;
}

/// Addressing scheme selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Static,
    Dynamic,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Static => "static",
            NetworkKind::Dynamic => "dynamic",
        }
    }

    /// Build the strategy over `kernel`
    pub fn build(self, kernel: Arc<dyn NetKernel>, queues: u32) -> Box<dyn Manager> {
        match self {
            NetworkKind::Static => Box::new(StaticNetwork::new(kernel).with_queues(queues)),
            NetworkKind::Dynamic => Box::new(DynamicNetwork::new(kernel).with_queues(queues)),
        }
    }
}

impl FromStr for NetworkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(NetworkKind::Static),
            "dynamic" => Ok(NetworkKind::Dynamic),
            other => Err(Error::UnsupportedManager(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Select a strategy by name, operating on the host kernel
pub fn new_network_manager(kind: &str) -> Result<Box<dyn Manager>> {
    new_network_manager_with(kind, Arc::new(HostKernel::new()))
}

/// Select a strategy by name over an injected kernel
pub fn new_network_manager_with(kind: &str, kernel: Arc<dyn NetKernel>) -> Result<Box<dyn Manager>> {
    Ok(kind.parse::<NetworkKind>()?.build(kernel, DEFAULT_QUEUES))
}

/// TAP device to create for a sandbox
struct TapSetup<'a> {
    name: &'a str,
    /// Gateway-side address assigned to the TAP
    address: Ipv4Net,
    queues: u32,
}

/// Create the TAP, address it and mirror it with `redirect`
fn setup_tap(
    kernel: &dyn NetKernel,
    setup: &TapSetup<'_>,
    redirect: &Link,
    uid: u32,
    gid: u32,
) -> Result<Link> {
    let queues = i32::try_from(setup.queues)
        .map_err(|_| Error::InvalidParameter(format!("queue count {} too large", setup.queues)))?;

    let tap = tap::create_tap_device(kernel, setup.name, queues, Some(redirect.mtu), uid, gid)?;
    kernel.add_address(&tap, setup.address)?;
    debug!(tap = %tap.name, addr = %setup.address, "Assigned TAP address");

    mirror::install_mirror(kernel, redirect, &tap)?;

    Ok(tap)
}

/// Fixed 172.16.1.0/24 subnet with masquerade NAT out of eth0
pub struct StaticNetwork {
    kernel: Arc<dyn NetKernel>,
    queues: u32,
}

impl StaticNetwork {
    pub fn new(kernel: Arc<dyn NetKernel>) -> Self {
        Self {
            kernel,
            queues: DEFAULT_QUEUES,
        }
    }

    pub fn with_queues(mut self, queues: u32) -> Self {
        self.queues = queues;
        self
    }
}

impl fmt::Debug for StaticNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticNetwork")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Manager for StaticNetwork {
    fn network_setup(&self, uid: u32, gid: u32) -> Result<UnikernelNetworkInfo> {
        let kernel = &*self.kernel;
        ensure_eth0_exists(kernel)?;

        let plan = AddressPlan::fixed();
        let eth0 = kernel.link_by_name(DEFAULT_INTERFACE)?;

        let setup = TapSetup {
            name: &plan.tap_name,
            address: plan.tap_addr,
            queues: self.queues,
        };
        setup_tap(kernel, &setup, &eth0, uid, gid)?;

        nat::set_nat_rule(kernel, DEFAULT_INTERFACE, plan.subnet())?;

        let eth = get_interface_info(kernel, DEFAULT_INTERFACE)?;
        info!(tap = %plan.tap_name, sandbox_ip = STATIC_NETWORK_UNIKERNEL_IP, "Static network ready");

        Ok(UnikernelNetworkInfo {
            tap_device: plan.tap_name.clone(),
            eth_device: Interface {
                ip: STATIC_NETWORK_UNIKERNEL_IP.to_string(),
                default_gateway: STATIC_NETWORK_TAP_IP.to_string(),
                mask: plan.mask(),
                interface: DEFAULT_INTERFACE.to_string(),
                mac: eth.mac,
            },
        })
    }

    fn kind(&self) -> NetworkKind {
        NetworkKind::Static
    }
}

/// Index-derived subnet, mirrored without NAT
///
/// Each sandbox is expected to own its network namespace, so only TAP
/// index 0 is accepted.
pub struct DynamicNetwork {
    kernel: Arc<dyn NetKernel>,
    queues: u32,
}

impl DynamicNetwork {
    pub fn new(kernel: Arc<dyn NetKernel>) -> Self {
        Self {
            kernel,
            queues: DEFAULT_QUEUES,
        }
    }

    pub fn with_queues(mut self, queues: u32) -> Self {
        self.queues = queues;
        self
    }
}

impl fmt::Debug for DynamicNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicNetwork")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Manager for DynamicNetwork {
    fn network_setup(&self, uid: u32, gid: u32) -> Result<UnikernelNetworkInfo> {
        let kernel = &*self.kernel;
        ensure_eth0_exists(kernel)?;

        let index = get_tap_index(kernel)?;
        if index > 0 {
            return Err(Error::MultipleSandboxes);
        }
        let index = u8::try_from(index).map_err(|_| Error::TapIndexExhausted(index))?;

        let plan = AddressPlan::for_index(index);
        let eth0 = kernel.link_by_name(DEFAULT_INTERFACE)?;

        let setup = TapSetup {
            name: &plan.tap_name,
            address: plan.tap_addr,
            queues: self.queues,
        };
        setup_tap(kernel, &setup, &eth0, uid, gid)?;

        let eth = get_interface_info(kernel, DEFAULT_INTERFACE)?;
        info!(tap = %plan.tap_name, sandbox_ip = %plan.sandbox_ip(), "Dynamic network ready");

        Ok(UnikernelNetworkInfo {
            tap_device: plan.tap_name.clone(),
            eth_device: Interface {
                ip: plan.sandbox_ip(),
                default_gateway: plan.gateway_ip(),
                mask: plan.mask(),
                interface: eth.interface,
                mac: eth.mac,
            },
        })
    }

    fn kind(&self) -> NetworkKind {
        NetworkKind::Dynamic
    }
}

/// Tear down the sandbox network behind `tap_name` on the host kernel
pub fn cleanup(tap_name: &str) -> Result<()> {
    cleanup_with(&HostKernel::new(), tap_name)
}

/// Tear down the sandbox network behind `tap_name`
///
/// A missing TAP is reported as [`Error::LinkNotFound`]. Removal of tc
/// state and NAT rules is best effort; only deleting the device itself
/// can fail the call once the TAP is resolved. The physical interface is
/// refused before anything is touched.
pub fn cleanup_with(kernel: &dyn NetKernel, tap_name: &str) -> Result<()> {
    if tap_name == DEFAULT_INTERFACE {
        return Err(Error::InvalidParameter(format!(
            "refusing to clean up physical interface {}",
            tap_name
        )));
    }
    let tap = kernel.link_by_name(tap_name)?;

    if let Err(e) = mirror::delete_all_tc_filters(kernel, Some(&tap)) {
        warn!(tap = tap_name, error = %e, "Failed to delete TAP filters");
    }
    if let Err(e) = mirror::delete_all_qdiscs(kernel, Some(&tap)) {
        warn!(tap = tap_name, error = %e, "Failed to delete TAP qdiscs");
    }

    match kernel.link_by_name(DEFAULT_INTERFACE) {
        Ok(eth0) => remove_physical_rules(kernel, &eth0, tap_name),
        Err(e) => debug!(error = %e, "Skipping physical interface rules"),
    }

    if let Some(plan) = AddressPlan::from_tap_name(tap_name)
        && let Err(e) = nat::remove_nat_rule(kernel, DEFAULT_INTERFACE, plan.subnet())
    {
        warn!(tap = tap_name, error = %e, "Failed to remove NAT rule");
    }

    tap::delete_tap_device(kernel, Some(&tap))?;
    info!(tap = tap_name, "Sandbox network removed");
    Ok(())
}

/// Drop eth0 redirects towards the TAP, and the ingress qdisc once unused
fn remove_physical_rules(kernel: &dyn NetKernel, eth0: &Link, tap_name: &str) {
    let remaining = match mirror::delete_redirects_to(kernel, eth0, tap_name) {
        Ok(remaining) => remaining,
        Err(e) => {
            warn!(link = %eth0.name, error = %e, "Failed to delete redirect filters");
            return;
        }
    };

    if remaining > 0 {
        debug!(link = %eth0.name, remaining, "Keeping ingress qdisc in use");
        return;
    }

    let result = kernel.qdiscs(eth0).and_then(|qdiscs| {
        qdiscs
            .iter()
            .filter(|q| q.is_ingress())
            .try_for_each(|q| kernel.del_qdisc(eth0, q))
    });
    if let Err(e) = result {
        warn!(link = %eth0.name, error = %e, "Failed to delete ingress qdisc");
    }
}
