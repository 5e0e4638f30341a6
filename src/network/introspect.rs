//! Interface introspection
//!
//! Reads the addressing of the physical interface so it can be reported
//! to the sandbox.

use crate::error::{Error, MissingAttribute, Result};
use crate::network::kernel::NetKernel;
use crate::network::{DEFAULT_INTERFACE, Interface};
use std::net::Ipv4Addr;
use tracing::debug;

/// Fail unless an interface literally named `eth0` exists
pub fn ensure_eth0_exists(kernel: &dyn NetKernel) -> Result<()> {
    let names = kernel.link_names()?;
    if names.iter().any(|n| n == DEFAULT_INTERFACE) {
        return Ok(());
    }
    Err(Error::DeviceNotFound(DEFAULT_INTERFACE.to_string()))
}

/// Format a hardware address as colon-separated lowercase hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Collect MAC, IPv4, mask and default gateway of `name`
///
/// The `interface` field of the result is always [`DEFAULT_INTERFACE`],
/// whatever `name` was queried. An interface without a default route
/// yields an empty gateway.
pub fn get_interface_info(kernel: &dyn NetKernel, name: &str) -> Result<Interface> {
    let addrs = kernel.link_addrs(name)?;
    let absent = |missing| Error::Introspection {
        iface: name.to_string(),
        missing,
    };

    let mac = addrs.mac.ok_or_else(|| absent(MissingAttribute::Mac))?;
    let mask = addrs.netmask.ok_or_else(|| absent(MissingAttribute::Mask))?;
    let ip = addrs.ipv4.ok_or_else(|| absent(MissingAttribute::Ipv4))?;

    let gateway = default_gateway(kernel, name)?;
    debug!(iface = name, %ip, %mask, gateway = ?gateway, "Introspected interface");

    Ok(Interface {
        ip: ip.to_string(),
        default_gateway: gateway.map(|g| g.to_string()).unwrap_or_default(),
        mask: mask.to_string(),
        interface: DEFAULT_INTERFACE.to_string(),
        mac: format_mac(&mac),
    })
}

fn default_gateway(kernel: &dyn NetKernel, name: &str) -> Result<Option<Ipv4Addr>> {
    Ok(kernel
        .routes()?
        .into_iter()
        .find(|r| r.iface == name && r.is_default())
        .and_then(|r| r.gateway))
}
