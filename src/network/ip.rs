//! Address planning for sandbox networks
//!
//! Provides:
//! - Per-index TAP naming and /24 subnet derivation
//! - The fixed static scheme
//! - TAP index allocation by counting existing devices

use crate::error::{Error, Result};
use crate::network::kernel::NetKernel;
use crate::network::{DEFAULT_TAP, TAP_PREFIX};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::debug;

/// Highest index a TAP device can take
pub const MAX_TAP_INDEX: usize = 255;

/// Prefix length of every sandbox subnet
const SUBNET_PREFIX: u8 = 24;

/// Addressing of one sandbox: device name, gateway side and sandbox side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPlan {
    /// TAP device name (e.g., "tap0_urunc")
    pub tap_name: String,
    /// Address assigned to the TAP, used by the sandbox as its gateway
    pub tap_addr: Ipv4Net,
    /// Address reserved for the sandbox itself
    pub sandbox_addr: Ipv4Net,
}

impl AddressPlan {
    /// Fixed plan of the static scheme
    pub fn fixed() -> Self {
        // 172.16.1.0/24 is the dynamic plan's index 0
        Self::for_index(0)
    }

    /// Plan for TAP index `index`: subnet `172.16.<index+1>.0/24`
    ///
    /// The third octet saturates, so index 255 shares index 254's subnet.
    pub fn for_index(index: u8) -> Self {
        let octet = index.saturating_add(1);
        Self {
            tap_name: tap_name(index as usize),
            tap_addr: Ipv4Net::new_assert(Ipv4Addr::new(172, 16, octet, 1), SUBNET_PREFIX),
            sandbox_addr: Ipv4Net::new_assert(Ipv4Addr::new(172, 16, octet, 2), SUBNET_PREFIX),
        }
    }

    /// Recover the plan behind a TAP name built by [`tap_name`]
    pub fn from_tap_name(name: &str) -> Option<Self> {
        let index: u8 = name
            .strip_prefix(TAP_PREFIX)?
            .strip_suffix("_urunc")?
            .parse()
            .ok()?;
        Some(Self::for_index(index))
    }

    /// Sandbox subnet (network address form)
    pub fn subnet(&self) -> Ipv4Net {
        self.sandbox_addr.trunc()
    }

    /// Sandbox IP in dotted-decimal
    pub fn sandbox_ip(&self) -> String {
        self.sandbox_addr.addr().to_string()
    }

    /// Gateway IP in dotted-decimal
    pub fn gateway_ip(&self) -> String {
        self.tap_addr.addr().to_string()
    }

    /// Subnet mask in dotted-decimal
    pub fn mask(&self) -> String {
        self.sandbox_addr.netmask().to_string()
    }
}

/// TAP device name for an index
pub fn tap_name(index: usize) -> String {
    DEFAULT_TAP.replace('X', &index.to_string())
}

/// Next free TAP index: the number of existing `tap*` interfaces
///
/// This is a snapshot, not a reservation. Two concurrent callers in the
/// same namespace can observe the same count.
pub fn get_tap_index(kernel: &dyn NetKernel) -> Result<usize> {
    let index = count_taps(&kernel.link_names()?);
    if index > MAX_TAP_INDEX {
        return Err(Error::TapIndexExhausted(index));
    }

    debug!(index, "Computed next TAP index");
    Ok(index)
}

fn count_taps(names: &[String]) -> usize {
    names.iter().filter(|n| n.starts_with(TAP_PREFIX)).count()
}
