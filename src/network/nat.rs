//! Masquerade NAT and IPv4 forwarding
//!
//! Used by the static scheme only: the sandbox subnet is private to the
//! host and leaves through the physical interface with the host's
//! address.

use crate::error::Result;
use crate::network::kernel::{NatRule, NetKernel};
use ipnet::Ipv4Net;
use tracing::{debug, info};

/// Masquerade `subnet` leaving via `iface` and enable IPv4 forwarding
///
/// The rule is appended only if not already present. Forwarding is
/// written only when it is off, and is never turned back off here.
pub fn set_nat_rule(kernel: &dyn NetKernel, iface: &str, subnet: Ipv4Net) -> Result<()> {
    let rule = NatRule::masquerade(iface, subnet);

    if kernel.nat_rule_exists(&rule)? {
        debug!(rule = %rule, "NAT rule already present");
    } else {
        kernel.append_nat_rule(&rule)?;
        info!(rule = %rule, "Added NAT rule");
    }

    enable_forwarding(kernel)
}

/// Remove the masquerade rule for `subnet` via `iface`, if present
///
/// Returns whether a rule was removed.
pub fn remove_nat_rule(kernel: &dyn NetKernel, iface: &str, subnet: Ipv4Net) -> Result<bool> {
    let rule = NatRule::masquerade(iface, subnet);
    if !kernel.nat_rule_exists(&rule)? {
        return Ok(false);
    }

    kernel.delete_nat_rule(&rule)?;
    info!(rule = %rule, "Removed NAT rule");
    Ok(true)
}

fn enable_forwarding(kernel: &dyn NetKernel) -> Result<()> {
    if kernel.ipv4_forwarding()? {
        return Ok(());
    }

    kernel.set_ipv4_forwarding(true)?;
    info!("Enabled IPv4 forwarding");
    Ok(())
}
