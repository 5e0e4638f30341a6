//! TAP device lifecycle
//!
//! A TAP device is the sandbox's end of the network path. It is created
//! persistent and owned by the sandbox's uid/gid so the unprivileged
//! process can attach its queues directly.

use crate::error::{Error, Result};
use crate::network::kernel::{Link, NetKernel, TapSpec};
use tracing::{debug, info};

/// Create a multi-queue TAP device and bring it up
///
/// `queues` of 0 opens a single queue. `mtu` of `None` keeps the kernel
/// default.
pub fn create_tap_device(
    kernel: &dyn NetKernel,
    name: &str,
    queues: i32,
    mtu: Option<u32>,
    uid: u32,
    gid: u32,
) -> Result<Link> {
    if name.is_empty() {
        return Err(Error::InvalidParameter(
            "TAP device name must not be empty".to_string(),
        ));
    }
    if queues < 0 {
        return Err(Error::InvalidParameter(format!(
            "negative queue count {} for {}",
            queues, name
        )));
    }

    let spec = TapSpec {
        name: name.to_string(),
        queues: (queues as u32).max(1),
        mtu,
        owner: uid,
        group: gid,
    };

    let link = kernel.add_tap(&spec)?;
    kernel.set_link_up(&link)?;

    info!(tap = %link.name, queues = spec.queues, mtu = link.mtu, uid, gid, "Created TAP device");
    Ok(link)
}

/// Remove a TAP device
///
/// # Panics
///
/// Panics when `link` is `None`. Callers resolve the device first; an
/// unresolved handle here is a programming error.
pub fn delete_tap_device(kernel: &dyn NetKernel, link: Option<&Link>) -> Result<()> {
    let Some(link) = link else {
        panic!("delete_tap_device called without a resolved TAP link");
    };

    kernel.delete_link(link)?;
    debug!(tap = %link.name, "Deleted TAP device");
    Ok(())
}
