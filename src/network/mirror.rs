//! Full-duplex traffic mirroring with tc
//!
//! There is no bridge between the physical interface and the TAP. Each
//! link gets an ingress qdisc, and a match-all u32 filter on it redirects
//! every frame to the other link. Two filters (eth0 -> tap, tap -> eth0)
//! give a full-duplex path.
//!
//! A filter can only be attached once the ingress qdisc of its link
//! exists, so [`add_ingress_qdisc`] always runs before
//! [`add_redirect_filter`] on the same link.

use crate::error::{Error, Result};
use crate::network::kernel::{Filter, Link, NetKernel, Qdisc, TcHandle};
use tracing::{debug, info};

fn require<'a>(link: Option<&'a Link>, what: &str) -> Result<&'a Link> {
    link.ok_or_else(|| Error::InvalidParameter(format!("{} link is required", what)))
}

/// Attach an ingress qdisc to `link`
pub fn add_ingress_qdisc(kernel: &dyn NetKernel, link: Option<&Link>) -> Result<()> {
    let link = require(link, "ingress qdisc")?;

    kernel.add_qdisc(link, &Qdisc::ingress())?;
    debug!(link = %link.name, "Added ingress qdisc");
    Ok(())
}

/// Redirect everything entering `src` to `dst`
pub fn add_redirect_filter(
    kernel: &dyn NetKernel,
    src: Option<&Link>,
    dst: Option<&Link>,
) -> Result<()> {
    let src = require(src, "redirect source")?;
    let dst = require(dst, "redirect target")?;

    kernel.add_filter(src, &Filter::redirect(&dst.name))?;
    info!(from = %src.name, to = %dst.name, "Installed redirect filter");
    Ok(())
}

/// Remove every qdisc on `link`
///
/// Qdiscs the kernel attaches by itself (handle `0:`) cannot be deleted
/// and are skipped. Only top-level qdiscs are deleted; their children
/// are torn down by the kernel along with them.
pub fn delete_all_qdiscs(kernel: &dyn NetKernel, link: Option<&Link>) -> Result<()> {
    let link = require(link, "qdisc cleanup")?;

    for qdisc in kernel.qdiscs(link)? {
        if qdisc.is_kernel_default() || !qdisc.is_top_level() {
            continue;
        }
        kernel.del_qdisc(link, &qdisc)?;
        debug!(link = %link.name, kind = %qdisc.kind, handle = %qdisc.handle, "Deleted qdisc");
    }

    Ok(())
}

/// Remove every ingress filter on `link`
pub fn delete_all_tc_filters(kernel: &dyn NetKernel, link: Option<&Link>) -> Result<()> {
    let link = require(link, "filter cleanup")?;

    for filter in kernel.filters(link, TcHandle::INGRESS)? {
        kernel.del_filter(link, &filter)?;
        debug!(link = %link.name, priority = filter.priority, "Deleted filter");
    }

    Ok(())
}

/// Remove only the ingress filters on `link` that redirect to `target`
///
/// Returns how many filters remain under the ingress qdisc afterwards.
pub fn delete_redirects_to(kernel: &dyn NetKernel, link: &Link, target: &str) -> Result<usize> {
    let filters = kernel.filters(link, TcHandle::INGRESS)?;
    let mut remaining = filters.len();

    for filter in filters.iter().filter(|f| f.redirects_to(target)) {
        kernel.del_filter(link, filter)?;
        remaining -= 1;
        debug!(link = %link.name, to = target, priority = filter.priority, "Deleted redirect filter");
    }

    Ok(remaining)
}

/// Install the full-duplex mirror between `physical` and `tap`
///
/// Stale filters and qdiscs on both links are cleared first.
pub fn install_mirror(kernel: &dyn NetKernel, physical: &Link, tap: &Link) -> Result<()> {
    delete_all_tc_filters(kernel, Some(physical))?;
    delete_all_qdiscs(kernel, Some(physical))?;
    delete_all_tc_filters(kernel, Some(tap))?;
    delete_all_qdiscs(kernel, Some(tap))?;

    add_ingress_qdisc(kernel, Some(physical))?;
    add_ingress_qdisc(kernel, Some(tap))?;

    add_redirect_filter(kernel, Some(physical), Some(tap))?;
    add_redirect_filter(kernel, Some(tap), Some(physical))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::fake::FakeKernel;
    use crate::network::kernel::TapSpec;

    fn setup() -> (FakeKernel, Link, Link) {
        let kernel = FakeKernel::with_eth0();
        let tap = kernel
            .add_tap(&TapSpec {
                name: "tap0_urunc".to_string(),
                queues: 1,
                mtu: Some(1500),
                owner: 0,
                group: 0,
            })
            .unwrap();
        let eth0 = kernel.link_by_name("eth0").unwrap();
        (kernel, eth0, tap)
    }

    #[test]
    fn test_absent_links_are_errors() {
        let (kernel, eth0, _) = setup();

        assert!(matches!(
            add_ingress_qdisc(&kernel, None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            add_redirect_filter(&kernel, None, Some(&eth0)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            add_redirect_filter(&kernel, Some(&eth0), None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            delete_all_qdiscs(&kernel, None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            delete_all_tc_filters(&kernel, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_filter_requires_ingress_qdisc() {
        let (kernel, eth0, tap) = setup();

        assert!(add_redirect_filter(&kernel, Some(&eth0), Some(&tap)).is_err());

        add_ingress_qdisc(&kernel, Some(&eth0)).unwrap();
        add_redirect_filter(&kernel, Some(&eth0), Some(&tap)).unwrap();

        let filters = kernel.filters(&eth0, TcHandle::INGRESS).unwrap();
        assert_eq!(filters.len(), 1);
        assert!(filters[0].redirects_to("tap0_urunc"));
    }

    #[test]
    fn test_install_mirror_is_full_duplex() {
        let (kernel, eth0, tap) = setup();
        install_mirror(&kernel, &eth0, &tap).unwrap();

        let eth0_state = kernel.link("eth0").unwrap();
        assert_eq!(eth0_state.qdiscs, vec![Qdisc::ingress()]);
        assert_eq!(eth0_state.filters.len(), 1);
        assert!(eth0_state.filters[0].redirects_to("tap0_urunc"));

        let tap_state = kernel.link("tap0_urunc").unwrap();
        assert_eq!(tap_state.qdiscs, vec![Qdisc::ingress()]);
        assert!(tap_state.filters[0].redirects_to("eth0"));
    }

    #[test]
    fn test_install_mirror_replaces_stale_rules() {
        let (kernel, eth0, tap) = setup();
        install_mirror(&kernel, &eth0, &tap).unwrap();
        install_mirror(&kernel, &eth0, &tap).unwrap();

        assert_eq!(kernel.link("eth0").unwrap().filters.len(), 1);
        assert_eq!(kernel.link("tap0_urunc").unwrap().qdiscs.len(), 1);
    }

    #[test]
    fn test_delete_all() {
        let (kernel, eth0, tap) = setup();
        install_mirror(&kernel, &eth0, &tap).unwrap();

        delete_all_tc_filters(&kernel, Some(&eth0)).unwrap();
        assert!(kernel.link("eth0").unwrap().filters.is_empty());

        delete_all_qdiscs(&kernel, Some(&eth0)).unwrap();
        assert!(kernel.link("eth0").unwrap().qdiscs.is_empty());

        // Nothing left to remove
        delete_all_tc_filters(&kernel, Some(&eth0)).unwrap();
        delete_all_qdiscs(&kernel, Some(&eth0)).unwrap();
    }

    #[test]
    fn test_kernel_default_qdisc_is_kept() {
        let (kernel, eth0, _) = setup();
        let default = Qdisc {
            kind: "noqueue".to_string(),
            handle: TcHandle::UNSPEC,
            parent: TcHandle::ROOT,
        };
        kernel.add_qdisc(&eth0, &default).unwrap();
        kernel.add_qdisc(&eth0, &Qdisc::ingress()).unwrap();

        delete_all_qdiscs(&kernel, Some(&eth0)).unwrap();
        assert_eq!(kernel.link("eth0").unwrap().qdiscs, vec![default]);
    }

    #[test]
    fn test_shaping_tree_is_removed_with_its_root() {
        let (kernel, eth0, tap) = setup();
        let htb = Qdisc {
            kind: "htb".to_string(),
            handle: TcHandle::new(1, 0),
            parent: TcHandle::ROOT,
        };
        let leaf = Qdisc {
            kind: "pfifo".to_string(),
            handle: TcHandle::new(0x10, 0),
            parent: TcHandle::new(1, 1),
        };
        kernel.add_qdisc(&eth0, &htb).unwrap();
        kernel.add_qdisc(&eth0, &leaf).unwrap();

        delete_all_qdiscs(&kernel, Some(&eth0)).unwrap();
        assert!(kernel.link("eth0").unwrap().qdiscs.is_empty());

        kernel.add_qdisc(&eth0, &htb).unwrap();
        kernel.add_qdisc(&eth0, &leaf).unwrap();
        install_mirror(&kernel, &eth0, &tap).unwrap();
        assert_eq!(kernel.link("eth0").unwrap().qdiscs, vec![Qdisc::ingress()]);
    }

    #[test]
    fn test_delete_redirects_to() {
        let (kernel, eth0, tap) = setup();
        install_mirror(&kernel, &eth0, &tap).unwrap();

        assert_eq!(delete_redirects_to(&kernel, &eth0, "tap9_urunc").unwrap(), 1);
        assert_eq!(delete_redirects_to(&kernel, &eth0, "tap0_urunc").unwrap(), 0);
        assert!(kernel.link("eth0").unwrap().filters.is_empty());
    }
}
