//! Kernel network configuration capability
//!
//! Every piece of host state the subsystem touches (links, addresses,
//! queueing disciplines, classifiers, NAT rules, the forwarding toggle)
//! goes through [`NetKernel`]. The host implementation lives in
//! [`crate::network::host`]; tests swap in an in-memory one.

use crate::error::Result;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// A traffic-control handle (`major:minor`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcHandle(pub u32);

impl TcHandle {
    /// Handle of an ingress qdisc (`ffff:`)
    pub const INGRESS: TcHandle = TcHandle(0xffff_0000);
    /// Parent of an ingress qdisc (`ffff:fff1`)
    pub const INGRESS_PARENT: TcHandle = TcHandle(0xffff_fff1);
    /// Root pseudo-parent
    pub const ROOT: TcHandle = TcHandle(0xffff_ffff);
    /// Kernel-assigned default handle (`0:`)
    pub const UNSPEC: TcHandle = TcHandle(0);

    pub fn new(major: u16, minor: u16) -> Self {
        TcHandle(((major as u32) << 16) | minor as u32)
    }

    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Parse tc notation: `ffff:`, `ffff:fff1`, `:1`, `root`
    pub fn parse(s: &str) -> Option<Self> {
        if s == "root" {
            return Some(TcHandle::ROOT);
        }
        let (major, minor) = s.split_once(':')?;
        let major = if major.is_empty() {
            0
        } else {
            u16::from_str_radix(major, 16).ok()?
        };
        let minor = if minor.is_empty() {
            0
        } else {
            u16::from_str_radix(minor, 16).ok()?
        };
        Some(TcHandle::new(major, minor))
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TcHandle::ROOT {
            return write!(f, "root");
        }
        if self.minor() == 0 {
            write!(f, "{:x}:", self.major())
        } else {
            write!(f, "{:x}:{:x}", self.major(), self.minor())
        }
    }
}

/// A resolved host link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
}

/// Parameters for a new TAP device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapSpec {
    pub name: String,
    /// Number of queues opened on the device (at least one)
    pub queues: u32,
    /// MTU to apply; `None` keeps the kernel default
    pub mtu: Option<u32>,
    pub owner: u32,
    pub group: u32,
}

/// A queueing discipline attached to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qdisc {
    pub kind: String,
    pub handle: TcHandle,
    pub parent: TcHandle,
}

impl Qdisc {
    /// The ingress interception point
    pub fn ingress() -> Self {
        Self {
            kind: "ingress".to_string(),
            handle: TcHandle::INGRESS,
            parent: TcHandle::INGRESS_PARENT,
        }
    }

    pub fn is_ingress(&self) -> bool {
        self.kind == "ingress"
    }

    /// True for the qdisc the kernel attaches on its own (handle `0:`)
    pub fn is_kernel_default(&self) -> bool {
        self.handle == TcHandle::UNSPEC
    }

    /// True for root and ingress/clsact qdiscs. Any other qdisc hangs off
    /// a class and is destroyed together with its root.
    pub fn is_top_level(&self) -> bool {
        self.parent == TcHandle::ROOT || self.parent == TcHandle::INGRESS_PARENT
    }
}

/// A u32 match-all classifier with a mirred egress redirect action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub parent: TcHandle,
    pub priority: u16,
    /// Link-layer protocol matched (`all`, `ip`, ...)
    pub protocol: String,
    /// Device the packet is redirected to, when the action is a redirect
    pub redirect_to: Option<String>,
}

impl Filter {
    /// Default priority used for mirror filters
    pub const MIRROR_PRIORITY: u16 = 1;

    /// Catch-all redirect from a link's ingress towards `target`
    pub fn redirect(target: &str) -> Self {
        Self {
            parent: TcHandle::INGRESS,
            priority: Self::MIRROR_PRIORITY,
            protocol: "all".to_string(),
            redirect_to: Some(target.to_string()),
        }
    }

    pub fn redirects_to(&self, name: &str) -> bool {
        self.redirect_to.as_deref() == Some(name)
    }
}

/// A source-NAT masquerade rule in the `nat` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub out_iface: String,
    pub source: Ipv4Net,
}

impl NatRule {
    pub const TABLE: &'static str = "nat";
    pub const CHAIN: &'static str = "POSTROUTING";
    pub const TARGET: &'static str = "MASQUERADE";

    pub fn masquerade(out_iface: &str, source: Ipv4Net) -> Self {
        Self {
            out_iface: out_iface.to_string(),
            source: source.trunc(),
        }
    }

    /// iptables arguments that follow the chain name
    pub fn rule_spec(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.source.to_string(),
            "-o".to_string(),
            self.out_iface.clone(),
            "-j".to_string(),
            Self::TARGET.to_string(),
        ]
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} -A {} {}",
            Self::TABLE,
            Self::CHAIN,
            self.rule_spec().join(" ")
        )
    }
}

/// Link-layer and IPv4 addressing of one interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkAddrs {
    pub mac: Option<[u8; 6]>,
    pub ipv4: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
}

/// An IPv4 route table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub iface: String,
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}

/// Kernel network configuration
///
/// Implementations perform each call synchronously and report failures
/// as values. A missing link is always [`crate::error::Error::LinkNotFound`].
pub trait NetKernel: Send + Sync {
    /// Names of every interface in the current namespace
    fn link_names(&self) -> Result<Vec<String>>;

    /// Resolve a link by name
    fn link_by_name(&self, name: &str) -> Result<Link>;

    /// Create a persistent multi-queue TAP device owned by `spec.owner`/`spec.group`
    fn add_tap(&self, spec: &TapSpec) -> Result<Link>;

    fn set_link_up(&self, link: &Link) -> Result<()>;

    fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()>;

    fn delete_link(&self, link: &Link) -> Result<()>;

    fn qdiscs(&self, link: &Link) -> Result<Vec<Qdisc>>;

    fn add_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()>;

    fn del_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()>;

    /// Filters attached under `parent` on `link`
    fn filters(&self, link: &Link, parent: TcHandle) -> Result<Vec<Filter>>;

    fn add_filter(&self, link: &Link, filter: &Filter) -> Result<()>;

    fn del_filter(&self, link: &Link, filter: &Filter) -> Result<()>;

    fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool>;

    fn append_nat_rule(&self, rule: &NatRule) -> Result<()>;

    fn delete_nat_rule(&self, rule: &NatRule) -> Result<()>;

    /// Host-wide IPv4 forwarding toggle
    fn ipv4_forwarding(&self) -> Result<bool>;

    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<()>;

    /// Hardware and IPv4 addressing of the named interface
    fn link_addrs(&self, name: &str) -> Result<LinkAddrs>;

    /// IPv4 routing table of the main table
    fn routes(&self) -> Result<Vec<Route>>;
}
