//! Linux host implementation of the kernel capability
//!
//! Native TUN/TAP and interface ioctls for device work, `tc` for queueing
//! disciplines and classifiers, `iptables` for NAT, and procfs for the
//! routing table and the forwarding toggle.

use crate::error::{Error, Result};
use crate::network::kernel::{
    Filter, Link, LinkAddrs, NatRule, NetKernel, Qdisc, Route, TapSpec, TcHandle,
};
use bitflags::bitflags;
use ipnet::Ipv4Net;
use std::fs::{self, File, OpenOptions};
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Clone device for TUN/TAP interfaces
const TUN_DEVICE: &str = "/dev/net/tun";

// TUN/TAP ioctls from <linux/if_tun.h>
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const TUNSETOWNER: libc::c_ulong = 0x400454cc;
const TUNSETGROUP: libc::c_ulong = 0x400454ce;

bitflags! {
    /// Flags accepted by TUNSETIFF
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TunFlags: libc::c_short {
        const TAP = 0x0002;
        const MULTI_QUEUE = 0x0100;
        const NO_PI = 0x1000;
    }
}

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

#[repr(C)]
struct IfReqInt {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_ivalue: libc::c_int,
    _padding: [u8; 20],
}

#[repr(C)]
struct IfReqAddr {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_addr: libc::sockaddr_in,
    _padding: [u8; 8],
}

/// Safely copy interface name into fixed-size buffer
/// Returns error if name is too long (max 15 chars + null terminator)
fn copy_ifname(dest: &mut [libc::c_char; libc::IF_NAMESIZE], name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::InvalidParameter(format!(
            "invalid interface name: {:?}",
            name
        )));
    }
    if name.len() >= libc::IF_NAMESIZE {
        return Err(Error::InvalidParameter(format!(
            "interface name too long: {} (max {} chars)",
            name,
            libc::IF_NAMESIZE - 1
        )));
    }

    for (d, s) in dest.iter_mut().zip(name.as_bytes()) {
        *d = *s as libc::c_char;
    }

    Ok(())
}

/// Socket used as the target of interface ioctls
fn control_socket() -> Result<UdpSocket> {
    UdpSocket::bind("0.0.0.0:0").map_err(|e| Error::kernel("create control socket", e))
}

/// Issue an ioctl whose argument is a pointer to `req`
fn ioctl_ptr<T>(fd: RawFd, request: libc::c_ulong, req: &mut T, op: &str) -> Result<()> {
    let result = unsafe { libc::ioctl(fd, request as _, req as *mut T) };
    if result < 0 {
        return Err(Error::kernel(op, std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Issue an ioctl whose argument is passed by value
fn ioctl_val(fd: RawFd, request: libc::c_ulong, value: libc::c_ulong, op: &str) -> Result<()> {
    let result = unsafe { libc::ioctl(fd, request as _, value) };
    if result < 0 {
        return Err(Error::kernel(op, std::io::Error::last_os_error()));
    }
    Ok(())
}

fn sockaddr_v4(ip: Ipv4Addr) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr.s_addr = u32::from_be_bytes(ip.octets()).to_be();
    sin
}

/// Run a host tool and return its stdout
fn run(program: &str, args: &[&str]) -> Result<String> {
    let op = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::kernel(&op, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::kernel(op, stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a host tool against one device, mapping a vanished device to `LinkNotFound`
fn run_on(device: &str, program: &str, args: &[&str]) -> Result<String> {
    run(program, args).map_err(|e| match e {
        Error::KernelOperation { ref message, .. }
            if message.contains("Cannot find device") || message.contains("does not exist") =>
        {
            Error::LinkNotFound(device.to_string())
        }
        other => other,
    })
}

/// Parse `tc qdisc show` output
pub(crate) fn parse_qdiscs(text: &str) -> Vec<Qdisc> {
    let mut qdiscs = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[0] != "qdisc" {
            continue;
        }
        let Some(handle) = TcHandle::parse(tokens[2]) else {
            continue;
        };

        let parent = match tokens.get(3) {
            Some(&"root") => TcHandle::ROOT,
            Some(&"parent") => match tokens.get(4).and_then(|p| TcHandle::parse(p)) {
                Some(p) => p,
                None => continue,
            },
            _ => continue,
        };

        qdiscs.push(Qdisc {
            kind: tokens[1].to_string(),
            handle,
            parent,
        });
    }

    qdiscs
}

/// Parse `tc filter show` output for one parent
///
/// u32 prints several lines per priority (hash table, key node); they
/// collapse into one filter per priority.
pub(crate) fn parse_filters(text: &str, parent: TcHandle) -> Vec<Filter> {
    let mut filters: Vec<Filter> = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if tokens.first() == Some(&"filter") {
            let value_of = |key: &str| {
                tokens
                    .iter()
                    .position(|t| *t == key)
                    .and_then(|i| tokens.get(i + 1))
                    .copied()
            };
            let Some(priority) = value_of("pref").and_then(|p| p.parse::<u16>().ok()) else {
                continue;
            };
            if filters.iter().any(|f| f.priority == priority) {
                continue;
            }
            filters.push(Filter {
                parent,
                priority,
                protocol: value_of("protocol").unwrap_or("all").to_string(),
                redirect_to: None,
            });
        } else if let Some(pos) = line.find("Redirect to device ") {
            let target: String = line[pos + "Redirect to device ".len()..]
                .chars()
                .take_while(|c| *c != ')' && !c.is_whitespace())
                .collect();
            if let Some(last) = filters.last_mut() {
                last.redirect_to = Some(target);
            }
        }
    }

    filters
}

/// Parse a kernel hexadecimal IPv4 (host byte order, as in /proc/net/route)
pub(crate) fn parse_hex_ipv4(hex: &str) -> Option<Ipv4Addr> {
    u32::from_str_radix(hex, 16)
        .ok()
        .map(|v| Ipv4Addr::from(v.to_ne_bytes()))
}

/// Parse /proc/net/route
pub(crate) fn parse_route_table(text: &str) -> Vec<Route> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let destination = parse_hex_ipv4(fields[1])?;
            let gateway = parse_hex_ipv4(fields[2])?;
            let mask = parse_hex_ipv4(fields[7])?;
            let prefix = ipnet::ipv4_mask_to_prefix(mask).ok()?;

            Some(Route {
                iface: fields[0].to_string(),
                destination: Ipv4Net::new(destination, prefix).ok()?,
                gateway: (!gateway.is_unspecified()).then_some(gateway),
            })
        })
        .collect()
}

/// Kernel network configuration of the running host
#[derive(Debug, Clone)]
pub struct HostKernel {
    /// procfs mount point (normally `/proc`)
    proc_root: PathBuf,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Read routes and the forwarding toggle below another procfs root
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn ip_forward_path(&self) -> PathBuf {
        self.proc_root.join("sys/net/ipv4/ip_forward")
    }

    fn route_path(&self) -> PathBuf {
        self.proc_root.join("net/route")
    }

    fn link_index(name: &str) -> Result<u32> {
        nix::net::if_::if_nametoindex(name).map_err(|_| Error::LinkNotFound(name.to_string()))
    }

    fn link_mtu(sock: &UdpSocket, name: &str) -> Result<u32> {
        let mut req: IfReqInt = unsafe { std::mem::zeroed() };
        copy_ifname(&mut req.ifr_name, name)?;
        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCGIFMTU as libc::c_ulong,
            &mut req,
            "get interface MTU",
        )?;
        Ok(req.ifr_ivalue as u32)
    }

    fn set_mtu(sock: &UdpSocket, name: &str, mtu: u32) -> Result<()> {
        let mut req: IfReqInt = unsafe { std::mem::zeroed() };
        copy_ifname(&mut req.ifr_name, name)?;
        req.ifr_ivalue = mtu as libc::c_int;
        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCSIFMTU as libc::c_ulong,
            &mut req,
            "set interface MTU",
        )
    }

    /// Attach one queue of a TAP device
    fn open_tap_queue(name: &str) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| Error::kernel(format!("open {}", TUN_DEVICE), e))?;

        let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
        copy_ifname(&mut req.ifr_name, name)?;
        req.ifr_flags = (TunFlags::TAP | TunFlags::NO_PI | TunFlags::MULTI_QUEUE).bits();

        ioctl_ptr(file.as_raw_fd(), TUNSETIFF, &mut req, "create TAP device")?;
        Ok(file)
    }
}

impl NetKernel for HostKernel {
    fn link_names(&self) -> Result<Vec<String>> {
        let interfaces = nix::net::if_::if_nameindex()
            .map_err(|e| Error::kernel("list interfaces", e))?;

        Ok(interfaces
            .iter()
            .map(|i| i.name().to_string_lossy().into_owned())
            .collect())
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        let index = Self::link_index(name)?;
        let sock = control_socket()?;
        let mtu = Self::link_mtu(&sock, name)?;

        Ok(Link {
            index,
            name: name.to_string(),
            mtu,
        })
    }

    fn add_tap(&self, spec: &TapSpec) -> Result<Link> {
        // TUNSETIFF attaches to an existing TAP instead of failing
        if Self::link_index(&spec.name).is_ok() {
            return Err(Error::kernel(
                format!("create TAP device {}", spec.name),
                "device already exists",
            ));
        }

        let queues: Vec<File> = (0..spec.queues.max(1))
            .map(|_| Self::open_tap_queue(&spec.name))
            .collect::<Result<_>>()?;
        let fd = queues[0].as_raw_fd();

        ioctl_val(fd, TUNSETOWNER, spec.owner as libc::c_ulong, "set TAP owner")?;
        ioctl_val(fd, TUNSETGROUP, spec.group as libc::c_ulong, "set TAP group")?;
        ioctl_val(fd, TUNSETPERSIST, 1, "make TAP persistent")?;

        // Queues close here; the persistent device stays
        drop(queues);

        if let Some(mtu) = spec.mtu {
            Self::set_mtu(&control_socket()?, &spec.name, mtu)?;
        }

        debug!(tap = %spec.name, owner = spec.owner, group = spec.group, "TAP device created");
        self.link_by_name(&spec.name)
    }

    fn set_link_up(&self, link: &Link) -> Result<()> {
        let sock = control_socket()?;
        let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
        copy_ifname(&mut req.ifr_name, &link.name)?;

        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCGIFFLAGS as libc::c_ulong,
            &mut req,
            "get interface flags",
        )?;
        req.ifr_flags |= libc::IFF_UP as libc::c_short;
        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCSIFFLAGS as libc::c_ulong,
            &mut req,
            "set interface flags",
        )
    }

    fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
        let sock = control_socket()?;

        let mut req: IfReqAddr = unsafe { std::mem::zeroed() };
        copy_ifname(&mut req.ifr_name, &link.name)?;
        req.ifr_addr = sockaddr_v4(addr.addr());
        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCSIFADDR as libc::c_ulong,
            &mut req,
            "set IP address",
        )?;

        let mut mask_req: IfReqAddr = unsafe { std::mem::zeroed() };
        copy_ifname(&mut mask_req.ifr_name, &link.name)?;
        mask_req.ifr_addr = sockaddr_v4(addr.netmask());
        ioctl_ptr(
            sock.as_raw_fd(),
            libc::SIOCSIFNETMASK as libc::c_ulong,
            &mut mask_req,
            "set netmask",
        )
    }

    fn delete_link(&self, link: &Link) -> Result<()> {
        run_on(&link.name, "ip", &["link", "delete", "dev", link.name.as_str()]).map(|_| ())
    }

    fn qdiscs(&self, link: &Link) -> Result<Vec<Qdisc>> {
        let out = run_on(&link.name, "tc", &["qdisc", "show", "dev", link.name.as_str()])?;
        Ok(parse_qdiscs(&out))
    }

    fn add_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()> {
        let handle = qdisc.handle.to_string();
        let parent = qdisc.parent.to_string();

        let mut args = vec!["qdisc", "add", "dev", link.name.as_str()];
        if qdisc.is_ingress() {
            args.extend(["handle", "ffff:", "ingress"]);
        } else {
            if qdisc.parent == TcHandle::ROOT {
                args.push("root");
            } else {
                args.extend(["parent", parent.as_str()]);
            }
            args.extend(["handle", handle.as_str(), qdisc.kind.as_str()]);
        }

        run_on(&link.name, "tc", &args).map(|_| ())
    }

    fn del_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()> {
        let handle = qdisc.handle.to_string();
        let parent = qdisc.parent.to_string();

        let mut args = vec!["qdisc", "del", "dev", link.name.as_str()];
        if qdisc.is_ingress() {
            args.push("ingress");
        } else {
            if qdisc.parent == TcHandle::ROOT {
                args.push("root");
            } else {
                args.extend(["parent", parent.as_str()]);
            }
            args.extend(["handle", handle.as_str()]);
        }

        run_on(&link.name, "tc", &args).map(|_| ())
    }

    fn filters(&self, link: &Link, parent: TcHandle) -> Result<Vec<Filter>> {
        let parent_str = parent.to_string();
        match run_on(
            &link.name,
            "tc",
            &["filter", "show", "dev", link.name.as_str(), "parent", parent_str.as_str()],
        ) {
            Ok(out) => Ok(parse_filters(&out, parent)),
            // No qdisc under that parent means no filters either
            Err(Error::KernelOperation { message, .. })
                if message.contains("Cannot find specified qdisc") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn add_filter(&self, link: &Link, filter: &Filter) -> Result<()> {
        let Some(target) = filter.redirect_to.as_deref() else {
            return Err(Error::InvalidParameter(
                "only redirect filters are supported".to_string(),
            ));
        };
        let parent = filter.parent.to_string();
        let priority = filter.priority.to_string();

        run_on(
            &link.name,
            "tc",
            &[
                "filter", "add", "dev", link.name.as_str(), "parent", parent.as_str(), "protocol",
                filter.protocol.as_str(), "prio", priority.as_str(), "u32", "match", "u32", "0", "0",
                "action", "mirred", "egress", "redirect", "dev", target,
            ],
        )
        .map(|_| ())
    }

    fn del_filter(&self, link: &Link, filter: &Filter) -> Result<()> {
        let parent = filter.parent.to_string();
        let priority = filter.priority.to_string();

        run_on(
            &link.name,
            "tc",
            &["filter", "del", "dev", link.name.as_str(), "parent", parent.as_str(), "prio", priority.as_str()],
        )
        .map(|_| ())
    }

    fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool> {
        let spec = rule.rule_spec();
        let mut args = vec!["-t", NatRule::TABLE, "-C", NatRule::CHAIN];
        args.extend(spec.iter().map(String::as_str));

        let output = Command::new("iptables")
            .args(&args)
            .output()
            .map_err(|e| Error::kernel("iptables -C", e))?;

        // Exit status 1 means "no such rule"; anything else is a real failure
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::kernel(
                "iptables -C",
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        }
    }

    fn append_nat_rule(&self, rule: &NatRule) -> Result<()> {
        let spec = rule.rule_spec();
        let mut args = vec!["-t", NatRule::TABLE, "-A", NatRule::CHAIN];
        args.extend(spec.iter().map(String::as_str));
        run("iptables", &args).map(|_| ())
    }

    fn delete_nat_rule(&self, rule: &NatRule) -> Result<()> {
        let spec = rule.rule_spec();
        let mut args = vec!["-t", NatRule::TABLE, "-D", NatRule::CHAIN];
        args.extend(spec.iter().map(String::as_str));
        run("iptables", &args).map(|_| ())
    }

    fn ipv4_forwarding(&self) -> Result<bool> {
        let path = self.ip_forward_path();
        let value = fs::read_to_string(&path)
            .map_err(|e| Error::kernel(format!("read {}", path.display()), e))?;
        Ok(value.trim() == "1")
    }

    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<()> {
        let path = self.ip_forward_path();
        fs::write(&path, if enabled { "1" } else { "0" })
            .map_err(|e| Error::kernel(format!("write {}", path.display()), e))
    }

    fn link_addrs(&self, name: &str) -> Result<LinkAddrs> {
        if Self::link_index(name).is_err() {
            return Err(Error::NoSuchInterface(name.to_string()));
        }

        let entries =
            nix::ifaddrs::getifaddrs().map_err(|e| Error::kernel("getifaddrs", e))?;

        let mut addrs = LinkAddrs::default();
        for entry in entries.filter(|e| e.interface_name == name) {
            let Some(address) = entry.address else {
                continue;
            };

            if let Some(mac) = address.as_link_addr().and_then(|l| l.addr()) {
                if mac != [0u8; 6] {
                    addrs.mac = Some(mac);
                }
            }

            if let Some(sin) = address.as_sockaddr_in() {
                if addrs.ipv4.is_none() {
                    addrs.ipv4 = Some(sin.ip());
                    addrs.netmask = entry
                        .netmask
                        .as_ref()
                        .and_then(|m| m.as_sockaddr_in())
                        .map(|m| m.ip());
                }
            }
        }

        Ok(addrs)
    }

    fn routes(&self) -> Result<Vec<Route>> {
        let path = self.route_path();
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::kernel(format!("read {}", path.display()), e))?;
        Ok(parse_route_table(&text))
    }
}
