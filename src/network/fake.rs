//! In-memory kernel used by unit tests

use crate::error::{Error, Result};
use crate::network::kernel::{
    Filter, Link, LinkAddrs, NatRule, NetKernel, Qdisc, Route, TapSpec, TcHandle,
};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub link: Link,
    pub up: bool,
    pub tap: Option<TapSpec>,
    pub addrs: LinkAddrs,
    pub extra_addrs: Vec<Ipv4Net>,
    pub qdiscs: Vec<Qdisc>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub links: BTreeMap<String, FakeLink>,
    pub next_index: u32,
    pub nat: Vec<NatRule>,
    pub forwarding: bool,
    pub routes: Vec<Route>,
    /// Operation name that fails on its next call
    pub fail_on: Option<&'static str>,
}

/// Kernel double holding links, tc objects and NAT rules in memory
#[derive(Debug, Default)]
pub struct FakeKernel {
    pub state: Mutex<FakeState>,
}

pub const ETH0_MAC: [u8; 6] = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];

impl FakeKernel {
    /// Namespace with only loopback
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.insert_link(
            "lo",
            65536,
            LinkAddrs {
                mac: None,
                ipv4: Some(Ipv4Addr::LOCALHOST),
                netmask: Some(Ipv4Addr::new(255, 0, 0, 0)),
            },
        );
        kernel
    }

    /// Namespace with loopback and a configured eth0
    pub fn with_eth0() -> Self {
        let kernel = Self::new();
        kernel.insert_link(
            "eth0",
            1500,
            LinkAddrs {
                mac: Some(ETH0_MAC),
                ipv4: Some(Ipv4Addr::new(172, 17, 0, 2)),
                netmask: Some(Ipv4Addr::new(255, 255, 0, 0)),
            },
        );
        {
            let mut state = kernel.state.lock().unwrap();
            state.routes.push(Route {
                iface: "eth0".to_string(),
                destination: "0.0.0.0/0".parse().unwrap(),
                gateway: Some(Ipv4Addr::new(172, 17, 0, 1)),
            });
            state.routes.push(Route {
                iface: "eth0".to_string(),
                destination: "172.17.0.0/16".parse().unwrap(),
                gateway: None,
            });
        }
        kernel
    }

    pub fn insert_link(&self, name: &str, mtu: u32, addrs: LinkAddrs) {
        let mut state = self.state.lock().unwrap();
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(
            name.to_string(),
            FakeLink {
                link: Link {
                    index,
                    name: name.to_string(),
                    mtu,
                },
                up: true,
                tap: None,
                addrs,
                extra_addrs: Vec::new(),
                qdiscs: Vec::new(),
                filters: Vec::new(),
            },
        );
    }

    /// Make the next call of `op` fail with a kernel error
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().unwrap().fail_on = Some(op);
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().unwrap().links.get(name).cloned()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.link(name).is_some()
    }

    pub fn nat_rules(&self) -> Vec<NatRule> {
        self.state.lock().unwrap().nat.clone()
    }

    pub fn forwarding(&self) -> bool {
        self.state.lock().unwrap().forwarding
    }

    fn check_fail(state: &mut FakeState, op: &'static str) -> Result<()> {
        if state.fail_on == Some(op) {
            state.fail_on = None;
            return Err(Error::kernel(op, "operation not permitted"));
        }
        Ok(())
    }

    fn entry<'a>(state: &'a mut FakeState, link: &Link) -> Result<&'a mut FakeLink> {
        state
            .links
            .get_mut(&link.name)
            .filter(|l| l.link.index == link.index)
            .ok_or_else(|| Error::LinkNotFound(link.name.clone()))
    }
}

impl NetKernel for FakeKernel {
    fn link_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().links.keys().cloned().collect())
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .map(|l| l.link.clone())
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))
    }

    fn add_tap(&self, spec: &TapSpec) -> Result<Link> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "add_tap")?;
        if state.links.contains_key(&spec.name) {
            return Err(Error::kernel("add tap", "file exists"));
        }
        state.next_index += 1;
        let index = state.next_index;
        let link = Link {
            index,
            name: spec.name.clone(),
            mtu: spec.mtu.unwrap_or(1500),
        };
        state.links.insert(
            spec.name.clone(),
            FakeLink {
                link: link.clone(),
                up: false,
                tap: Some(spec.clone()),
                addrs: LinkAddrs {
                    mac: Some([0x6e, 0x0f, 0x00, 0x00, 0x00, index as u8]),
                    ipv4: None,
                    netmask: None,
                },
                extra_addrs: Vec::new(),
                qdiscs: Vec::new(),
                filters: Vec::new(),
            },
        );
        Ok(link)
    }

    fn set_link_up(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "set_link_up")?;
        Self::entry(&mut state, link)?.up = true;
        Ok(())
    }

    fn add_address(&self, link: &Link, addr: Ipv4Net) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "add_address")?;
        let entry = Self::entry(&mut state, link)?;
        if entry.extra_addrs.contains(&addr) {
            return Err(Error::kernel("add address", "file exists"));
        }
        entry.extra_addrs.push(addr);
        if entry.addrs.ipv4.is_none() {
            entry.addrs.ipv4 = Some(addr.addr());
            entry.addrs.netmask = Some(addr.netmask());
        }
        Ok(())
    }

    fn delete_link(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "delete_link")?;
        Self::entry(&mut state, link)?;
        state.links.remove(&link.name);
        Ok(())
    }

    fn qdiscs(&self, link: &Link) -> Result<Vec<Qdisc>> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::entry(&mut state, link)?.qdiscs.clone())
    }

    fn add_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "add_qdisc")?;
        let entry = Self::entry(&mut state, link)?;
        if entry.qdiscs.iter().any(|q| q.handle == qdisc.handle) {
            return Err(Error::kernel("add qdisc", "file exists"));
        }
        entry.qdiscs.push(qdisc.clone());
        Ok(())
    }

    fn del_qdisc(&self, link: &Link, qdisc: &Qdisc) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "del_qdisc")?;
        let entry = Self::entry(&mut state, link)?;
        let before = entry.qdiscs.len();
        entry.qdiscs.retain(|q| q != qdisc);
        if entry.qdiscs.len() == before {
            return Err(Error::kernel("del qdisc", "no such file or directory"));
        }
        // Qdiscs under the deleted one's classes go with it
        let mut gone = vec![qdisc.handle.major()];
        while let Some(major) = gone.pop() {
            entry.qdiscs.retain(|q| {
                let child = !q.is_top_level() && q.parent.major() == major;
                if child {
                    gone.push(q.handle.major());
                }
                !child
            });
        }
        // Filters hang off the qdisc and go with it
        if qdisc.is_ingress() {
            entry.filters.retain(|f| f.parent != TcHandle::INGRESS);
        }
        Ok(())
    }

    fn filters(&self, link: &Link, parent: TcHandle) -> Result<Vec<Filter>> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::entry(&mut state, link)?
            .filters
            .iter()
            .filter(|f| f.parent == parent)
            .cloned()
            .collect())
    }

    fn add_filter(&self, link: &Link, filter: &Filter) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "add_filter")?;
        if let Some(target) = &filter.redirect_to
            && !state.links.contains_key(target)
        {
            return Err(Error::LinkNotFound(target.clone()));
        }
        let entry = Self::entry(&mut state, link)?;
        if !entry.qdiscs.iter().any(|q| q.handle == filter.parent) {
            return Err(Error::kernel("add filter", "parent qdisc does not exist"));
        }
        entry.filters.push(filter.clone());
        Ok(())
    }

    fn del_filter(&self, link: &Link, filter: &Filter) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "del_filter")?;
        let entry = Self::entry(&mut state, link)?;
        entry
            .filters
            .retain(|f| !(f.parent == filter.parent && f.priority == filter.priority));
        Ok(())
    }

    fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool> {
        Ok(self.state.lock().unwrap().nat.contains(rule))
    }

    fn append_nat_rule(&self, rule: &NatRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "append_nat_rule")?;
        state.nat.push(rule.clone());
        Ok(())
    }

    fn delete_nat_rule(&self, rule: &NatRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "delete_nat_rule")?;
        match state.nat.iter().position(|r| r == rule) {
            Some(pos) => {
                state.nat.remove(pos);
                Ok(())
            }
            None => Err(Error::kernel("delete nat rule", "bad rule")),
        }
    }

    fn ipv4_forwarding(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().forwarding)
    }

    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_fail(&mut state, "set_ipv4_forwarding")?;
        state.forwarding = enabled;
        Ok(())
    }

    fn link_addrs(&self, name: &str) -> Result<LinkAddrs> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .map(|l| l.addrs.clone())
            .ok_or_else(|| Error::NoSuchInterface(name.to_string()))
    }

    fn routes(&self) -> Result<Vec<Route>> {
        Ok(self.state.lock().unwrap().routes.clone())
    }
}
