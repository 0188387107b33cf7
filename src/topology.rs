//! The static LAN as data, plus per-node stack builders.
//!
//! Nothing in the core layers hard-codes who exists on the network: the
//! routing, ARP, and substrate tables are all derived from a [`Topology`]
//! value and injected into the layer constructors.  [`Topology::default_lan`]
//! is the fixed loopback LAN the four CLI roles run on; tests build their
//! own.
//!
//! All hosts use the router as their only next hop; the router has direct
//! adjacency to every host.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use thiserror::Error;

use crate::addr::{Mac, Port, VirtualAddr, Vip};
use crate::link::SimpleLink;
use crate::network::{HostNetwork, RouterNetwork};
use crate::physical::{ChannelConfig, PhysError, UdpPhysical};
use crate::transport::{ReliableTransport, TransportConfig};

/// Errors from assembling a node's stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("unknown node name: {0:?}")]
    UnknownNode(String),
    #[error(transparent)]
    Phys(#[from] PhysError),
}

/// One node of the simulated LAN: its identity at every layer.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub vip: Vip,
    pub mac: Mac,
    pub ip: Ipv4Addr,
    pub port: Port,
}

impl NodeSpec {
    /// The substrate socket address this node binds.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port.get()))
    }

    /// The node's transport endpoint.
    pub fn virtual_addr(&self) -> VirtualAddr {
        VirtualAddr::new(self.vip.clone(), self.port)
    }
}

/// The whole LAN: end hosts plus the single router.
#[derive(Debug, Clone)]
pub struct Topology {
    pub hosts: Vec<NodeSpec>,
    pub router: NodeSpec,
}

fn node(name: &str, vip: &str, mac: &str, port: u16) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        vip: vip.parse().expect("static topology vip is well-formed"),
        mac: mac.parse().expect("static topology mac is well-formed"),
        ip: Ipv4Addr::LOCALHOST,
        port: Port::new(port).expect("static topology port is well-formed"),
    }
}

impl Topology {
    /// The fixed loopback LAN the CLI roles run on.
    pub fn default_lan() -> Self {
        Self {
            hosts: vec![
                node("alice", "HOST_A", "AA:AA:AA:AA:AA:AA", 10000),
                node("bob", "HOST_B", "BB:BB:BB:BB:BB:BB", 10001),
                node("server", "HOST_S", "CC:CC:CC:CC:CC:CC", 10002),
            ],
            router: node("router", "HOST_R", "DD:DD:DD:DD:DD:DD", 10003),
        }
    }

    /// Look a node up by name (hosts and the router).
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        if self.router.name == name {
            return Some(&self.router);
        }
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Look a host up by VIP.
    pub fn host_by_vip(&self, vip: &Vip) -> Option<&NodeSpec> {
        self.hosts.iter().find(|h| &h.vip == vip)
    }

    /// Substrate table: every node's MAC to its socket address.
    pub fn mac_table(&self) -> HashMap<Mac, SocketAddr> {
        self.all_nodes()
            .map(|n| (n.mac, n.socket_addr()))
            .collect()
    }

    /// A host's routing table: every other host through the router.
    pub fn host_routing(&self) -> HashMap<Vip, Vip> {
        self.hosts
            .iter()
            .map(|h| (h.vip.clone(), self.router.vip.clone()))
            .collect()
    }

    /// The router's routing table: direct adjacency to each host.
    pub fn router_routing(&self) -> HashMap<Vip, Vip> {
        self.hosts
            .iter()
            .map(|h| (h.vip.clone(), h.vip.clone()))
            .collect()
    }

    /// A host's ARP table: only the router is resolvable.
    pub fn host_arp(&self) -> HashMap<Vip, Mac> {
        HashMap::from([(self.router.vip.clone(), self.router.mac)])
    }

    /// The router's ARP table: every host is resolvable.
    pub fn router_arp(&self) -> HashMap<Vip, Mac> {
        self.hosts.iter().map(|h| (h.vip.clone(), h.mac)).collect()
    }

    fn all_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.hosts.iter().chain(std::iter::once(&self.router))
    }
}

/// Assemble the full stack for the named host and return its transport.
pub async fn build_host_transport(
    topology: &Topology,
    name: &str,
    channel: ChannelConfig,
    config: TransportConfig,
) -> Result<Arc<ReliableTransport>, StackError> {
    let host = topology
        .hosts
        .iter()
        .find(|h| h.name == name)
        .ok_or_else(|| StackError::UnknownNode(name.to_string()))?;

    let physical = UdpPhysical::bind(host.socket_addr(), topology.mac_table(), channel).await?;
    let link = SimpleLink::new(Arc::new(physical), host.mac, topology.host_arp());
    let network = HostNetwork::new(Arc::new(link), host.vip.clone(), topology.host_routing());
    Ok(ReliableTransport::new(
        Arc::new(network),
        host.virtual_addr(),
        config,
    ))
}

/// Assemble the router's stack down from the network layer.
pub async fn build_router_network(
    topology: &Topology,
    channel: ChannelConfig,
) -> Result<RouterNetwork, StackError> {
    let router = &topology.router;
    let physical = UdpPhysical::bind(router.socket_addr(), topology.mac_table(), channel).await?;
    let link = SimpleLink::new(Arc::new(physical), router.mac, topology.router_arp());
    Ok(RouterNetwork::new(
        Arc::new(link),
        router.vip.clone(),
        topology.router_routing(),
    ))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lan_shape() {
        let topo = Topology::default_lan();
        assert_eq!(topo.hosts.len(), 3);
        assert_eq!(topo.router.vip.as_str(), "HOST_R");
        assert!(topo.node("alice").is_some());
        assert!(topo.node("router").is_some());
        assert!(topo.node("eve").is_none());
    }

    #[test]
    fn host_tables_point_at_the_router() {
        let topo = Topology::default_lan();
        let routing = topo.host_routing();
        for host in &topo.hosts {
            assert_eq!(routing[&host.vip], topo.router.vip);
        }
        let arp = topo.host_arp();
        assert_eq!(arp.len(), 1);
        assert_eq!(arp[&topo.router.vip], topo.router.mac);
    }

    #[test]
    fn router_tables_reach_every_host() {
        let topo = Topology::default_lan();
        let routing = topo.router_routing();
        let arp = topo.router_arp();
        for host in &topo.hosts {
            assert_eq!(routing[&host.vip], host.vip);
            assert_eq!(arp[&host.vip], host.mac);
        }
    }

    #[test]
    fn mac_table_covers_all_nodes() {
        let topo = Topology::default_lan();
        assert_eq!(topo.mac_table().len(), 4);
    }
}
