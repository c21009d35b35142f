//! # Network Topology & Reachability Gate
//!
//! Named networks (subnet + VLAN), device memberships, explicit allow
//! rules, and the admission decision evaluated when a listener accepts a
//! TCP connection. Reachability: the destination device is a member of the
//! source network, or an explicit `(src_network, device, protocol, port)`
//! allow rule matches. Everything else is denied — the socket closes and a
//! denial record is appended to a bounded audit log.
//!
//! A device on more than one network is a dual-homed pivot, permitted by
//! design; lateral-movement scenarios depend on it.

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use pal_common::config::{self, SimConfig};
use pal_common::consts::DENIED_LOG_CAPACITY;
use pal_common::device::ProtocolTag;
use pal_common::events::{EventBus, KernelEvent};

// ─── Errors ─────────────────────────────────────────────────────────

/// Topology load error. Fatal at boot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// A membership references a device the fabric never registered.
    #[error("topology references unregistered device: {device}")]
    UnknownDevice {
        /// Offending device name.
        device: String,
    },

    /// A subnet failed to parse (validated earlier, checked again here).
    #[error("network {network}: invalid subnet {subnet}")]
    InvalidSubnet {
        /// Network name.
        network: String,
        /// Offending subnet literal.
        subnet: String,
    },
}

// ─── Topology model ─────────────────────────────────────────────────

/// IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetV4 {
    network: u32,
    prefix: u8,
}

impl SubnetV4 {
    /// Parse `a.b.c.d/len`.
    pub fn parse(s: &str) -> Option<Self> {
        config::parse_cidr(s).map(|(network, prefix)| Self { network, prefix })
    }

    /// Whether `ip` falls inside this subnet. IPv6 never matches.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let IpAddr::V4(v4) = ip else { return false };
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        (u32::from(v4) & mask) == self.network
    }
}

/// One named network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Network name.
    pub name: String,
    /// IPv4 subnet.
    pub subnet: SubnetV4,
    /// VLAN tag.
    pub vlan: u16,
}

/// One explicit cross-network allow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowRule {
    /// Source network.
    pub src_network: String,
    /// Destination device.
    pub device: String,
    /// Protocol.
    pub protocol: ProtocolTag,
    /// Destination port.
    pub port: u16,
}

/// Networks, memberships, and allow rules.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    networks: Vec<Network>,
    /// device → networks it belongs to.
    membership: HashMap<String, BTreeSet<String>>,
    allow_rules: Vec<AllowRule>,
    fallback_network: String,
}

impl Topology {
    /// Build from the catalogue. `registered` is the set of device names
    /// known to the fabric; any membership outside it is `TopologyError`.
    pub fn from_config(
        cfg: &SimConfig,
        registered: &BTreeSet<String>,
    ) -> Result<Self, TopologyError> {
        let mut networks = Vec::new();
        for net in &cfg.networks {
            let subnet =
                SubnetV4::parse(&net.subnet).ok_or_else(|| TopologyError::InvalidSubnet {
                    network: net.name.clone(),
                    subnet: net.subnet.clone(),
                })?;
            networks.push(Network {
                name: net.name.clone(),
                subnet,
                vlan: net.vlan,
            });
        }

        let mut membership: HashMap<String, BTreeSet<String>> = HashMap::new();
        for mem in &cfg.memberships {
            for device in &mem.devices {
                if !registered.contains(device) {
                    return Err(TopologyError::UnknownDevice {
                        device: device.clone(),
                    });
                }
                membership
                    .entry(device.clone())
                    .or_default()
                    .insert(mem.network.clone());
            }
        }

        let allow_rules = cfg
            .allow_rules
            .iter()
            .map(|r| AllowRule {
                src_network: r.src_network.clone(),
                device: r.device.clone(),
                protocol: r.protocol,
                port: r.port,
            })
            .collect();

        Ok(Self {
            networks,
            membership,
            allow_rules,
            fallback_network: cfg.fallback_network.clone(),
        })
    }

    /// Classify a peer address into a network name. Unmatched peers fall
    /// back to the designated fallback (corporate) network.
    pub fn classify(&self, peer: IpAddr) -> &str {
        self.networks
            .iter()
            .find(|net| net.subnet.contains(peer))
            .map(|net| net.name.as_str())
            .unwrap_or(self.fallback_network.as_str())
    }

    /// Whether `device` is a member of `network`.
    pub fn is_member(&self, device: &str, network: &str) -> bool {
        self.membership
            .get(device)
            .is_some_and(|nets| nets.contains(network))
    }

    /// Networks a device belongs to (empty when unattached).
    pub fn networks_of(&self, device: &str) -> Vec<String> {
        self.membership
            .get(device)
            .map(|nets| nets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a device from one network (used by pivot scenarios).
    pub fn remove_membership(&mut self, device: &str, network: &str) {
        if let Some(nets) = self.membership.get_mut(device) {
            nets.remove(network);
        }
    }

    /// Core reachability rule.
    pub fn can_reach(
        &self,
        src_network: &str,
        device: &str,
        protocol: ProtocolTag,
        port: u16,
    ) -> bool {
        if self.is_member(device, src_network) {
            return true;
        }
        self.allow_rules.iter().any(|rule| {
            rule.src_network == src_network
                && rule.device == device
                && rule.protocol == protocol
                && rule.port == port
        })
    }
}

// ─── Service registry ───────────────────────────────────────────────

/// One bound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Device the listener serves.
    pub device: String,
    /// Protocol spoken.
    pub protocol: ProtocolTag,
    /// Bound port.
    pub port: u16,
}

// ─── Gate ───────────────────────────────────────────────────────────

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Session may proceed.
    Allowed {
        /// Source network inferred from the peer address.
        src_network: String,
    },
    /// Socket must be closed.
    Denied {
        /// Source network inferred from the peer address.
        src_network: String,
    },
}

/// One denied connection, kept in the bounded audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct DeniedRecord {
    /// Peer socket address.
    pub peer: SocketAddr,
    /// Destination device.
    pub device: String,
    /// Protocol of the listener.
    pub protocol: ProtocolTag,
    /// Listener port.
    pub port: u16,
    /// Source network the peer classified into.
    pub src_network: String,
    /// Sim time of the denial [s].
    pub sim_time: f64,
}

#[derive(Debug, Default)]
struct GateState {
    topology: Topology,
    services: Vec<ServiceEntry>,
    denied: VecDeque<DeniedRecord>,
}

/// The reachability gate consulted by every listener at accept time.
#[derive(Debug)]
pub struct ReachabilityGate {
    state: RwLock<GateState>,
    events: EventBus,
}

impl ReachabilityGate {
    /// Create a gate over a loaded topology.
    pub fn new(topology: Topology, events: EventBus) -> Self {
        Self {
            state: RwLock::new(GateState {
                topology,
                services: Vec::new(),
                denied: VecDeque::new(),
            }),
            events,
        }
    }

    /// Record a bound listener in the service registry.
    pub fn register_service(&self, entry: ServiceEntry) {
        info!(
            device = %entry.device,
            protocol = %entry.protocol,
            port = entry.port,
            "service registered"
        );
        self.state.write().services.push(entry);
    }

    /// Registered services, in registration order.
    pub fn services(&self) -> Vec<ServiceEntry> {
        self.state.read().services.clone()
    }

    /// Evaluate reachability without recording anything.
    pub fn can_reach(
        &self,
        src_network: &str,
        device: &str,
        protocol: ProtocolTag,
        port: u16,
    ) -> bool {
        self.state
            .read()
            .topology
            .can_reach(src_network, device, protocol, port)
    }

    /// Classify a peer address into a network name.
    pub fn classify(&self, peer: IpAddr) -> String {
        self.state.read().topology.classify(peer).to_string()
    }

    /// Admission check for one accepted connection. Denials are recorded
    /// and emitted; the caller closes the socket on `Denied`.
    pub fn admit(
        &self,
        peer: SocketAddr,
        device: &str,
        protocol: ProtocolTag,
        port: u16,
        sim_time: f64,
    ) -> Admission {
        let mut state = self.state.write();
        let src_network = state.topology.classify(peer.ip()).to_string();
        let allowed = state
            .topology
            .can_reach(&src_network, device, protocol, port);

        if allowed {
            debug!(%peer, device, %protocol, port, src = %src_network, "connection allowed");
            drop(state);
            self.events.emit(KernelEvent::ConnectionAllowed {
                peer,
                device: device.to_string(),
                protocol,
                port,
                src_network: src_network.clone(),
            });
            Admission::Allowed { src_network }
        } else {
            info!(%peer, device, %protocol, port, src = %src_network, "connection denied");
            if state.denied.len() >= DENIED_LOG_CAPACITY {
                state.denied.pop_front();
            }
            state.denied.push_back(DeniedRecord {
                peer,
                device: device.to_string(),
                protocol,
                port,
                src_network: src_network.clone(),
                sim_time,
            });
            drop(state);
            self.events.emit(KernelEvent::ConnectionDenied {
                peer,
                device: device.to_string(),
                protocol,
                port,
                src_network: src_network.clone(),
            });
            Admission::Denied { src_network }
        }
    }

    /// Copy of the denial audit log, oldest first.
    pub fn denied_log(&self) -> Vec<DeniedRecord> {
        self.state.read().denied.iter().cloned().collect()
    }

    /// Mutate the topology in place (membership changes at runtime).
    pub fn with_topology_mut<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.state.write().topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::config::{AllowRuleConfig, MembershipConfig, NetworkConfig};

    fn catalogue() -> SimConfig {
        SimConfig {
            networks: vec![
                NetworkConfig {
                    name: "plant_network".into(),
                    subnet: "192.168.1.0/24".into(),
                    vlan: 10,
                },
                NetworkConfig {
                    name: "scada_network".into(),
                    subnet: "192.168.2.0/24".into(),
                    vlan: 20,
                },
                NetworkConfig {
                    name: "corporate_network".into(),
                    subnet: "10.0.0.0/8".into(),
                    vlan: 1,
                },
            ],
            memberships: vec![
                MembershipConfig {
                    network: "plant_network".into(),
                    devices: vec!["turbine_plc_1".into(), "engineering_workstation".into()],
                },
                MembershipConfig {
                    network: "corporate_network".into(),
                    devices: vec!["engineering_workstation".into()],
                },
                MembershipConfig {
                    network: "scada_network".into(),
                    devices: vec!["engineering_workstation".into()],
                },
            ],
            allow_rules: vec![AllowRuleConfig {
                src_network: "scada_network".into(),
                device: "turbine_plc_1".into(),
                protocol: ProtocolTag::ModbusTcp,
                port: 10502,
            }],
            ..SimConfig::default()
        }
    }

    fn registered() -> BTreeSet<String> {
        ["turbine_plc_1", "engineering_workstation"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn topology() -> Topology {
        Topology::from_config(&catalogue(), &registered()).unwrap()
    }

    #[test]
    fn membership_must_be_registered() {
        let err = Topology::from_config(&catalogue(), &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, TopologyError::UnknownDevice { .. }));
    }

    #[test]
    fn classify_matches_subnets_with_fallback() {
        let topo = topology();
        assert_eq!(topo.classify("192.168.1.10".parse().unwrap()), "plant_network");
        assert_eq!(topo.classify("10.0.0.5".parse().unwrap()), "corporate_network");
        // Unmatched peers land on the fallback network.
        assert_eq!(topo.classify("172.16.0.9".parse().unwrap()), "corporate_network");
    }

    #[test]
    fn same_network_reaches_allow_rule_reaches_rest_denied() {
        let topo = topology();
        assert!(topo.can_reach("plant_network", "turbine_plc_1", ProtocolTag::ModbusTcp, 10502));
        // Explicit allow rule.
        assert!(topo.can_reach("scada_network", "turbine_plc_1", ProtocolTag::ModbusTcp, 10502));
        // Same rule, wrong port: denied.
        assert!(!topo.can_reach("scada_network", "turbine_plc_1", ProtocolTag::ModbusTcp, 502));
        // Corporate has no path to the PLC.
        assert!(!topo.can_reach("corporate_network", "turbine_plc_1", ProtocolTag::ModbusTcp, 10502));
    }

    #[test]
    fn dual_homed_pivot_and_membership_removal() {
        let mut topo = topology();
        // The workstation is reachable from corporate and lives in plant too.
        assert!(topo.can_reach("corporate_network", "engineering_workstation", ProtocolTag::S7, 102));
        assert!(topo.is_member("engineering_workstation", "plant_network"));

        // Removing it from plant_network severs the second hop.
        topo.remove_membership("engineering_workstation", "plant_network");
        assert!(!topo.is_member("engineering_workstation", "plant_network"));
    }

    #[test]
    fn gate_records_denials_and_emits_events() {
        let events = EventBus::new(32);
        let mut rx = events.subscribe();
        let gate = ReachabilityGate::new(topology(), events);

        let peer: SocketAddr = "10.0.0.5:49152".parse().unwrap();
        let admission = gate.admit(peer, "turbine_plc_1", ProtocolTag::ModbusTcp, 10502, 1.5);
        assert_eq!(
            admission,
            Admission::Denied {
                src_network: "corporate_network".into()
            }
        );
        let log = gate.denied_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].peer, peer);
        assert_eq!(log[0].sim_time, 1.5);
        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::ConnectionDenied { .. }
        ));

        let peer: SocketAddr = "192.168.1.10:49152".parse().unwrap();
        let admission = gate.admit(peer, "turbine_plc_1", ProtocolTag::ModbusTcp, 10502, 2.0);
        assert!(matches!(admission, Admission::Allowed { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::ConnectionAllowed { .. }
        ));
    }
}
