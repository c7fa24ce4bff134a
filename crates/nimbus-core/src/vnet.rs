use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::host::HostTools;
use crate::instance::UNSET_IP;

/// Highest usable VLAN tag.
pub const MAX_VLAN: i32 = 4095;

/// Tenant network isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// VLAN isolation, elastic IPs, tunnels.
    #[serde(rename = "MANAGED")]
    Managed,
    /// Elastic IPs without VLAN tagging.
    #[serde(rename = "MANAGED-NOVLAN")]
    ManagedNovlan,
    /// Addresses come from a static MAC→IP map.
    #[serde(rename = "STATIC")]
    Static,
    /// Addressing fully delegated to the underlying network.
    #[serde(rename = "SYSTEM")]
    System,
}

impl NetworkMode {
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed | Self::ManagedNovlan)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "MANAGED" => Ok(Self::Managed),
            "MANAGED-NOVLAN" => Ok(Self::ManagedNovlan),
            "STATIC" => Ok(Self::Static),
            "SYSTEM" => Ok(Self::System),
            other => bail!("unknown network mode '{}'", other),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "MANAGED"),
            Self::ManagedNovlan => write!(f, "MANAGED-NOVLAN"),
            Self::Static => write!(f, "STATIC"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

/// Raw `[vnet]` configuration table, passed through to the vnet capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnetParams {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_interface")]
    pub public_interface: String,
    #[serde(default = "default_interface")]
    pub private_interface: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub dns: String,
    #[serde(default = "default_addrs_per_net")]
    pub addrs_per_net: u32,
    #[serde(default)]
    pub public_ips: Vec<String>,
    /// STATIC mode: "mac=ip" pairs.
    #[serde(default)]
    pub mac_map: Vec<String>,
}

fn default_mode() -> String {
    "SYSTEM".to_string()
}
fn default_interface() -> String {
    "eth0".to_string()
}
fn default_addrs_per_net() -> u32 {
    32
}

impl Default for VnetParams {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            public_interface: default_interface(),
            private_interface: default_interface(),
            subnet: String::new(),
            netmask: String::new(),
            dns: String::new(),
            addrs_per_net: default_addrs_per_net(),
            public_ips: Vec::new(),
            mac_map: Vec::new(),
        }
    }
}

/// One routable address the cluster can map onto instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIpEntry {
    pub ip: String,
    /// Private IP the address is mapped to; UNSET_IP when unmapped.
    pub dst_ip: String,
    pub allocated: bool,
}

/// One MAC/IP reservation handed to an instance NIC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub mac: String,
    pub ip: String,
    pub vlan: i32,
    pub network_index: i32,
    pub enabled: bool,
}

/// One active tenant network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub vlan: i32,
    pub user_name: String,
    pub net_name: String,
    pub active: bool,
}

/// One ingress filter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub rule_type: String,
    pub dest_user: String,
    pub dest_name: String,
    pub source_name: Option<String>,
    pub source_user: Option<String>,
    pub source_net: Option<String>,
    pub protocol: String,
    pub min_port: i32,
    pub max_port: i32,
}

/// The virtual-network shared region. Guarded by the Vnet lock; all
/// mutation goes through a [`VnetService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnetState {
    pub mode: NetworkMode,
    pub public_interface: String,
    pub private_interface: String,
    pub subnet: String,
    pub netmask: String,
    pub nameserver: String,
    pub addrs_per_net: u32,
    pub peer_ccs: Vec<String>,
    pub public_ips: Vec<PublicIpEntry>,
    pub hosts: Vec<HostEntry>,
    pub networks: Vec<NetworkEntry>,
    pub rules: Vec<FilterRule>,
    pub tunnels_up: bool,
}

impl Default for VnetState {
    fn default() -> Self {
        Self {
            mode: NetworkMode::System,
            public_interface: default_interface(),
            private_interface: default_interface(),
            subnet: String::new(),
            netmask: String::new(),
            nameserver: String::new(),
            addrs_per_net: default_addrs_per_net(),
            peer_ccs: Vec::new(),
            public_ips: Vec::new(),
            hosts: Vec::new(),
            networks: Vec::new(),
            rules: Vec::new(),
            tunnels_up: false,
        }
    }
}

/// Network coordinates synthesized for one instance at launch.
#[derive(Debug, Clone)]
pub struct NetParams {
    pub mac: String,
    pub private_ip: String,
    pub public_ip: String,
}

/// Parse a dotted-quad into host byte order.
pub fn dot_to_u32(s: &str) -> Result<u32> {
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        bail!("bad dotted-quad '{}'", s);
    }
    let mut out: u32 = 0;
    for o in octets {
        let b: u32 = o.parse().map_err(|_| anyhow::anyhow!("bad octet '{}'", o))?;
        if b > 255 {
            bail!("bad octet '{}'", o);
        }
        out = (out << 8) | b;
    }
    Ok(out)
}

/// Format a host-byte-order address as a dotted-quad.
pub fn u32_to_dot(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff
    )
}

/// Broadcast address for an interface address and netmask.
pub fn broadcast_addr(ip: &str, netmask: &str) -> Result<String> {
    let ip = dot_to_u32(ip)?;
    let nm = dot_to_u32(netmask)?;
    Ok(u32_to_dot((ip & nm) | !nm))
}

/// Virtual-network capability: address/MAC allocation bookkeeping plus the
/// host-side plumbing (bridges, DHCP, filter rules) behind it.
///
/// State lives in the caller-guarded [`VnetState`] region; implementations
/// mutate it and perform whatever host side effects the mode requires.
#[async_trait]
pub trait VnetService: Send + Sync {
    async fn init(&self, state: &mut VnetState, params: &VnetParams) -> Result<()>;

    /// Synthesize (mac, private IP, public IP) for an instance NIC.
    async fn generate_network_params(
        &self,
        state: &mut VnetState,
        instance_id: &str,
        vlan: i32,
        network_index: Option<i32>,
        preset_mac: Option<&str>,
    ) -> Result<NetParams>;

    async fn add_host(
        &self,
        state: &mut VnetState,
        mac: &str,
        ip: &str,
        vlan: i32,
        network_index: i32,
    ) -> Result<()>;

    async fn del_host(&self, state: &mut VnetState, mac: &str, vlan: i32) -> Result<()>;

    async fn disable_host(&self, state: &mut VnetState, mac: &str) -> Result<()>;

    async fn start_network(
        &self,
        state: &mut VnetState,
        vlan: i32,
        user_name: &str,
        net_name: &str,
    ) -> Result<()>;

    async fn stop_network(
        &self,
        state: &mut VnetState,
        vlan: i32,
        user_name: &str,
        net_name: &str,
    ) -> Result<()>;

    async fn assign_address(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()>;

    async fn unassign_address(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()>;

    async fn allocate_public_ip(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        dst_ip: &str,
    ) -> Result<()>;

    async fn deallocate_public_ip(&self, state: &mut VnetState, public_ip: &str) -> Result<()>;

    fn get_public_ip(&self, state: &VnetState, public_ip: &str) -> Result<PublicIpEntry>;

    /// Reverse lookup: reservation MAC → private IP.
    fn mac_to_ip(&self, state: &VnetState, mac: &str) -> Result<String>;

    async fn kick_dhcp(&self, state: &VnetState) -> Result<()>;

    async fn setup_tunnels(&self, state: &mut VnetState) -> Result<()>;

    async fn table_rule(&self, state: &mut VnetState, rule: FilterRule) -> Result<()>;

    async fn flush_table(&self, state: &mut VnetState, user: &str, dest_name: &str) -> Result<()>;
}

/// Default vnet implementation: pure allocation bookkeeping over the state
/// region, with host side effects delegated to [`HostTools`].
pub struct BasicVnet {
    tools: Arc<dyn HostTools>,
}

impl BasicVnet {
    pub fn new(tools: Arc<dyn HostTools>) -> Self {
        Self { tools }
    }

    /// Deterministic locally-administered MAC for a (vlan, index) slot.
    fn slot_mac(vlan: i32, index: i32) -> String {
        format!(
            "d0:0d:{:02x}:{:02x}:{:02x}:{:02x}",
            (vlan >> 8) & 0xff,
            vlan & 0xff,
            (index >> 8) & 0xff,
            index & 0xff
        )
    }

    /// Private IP for a (vlan, index) slot within the configured subnet.
    fn slot_ip(state: &VnetState, vlan: i32, index: i32) -> Result<String> {
        let base = dot_to_u32(&state.subnet)?;
        let offset = (vlan as u32) * state.addrs_per_net + index as u32;
        Ok(u32_to_dot(base + offset))
    }

    fn first_free_index(state: &VnetState, vlan: i32) -> Option<i32> {
        // 0 = network, 1 = gateway; usable slots start at 2.
        (2..state.addrs_per_net as i32).find(|idx| {
            !state
                .hosts
                .iter()
                .any(|h| h.enabled && h.vlan == vlan && h.network_index == *idx)
        })
    }

    /// Stable MAC for modes with no slot math, derived from the instance id.
    fn instance_mac(instance_id: &str) -> String {
        let mut h: u32 = 0x811c_9dc5;
        for b in instance_id.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        format!(
            "d0:0d:{:02x}:{:02x}:{:02x}:{:02x}",
            (h >> 24) & 0xff,
            (h >> 16) & 0xff,
            (h >> 8) & 0xff,
            h & 0xff
        )
    }
}

#[async_trait]
impl VnetService for BasicVnet {
    async fn init(&self, state: &mut VnetState, params: &VnetParams) -> Result<()> {
        state.mode = NetworkMode::parse(&params.mode)?;
        state.public_interface = params.public_interface.clone();
        state.private_interface = params.private_interface.clone();
        state.subnet = params.subnet.clone();
        state.netmask = params.netmask.clone();
        state.nameserver = params.dns.clone();
        state.addrs_per_net = params.addrs_per_net.max(4);

        state.public_ips = params
            .public_ips
            .iter()
            .map(|ip| PublicIpEntry {
                ip: ip.clone(),
                dst_ip: UNSET_IP.to_string(),
                allocated: false,
            })
            .collect();

        // STATIC mode: seed reservations from the mac map.
        for pair in &params.mac_map {
            let Some((mac, ip)) = pair.split_once('=') else {
                warn!(entry = %pair, "Ignoring malformed mac_map entry");
                continue;
            };
            state.hosts.push(HostEntry {
                mac: mac.to_string(),
                ip: ip.to_string(),
                vlan: 0,
                network_index: -1,
                enabled: true,
            });
        }

        if state.mode.is_managed() && (state.subnet.is_empty() || state.netmask.is_empty()) {
            bail!("MANAGED modes require subnet and netmask");
        }
        info!(mode = %state.mode, addrs_per_net = state.addrs_per_net, "Virtual network initialized");
        Ok(())
    }

    async fn generate_network_params(
        &self,
        state: &mut VnetState,
        instance_id: &str,
        vlan: i32,
        network_index: Option<i32>,
        preset_mac: Option<&str>,
    ) -> Result<NetParams> {
        match state.mode {
            NetworkMode::Managed | NetworkMode::ManagedNovlan => {
                if !(0..=MAX_VLAN).contains(&vlan) {
                    bail!("vlan {} out of range", vlan);
                }
                let index = match network_index {
                    Some(idx) => {
                        if idx < 0 || idx as u32 >= state.addrs_per_net {
                            bail!("network index {} out of range", idx);
                        }
                        if state
                            .hosts
                            .iter()
                            .any(|h| h.enabled && h.vlan == vlan && h.network_index == idx)
                        {
                            bail!("network index {} already in use on vlan {}", idx, vlan);
                        }
                        idx
                    }
                    None => Self::first_free_index(state, vlan)
                        .ok_or_else(|| anyhow::anyhow!("no free address in vlan {}", vlan))?,
                };
                let mac = match preset_mac {
                    Some(m) if !m.is_empty() => m.to_string(),
                    _ => Self::slot_mac(vlan, index),
                };
                let private_ip = Self::slot_ip(state, vlan, index)?;
                state.hosts.push(HostEntry {
                    mac: mac.clone(),
                    ip: private_ip.clone(),
                    vlan,
                    network_index: index,
                    enabled: true,
                });
                debug!(instance = %instance_id, mac = %mac, ip = %private_ip, vlan, index, "Reserved network slot");
                Ok(NetParams {
                    mac,
                    private_ip,
                    public_ip: UNSET_IP.to_string(),
                })
            }
            NetworkMode::Static => {
                let mac = preset_mac
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("STATIC mode requires a caller-supplied MAC"))?;
                let entry = state
                    .hosts
                    .iter()
                    .find(|h| h.mac == mac)
                    .ok_or_else(|| anyhow::anyhow!("MAC {} not present in the static map", mac))?;
                Ok(NetParams {
                    mac: mac.to_string(),
                    private_ip: entry.ip.clone(),
                    public_ip: UNSET_IP.to_string(),
                })
            }
            NetworkMode::System => {
                let mac = match preset_mac {
                    Some(m) if !m.is_empty() => m.to_string(),
                    _ => Self::instance_mac(instance_id),
                };
                Ok(NetParams {
                    mac,
                    private_ip: UNSET_IP.to_string(),
                    public_ip: UNSET_IP.to_string(),
                })
            }
        }
    }

    async fn add_host(
        &self,
        state: &mut VnetState,
        mac: &str,
        ip: &str,
        vlan: i32,
        network_index: i32,
    ) -> Result<()> {
        if state.hosts.iter().any(|h| h.mac == mac && h.vlan == vlan) {
            return Ok(());
        }
        state.hosts.push(HostEntry {
            mac: mac.to_string(),
            ip: ip.to_string(),
            vlan,
            network_index,
            enabled: true,
        });
        Ok(())
    }

    async fn del_host(&self, state: &mut VnetState, mac: &str, vlan: i32) -> Result<()> {
        state.hosts.retain(|h| !(h.mac == mac && h.vlan == vlan));
        Ok(())
    }

    async fn disable_host(&self, state: &mut VnetState, mac: &str) -> Result<()> {
        for h in state.hosts.iter_mut().filter(|h| h.mac == mac) {
            h.enabled = false;
        }
        Ok(())
    }

    async fn start_network(
        &self,
        state: &mut VnetState,
        vlan: i32,
        user_name: &str,
        net_name: &str,
    ) -> Result<()> {
        if let Some(net) = state.networks.iter_mut().find(|n| n.vlan == vlan) {
            net.user_name = user_name.to_string();
            net.net_name = net_name.to_string();
            net.active = true;
        } else {
            state.networks.push(NetworkEntry {
                vlan,
                user_name: user_name.to_string(),
                net_name: net_name.to_string(),
                active: true,
            });
        }
        info!(vlan, net = %net_name, "Tenant network started");
        Ok(())
    }

    async fn stop_network(
        &self,
        state: &mut VnetState,
        vlan: i32,
        _user_name: &str,
        net_name: &str,
    ) -> Result<()> {
        if let Some(net) = state.networks.iter_mut().find(|n| n.vlan == vlan) {
            net.active = false;
        }
        info!(vlan, net = %net_name, "Tenant network stopped");
        Ok(())
    }

    async fn assign_address(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()> {
        let entry = state
            .public_ips
            .iter_mut()
            .find(|e| e.ip == public_ip)
            .ok_or_else(|| anyhow::anyhow!("public IP {} is not managed here", public_ip))?;
        entry.dst_ip = private_ip.to_string();
        Ok(())
    }

    async fn unassign_address(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()> {
        if let Some(entry) = state
            .public_ips
            .iter_mut()
            .find(|e| e.ip == public_ip && e.dst_ip == private_ip)
        {
            entry.dst_ip = UNSET_IP.to_string();
        }
        Ok(())
    }

    async fn allocate_public_ip(
        &self,
        state: &mut VnetState,
        public_ip: &str,
        dst_ip: &str,
    ) -> Result<()> {
        let entry = state
            .public_ips
            .iter_mut()
            .find(|e| e.ip == public_ip)
            .ok_or_else(|| anyhow::anyhow!("public IP {} is not managed here", public_ip))?;
        entry.allocated = true;
        entry.dst_ip = dst_ip.to_string();
        Ok(())
    }

    async fn deallocate_public_ip(&self, state: &mut VnetState, public_ip: &str) -> Result<()> {
        if let Some(entry) = state.public_ips.iter_mut().find(|e| e.ip == public_ip) {
            entry.allocated = false;
            entry.dst_ip = UNSET_IP.to_string();
        }
        Ok(())
    }

    fn get_public_ip(&self, state: &VnetState, public_ip: &str) -> Result<PublicIpEntry> {
        state
            .public_ips
            .iter()
            .find(|e| e.ip == public_ip)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("public IP {} is not managed here", public_ip))
    }

    fn mac_to_ip(&self, state: &VnetState, mac: &str) -> Result<String> {
        state
            .hosts
            .iter()
            .find(|h| h.mac == mac)
            .map(|h| h.ip.clone())
            .ok_or_else(|| anyhow::anyhow!("no reservation for MAC {}", mac))
    }

    async fn kick_dhcp(&self, state: &VnetState) -> Result<()> {
        if !state.mode.is_managed() {
            return Ok(());
        }
        self.tools.kick_dhcpd()
    }

    async fn setup_tunnels(&self, state: &mut VnetState) -> Result<()> {
        if !state.mode.is_managed() {
            return Ok(());
        }
        state.tunnels_up = !state.peer_ccs.is_empty();
        debug!(peers = state.peer_ccs.len(), up = state.tunnels_up, "Tunnel state refreshed");
        Ok(())
    }

    async fn table_rule(&self, state: &mut VnetState, rule: FilterRule) -> Result<()> {
        if !state.rules.contains(&rule) {
            state.rules.push(rule);
        }
        Ok(())
    }

    async fn flush_table(&self, state: &mut VnetState, user: &str, dest_name: &str) -> Result<()> {
        state
            .rules
            .retain(|r| !(r.dest_user == user && r.dest_name == dest_name));
        Ok(())
    }
}
