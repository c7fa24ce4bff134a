use serde::{Deserialize, Serialize};

use crate::time::unix_now;

/// Power/liveness state of a node controller host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Unreachable or never probed.
    Down,
    /// Wake-on-LAN sent, waiting for the host to come back.
    Waking,
    /// Answering describe-resource probes.
    Up,
    /// Powered down by the power-save policy; probes are skipped.
    Asleep,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Waking => write!(f, "waking"),
            Self::Up => write!(f, "up"),
            Self::Asleep => write!(f, "asleep"),
        }
    }
}

/// One node controller as tracked by the resource cache.
///
/// Slot identity is stable: records are created from the configured node
/// list and `host_idx` references into that list survive until the next
/// reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub hostname: String,
    /// Resolved at config load; "0.0.0.0" when resolution failed.
    pub ip: String,
    /// Discovered lazily from `ip` via ARP; write-once after discovery.
    pub mac: String,
    pub nc_url: String,
    pub nc_port: u16,
    pub nc_service: String,

    pub max_memory_mb: u32,
    pub max_disk_gb: u32,
    pub max_cores: u32,
    pub avail_memory_mb: u32,
    pub avail_disk_gb: u32,
    pub avail_cores: u32,

    pub state: NodeState,
    pub last_state: NodeState,
    /// Unix timestamp of the last state change.
    pub state_change_ts: u64,
    /// Unix timestamp the node was first seen with no instances; 0 = busy.
    pub idle_start_ts: u64,
}

impl NodeRecord {
    pub fn new(hostname: &str, ip: &str, nc_port: u16, nc_service: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            mac: String::new(),
            nc_url: format!("http://{}:{}/{}", hostname, nc_port, nc_service),
            nc_port,
            nc_service: nc_service.to_string(),
            max_memory_mb: 0,
            max_disk_gb: 0,
            max_cores: 0,
            avail_memory_mb: 0,
            avail_disk_gb: 0,
            avail_cores: 0,
            state: NodeState::Down,
            last_state: NodeState::Down,
            state_change_ts: 0,
            idle_start_ts: 0,
        }
    }

    /// Transition to `new_state`, remembering the previous state and
    /// stamping the change. A no-op when the state is unchanged.
    pub fn change_state(&mut self, new_state: NodeState) {
        if self.state == new_state {
            return;
        }
        self.last_state = self.state;
        self.state = new_state;
        self.state_change_ts = unix_now();
        self.idle_start_ts = 0;
    }

    /// Zero both capacity and availability (node is unusable).
    pub fn zero_capacity(&mut self) {
        self.max_memory_mb = 0;
        self.max_disk_gb = 0;
        self.max_cores = 0;
        self.avail_memory_mb = 0;
        self.avail_disk_gb = 0;
        self.avail_cores = 0;
    }

    /// Whether the node can fit the requested shape out of current
    /// availability.
    pub fn fits(&self, mem_mb: u32, disk_gb: u32, cores: u32) -> bool {
        self.avail_memory_mb >= mem_mb && self.avail_disk_gb >= disk_gb && self.avail_cores >= cores
    }

    /// Whether the node could fit the requested shape if empty (used when
    /// considering waking a sleeping node).
    pub fn fits_max(&self, mem_mb: u32, disk_gb: u32, cores: u32) -> bool {
        self.max_memory_mb >= mem_mb && self.max_disk_gb >= disk_gb && self.max_cores >= cores
    }
}
