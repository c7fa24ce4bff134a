use std::path::{Path, PathBuf};

use nimbus_core::CcError;
use nimbus_core::host::HostTools;
use nimbus_core::node::NodeRecord;
use nimbus_core::vnet::VnetParams;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// VM placement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    #[default]
    #[serde(rename = "GREEDY")]
    Greedy,
    #[serde(rename = "ROUNDROBIN")]
    RoundRobin,
    #[serde(rename = "POWERSAVE")]
    PowerSave,
}

impl std::fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Greedy => write!(f, "GREEDY"),
            Self::RoundRobin => write!(f, "ROUNDROBIN"),
            Self::PowerSave => write!(f, "POWERSAVE"),
        }
    }
}

/// Cluster-controller configuration.
///
/// Loaded from a main TOML file plus an optional override file whose keys
/// win. Out-of-range durations are clamped to their floors with a warning,
/// never rejected. The struct doubles as the checkpointed config region, so
/// it also carries the runtime scheduler cursor and reload bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// NC hostnames, in scheduling slot order.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_nc_port")]
    pub nc_port: u16,
    #[serde(default = "default_nc_service")]
    pub nc_service: String,

    #[serde(default)]
    pub sched_policy: SchedPolicy,
    #[serde(default = "default_idle_thresh")]
    pub power_idle_thresh_secs: u64,
    #[serde(default = "default_wake_thresh")]
    pub power_wake_thresh_secs: u64,
    #[serde(default = "default_polling_frequency")]
    pub nc_polling_frequency_secs: u64,
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout_secs: u64,

    #[serde(default)]
    pub enable_ws_security: bool,
    #[serde(default)]
    pub disable_tunneling: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub vnet: VnetParams,

    /// Round-robin scheduler cursor; survives restarts via the checkpoint.
    #[serde(default)]
    pub sched_state: usize,

    /// Paths the config was loaded from (main, then override), for
    /// mtime-driven reload.
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    /// Newest mtime observed across `config_files` at load/reload time.
    #[serde(default)]
    pub config_mtime: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/nimbus/cc")
}
fn default_nc_port() -> u16 {
    8775
}
fn default_nc_service() -> String {
    "axis2/services/NodeCtl".to_string()
}
fn default_idle_thresh() -> u64 {
    300
}
fn default_wake_thresh() -> u64 {
    300
}
fn default_polling_frequency() -> u64 {
    6
}
fn default_instance_timeout() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

const MIN_IDLE_THRESH: u64 = 300;
const MIN_WAKE_THRESH: u64 = 300;
const MIN_POLLING_FREQUENCY: u64 = 6;
const MIN_INSTANCE_TIMEOUT: u64 = 30;

impl CcConfig {
    /// Load from the main file, then layer the override file's keys on top.
    pub fn load(main: &Path, override_path: Option<&Path>) -> Result<Self, CcError> {
        let main_text = std::fs::read_to_string(main)
            .map_err(|e| CcError::Config(format!("cannot read {}: {}", main.display(), e)))?;
        let mut table: toml::Table = toml::from_str(&main_text)
            .map_err(|e| CcError::Config(format!("cannot parse {}: {}", main.display(), e)))?;

        let mut files = vec![main.to_path_buf()];
        if let Some(ov) = override_path
            && ov.exists()
        {
            let ov_text = std::fs::read_to_string(ov)
                .map_err(|e| CcError::Config(format!("cannot read {}: {}", ov.display(), e)))?;
            let ov_table: toml::Table = toml::from_str(&ov_text)
                .map_err(|e| CcError::Config(format!("cannot parse {}: {}", ov.display(), e)))?;
            for (k, v) in ov_table {
                table.insert(k, v);
            }
            files.push(ov.to_path_buf());
        }

        let mut config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e| CcError::Config(format!("bad configuration: {}", e)))?;
        config.config_files = files;
        config.config_mtime = config.latest_mtime();
        config.clamp();
        Ok(config)
    }

    /// Parse from a TOML string (no file bookkeeping). Used by tests.
    pub fn parse(s: &str) -> Result<Self, CcError> {
        let mut config: Self =
            toml::from_str(s).map_err(|e| CcError::Config(format!("bad configuration: {}", e)))?;
        config.clamp();
        Ok(config)
    }

    /// Clamp duration knobs to their floors.
    fn clamp(&mut self) {
        if self.power_idle_thresh_secs < MIN_IDLE_THRESH {
            warn!(
                value = self.power_idle_thresh_secs,
                floor = MIN_IDLE_THRESH,
                "power_idle_thresh_secs below minimum, clamping"
            );
            self.power_idle_thresh_secs = MIN_IDLE_THRESH;
        }
        if self.power_wake_thresh_secs < MIN_WAKE_THRESH {
            warn!(
                value = self.power_wake_thresh_secs,
                floor = MIN_WAKE_THRESH,
                "power_wake_thresh_secs below minimum, clamping"
            );
            self.power_wake_thresh_secs = MIN_WAKE_THRESH;
        }
        if self.nc_polling_frequency_secs < MIN_POLLING_FREQUENCY {
            warn!(
                value = self.nc_polling_frequency_secs,
                floor = MIN_POLLING_FREQUENCY,
                "nc_polling_frequency_secs below minimum, clamping"
            );
            self.nc_polling_frequency_secs = MIN_POLLING_FREQUENCY;
        }
        if self.instance_timeout_secs < MIN_INSTANCE_TIMEOUT {
            warn!(
                value = self.instance_timeout_secs,
                floor = MIN_INSTANCE_TIMEOUT,
                "instance_timeout_secs below minimum, clamping"
            );
            self.instance_timeout_secs = MIN_INSTANCE_TIMEOUT;
        }
    }

    /// Newest mtime across the config files; 0 when none can be stat'ed.
    pub fn latest_mtime(&self) -> u64 {
        self.config_files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .filter_map(|m| m.modified().ok())
            .filter_map(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .max()
            .unwrap_or(0)
    }

    /// Build fresh node records from the configured node list, resolving
    /// each hostname. Resolution failures leave the IP unset; the record
    /// still enters the cache so the slot exists.
    pub fn build_nodes(&self, tools: &dyn HostTools) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .map(|hostname| {
                let ip = match tools.resolve_host(hostname) {
                    Ok(ip) => ip,
                    Err(e) => {
                        warn!(host = %hostname, error = %e, "Cannot resolve node, leaving IP unset");
                        "0.0.0.0".to_string()
                    }
                };
                NodeRecord::new(hostname, &ip, self.nc_port, &self.nc_service)
            })
            .collect()
    }
}
