use serde::{Deserialize, Serialize};

/// Upper bound on block volumes attached to one instance.
pub const MAX_VOLUMES: usize = 16;

/// Upper bound on security groups per instance.
pub const MAX_GROUPS: usize = 64;

/// Sentinel for "no address assigned".
pub const UNSET_IP: &str = "0.0.0.0";

/// Network coordinates of one instance NIC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    /// Immutable after first assignment.
    pub private_mac: String,
    pub private_ip: String,
    /// "0.0.0.0" means no elastic IP is mapped.
    pub public_ip: String,
    pub vlan: i32,
    /// Tenant address-slot within the VLAN; -1 when the mode has none.
    pub network_index: i32,
}

impl NetConfig {
    pub fn unset() -> Self {
        Self {
            private_mac: String::new(),
            private_ip: UNSET_IP.to_string(),
            public_ip: UNSET_IP.to_string(),
            vlan: -1,
            network_index: -1,
        }
    }

    pub fn has_public_ip(&self) -> bool {
        !self.public_ip.is_empty() && self.public_ip != UNSET_IP
    }
}

/// VM shape requested at launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub mem_mb: u32,
    pub disk_gb: u32,
    pub cores: u32,
    #[serde(default)]
    pub name: String,
}

impl VmSpec {
    pub fn new(mem_mb: u32, disk_gb: u32, cores: u32) -> Self {
        Self {
            mem_mb,
            disk_gb,
            cores,
            name: String::new(),
        }
    }

    /// A shape is usable only when every axis is positive.
    pub fn is_valid(&self) -> bool {
        self.mem_mb > 0 && self.disk_gb > 0 && self.cores > 0
    }
}

/// One block volume as reported by a node controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume_id: String,
    pub remote_dev: String,
    pub local_dev: String,
    /// Opaque state string from the NC.
    pub state: String,
}

/// One VM as tracked by the instance cache.
///
/// `state` is an opaque string owned by the NC ("Pending", "Extant",
/// "Teardown", ...); the controller stores and forwards it without
/// interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub reservation_id: String,
    pub owner_id: String,

    pub ami_id: String,
    pub kernel_id: String,
    pub ramdisk_id: String,
    #[serde(default)]
    pub ami_url: String,
    #[serde(default)]
    pub kernel_url: String,
    #[serde(default)]
    pub ramdisk_url: String,

    pub key_name: String,
    #[serde(default)]
    pub launch_index: String,
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub group_names: Vec<String>,

    pub state: String,
    /// Unix timestamp of the last update from any source.
    pub ts: u64,

    /// Index of the hosting node in the resource cache at write time.
    pub nc_host_idx: usize,
    /// Snapshot of the hosting node's NC URL.
    pub service_tag: String,

    pub net: NetConfig,
    pub vm: VmSpec,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
}

impl InstanceRecord {
    /// Merge an NC-side report into this record, keeping the fields only the
    /// controller knows (host index, service tag, vm shape, assigned
    /// addresses).
    ///
    /// Address merge rules: a concrete IP from the NC always wins; the NC's
    /// "0.0.0.0" only wins when we have nothing yet. The private MAC is
    /// never overwritten once set.
    pub fn absorb_report(&mut self, report: &crate::nc::NcInstanceReport) {
        self.reservation_id = report.reservation_id.clone();
        self.owner_id = report.owner_id.clone();
        self.ami_id = report.image_id.clone();
        self.kernel_id = report.kernel_id.clone();
        self.ramdisk_id = report.ramdisk_id.clone();
        self.key_name = report.key_name.clone();
        self.launch_index = report.launch_index.clone();
        self.user_data = report.user_data.clone();
        self.group_names = report
            .group_names
            .iter()
            .take(MAX_GROUPS)
            .cloned()
            .collect();
        self.state = report.state_name.clone();

        self.net.vlan = report.net.vlan;
        self.net.network_index = report.net.network_index;
        if self.net.private_mac.is_empty() {
            self.net.private_mac = report.net.private_mac.clone();
        }
        if report.net.public_ip != UNSET_IP || self.net.public_ip.is_empty() {
            self.net.public_ip = report.net.public_ip.clone();
        }
        if report.net.private_ip != UNSET_IP || self.net.private_ip.is_empty() {
            self.net.private_ip = report.net.private_ip.clone();
        }

        self.volumes = report.volumes.iter().take(MAX_VOLUMES).cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nc::NcInstanceReport;

    fn record() -> InstanceRecord {
        InstanceRecord {
            instance_id: "i-4f2a11b0".to_string(),
            reservation_id: "r-83dd02c4".to_string(),
            owner_id: "acme".to_string(),
            ami_id: "emi-01ab".to_string(),
            kernel_id: "eki-02cd".to_string(),
            ramdisk_id: "eri-03ef".to_string(),
            ami_url: String::new(),
            kernel_url: String::new(),
            ramdisk_url: String::new(),
            key_name: "mykey".to_string(),
            launch_index: "0".to_string(),
            user_data: String::new(),
            group_names: vec!["default".to_string()],
            state: "Pending".to_string(),
            ts: 1,
            nc_host_idx: 0,
            service_tag: "http://nc1:8775/axis2/services/NodeCtl".to_string(),
            net: NetConfig {
                private_mac: "d0:0d:01:02:03:04".to_string(),
                private_ip: "10.0.0.5".to_string(),
                public_ip: UNSET_IP.to_string(),
                vlan: 10,
                network_index: 3,
            },
            vm: VmSpec::new(1024, 10, 1),
            volumes: vec![],
        }
    }

    fn report() -> NcInstanceReport {
        NcInstanceReport {
            instance_id: "i-4f2a11b0".to_string(),
            reservation_id: "r-83dd02c4".to_string(),
            owner_id: "acme".to_string(),
            image_id: "emi-01ab".to_string(),
            kernel_id: "eki-02cd".to_string(),
            ramdisk_id: "eri-03ef".to_string(),
            key_name: "mykey".to_string(),
            launch_index: "0".to_string(),
            user_data: String::new(),
            group_names: vec!["default".to_string()],
            state_name: "Extant".to_string(),
            net: NetConfig {
                private_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                private_ip: UNSET_IP.to_string(),
                public_ip: "203.0.113.9".to_string(),
                vlan: 10,
                network_index: 3,
            },
            vm: VmSpec::new(1024, 10, 1),
            volumes: vec![VolumeRecord {
                volume_id: "vol-7788".to_string(),
                remote_dev: "/dev/etherd/e0.1".to_string(),
                local_dev: "/dev/sdb".to_string(),
                state: "attached".to_string(),
            }],
        }
    }

    #[test]
    fn test_absorb_updates_state_and_volumes() {
        let mut rec = record();
        rec.absorb_report(&report());
        assert_eq!(rec.state, "Extant");
        assert_eq!(rec.volumes.len(), 1);
        assert_eq!(rec.volumes[0].volume_id, "vol-7788");
    }

    #[test]
    fn test_absorb_keeps_private_mac() {
        let mut rec = record();
        rec.absorb_report(&report());
        // MAC is write-once: the NC's differing MAC must not replace ours
        assert_eq!(rec.net.private_mac, "d0:0d:01:02:03:04");
    }

    #[test]
    fn test_absorb_ip_merge_rules() {
        let mut rec = record();
        rec.absorb_report(&report());
        // Concrete public IP from NC wins; NC's 0.0.0.0 private IP does not
        // clobber our known private IP.
        assert_eq!(rec.net.public_ip, "203.0.113.9");
        assert_eq!(rec.net.private_ip, "10.0.0.5");
    }

    #[test]
    fn test_vm_spec_validity() {
        assert!(VmSpec::new(1024, 10, 1).is_valid());
        assert!(!VmSpec::new(0, 10, 1).is_valid());
        assert!(!VmSpec::new(1024, 0, 1).is_valid());
        assert!(!VmSpec::new(1024, 10, 0).is_valid());
    }

    #[test]
    fn test_net_config_public_ip_flag() {
        let mut net = NetConfig::unset();
        assert!(!net.has_public_ip());
        net.public_ip = "203.0.113.9".to_string();
        assert!(net.has_public_ip());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let rec = record();
        let json = serde_json::to_string(&rec).unwrap();
        let parsed: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.instance_id, "i-4f2a11b0");
        assert_eq!(parsed.net.vlan, 10);
        assert_eq!(parsed.vm, rec.vm);
    }
}
