use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::instance::{NetConfig, VmSpec, VolumeRecord};
use crate::meta::RequestMeta;

/// Capacity report from a node controller's describe-resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcResourceReport {
    pub memory_max_mb: u32,
    pub memory_avail_mb: u32,
    pub disk_max_gb: u32,
    pub disk_avail_gb: u32,
    pub cores_max: u32,
    pub cores_avail: u32,
}

/// One instance as reported by a node controller's describe-instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NcInstanceReport {
    pub instance_id: String,
    pub reservation_id: String,
    pub owner_id: String,
    pub image_id: String,
    pub kernel_id: String,
    pub ramdisk_id: String,
    pub key_name: String,
    #[serde(default)]
    pub launch_index: String,
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub group_names: Vec<String>,
    /// Opaque lifecycle state string owned by the NC.
    pub state_name: String,
    pub net: NetConfig,
    pub vm: VmSpec,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
}

/// Parameters for a run-instance call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NcRunRequest {
    pub instance_id: String,
    pub reservation_id: String,
    pub owner_id: String,
    pub image_id: String,
    pub image_url: String,
    pub kernel_id: String,
    pub kernel_url: String,
    pub ramdisk_id: String,
    pub ramdisk_url: String,
    pub key_name: String,
    pub user_data: String,
    pub launch_index: String,
    pub group_names: Vec<String>,
    pub net: NetConfig,
    pub vm: VmSpec,
}

/// Client capability for talking to one node controller.
///
/// Transport and marshalling live behind this trait; the controller core
/// only sees typed calls addressed by NC URL. Every method is invoked from
/// inside the call sandbox, so implementations may block on the network for
/// as long as they like — the sandbox enforces the deadline.
#[async_trait]
pub trait NcClient: Send + Sync {
    async fn describe_resource(&self, url: &str, meta: &RequestMeta) -> Result<NcResourceReport>;

    async fn describe_instances(
        &self,
        url: &str,
        meta: &RequestMeta,
    ) -> Result<Vec<NcInstanceReport>>;

    async fn run_instance(
        &self,
        url: &str,
        meta: &RequestMeta,
        req: &NcRunRequest,
    ) -> Result<NcInstanceReport>;

    async fn start_network(&self, url: &str, meta: &RequestMeta, vlan: i32) -> Result<()>;

    async fn terminate_instance(&self, url: &str, meta: &RequestMeta, instance_id: &str)
    -> Result<()>;

    async fn reboot_instance(&self, url: &str, meta: &RequestMeta, instance_id: &str) -> Result<()>;

    async fn get_console_output(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<String>;

    async fn attach_volume(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
        volume_id: &str,
        remote_dev: &str,
        local_dev: &str,
    ) -> Result<()>;

    async fn detach_volume(
        &self,
        url: &str,
        meta: &RequestMeta,
        instance_id: &str,
        volume_id: &str,
        remote_dev: &str,
        local_dev: &str,
        force: bool,
    ) -> Result<()>;

    async fn power_down(&self, url: &str, meta: &RequestMeta) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_report_serde() {
        let r = NcResourceReport {
            memory_max_mb: 8192,
            memory_avail_mb: 7168,
            disk_max_gb: 100,
            disk_avail_gb: 90,
            cores_max: 4,
            cores_avail: 3,
        };
        let json = serde_json::to_string(&r).unwrap();
        let parsed: NcResourceReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.memory_avail_mb, 7168);
        assert_eq!(parsed.cores_max, 4);
    }

    #[test]
    fn test_instance_report_defaults() {
        // Reports from older NCs omit optional fields
        let json = r#"{
            "instance_id": "i-1",
            "reservation_id": "r-1",
            "owner_id": "acme",
            "image_id": "emi-1",
            "kernel_id": "eki-1",
            "ramdisk_id": "eri-1",
            "key_name": "k",
            "state_name": "Extant",
            "net": {"private_mac": "", "private_ip": "0.0.0.0", "public_ip": "0.0.0.0", "vlan": -1, "network_index": -1},
            "vm": {"mem_mb": 512, "disk_gb": 5, "cores": 1}
        }"#;
        let parsed: NcInstanceReport = serde_json::from_str(json).unwrap();
        assert!(parsed.group_names.is_empty());
        assert!(parsed.volumes.is_empty());
        assert_eq!(parsed.state_name, "Extant");
    }
}
