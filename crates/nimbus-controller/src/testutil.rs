// Shared test doubles: a scriptable NC client and host-tool recorder, plus
// record builders the cache and scheduler tests lean on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use nimbus_core::host::HostTools;
use nimbus_core::instance::{InstanceRecord, NetConfig, VmSpec};
use nimbus_core::meta::RequestMeta;
use nimbus_core::nc::{NcClient, NcInstanceReport, NcResourceReport, NcRunRequest};
use nimbus_core::node::{NodeRecord, NodeState};
use nimbus_core::time::unix_now;
use nimbus_core::vnet::{BasicVnet, VnetParams, VnetService, VnetState};

use crate::config::CcConfig;
use crate::instance_cache::InstanceCache;
use crate::resource_cache::ResourceCache;
use crate::state::{Capabilities, ClusterState};

/// An UP node with 8192 MB / 100 GB / 4 cores, all available.
pub fn up_node(hostname: &str) -> NodeRecord {
    let mut n = NodeRecord::new(hostname, "10.1.0.1", 8775, "axis2/services/NodeCtl");
    n.state = NodeState::Up;
    n.max_memory_mb = 8192;
    n.max_disk_gb = 100;
    n.max_cores = 4;
    n.avail_memory_mb = 8192;
    n.avail_disk_gb = 100;
    n.avail_cores = 4;
    n
}

/// A minimal Pending record for cache tests.
pub fn pending_record(instance_id: &str, nc_host_idx: usize) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        reservation_id: "r-0001".to_string(),
        owner_id: "acme".to_string(),
        ami_id: "emi-1111".to_string(),
        kernel_id: "eki-2222".to_string(),
        ramdisk_id: "eri-3333".to_string(),
        ami_url: String::new(),
        kernel_url: String::new(),
        ramdisk_url: String::new(),
        key_name: "default".to_string(),
        launch_index: "0".to_string(),
        user_data: String::new(),
        group_names: vec!["default".to_string()],
        state: "Pending".to_string(),
        ts: unix_now(),
        nc_host_idx,
        service_tag: format!("http://nc{}:8775/axis2/services/NodeCtl", nc_host_idx),
        net: NetConfig::unset(),
        vm: VmSpec::new(1024, 10, 1),
        volumes: vec![],
    }
}

fn standard_resource_report() -> NcResourceReport {
    NcResourceReport {
        memory_max_mb: 8192,
        memory_avail_mb: 8192,
        disk_max_gb: 100,
        disk_avail_gb: 100,
        cores_max: 4,
        cores_avail: 4,
    }
}

/// Scriptable NC client: per-URL instance lists and capacity reports, with
/// fail/hang switches per URL and a call log.
#[derive(Default)]
pub struct MockNc {
    calls: StdMutex<Vec<(String, String)>>,
    resources: StdMutex<HashMap<String, NcResourceReport>>,
    instances: StdMutex<HashMap<String, Vec<NcInstanceReport>>>,
    fail: StdMutex<HashSet<String>>,
    hang: StdMutex<HashSet<String>>,
    run_fail: StdMutex<HashSet<String>>,
}

impl MockNc {
    pub fn fail_url(&self, url: &str) {
        self.fail.lock().unwrap().insert(url.to_string());
    }

    pub fn hang_url(&self, url: &str) {
        self.hang.lock().unwrap().insert(url.to_string());
    }

    /// run_instance fails on this URL while other verbs keep working.
    pub fn fail_run_on(&self, url: &str) {
        self.run_fail.lock().unwrap().insert(url.to_string());
    }

    pub fn put_resource(&self, url: &str, report: NcResourceReport) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), report);
    }

    pub fn put_instance(&self, url: &str, report: NcInstanceReport) {
        self.instances
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(report);
    }

    pub fn instances_on(&self, url: &str) -> Vec<NcInstanceReport> {
        self.instances
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    /// URLs that received the named verb, in call order.
    pub fn calls_for(&self, verb: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| v == verb)
            .map(|(_, url)| url.clone())
            .collect()
    }

    async fn gate(&self, verb: &str, url: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((verb.to_string(), url.to_string()));
        let hang = self.hang.lock().unwrap().contains(url);
        if hang {
            tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        }
        let fail = self.fail.lock().unwrap().contains(url);
        if fail {
            bail!("{}: {} is unreachable", verb, url);
        }
        Ok(())
    }

    fn has_instance(&self, url: &str, instance_id: &str) -> bool {
        self.instances
            .lock()
            .unwrap()
            .get(url)
            .is_some_and(|list| list.iter().any(|r| r.instance_id == instance_id))
    }
}

#[async_trait]
impl NcClient for MockNc {
    async fn describe_resource(&self, url: &str, _meta: &RequestMeta) -> Result<NcResourceReport> {
        self.gate("describe_resource", url).await?;
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(standard_resource_report))
    }

    async fn describe_instances(
        &self,
        url: &str,
        _meta: &RequestMeta,
    ) -> Result<Vec<NcInstanceReport>> {
        self.gate("describe_instances", url).await?;
        Ok(self.instances_on(url))
    }

    async fn run_instance(
        &self,
        url: &str,
        _meta: &RequestMeta,
        req: &NcRunRequest,
    ) -> Result<NcInstanceReport> {
        self.gate("run_instance", url).await?;
        if self.run_fail.lock().unwrap().contains(url) {
            bail!("run_instance: {} refused", url);
        }
        let report = NcInstanceReport {
            instance_id: req.instance_id.clone(),
            reservation_id: req.reservation_id.clone(),
            owner_id: req.owner_id.clone(),
            image_id: req.image_id.clone(),
            kernel_id: req.kernel_id.clone(),
            ramdisk_id: req.ramdisk_id.clone(),
            key_name: req.key_name.clone(),
            launch_index: req.launch_index.clone(),
            user_data: req.user_data.clone(),
            group_names: req.group_names.clone(),
            state_name: "Pending".to_string(),
            net: req.net.clone(),
            vm: req.vm.clone(),
            volumes: vec![],
        };
        self.put_instance(url, report.clone());
        Ok(report)
    }

    async fn start_network(&self, url: &str, _meta: &RequestMeta, _vlan: i32) -> Result<()> {
        self.gate("start_network", url).await
    }

    async fn terminate_instance(
        &self,
        url: &str,
        _meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<()> {
        self.gate("terminate_instance", url).await?;
        if !self.has_instance(url, instance_id) {
            bail!("terminate: {} not on {}", instance_id, url);
        }
        self.instances
            .lock()
            .unwrap()
            .get_mut(url)
            .unwrap()
            .retain(|r| r.instance_id != instance_id);
        Ok(())
    }

    async fn reboot_instance(
        &self,
        url: &str,
        _meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<()> {
        self.gate("reboot_instance", url).await?;
        if !self.has_instance(url, instance_id) {
            bail!("reboot: {} not on {}", instance_id, url);
        }
        Ok(())
    }

    async fn get_console_output(
        &self,
        url: &str,
        _meta: &RequestMeta,
        instance_id: &str,
    ) -> Result<String> {
        self.gate("get_console_output", url).await?;
        if !self.has_instance(url, instance_id) {
            bail!("console: {} not on {}", instance_id, url);
        }
        Ok(format!("serial console of {}", instance_id))
    }

    async fn attach_volume(
        &self,
        url: &str,
        _meta: &RequestMeta,
        instance_id: &str,
        _volume_id: &str,
        _remote_dev: &str,
        _local_dev: &str,
    ) -> Result<()> {
        self.gate("attach_volume", url).await?;
        if !self.has_instance(url, instance_id) {
            bail!("attach: {} not on {}", instance_id, url);
        }
        Ok(())
    }

    async fn detach_volume(
        &self,
        url: &str,
        _meta: &RequestMeta,
        instance_id: &str,
        _volume_id: &str,
        _remote_dev: &str,
        _local_dev: &str,
        _force: bool,
    ) -> Result<()> {
        self.gate("detach_volume", url).await?;
        if !self.has_instance(url, instance_id) {
            bail!("detach: {} not on {}", instance_id, url);
        }
        Ok(())
    }

    async fn power_down(&self, url: &str, _meta: &RequestMeta) -> Result<()> {
        self.gate("power_down", url).await
    }
}

/// Host-tool recorder: canned resolution/ARP answers, captured WoL and
/// address-plumbing calls.
#[derive(Default)]
pub struct MockTools {
    resolve: StdMutex<HashMap<String, String>>,
    arp: StdMutex<HashMap<String, String>>,
    wol: StdMutex<Vec<(String, String)>>,
    ip_cmds: StdMutex<Vec<String>>,
    fail_ip_cmds: StdMutex<bool>,
}

impl MockTools {
    pub fn set_arp(&self, ip: &str, mac: &str) {
        self.arp
            .lock()
            .unwrap()
            .insert(ip.to_string(), mac.to_string());
    }

    pub fn fail_ip_cmds(&self) {
        *self.fail_ip_cmds.lock().unwrap() = true;
    }

    pub fn wol_calls(&self) -> Vec<(String, String)> {
        self.wol.lock().unwrap().clone()
    }

    pub fn ip_cmds(&self) -> Vec<String> {
        self.ip_cmds.lock().unwrap().clone()
    }
}

impl HostTools for MockTools {
    fn resolve_host(&self, hostname: &str) -> Result<String> {
        Ok(self
            .resolve
            .lock()
            .unwrap()
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string()))
    }

    fn arp_lookup(&self, ip: &str) -> Result<String> {
        match self.arp.lock().unwrap().get(ip) {
            Some(mac) => Ok(mac.clone()),
            None => bail!("no neighbor entry for {}", ip),
        }
    }

    fn ip_addr_add(&self, ip: &str, dev: &str) -> Result<()> {
        if *self.fail_ip_cmds.lock().unwrap() {
            bail!("ip addr add {} refused", ip);
        }
        self.ip_cmds
            .lock()
            .unwrap()
            .push(format!("add {} {}", ip, dev));
        Ok(())
    }

    fn ip_addr_del(&self, ip: &str, dev: &str) -> Result<()> {
        self.ip_cmds
            .lock()
            .unwrap()
            .push(format!("del {} {}", ip, dev));
        Ok(())
    }

    fn wake_on_lan(&self, broadcast: &str, target: &str) -> Result<()> {
        self.wol
            .lock()
            .unwrap()
            .push((broadcast.to_string(), target.to_string()));
        Ok(())
    }

    fn kick_dhcpd(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything the handler tests need in one bundle.
pub struct Harness {
    pub state: Arc<ClusterState>,
    pub nc: Arc<MockNc>,
    pub tools: Arc<MockTools>,
}

/// Build a controller over `nodes` with the given config TOML, a MANAGED
/// vnet unless the config says otherwise, and scriptable capabilities.
pub async fn harness(config_toml: &str, nodes: Vec<NodeRecord>) -> Harness {
    let config = CcConfig::parse(config_toml).expect("test config");
    let nc = Arc::new(MockNc::default());
    let tools = Arc::new(MockTools::default());
    let vnet_service: Arc<dyn VnetService> = Arc::new(BasicVnet::new(tools.clone()));

    let mut vnet_state = VnetState::default();
    let params: VnetParams = config.vnet.clone();
    vnet_service
        .init(&mut vnet_state, &params)
        .await
        .expect("vnet init");

    let caps = Capabilities {
        nc: nc.clone(),
        vnet: vnet_service,
        tools: tools.clone(),
    };
    let state = ClusterState::assemble(
        config,
        InstanceCache::new(),
        ResourceCache::new(nodes),
        vnet_state,
        caps,
    );
    Harness { state, nc, tools }
}

/// A managed-mode config with two public IPs and relaxed thresholds.
pub const MANAGED_CONFIG: &str = r#"
nodes = ["nc0", "nc1"]
sched_policy = "GREEDY"

[vnet]
mode = "MANAGED"
subnet = "10.128.0.0"
netmask = "255.255.0.0"
addrs_per_net = 32
public_ips = ["203.0.113.7", "203.0.113.8"]
"#;
