use std::sync::Arc;

use nimbus_core::CcError;
use nimbus_core::instance::{InstanceRecord, NetConfig, UNSET_IP, VmSpec};
use nimbus_core::meta::RequestMeta;
use nimbus_core::node::NodeState;
use nimbus_core::time::unix_now;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::{CcConfig, SchedPolicy};
use crate::power;
use crate::sandbox::{self, OpBudget};
use crate::state::ClusterState;

/// Per-refresher NC describe budget.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Background monitor: forever, at the polling frequency, pick up config
/// changes, refresh fleet capacity, then refresh instance state.
pub async fn run(state: Arc<ClusterState>) {
    info!("Monitor started");
    loop {
        if let Err(e) = update_config(&state).await {
            warn!(error = %e, "Config refresh failed, check the config files");
        }
        if let Err(e) = refresh_resources(&state, REFRESH_TIMEOUT).await {
            warn!(error = %e, "Resource refresh failed");
        }
        if let Err(e) = refresh_instances(&state, REFRESH_TIMEOUT).await {
            warn!(error = %e, "Instance refresh failed");
        }
        checkpoint::spawn_flush(&state);

        let period = { state.config.lock().await.nc_polling_frequency_secs };
        tokio::time::sleep(Duration::from_secs(period)).await;
    }
}

/// Reload the node list when a config file's mtime moved. An unreadable
/// node list empties the fleet rather than serving stale slots.
pub async fn update_config(state: &ClusterState) -> Result<(), CcError> {
    let mut cfg = state.config.lock().await;
    if cfg.config_files.is_empty() {
        return Ok(());
    }
    let mtime = cfg.latest_mtime();
    if mtime == 0 {
        return Err(CcError::Config("cannot stat any config file".to_string()));
    }
    if mtime == cfg.config_mtime {
        return Ok(());
    }

    info!("Config files modified, refreshing node list");
    let main = cfg.config_files[0].clone();
    let override_path = cfg.config_files.get(1).cloned();
    cfg.config_mtime = mtime;

    match CcConfig::load(&main, override_path.as_deref()) {
        Ok(fresh) => {
            let nodes = fresh.build_nodes(state.caps.tools.as_ref());
            cfg.nodes = fresh.nodes;
            cfg.nc_port = fresh.nc_port;
            cfg.nc_service = fresh.nc_service;
            let mut resources = state.resources.lock_after(&cfg).await?;
            resources.replace_all(nodes);
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Cannot re-read node list, emptying the fleet");
            let mut resources = state.resources.lock_after(&cfg).await?;
            resources.replace_all(Vec::new());
            Err(e)
        }
    }
}

/// Probe every non-sleeping node with describe-resource and fold the
/// answers into the resource cache: capacity and UP on success; on failure
/// a wake attempt (under power-save), a grace period for waking nodes, and
/// DOWN with zeroed capacity past it. Also discovers missing MACs by ARP.
pub async fn refresh_resources(state: &ClusterState, timeout: Duration) -> Result<(), CcError> {
    let meta = RequestMeta::monitor();
    let (policy, wake_thresh) = {
        let cfg = state.config.lock().await;
        (cfg.sched_policy, cfg.power_wake_thresh_secs)
    };
    let netmask = { state.vnet.lock().await.netmask.clone() };
    let budget = OpBudget::new(timeout);

    let nc_guard = state.nc_call.lock().await;
    let mut local = {
        let resources = state.resources.lock_after(&nc_guard).await?;
        resources.snapshot()
    };
    let n = local.len();

    for i in 0..n {
        if local[i].state == NodeState::Asleep {
            debug!(node = %local[i].hostname, "Node asleep, skipping probe");
        } else {
            let deadline = budget.per_node(n - i);
            let nc = state.caps.nc.clone();
            let url = local[i].nc_url.clone();
            let m = meta.clone();
            let probe = sandbox::isolated_call(
                deadline,
                "describe-resource",
                Box::pin(async move { nc.describe_resource(&url, &m).await }),
            )
            .await;

            match probe {
                Ok(report) => {
                    let node = &mut local[i];
                    node.max_memory_mb = report.memory_max_mb;
                    node.avail_memory_mb = report.memory_avail_mb;
                    node.max_disk_gb = report.disk_max_gb;
                    node.avail_disk_gb = report.disk_avail_gb;
                    node.max_cores = report.cores_max;
                    node.avail_cores = report.cores_avail;
                    node.change_state(NodeState::Up);
                    debug!(
                        node = %node.hostname,
                        mem = node.avail_memory_mb,
                        disk = node.avail_disk_gb,
                        cores = node.avail_cores,
                        "Node capacity refreshed"
                    );
                }
                Err(e) => {
                    // Under power-save an unresponsive node may simply be
                    // powered off; try to wake it before giving up on it.
                    if policy == SchedPolicy::PowerSave
                        && let Err(wake_err) = power::wake_node(
                            &mut local[i],
                            policy,
                            Some(netmask.as_str()).filter(|nm| !nm.is_empty()),
                            state.caps.tools.as_ref(),
                        )
                    {
                        debug!(node = %local[i].hostname, error = %wake_err, "Wake attempt failed");
                    }

                    let node = &mut local[i];
                    let waking_for = unix_now().saturating_sub(node.state_change_ts);
                    if node.state == NodeState::Waking && waking_for < wake_thresh {
                        debug!(
                            node = %node.hostname,
                            remaining = wake_thresh - waking_for,
                            "Node still waking, not marking DOWN yet"
                        );
                    } else {
                        warn!(node = %node.hostname, error = %e, "Describe-resource failed, marking DOWN");
                        node.zero_capacity();
                        node.change_state(NodeState::Down);
                    }
                }
            }
        }

        // Lazy MAC discovery, needed before this node can ever be woken.
        if local[i].mac.is_empty() && !local[i].ip.is_empty() && local[i].ip != UNSET_IP {
            if let Ok(mac) = state.caps.tools.arp_lookup(&local[i].ip) {
                debug!(node = %local[i].hostname, mac = %mac, "Discovered node MAC");
                local[i].mac = mac;
            }
        }
    }

    {
        let mut resources = state.resources.lock_after(&nc_guard).await?;
        resources.commit(local);
    }
    Ok(())
}

/// Sweep stale cache entries, then ask every UP node what it is running and
/// upsert the answers. An empty answer starts (or advances) the node's idle
/// clock; past the idle threshold the node is sent to sleep.
pub async fn refresh_instances(state: &ClusterState, timeout: Duration) -> Result<(), CcError> {
    let meta = RequestMeta::monitor();
    let (policy, idle_thresh, instance_timeout) = {
        let cfg = state.config.lock().await;
        (
            cfg.sched_policy,
            cfg.power_idle_thresh_secs,
            cfg.instance_timeout_secs,
        )
    };
    let budget = OpBudget::new(timeout);

    let nc_guard = state.nc_call.lock().await;
    {
        let mut instances = state.instances.lock_after(&nc_guard).await?;
        let dropped = instances.invalidate_stale(instance_timeout);
        if !dropped.is_empty() {
            info!(count = dropped.len(), "Invalidated stale instances");
        }
    }

    let mut local = {
        let resources = state.resources.lock_after(&nc_guard).await?;
        resources.snapshot()
    };
    let n = local.len();

    for i in 0..n {
        if local[i].state != NodeState::Up {
            continue;
        }
        let deadline = budget.per_node(n - i);
        let nc = state.caps.nc.clone();
        let url = local[i].nc_url.clone();
        let m = meta.clone();
        let answer = sandbox::isolated_call(
            deadline,
            "describe-instances",
            Box::pin(async move { nc.describe_instances(&url, &m).await }),
        )
        .await;

        let reports = match answer {
            Ok(reports) => reports,
            Err(e) => {
                warn!(node = %local[i].hostname, error = %e, "Describe-instances failed");
                continue;
            }
        };

        if reports.is_empty() {
            if local[i].idle_start_ts == 0 {
                local[i].idle_start_ts = unix_now();
            } else if unix_now().saturating_sub(local[i].idle_start_ts) > idle_thresh {
                let deadline = budget.per_node(n - i);
                if let Err(e) = power::power_down(
                    &mut local[i],
                    policy,
                    state.caps.nc.clone(),
                    &meta,
                    deadline,
                )
                .await
                {
                    warn!(node = %local[i].hostname, error = %e, "Power-down failed");
                }
            } else {
                debug!(
                    node = %local[i].hostname,
                    idle_for = unix_now().saturating_sub(local[i].idle_start_ts),
                    "Node idle, below threshold"
                );
            }
            continue;
        }

        local[i].idle_start_ts = 0;
        let service_tag = local[i].nc_url.clone();
        for report in &reports {
            let mut record = {
                let instances = state.instances.lock_after(&nc_guard).await?;
                instances.find_by_id(&report.instance_id)
            }
            .unwrap_or_else(|| seed_record(&report.instance_id));

            record.absorb_report(report);
            record.nc_host_idx = i;
            record.service_tag = service_tag.clone();
            record.vm = report.vm.clone();
            record.ts = unix_now();

            backfill_addresses(state, &nc_guard, &mut record).await?;

            debug!(
                instance = %record.instance_id,
                state = %record.state,
                public_ip = %record.net.public_ip,
                private_ip = %record.net.private_ip,
                "Storing instance state"
            );
            let mut instances = state.instances.lock_after(&nc_guard).await?;
            instances.refresh(record);
        }
    }

    {
        let mut resources = state.resources.lock_after(&nc_guard).await?;
        resources.commit(local);
    }
    Ok(())
}

/// Fill in addresses the NC did not report from the vnet reservations: the
/// private IP in every mode, the public IP only where the underlying
/// network provides it (SYSTEM/STATIC).
async fn backfill_addresses<T>(
    state: &ClusterState,
    nc_guard: &crate::locks::OrderedGuard<'_, T>,
    record: &mut InstanceRecord,
) -> Result<(), CcError> {
    if record.net.private_mac.is_empty()
        || (record.net.private_ip != UNSET_IP && record.net.public_ip != UNSET_IP)
    {
        return Ok(());
    }
    let vnet = state.vnet.lock_after(nc_guard).await?;
    if record.net.private_ip == UNSET_IP
        && let Ok(ip) = state.caps.vnet.mac_to_ip(&vnet, &record.net.private_mac)
    {
        record.net.private_ip = ip;
    }
    if record.net.public_ip == UNSET_IP
        && !vnet.mode.is_managed()
        && let Ok(ip) = state.caps.vnet.mac_to_ip(&vnet, &record.net.private_mac)
    {
        record.net.public_ip = ip;
    }
    Ok(())
}

/// Starting point for an instance the monitor discovers on an NC without
/// any cached history.
fn seed_record(instance_id: &str) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        reservation_id: String::new(),
        owner_id: String::new(),
        ami_id: String::new(),
        kernel_id: String::new(),
        ramdisk_id: String::new(),
        ami_url: String::new(),
        kernel_url: String::new(),
        ramdisk_url: String::new(),
        key_name: String::new(),
        launch_index: String::new(),
        user_data: String::new(),
        group_names: Vec::new(),
        state: String::new(),
        ts: 0,
        nc_host_idx: 0,
        service_tag: String::new(),
        net: NetConfig::unset(),
        vm: VmSpec::default(),
        volumes: Vec::new(),
    }
}
