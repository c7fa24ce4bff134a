use std::sync::Arc;

use nimbus_core::CcError;
use nimbus_core::instance::{InstanceRecord, NetConfig, VmSpec};
use nimbus_core::meta::RequestMeta;
use nimbus_core::nc::NcRunRequest;
use nimbus_core::node::NodeState;
use nimbus_core::time::unix_now;
use nimbus_core::vnet::{NetParams, VnetState};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::fanout::{self, FanoutTarget};
use crate::power;
use crate::sandbox::{self, OpBudget};
use crate::scheduler;
use crate::state::ClusterState;

/// Budget for the start-network phase of a launch.
const START_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of a RunInstances verb.
#[derive(Debug, Clone)]
pub struct RunInstancesRequest {
    pub ami_id: String,
    pub kernel_id: String,
    pub ramdisk_id: String,
    pub ami_url: String,
    pub kernel_url: String,
    pub ramdisk_url: String,
    /// Pre-allocated instance ids; at least `max_count` of them.
    pub inst_ids: Vec<String>,
    pub net_names: Vec<String>,
    /// Caller-supplied MACs, one per slot; empty entries mean "generate".
    pub mac_addrs: Vec<String>,
    pub network_index_list: Option<Vec<i32>>,
    pub min_count: usize,
    pub max_count: usize,
    pub owner_id: String,
    pub reservation_id: String,
    pub vm: VmSpec,
    pub key_name: String,
    pub vlan: i32,
    pub user_data: String,
    pub launch_index: String,
    pub target_node: Option<String>,
}

/// Per-vm-type fleet capacity as seen by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ResourceSummary {
    pub types_max: Vec<u32>,
    pub types_avail: Vec<u32>,
    pub service_tags: Vec<String>,
}

/// Launch up to `max_count` instances.
///
/// Each slot runs the pipeline: synthesize network params, schedule, launch
/// through the sandbox (retrying the start-network/run-instance pair for up
/// to the wake threshold to ride out node wake-up), then admit the record.
/// A node that fails its launch is marked DOWN and the slot is retried
/// elsewhere; a slot with no capacity anywhere is skipped. `min_count` is
/// not enforced here — the caller decides whether a partial run is enough.
pub async fn run_instances(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    req: &RunInstancesRequest,
) -> Result<Vec<InstanceRecord>, CcError> {
    state.ensure_initialized().await?;

    if !req.vm.is_valid() {
        return Err(CcError::bad_input("vm shape has a non-positive axis"));
    }
    if req.min_count == 0 || req.max_count == 0 || req.inst_ids.len() < req.max_count {
        return Err(CcError::bad_input(format!(
            "bad counts: min={}, max={}, ids={}",
            req.min_count,
            req.max_count,
            req.inst_ids.len()
        )));
    }

    // Index-list health check; the list is ignored entirely outside the
    // managed modes.
    let (managed_mode, addrs_per_net) = {
        let vnet = state.vnet.lock().await;
        (vnet.mode.is_managed(), vnet.addrs_per_net)
    };
    let index_list = match (&req.network_index_list, managed_mode) {
        (Some(list), true) => {
            if list.len() < req.min_count || list.len() > req.max_count {
                return Err(CcError::bad_input(format!(
                    "network index list length {} out of bounds for {}-{} instances",
                    list.len(),
                    req.min_count,
                    req.max_count
                )));
            }
            for &idx in list {
                if idx < 0 || idx as u32 >= addrs_per_net {
                    return Err(CcError::bad_input(format!(
                        "network index {} out of bounds (0-{})",
                        idx,
                        addrs_per_net - 1
                    )));
                }
            }
            Some(list.as_slice())
        }
        _ => None,
    };

    info!(
        user = %meta.user_id,
        image = %req.ami_id,
        count = req.max_count,
        vlan = req.vlan,
        "Launching instances"
    );

    let fleet_size = { state.resources.lock().await.len() };
    let mut launched = Vec::new();

    for slot in 0..req.max_count {
        let instance_id = &req.inst_ids[slot];
        let preset_mac = req.mac_addrs.get(slot).filter(|m| !m.is_empty());
        let net_index = index_list.and_then(|list| list.get(slot).copied());

        let mut attempts = 0usize;
        loop {
            // A failed node goes DOWN and out of scheduling; the fleet size
            // bounds how often this slot can move.
            if attempts > fleet_size {
                warn!(instance = %instance_id, "Giving up on slot after exhausting the fleet");
                break;
            }
            attempts += 1;

            // Phase 1: network reservation.
            let params = {
                let mut vnet = state.vnet.lock().await;
                match state
                    .caps
                    .vnet
                    .generate_network_params(
                        &mut vnet,
                        instance_id,
                        req.vlan,
                        net_index,
                        preset_mac.map(|s| s.as_str()),
                    )
                    .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(instance = %instance_id, error = %e, "No usable network address, skipping slot");
                        break;
                    }
                }
            };

            // Phase 2: schedule under Config → NcCall → ResCache.
            let mut cfg = state.config.lock().await;
            let nc_guard = state.nc_call.lock_after(&cfg).await?;
            let policy = cfg.sched_policy;
            let wake_thresh = Duration::from_secs(cfg.power_wake_thresh_secs);

            let scheduled = {
                let mut resources = state.resources.lock_after(&nc_guard).await?;
                match scheduler::schedule(
                    policy,
                    &resources,
                    &mut cfg.sched_state,
                    &req.vm,
                    req.target_node.as_deref(),
                ) {
                    Ok(placement) => {
                        if placement.needs_wake {
                            let netmask = { state.vnet.lock_after(&resources).await?.netmask.clone() };
                            let node = resources
                                .get_mut(placement.res_idx)
                                .expect("scheduler returned a valid slot");
                            if let Err(e) = power::wake_node(
                                node,
                                policy,
                                Some(&netmask).filter(|nm| !nm.is_empty()).map(|s| s.as_str()),
                                state.caps.tools.as_ref(),
                            ) {
                                warn!(node = %node.hostname, error = %e, "Wake-on-LAN failed");
                            }
                        }
                        let node = resources.get(placement.res_idx).expect("valid slot");
                        Ok((placement.res_idx, node.nc_url.clone(), node.hostname.clone()))
                    }
                    Err(e) => Err(e),
                }
            };
            drop(cfg);

            let (res_idx, node_url, node_hostname) = match scheduled {
                Ok(v) => v,
                Err(e) => {
                    warn!(instance = %instance_id, error = %e, "Scheduler found no resource");
                    let mut vnet = state.vnet.lock_after(&nc_guard).await?;
                    undo_reservation(state, &mut vnet, &params.mac, req.vlan).await;
                    break;
                }
            };
            debug!(instance = %instance_id, node = %node_hostname, "Scheduler decision");

            // Phase 3: the two-phase NC call, retried across node wake-up.
            // Only NcCall is held across the wait.
            let ok = launch_on_node(
                state,
                meta,
                req,
                instance_id,
                net_index,
                &params,
                &node_url,
                wake_thresh,
            )
            .await;

            if !ok {
                warn!(instance = %instance_id, node = %node_hostname, "Launch failed, marking node DOWN and retrying elsewhere");
                {
                    let mut resources = state.resources.lock_after(&nc_guard).await?;
                    if let Some(node) = resources.get_mut(res_idx) {
                        node.change_state(NodeState::Down);
                    }
                }
                {
                    let mut vnet = state.vnet.lock_after(&nc_guard).await?;
                    undo_reservation(state, &mut vnet, &params.mac, req.vlan).await;
                }
                continue;
            }

            // Phase 4: commit — capacity decrement, DHCP, cache admission.
            let service_tag = {
                let mut resources = state.resources.lock_after(&nc_guard).await?;
                let node = resources.get_mut(res_idx).expect("valid slot");
                node.avail_memory_mb = node.avail_memory_mb.saturating_sub(req.vm.mem_mb);
                node.avail_disk_gb = node.avail_disk_gb.saturating_sub(req.vm.disk_gb);
                node.avail_cores = node.avail_cores.saturating_sub(req.vm.cores);
                debug!(
                    node = %node.hostname,
                    mem = node.avail_memory_mb,
                    disk = node.avail_disk_gb,
                    cores = node.avail_cores,
                    "Availability after launch"
                );
                node.nc_url.clone()
            };

            {
                let vnet = state.vnet.lock_after(&nc_guard).await?;
                if let Err(e) = state.caps.vnet.kick_dhcp(&vnet).await {
                    warn!(instance = %instance_id, error = %e, "Cannot kick DHCP daemon, check network settings");
                }
            }

            let record = pending_record_for(req, instance_id, net_index, &params, res_idx, service_tag);
            {
                let mut instances = state.instances.lock_after(&nc_guard).await?;
                instances.add(record.clone());
            }
            launched.push(record);
            break;
        }
    }

    info!(
        requested = req.max_count,
        launched = launched.len(),
        "Launch pipeline finished"
    );
    checkpoint::verb_complete(state).await;
    Ok(launched)
}

/// Tear a failed or unplaced reservation back out of the vnet region.
async fn undo_reservation(state: &ClusterState, vnet: &mut VnetState, mac: &str, vlan: i32) {
    if let Err(e) = state.caps.vnet.disable_host(vnet, mac).await {
        warn!(mac = %mac, error = %e, "Cannot disable host reservation");
    }
    if vnet.mode.is_managed()
        && let Err(e) = state.caps.vnet.del_host(vnet, mac, vlan).await
    {
        warn!(mac = %mac, error = %e, "Cannot delete host reservation");
    }
}

/// Start-network then run-instance against one NC, retrying the pair until
/// the wake threshold elapses. Returns whether the run was acknowledged.
#[allow(clippy::too_many_arguments)]
async fn launch_on_node(
    state: &ClusterState,
    meta: &RequestMeta,
    req: &RunInstancesRequest,
    instance_id: &str,
    net_index: Option<i32>,
    params: &NetParams,
    node_url: &str,
    wake_thresh: Duration,
) -> bool {
    let run_req = NcRunRequest {
        instance_id: instance_id.to_string(),
        reservation_id: req.reservation_id.clone(),
        owner_id: req.owner_id.clone(),
        image_id: req.ami_id.clone(),
        image_url: req.ami_url.clone(),
        kernel_id: req.kernel_id.clone(),
        kernel_url: req.kernel_url.clone(),
        ramdisk_id: req.ramdisk_id.clone(),
        ramdisk_url: req.ramdisk_url.clone(),
        key_name: req.key_name.clone(),
        user_data: req.user_data.clone(),
        launch_index: req.launch_index.clone(),
        group_names: req.net_names.clone(),
        net: NetConfig {
            private_mac: params.mac.clone(),
            private_ip: params.private_ip.clone(),
            public_ip: params.public_ip.clone(),
            vlan: req.vlan,
            network_index: net_index.unwrap_or(-1),
        },
        vm: req.vm.clone(),
    };

    let started = Instant::now();
    loop {
        // Make sure the tenant network exists on the node first; a failure
        // here is tolerated (the run call will tell us for sure).
        let nc = state.caps.nc.clone();
        let url = node_url.to_string();
        let m = meta.clone();
        let vlan = req.vlan;
        if let Err(e) = sandbox::isolated_call(
            START_NETWORK_TIMEOUT,
            "start-network",
            Box::pin(async move { nc.start_network(&url, &m, vlan).await }),
        )
        .await
        {
            debug!(node = %node_url, error = %e, "start-network reported failure");
        }

        let nc = state.caps.nc.clone();
        let url = node_url.to_string();
        let m = meta.clone();
        let rr = run_req.clone();
        let remaining = wake_thresh
            .saturating_sub(started.elapsed())
            .max(Duration::from_secs(1));
        match sandbox::isolated_call(
            remaining,
            "run-instance",
            Box::pin(async move { nc.run_instance(&url, &m, &rr).await }),
        )
        .await
        {
            Ok(_report) => return true,
            Err(e) => {
                if started.elapsed() >= wake_thresh {
                    warn!(instance = %instance_id, node = %node_url, error = %e, "Run-instance failed past the wake threshold");
                    return false;
                }
                debug!(instance = %instance_id, error = %e, "Run-instance failed, node may still be waking; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// The CC-side record admitted for a freshly launched instance.
fn pending_record_for(
    req: &RunInstancesRequest,
    instance_id: &str,
    net_index: Option<i32>,
    params: &NetParams,
    res_idx: usize,
    service_tag: String,
) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        reservation_id: req.reservation_id.clone(),
        owner_id: req.owner_id.clone(),
        ami_id: req.ami_id.clone(),
        kernel_id: req.kernel_id.clone(),
        ramdisk_id: req.ramdisk_id.clone(),
        ami_url: req.ami_url.clone(),
        kernel_url: req.kernel_url.clone(),
        ramdisk_url: req.ramdisk_url.clone(),
        key_name: req.key_name.clone(),
        launch_index: req.launch_index.clone(),
        user_data: req.user_data.clone(),
        group_names: req.net_names.clone(),
        state: "Pending".to_string(),
        ts: unix_now(),
        nc_host_idx: res_idx,
        service_tag,
        net: NetConfig {
            private_mac: params.mac.clone(),
            private_ip: params.private_ip.clone(),
            public_ip: params.public_ip.clone(),
            vlan: req.vlan,
            network_index: net_index.unwrap_or(-1),
        },
        vm: req.vm.clone(),
        volumes: vec![],
    }
}

/// Serve instance records straight from the cache; no NC traffic. An empty
/// id list means everything.
pub async fn describe_instances(
    state: &Arc<ClusterState>,
    _meta: &RequestMeta,
    instance_ids: &[String],
) -> Result<Vec<InstanceRecord>, CcError> {
    state.ensure_initialized().await?;
    let mut records = {
        let instances = state.instances.lock().await;
        instances.snapshot()
    };
    if !instance_ids.is_empty() {
        records.retain(|r| instance_ids.iter().any(|id| id == &r.instance_id));
    }
    checkpoint::verb_complete(state).await;
    Ok(records)
}

/// Candidate targets for one instance-addressed call: the cached host when
/// known, the whole fleet otherwise. Cache locks are taken briefly under
/// NcCall and released before any call runs.
async fn targets_for<'a, T>(
    state: &ClusterState,
    nc_guard: &crate::locks::OrderedGuard<'a, T>,
    instance_id: &str,
) -> Result<(Option<InstanceRecord>, Vec<FanoutTarget>), CcError> {
    let cached = {
        let instances = state.instances.lock_after(nc_guard).await?;
        instances.find_by_id(instance_id)
    };
    let snapshot = {
        let resources = state.resources.lock_after(nc_guard).await?;
        resources.snapshot()
    };
    let range = fanout::candidate_range(cached.as_ref().map(|r| r.nc_host_idx), snapshot.len());
    let targets = FanoutTarget::from_snapshot(&snapshot)[range].to_vec();
    Ok((cached, targets))
}

/// Reboot each named instance on its NC, broadcasting when the mapping is
/// unknown. Per-instance failures are absorbed.
pub async fn reboot_instances(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    instance_ids: &[String],
) -> Result<(), CcError> {
    state.ensure_initialized().await?;
    let budget = OpBudget::standard();
    let nc_guard = state.nc_call.lock().await;

    for instance_id in instance_ids {
        let (_, targets) = targets_for(state, &nc_guard, instance_id).await?;
        let nc = state.caps.nc.clone();
        let result = fanout::first_success(&targets, &budget, "reboot-instance", |t| {
            let nc = nc.clone();
            let url = t.url.clone();
            let m = meta.clone();
            let id = instance_id.clone();
            Box::pin(async move { nc.reboot_instance(&url, &m, &id).await })
        })
        .await;
        if let Err(e) = result {
            warn!(instance = %instance_id, error = %e, "Reboot did not reach any NC");
        }
    }
    drop(nc_guard);

    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Terminate each named instance, returning one status per id (0 =
/// success). Known instances get their network reservation torn down first
/// and their cached host tried first; the sweep continues through the rest
/// of the fleet until one NC acknowledges, which covers both a stale
/// mapping and an instance the cache has never seen.
pub async fn terminate_instances(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    instance_ids: &[String],
) -> Result<Vec<i32>, CcError> {
    state.ensure_initialized().await?;
    let budget = OpBudget::standard();
    let nc_guard = state.nc_call.lock().await;
    let mut statuses = Vec::with_capacity(instance_ids.len());

    for instance_id in instance_ids {
        let cached = {
            let instances = state.instances.lock_after(&nc_guard).await?;
            instances.find_by_id(instance_id)
        };

        if let Some(rec) = &cached
            && !rec.net.private_mac.is_empty()
        {
            let mut vnet = state.vnet.lock_after(&nc_guard).await?;
            undo_reservation(state, &mut vnet, &rec.net.private_mac, rec.net.vlan).await;
        }

        let snapshot = {
            let resources = state.resources.lock_after(&nc_guard).await?;
            resources.snapshot()
        };
        let all = FanoutTarget::from_snapshot(&snapshot);

        // Cached host first, then everyone else; only nodes believed UP are
        // worth a call.
        let ordered: Vec<FanoutTarget> = match cached.as_ref().map(|r| r.nc_host_idx) {
            Some(idx) if idx < all.len() => {
                let mut v = vec![all[idx].clone()];
                v.extend(all.iter().filter(|t| t.idx != idx).cloned());
                v
            }
            _ => all,
        };
        let targets: Vec<FanoutTarget> = ordered
            .into_iter()
            .filter(|t| t.state == NodeState::Up)
            .collect();

        let nc = state.caps.nc.clone();
        let result = fanout::first_success(&targets, &budget, "terminate-instance", |t| {
            let nc = nc.clone();
            let url = t.url.clone();
            let m = meta.clone();
            let id = instance_id.clone();
            Box::pin(async move { nc.terminate_instance(&url, &m, &id).await })
        })
        .await;
        statuses.push(match result {
            Ok(_) => 0,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Terminate did not reach any NC");
                1
            }
        });
    }
    drop(nc_guard);

    checkpoint::verb_complete(state).await;
    Ok(statuses)
}

/// Fetch the serial console of one instance, stopping at the first NC that
/// returns a payload.
pub async fn get_console_output(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    instance_id: &str,
) -> Result<String, CcError> {
    if instance_id.is_empty() {
        return Err(CcError::bad_input("instanceId is empty"));
    }
    state.ensure_initialized().await?;
    let budget = OpBudget::standard();
    let nc_guard = state.nc_call.lock().await;

    let (_, targets) = targets_for(state, &nc_guard, instance_id).await?;
    let nc = state.caps.nc.clone();
    let result = fanout::first_success(&targets, &budget, "get-console-output", |t| {
        let nc = nc.clone();
        let url = t.url.clone();
        let m = meta.clone();
        let id = instance_id.to_string();
        Box::pin(async move { nc.get_console_output(&url, &m, &id).await })
    })
    .await;
    drop(nc_guard);

    checkpoint::verb_complete(state).await;
    result.map(|(_, payload)| payload)
}

/// Attach a block volume to an instance; hit-once across the candidate NCs.
pub async fn attach_volume(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    volume_id: &str,
    instance_id: &str,
    remote_dev: &str,
    local_dev: &str,
) -> Result<(), CcError> {
    if volume_id.is_empty() || instance_id.is_empty() || remote_dev.is_empty() || local_dev.is_empty()
    {
        return Err(CcError::bad_input("attach-volume requires volume, instance, and devices"));
    }
    state.ensure_initialized().await?;
    let budget = OpBudget::standard();
    let nc_guard = state.nc_call.lock().await;

    let (_, targets) = targets_for(state, &nc_guard, instance_id).await?;
    let nc = state.caps.nc.clone();
    let result = fanout::first_success(&targets, &budget, "attach-volume", |t| {
        let nc = nc.clone();
        let url = t.url.clone();
        let m = meta.clone();
        let (id, vol, rdev, ldev) = (
            instance_id.to_string(),
            volume_id.to_string(),
            remote_dev.to_string(),
            local_dev.to_string(),
        );
        Box::pin(async move { nc.attach_volume(&url, &m, &id, &vol, &rdev, &ldev).await })
    })
    .await;
    drop(nc_guard);

    checkpoint::verb_complete(state).await;
    result.map(|_| ())
}

/// Detach a block volume; hit-once across the candidate NCs.
#[allow(clippy::too_many_arguments)]
pub async fn detach_volume(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    volume_id: &str,
    instance_id: &str,
    remote_dev: &str,
    local_dev: &str,
    force: bool,
) -> Result<(), CcError> {
    if volume_id.is_empty() || instance_id.is_empty() || remote_dev.is_empty() || local_dev.is_empty()
    {
        return Err(CcError::bad_input("detach-volume requires volume, instance, and devices"));
    }
    state.ensure_initialized().await?;
    let budget = OpBudget::standard();
    let nc_guard = state.nc_call.lock().await;

    let (_, targets) = targets_for(state, &nc_guard, instance_id).await?;
    let nc = state.caps.nc.clone();
    let result = fanout::first_success(&targets, &budget, "detach-volume", |t| {
        let nc = nc.clone();
        let url = t.url.clone();
        let m = meta.clone();
        let (id, vol, rdev, ldev) = (
            instance_id.to_string(),
            volume_id.to_string(),
            remote_dev.to_string(),
            local_dev.to_string(),
        );
        Box::pin(async move {
            nc.detach_volume(&url, &m, &id, &vol, &rdev, &ldev, force).await
        })
    })
    .await;
    drop(nc_guard);

    checkpoint::verb_complete(state).await;
    result.map(|_| ())
}

/// How many of each requested VM shape the fleet could run, against current
/// availability and against maximum capacity, plus each node's service tag.
pub async fn describe_resources(
    state: &Arc<ClusterState>,
    _meta: &RequestMeta,
    shapes: &[VmSpec],
) -> Result<ResourceSummary, CcError> {
    state.ensure_initialized().await?;
    for shape in shapes {
        if !shape.is_valid() {
            return Err(CcError::bad_input(format!(
                "vm type '{}' has a non-positive axis",
                shape.name
            )));
        }
    }

    let summary = {
        let resources = state.resources.lock().await;
        let mut summary = ResourceSummary {
            types_max: vec![0; shapes.len()],
            types_avail: vec![0; shapes.len()],
            service_tags: resources.iter().map(|n| n.nc_url.clone()).collect(),
        };
        for node in resources.iter() {
            for (j, shape) in shapes.iter().enumerate() {
                summary.types_avail[j] += fit_count(
                    node.avail_memory_mb,
                    node.avail_disk_gb,
                    node.avail_cores,
                    shape,
                );
                summary.types_max[j] +=
                    fit_count(node.max_memory_mb, node.max_disk_gb, node.max_cores, shape);
            }
        }
        summary
    };

    checkpoint::verb_complete(state).await;
    Ok(summary)
}

/// How many copies of `shape` fit in the given pools.
fn fit_count(mem_mb: u32, disk_gb: u32, cores: u32, shape: &VmSpec) -> u32 {
    (mem_mb / shape.mem_mb)
        .min(disk_gb / shape.disk_gb)
        .min(cores / shape.cores)
}
