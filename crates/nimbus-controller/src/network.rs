use std::sync::Arc;

use nimbus_core::CcError;
use nimbus_core::instance::UNSET_IP;
use nimbus_core::meta::RequestMeta;
use nimbus_core::vnet::{FilterRule, PublicIpEntry, VnetState};
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::locks::OrderedGuard;
use crate::state::ClusterState;

/// Parameters of a ConfigureNetwork verb: one ingress rule template applied
/// per named source and per source net.
#[derive(Debug, Clone)]
pub struct ConfigureNetworkRequest {
    pub rule_type: String,
    pub source_names: Vec<String>,
    pub user_names: Vec<String>,
    pub source_nets: Vec<String>,
    pub dest_name: String,
    pub dest_user_name: Option<String>,
    pub protocol: String,
    pub min_port: i32,
    pub max_port: i32,
}

fn require_ip(value: &str, what: &str) -> Result<(), CcError> {
    if value.is_empty() || value == UNSET_IP {
        return Err(CcError::bad_input(format!("{} is empty or unset", what)));
    }
    Ok(())
}

/// Map an elastic IP onto an instance's private address.
///
/// In MANAGED modes this plumbs the address onto the public interface and
/// records the mapping in the vnet region; in SYSTEM/STATIC modes only the
/// instance cache is updated. Either way, every cached record whose private
/// IP matches picks up the public address.
pub async fn assign_address(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    src_public_ip: &str,
    dst_private_ip: &str,
) -> Result<(), CcError> {
    require_ip(src_public_ip, "source public IP")?;
    require_ip(dst_private_ip, "destination private IP")?;
    state.ensure_initialized().await?;
    debug!(user = %meta.user_id, src = %src_public_ip, dst = %dst_private_ip, "Assigning address");

    {
        let mut vnet = state.vnet.lock().await;
        if vnet.mode.is_managed() {
            let entry = state
                .caps
                .vnet
                .get_public_ip(&vnet, src_public_ip)
                .map_err(|_| CcError::not_found(format!("public IP {}", src_public_ip)))?;
            if entry.allocated {
                warn!(ip = %src_public_ip, "Address already assigned, ignoring");
            } else {
                state
                    .caps
                    .tools
                    .ip_addr_add(src_public_ip, &vnet.public_interface)
                    .map_err(CcError::Other)?;
                state
                    .caps
                    .vnet
                    .assign_address(&mut vnet, src_public_ip, dst_private_ip)
                    .await?;
                state
                    .caps
                    .vnet
                    .allocate_public_ip(&mut vnet, src_public_ip, dst_private_ip)
                    .await?;
            }
        }
    }

    let dst = dst_private_ip.to_string();
    let src = src_public_ip.to_string();
    let touched = {
        let mut instances = state.instances.lock().await;
        instances.map(
            |rec| rec.net.private_ip == dst,
            |rec| rec.net.public_ip = src.clone(),
        )
    };
    info!(src = %src_public_ip, dst = %dst_private_ip, touched, "Elastic IP assigned");

    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Undo an elastic-IP mapping and clear it from every matching cache record.
pub async fn unassign_address(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    src_public_ip: &str,
    dst_private_ip: &str,
) -> Result<(), CcError> {
    require_ip(src_public_ip, "source public IP")?;
    require_ip(dst_private_ip, "destination private IP")?;
    state.ensure_initialized().await?;
    debug!(user = %meta.user_id, src = %src_public_ip, dst = %dst_private_ip, "Unassigning address");

    {
        let mut vnet = state.vnet.lock().await;
        if vnet.mode.is_managed() {
            let entry = state
                .caps
                .vnet
                .get_public_ip(&vnet, src_public_ip)
                .map_err(|_| CcError::not_found(format!("public IP {}", src_public_ip)))?;
            if entry.allocated {
                if let Err(e) = state
                    .caps
                    .vnet
                    .unassign_address(&mut vnet, src_public_ip, dst_private_ip)
                    .await
                {
                    warn!(error = %e, "Unassign bookkeeping failed");
                }
                if let Err(e) = state
                    .caps
                    .vnet
                    .deallocate_public_ip(&mut vnet, src_public_ip)
                    .await
                {
                    warn!(error = %e, "Deallocate bookkeeping failed");
                }
            }
            if let Err(e) = state
                .caps
                .tools
                .ip_addr_del(src_public_ip, &vnet.public_interface)
            {
                warn!(error = %e, "Removing public address from interface failed");
            }
        }
    }

    let src = src_public_ip.to_string();
    {
        let mut instances = state.instances.lock().await;
        instances.map(
            |rec| rec.net.public_ip == src,
            |rec| rec.net.public_ip = UNSET_IP.to_string(),
        );
    }

    checkpoint::verb_complete(state).await;
    Ok(())
}

/// The elastic-IP pool; non-empty only in MANAGED modes.
pub async fn describe_public_addresses(
    state: &Arc<ClusterState>,
    _meta: &RequestMeta,
) -> Result<Vec<PublicIpEntry>, CcError> {
    state.ensure_initialized().await?;
    let addresses = {
        let vnet = state.vnet.lock().await;
        if vnet.mode.is_managed() {
            vnet.public_ips.clone()
        } else {
            Vec::new()
        }
    };
    checkpoint::verb_complete(state).await;
    Ok(addresses)
}

/// Install ingress rules for a destination group: one per named source
/// pair, one per source net. SYSTEM/STATIC modes delegate filtering to the
/// underlying network and accept silently.
pub async fn configure_network(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    req: &ConfigureNetworkRequest,
) -> Result<(), CcError> {
    state.ensure_initialized().await?;
    debug!(
        user = %meta.user_id,
        dest = %req.dest_name,
        named = req.source_names.len(),
        nets = req.source_nets.len(),
        "Configuring network rules"
    );

    {
        let vnet_probe = state.vnet.lock().await;
        if !vnet_probe.mode.is_managed() {
            return Ok(());
        }
    }

    let dest_user = req
        .dest_user_name
        .clone()
        .unwrap_or_else(|| meta.user_id.clone());

    let mut failed = false;
    let mut vnet = state.vnet.lock().await;
    for (i, source_name) in req.source_names.iter().enumerate() {
        let rule = FilterRule {
            rule_type: req.rule_type.clone(),
            dest_user: dest_user.clone(),
            dest_name: req.dest_name.clone(),
            source_name: Some(source_name.clone()),
            source_user: req.user_names.get(i).cloned(),
            source_net: None,
            protocol: req.protocol.clone(),
            min_port: req.min_port,
            max_port: req.max_port,
        };
        if let Err(e) = state.caps.vnet.table_rule(&mut vnet, rule).await {
            warn!(error = %e, source = %source_name, "Table rule failed");
            failed = true;
        }
    }
    for source_net in &req.source_nets {
        let rule = FilterRule {
            rule_type: req.rule_type.clone(),
            dest_user: dest_user.clone(),
            dest_name: req.dest_name.clone(),
            source_name: None,
            source_user: None,
            source_net: Some(source_net.clone()),
            protocol: req.protocol.clone(),
            min_port: req.min_port,
            max_port: req.max_port,
        };
        if let Err(e) = state.caps.vnet.table_rule(&mut vnet, rule).await {
            warn!(error = %e, net = %source_net, "Table rule failed");
            failed = true;
        }
    }
    drop(vnet);

    if failed {
        return Err(CcError::Other(anyhow::anyhow!(
            "one or more network rules failed to apply"
        )));
    }
    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Remove every rule for the caller's destination group.
pub async fn flush_network(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    dest_name: &str,
) -> Result<(), CcError> {
    state.ensure_initialized().await?;
    {
        let mut vnet = state.vnet.lock().await;
        if !vnet.mode.is_managed() {
            return Ok(());
        }
        state
            .caps
            .vnet
            .flush_table(&mut vnet, &meta.user_id, dest_name)
            .await?;
    }
    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Bring up a tenant network on its VLAN; refreshes the peer-CC set and
/// tunnels first.
pub async fn start_network(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    net_name: &str,
    vlan: i32,
    nameserver: Option<&str>,
    peer_ccs: &[String],
) -> Result<(), CcError> {
    if net_name.is_empty() || vlan < 0 {
        return Err(CcError::bad_input("net name or vlan"));
    }
    state.ensure_initialized().await?;
    info!(user = %meta.user_id, net = %net_name, vlan, "Starting tenant network");

    {
        let mut vnet = state.vnet.lock().await;
        if !vnet.mode.is_managed() {
            return Ok(());
        }
        if let Some(ns) = nameserver {
            vnet.nameserver = ns.to_string();
        }
        vnet.peer_ccs = peer_ccs.to_vec();
        state.caps.vnet.setup_tunnels(&mut vnet).await?;
        state
            .caps
            .vnet
            .start_network(&mut vnet, vlan, &meta.user_id, net_name)
            .await?;
    }

    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Tear down a tenant network.
pub async fn stop_network(
    state: &Arc<ClusterState>,
    meta: &RequestMeta,
    net_name: &str,
    vlan: i32,
) -> Result<(), CcError> {
    if net_name.is_empty() || vlan < 0 {
        return Err(CcError::bad_input("net name or vlan"));
    }
    state.ensure_initialized().await?;
    info!(user = %meta.user_id, net = %net_name, vlan, "Stopping tenant network");

    {
        let mut vnet = state.vnet.lock().await;
        if !vnet.mode.is_managed() {
            return Ok(());
        }
        state
            .caps
            .vnet
            .stop_network(&mut vnet, vlan, &meta.user_id, net_name)
            .await?;
    }
    checkpoint::verb_complete(state).await;
    Ok(())
}

/// Return a copy of the vnet region, after refreshing the nameserver and
/// (in MANAGED modes) the peer-CC tunnel set.
pub async fn describe_networks(
    state: &Arc<ClusterState>,
    _meta: &RequestMeta,
    nameserver: Option<&str>,
    peer_ccs: &[String],
) -> Result<VnetState, CcError> {
    state.ensure_initialized().await?;
    let mut vnet = state.vnet.lock().await;
    if let Some(ns) = nameserver {
        vnet.nameserver = ns.to_string();
    }
    if vnet.mode.is_managed() {
        vnet.peer_ccs = peer_ccs.to_vec();
        state.caps.vnet.setup_tunnels(&mut vnet).await?;
    }
    let copy = vnet.clone();
    drop(vnet);

    checkpoint::verb_complete(state).await;
    Ok(copy)
}

/// Re-assert cross-cluster tunnels; runs at every verb completion.
pub async fn maintain_network_state(state: &Arc<ClusterState>) -> Result<(), CcError> {
    let tunneling_disabled = { state.config.lock().await.disable_tunneling };
    let mut vnet = state.vnet.lock().await;
    if vnet.mode.is_managed() && !tunneling_disabled {
        state.caps.vnet.setup_tunnels(&mut vnet).await?;
    }
    Ok(())
}

/// Startup-time restore: re-plumb the metadata address and every allocated
/// elastic IP, then kick DHCP so leases match the rehydrated reservations.
pub async fn restore_network_state(
    state: &ClusterState,
    init_guard: &OrderedGuard<'_, bool>,
) -> Result<(), CcError> {
    let vnet = state.vnet.lock_after(init_guard).await?;
    if !vnet.mode.is_managed() {
        return Ok(());
    }
    debug!("Restoring network state");

    if let Err(e) = state
        .caps
        .tools
        .ip_addr_add("169.254.169.254", &vnet.private_interface)
    {
        warn!(error = %e, "Cannot re-add metadata address");
    }
    for entry in vnet.public_ips.iter().filter(|e| e.allocated) {
        if let Err(e) = state.caps.tools.ip_addr_add(&entry.ip, &vnet.public_interface) {
            warn!(ip = %entry.ip, error = %e, "Cannot re-add public address");
        }
    }

    let active = vnet.networks.iter().filter(|n| n.active).count();
    if active > 0 {
        debug!(active, "Tenant networks still active from checkpoint");
    }
    if let Err(e) = state.caps.vnet.kick_dhcp(&vnet).await {
        warn!(error = %e, "Cannot kick DHCP daemon");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MANAGED_CONFIG, harness, pending_record, up_node};

    const SYSTEM_CONFIG: &str = r#"
nodes = ["nc0"]

[vnet]
mode = "SYSTEM"
"#;

    fn meta() -> RequestMeta {
        RequestMeta::new("acme")
    }

    #[tokio::test]
    async fn test_assign_address_managed_flow() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        {
            let mut instances = h.state.instances.lock().await;
            let mut rec = pending_record("i-1", 0);
            rec.net.private_ip = "10.128.1.66".to_string();
            instances.add(rec);
        }

        assign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66")
            .await
            .unwrap();

        // Host command ran against the public interface
        let cmds = h.tools.ip_cmds();
        assert!(cmds.iter().any(|c| c.starts_with("add 203.0.113.7")));

        // vnet bookkeeping recorded the allocation
        let vnet = h.state.vnet.lock().await;
        let entry = vnet
            .public_ips
            .iter()
            .find(|e| e.ip == "203.0.113.7")
            .unwrap();
        assert!(entry.allocated);
        assert_eq!(entry.dst_ip, "10.128.1.66");
        drop(vnet);

        // cache record picked up the elastic IP
        let instances = h.state.instances.lock().await;
        assert_eq!(
            instances.find_by_id("i-1").unwrap().net.public_ip,
            "203.0.113.7"
        );
    }

    #[tokio::test]
    async fn test_assign_address_already_allocated_is_ok() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        assign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66")
            .await
            .unwrap();
        let cmds_before = h.tools.ip_cmds().len();

        // Second assign succeeds without re-plumbing the interface
        assign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66")
            .await
            .unwrap();
        assert_eq!(h.tools.ip_cmds().len(), cmds_before);
    }

    #[tokio::test]
    async fn test_assign_address_unknown_ip_fails() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        let err = assign_address(&h.state, &meta(), "198.51.100.1", "10.128.1.66")
            .await
            .unwrap_err();
        assert!(matches!(err, CcError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_assign_address_host_command_failure_propagates() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        h.tools.fail_ip_cmds();
        let result = assign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66").await;
        assert!(result.is_err());

        // Nothing was allocated
        let vnet = h.state.vnet.lock().await;
        assert!(!vnet.public_ips[0].allocated);
    }

    #[tokio::test]
    async fn test_assign_address_bad_input() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        assert!(matches!(
            assign_address(&h.state, &meta(), "0.0.0.0", "10.0.0.5").await,
            Err(CcError::BadInput(_))
        ));
        assert!(matches!(
            assign_address(&h.state, &meta(), "203.0.113.7", "").await,
            Err(CcError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_address_system_mode_only_maps_cache() {
        let h = harness(SYSTEM_CONFIG, vec![up_node("nc0")]).await;
        {
            let mut instances = h.state.instances.lock().await;
            let mut rec = pending_record("i-1", 0);
            rec.net.private_ip = "10.0.0.5".to_string();
            instances.add(rec);
        }

        assign_address(&h.state, &meta(), "203.0.113.7", "10.0.0.5")
            .await
            .unwrap();

        assert!(h.tools.ip_cmds().is_empty());
        let instances = h.state.instances.lock().await;
        assert_eq!(
            instances.find_by_id("i-1").unwrap().net.public_ip,
            "203.0.113.7"
        );
    }

    #[tokio::test]
    async fn test_unassign_address_reverses_assign() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        {
            let mut instances = h.state.instances.lock().await;
            let mut rec = pending_record("i-1", 0);
            rec.net.private_ip = "10.128.1.66".to_string();
            instances.add(rec);
        }
        assign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66")
            .await
            .unwrap();

        unassign_address(&h.state, &meta(), "203.0.113.7", "10.128.1.66")
            .await
            .unwrap();

        let vnet = h.state.vnet.lock().await;
        assert!(!vnet.public_ips[0].allocated);
        drop(vnet);
        let cmds = h.tools.ip_cmds();
        assert!(cmds.iter().any(|c| c.starts_with("del 203.0.113.7")));
        let instances = h.state.instances.lock().await;
        assert_eq!(instances.find_by_id("i-1").unwrap().net.public_ip, UNSET_IP);
    }

    #[tokio::test]
    async fn test_describe_public_addresses_by_mode() {
        let managed = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        let addrs = describe_public_addresses(&managed.state, &meta())
            .await
            .unwrap();
        assert_eq!(addrs.len(), 2);

        let system = harness(SYSTEM_CONFIG, vec![up_node("nc0")]).await;
        let addrs = describe_public_addresses(&system.state, &meta())
            .await
            .unwrap();
        assert!(addrs.is_empty());
    }

    #[tokio::test]
    async fn test_configure_network_builds_rules() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        let req = ConfigureNetworkRequest {
            rule_type: "firewall-open".to_string(),
            source_names: vec!["web".to_string(), "batch".to_string()],
            user_names: vec!["acme".to_string(), "acme".to_string()],
            source_nets: vec!["0.0.0.0/0".to_string()],
            dest_name: "default".to_string(),
            dest_user_name: None,
            protocol: "tcp".to_string(),
            min_port: 22,
            max_port: 22,
        };
        configure_network(&h.state, &meta(), &req).await.unwrap();

        let vnet = h.state.vnet.lock().await;
        assert_eq!(vnet.rules.len(), 3);
        // dest user defaulted to the caller
        assert!(vnet.rules.iter().all(|r| r.dest_user == "acme"));
    }

    #[tokio::test]
    async fn test_flush_network_clears_group_rules() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        let req = ConfigureNetworkRequest {
            rule_type: "firewall-open".to_string(),
            source_names: vec![],
            user_names: vec![],
            source_nets: vec!["0.0.0.0/0".to_string()],
            dest_name: "default".to_string(),
            dest_user_name: None,
            protocol: "tcp".to_string(),
            min_port: 80,
            max_port: 80,
        };
        configure_network(&h.state, &meta(), &req).await.unwrap();
        flush_network(&h.state, &meta(), "default").await.unwrap();
        let vnet = h.state.vnet.lock().await;
        assert!(vnet.rules.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_network() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        start_network(
            &h.state,
            &meta(),
            "default",
            10,
            Some("8.8.8.8"),
            &["cc-b".to_string()],
        )
        .await
        .unwrap();

        {
            let vnet = h.state.vnet.lock().await;
            assert!(vnet.networks.iter().any(|n| n.vlan == 10 && n.active));
            assert_eq!(vnet.nameserver, "8.8.8.8");
            assert!(vnet.tunnels_up);
        }

        stop_network(&h.state, &meta(), "default", 10).await.unwrap();
        let vnet = h.state.vnet.lock().await;
        assert!(vnet.networks.iter().any(|n| n.vlan == 10 && !n.active));
    }

    #[tokio::test]
    async fn test_describe_networks_returns_copy() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        let copy = describe_networks(&h.state, &meta(), Some("1.1.1.1"), &[])
            .await
            .unwrap();
        assert_eq!(copy.nameserver, "1.1.1.1");
        assert_eq!(copy.public_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_network_state_replumbs_allocated_ips() {
        let h = harness(MANAGED_CONFIG, vec![up_node("nc0")]).await;
        {
            let mut vnet = h.state.vnet.lock().await;
            vnet.public_ips[0].allocated = true;
            vnet.public_ips[0].dst_ip = "10.128.1.66".to_string();
        }

        // First verb triggers the one-time restore
        h.state.ensure_initialized().await.unwrap();

        let cmds = h.tools.ip_cmds();
        assert!(cmds.iter().any(|c| c.starts_with("add 169.254.169.254")));
        assert!(cmds.iter().any(|c| c.starts_with("add 203.0.113.7")));

        // Second call is a no-op
        let before = h.tools.ip_cmds().len();
        h.state.ensure_initialized().await.unwrap();
        assert_eq!(h.tools.ip_cmds().len(), before);
    }
}
