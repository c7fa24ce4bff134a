use nimbus_core::CcError;
use nimbus_core::host::HostTools;
use nimbus_core::meta::RequestMeta;
use nimbus_core::nc::NcClient;
use nimbus_core::node::{NodeRecord, NodeState};
use nimbus_core::vnet::broadcast_addr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::config::SchedPolicy;
use crate::sandbox;

/// Fallback broadcast when the private netmask is unknown.
const GLOBAL_BROADCAST: &str = "255.255.255.255";

/// Wake a sleeping or unresponsive node with a Wake-on-LAN packet and mark
/// it WAKING. A no-op unless the power-save policy is active. Prefers the
/// discovered MAC; falls back to the node IP when no MAC is known yet.
pub fn wake_node(
    node: &mut NodeRecord,
    policy: SchedPolicy,
    netmask: Option<&str>,
    tools: &dyn HostTools,
) -> Result<(), CcError> {
    if policy != SchedPolicy::PowerSave {
        return Ok(());
    }

    let broadcast = netmask
        .filter(|nm| !nm.is_empty())
        .and_then(|nm| broadcast_addr(&node.ip, nm).ok())
        .unwrap_or_else(|| GLOBAL_BROADCAST.to_string());

    let target = if !node.mac.is_empty() {
        node.mac.clone()
    } else if node.ip != "0.0.0.0" && !node.ip.is_empty() {
        node.ip.clone()
    } else {
        return Err(CcError::bad_input(format!(
            "node {} has neither MAC nor IP to wake",
            node.hostname
        )));
    };

    info!(node = %node.hostname, broadcast = %broadcast, target = %target, "Waking powered-off node");
    tools
        .wake_on_lan(&broadcast, &target)
        .map_err(CcError::Other)?;
    node.change_state(NodeState::Waking);
    Ok(())
}

/// Ask an idle node to power itself down. The NC call runs in the sandbox
/// with the given deadline; on success the caller's record transitions to
/// ASLEEP. Outside POWERSAVE the idle timer is reset and nothing is sent.
pub async fn power_down(
    node: &mut NodeRecord,
    policy: SchedPolicy,
    nc: Arc<dyn NcClient>,
    meta: &RequestMeta,
    deadline: Duration,
) -> Result<(), CcError> {
    if policy != SchedPolicy::PowerSave {
        node.idle_start_ts = 0;
        return Ok(());
    }

    info!(node = %node.hostname, url = %node.nc_url, "Sending power-down to idle node");
    let url = node.nc_url.clone();
    let meta = meta.clone();
    let result = sandbox::isolated_call(
        deadline,
        "power-down",
        Box::pin(async move { nc.power_down(&url, &meta).await }),
    )
    .await;

    match result {
        Ok(()) => {
            node.change_state(NodeState::Asleep);
            Ok(())
        }
        Err(e) => {
            warn!(node = %node.hostname, error = %e, "Power-down failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockNc, MockTools, up_node};

    #[test]
    fn test_wake_is_noop_outside_powersave() {
        let tools = MockTools::default();
        let mut node = up_node("nc1");
        node.state = NodeState::Asleep;
        wake_node(&mut node, SchedPolicy::Greedy, None, &tools).unwrap();
        assert_eq!(node.state, NodeState::Asleep);
        assert!(tools.wol_calls().is_empty());
    }

    #[test]
    fn test_wake_uses_mac_and_computed_broadcast() {
        let tools = MockTools::default();
        let mut node = up_node("nc1");
        node.state = NodeState::Asleep;
        node.ip = "10.1.2.3".to_string();
        node.mac = "d0:0d:00:0a:00:02".to_string();

        wake_node(&mut node, SchedPolicy::PowerSave, Some("255.255.0.0"), &tools).unwrap();
        assert_eq!(node.state, NodeState::Waking);
        assert_eq!(
            tools.wol_calls(),
            vec![("10.1.255.255".to_string(), "d0:0d:00:0a:00:02".to_string())]
        );
    }

    #[test]
    fn test_wake_falls_back_to_ip_target() {
        let tools = MockTools::default();
        let mut node = up_node("nc1");
        node.state = NodeState::Asleep;
        node.ip = "10.1.2.3".to_string();
        node.mac = String::new();

        wake_node(&mut node, SchedPolicy::PowerSave, None, &tools).unwrap();
        let calls = tools.wol_calls();
        assert_eq!(calls[0].0, GLOBAL_BROADCAST);
        assert_eq!(calls[0].1, "10.1.2.3");
    }

    #[test]
    fn test_wake_without_mac_or_ip_is_error() {
        let tools = MockTools::default();
        let mut node = up_node("nc1");
        node.state = NodeState::Asleep;
        node.ip = "0.0.0.0".to_string();
        let err = wake_node(&mut node, SchedPolicy::PowerSave, None, &tools).unwrap_err();
        assert!(matches!(err, CcError::BadInput(_)));
        assert_eq!(node.state, NodeState::Asleep);
    }

    #[tokio::test]
    async fn test_power_down_transitions_to_asleep() {
        let nc = Arc::new(MockNc::default());
        let mut node = up_node("nc1");
        let meta = RequestMeta::monitor();

        power_down(
            &mut node,
            SchedPolicy::PowerSave,
            nc.clone(),
            &meta,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(node.state, NodeState::Asleep);
        assert_eq!(node.idle_start_ts, 0);
        assert_eq!(nc.calls_for("power_down").len(), 1);
    }

    #[tokio::test]
    async fn test_power_down_noop_outside_powersave() {
        let nc = Arc::new(MockNc::default());
        let mut node = up_node("nc1");
        node.idle_start_ts = 123;
        let meta = RequestMeta::monitor();

        power_down(
            &mut node,
            SchedPolicy::Greedy,
            nc.clone(),
            &meta,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(node.state, NodeState::Up);
        assert_eq!(node.idle_start_ts, 0);
        assert!(nc.calls_for("power_down").is_empty());
    }

    #[tokio::test]
    async fn test_power_down_failure_keeps_state() {
        let nc = Arc::new(MockNc::default());
        let mut node = up_node("nc1");
        nc.fail_url(&node.nc_url);
        let meta = RequestMeta::monitor();

        let result = power_down(
            &mut node,
            SchedPolicy::PowerSave,
            nc,
            &meta,
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(node.state, NodeState::Up);
    }
}
