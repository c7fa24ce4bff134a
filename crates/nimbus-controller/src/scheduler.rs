use nimbus_core::CcError;
use nimbus_core::instance::VmSpec;
use nimbus_core::node::NodeState;
use tracing::debug;

use crate::config::SchedPolicy;
use crate::resource_cache::ResourceCache;

/// Outcome of a placement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Slot index of the chosen node.
    pub res_idx: usize,
    /// The chosen node is asleep and must be woken before it can run the VM.
    pub needs_wake: bool,
}

/// Pick a node for one VM.
///
/// A caller-supplied `target_node` forces EXPLICIT placement regardless of
/// policy. Ties break first-fit by slot order, which keeps decisions stable
/// and deterministic. Callers hold the Config and ResCache locks; the
/// round-robin cursor lives in the config region and is advanced here.
pub fn schedule(
    policy: SchedPolicy,
    cache: &ResourceCache,
    cursor: &mut usize,
    vm: &VmSpec,
    target_node: Option<&str>,
) -> Result<Placement, CcError> {
    if !vm.is_valid() {
        return Err(CcError::bad_input("vm shape has a non-positive axis"));
    }
    if cache.is_empty() {
        return Err(no_fit(vm));
    }

    if let Some(target) = target_node {
        return schedule_explicit(cache, vm, target);
    }
    match policy {
        SchedPolicy::RoundRobin => schedule_roundrobin(cache, cursor, vm),
        // POWERSAVE places exactly like GREEDY; the sleeping-node fallback
        // below is what wakes idle capacity back up.
        SchedPolicy::Greedy | SchedPolicy::PowerSave => schedule_greedy(cache, vm),
    }
}

fn no_fit(vm: &VmSpec) -> CcError {
    CcError::CapacityExhausted {
        mem_mb: vm.mem_mb,
        disk_gb: vm.disk_gb,
        cores: vm.cores,
    }
}

/// First UP/WAKING node with sufficient availability; failing that, the
/// first ASLEEP node whose maximum capacity would fit (the caller wakes it).
fn schedule_greedy(cache: &ResourceCache, vm: &VmSpec) -> Result<Placement, CcError> {
    let mut sleeper = None;
    for (idx, node) in cache.iter().enumerate() {
        match node.state {
            NodeState::Up | NodeState::Waking => {
                if node.fits(vm.mem_mb, vm.disk_gb, vm.cores) {
                    debug!(node = %node.hostname, idx, "Greedy placement");
                    return Ok(Placement {
                        res_idx: idx,
                        needs_wake: false,
                    });
                }
            }
            NodeState::Asleep => {
                if sleeper.is_none() && node.fits_max(vm.mem_mb, vm.disk_gb, vm.cores) {
                    sleeper = Some(idx);
                }
            }
            NodeState::Down => {}
        }
    }
    if let Some(idx) = sleeper {
        debug!(idx, "Greedy placement on sleeping node, wake required");
        return Ok(Placement {
            res_idx: idx,
            needs_wake: true,
        });
    }
    Err(no_fit(vm))
}

/// Circular scan from the cursor; first UP/WAKING fit wins and the cursor
/// moves to the slot after the winner. Sleeping nodes are not considered.
fn schedule_roundrobin(
    cache: &ResourceCache,
    cursor: &mut usize,
    vm: &VmSpec,
) -> Result<Placement, CcError> {
    let n = cache.len();
    let start = *cursor % n;
    debug!(start, "Round-robin scan");

    for offset in 0..n {
        let idx = (start + offset) % n;
        let node = cache.get(idx).expect("index within len");
        if matches!(node.state, NodeState::Up | NodeState::Waking)
            && node.fits(vm.mem_mb, vm.disk_gb, vm.cores)
        {
            *cursor = (idx + 1) % n;
            debug!(node = %node.hostname, idx, cursor = *cursor, "Round-robin placement");
            return Ok(Placement {
                res_idx: idx,
                needs_wake: false,
            });
        }
    }
    Err(no_fit(vm))
}

/// Place on the named node only: prefer it UP with availability, fall back
/// to waking it if ASLEEP with sufficient maximum capacity, otherwise fail.
fn schedule_explicit(
    cache: &ResourceCache,
    vm: &VmSpec,
    target_node: &str,
) -> Result<Placement, CcError> {
    let Some((idx, node)) = cache.find_by_host(target_node) else {
        return Err(CcError::not_found(format!(
            "target node '{}' is not in the fleet",
            target_node
        )));
    };

    match node.state {
        NodeState::Up if node.fits(vm.mem_mb, vm.disk_gb, vm.cores) => Ok(Placement {
            res_idx: idx,
            needs_wake: false,
        }),
        NodeState::Asleep if node.fits_max(vm.mem_mb, vm.disk_gb, vm.cores) => Ok(Placement {
            res_idx: idx,
            needs_wake: true,
        }),
        _ => Err(no_fit(vm)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::up_node;
    use nimbus_core::node::NodeRecord;

    fn vm() -> VmSpec {
        VmSpec::new(1024, 10, 1)
    }

    fn fleet(states: &[NodeState]) -> ResourceCache {
        let nodes: Vec<NodeRecord> = states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut n = up_node(&format!("nc{}", i));
                n.state = *s;
                n
            })
            .collect();
        ResourceCache::new(nodes)
    }

    #[test]
    fn test_greedy_first_fit() {
        let cache = fleet(&[NodeState::Up, NodeState::Up]);
        let mut cursor = 0;
        let p = schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 0);
        assert!(!p.needs_wake);
    }

    #[test]
    fn test_greedy_skips_down_and_overloaded() {
        let mut cache = fleet(&[NodeState::Down, NodeState::Up, NodeState::Up]);
        cache.get_mut(1).unwrap().avail_memory_mb = 512;
        let mut cursor = 0;
        let p = schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 2);
    }

    #[test]
    fn test_greedy_waking_node_is_schedulable() {
        let cache = fleet(&[NodeState::Waking]);
        let mut cursor = 0;
        let p = schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 0);
        assert!(!p.needs_wake);
    }

    #[test]
    fn test_greedy_falls_back_to_sleeper() {
        let mut cache = fleet(&[NodeState::Down, NodeState::Asleep]);
        // Sleeping node is judged on max capacity, not availability
        cache.get_mut(1).unwrap().avail_memory_mb = 0;
        let mut cursor = 0;
        let p = schedule(SchedPolicy::PowerSave, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 1);
        assert!(p.needs_wake);
    }

    #[test]
    fn test_greedy_prefers_up_over_sleeper() {
        let cache = fleet(&[NodeState::Asleep, NodeState::Up]);
        let mut cursor = 0;
        let p = schedule(SchedPolicy::PowerSave, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 1);
        assert!(!p.needs_wake);
    }

    #[test]
    fn test_no_capacity_is_error() {
        let mut cache = fleet(&[NodeState::Up]);
        cache.get_mut(0).unwrap().avail_cores = 0;
        let mut cursor = 0;
        let err = schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), None).unwrap_err();
        assert!(matches!(err, CcError::CapacityExhausted { .. }));
    }

    #[test]
    fn test_roundrobin_cycles_and_advances_cursor() {
        let cache = fleet(&[NodeState::Up, NodeState::Up, NodeState::Up]);
        let mut cursor = 0;
        let mut picks = Vec::new();
        for _ in 0..5 {
            let p = schedule(SchedPolicy::RoundRobin, &cache, &mut cursor, &vm(), None).unwrap();
            picks.push(p.res_idx);
        }
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
        assert_eq!(cursor, 2);
    }

    #[test]
    fn test_roundrobin_ignores_sleepers() {
        let cache = fleet(&[NodeState::Asleep, NodeState::Up]);
        let mut cursor = 0;
        let p = schedule(SchedPolicy::RoundRobin, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 1);

        let all_asleep = fleet(&[NodeState::Asleep, NodeState::Asleep]);
        let mut cursor = 0;
        assert!(schedule(SchedPolicy::RoundRobin, &all_asleep, &mut cursor, &vm(), None).is_err());
    }

    #[test]
    fn test_roundrobin_wraps_past_unfit_slots() {
        let mut cache = fleet(&[NodeState::Up, NodeState::Up, NodeState::Up]);
        cache.get_mut(1).unwrap().avail_disk_gb = 0;
        let mut cursor = 1;
        let p = schedule(SchedPolicy::RoundRobin, &cache, &mut cursor, &vm(), None).unwrap();
        assert_eq!(p.res_idx, 2);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_explicit_prefers_up_target() {
        let cache = fleet(&[NodeState::Up, NodeState::Up]);
        let mut cursor = 0;
        let p = schedule(
            SchedPolicy::Greedy,
            &cache,
            &mut cursor,
            &vm(),
            Some("nc1"),
        )
        .unwrap();
        assert_eq!(p.res_idx, 1);
        assert!(!p.needs_wake);
    }

    #[test]
    fn test_explicit_wakes_sleeping_target() {
        let cache = fleet(&[NodeState::Asleep]);
        let mut cursor = 0;
        let p = schedule(
            SchedPolicy::Greedy,
            &cache,
            &mut cursor,
            &vm(),
            Some("nc0"),
        )
        .unwrap();
        assert!(p.needs_wake);
    }

    #[test]
    fn test_explicit_down_or_absent_fails() {
        let cache = fleet(&[NodeState::Down]);
        let mut cursor = 0;
        assert!(matches!(
            schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), Some("nc0")),
            Err(CcError::CapacityExhausted { .. })
        ));
        assert!(matches!(
            schedule(SchedPolicy::Greedy, &cache, &mut cursor, &vm(), Some("nc9")),
            Err(CcError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_shape_rejected_before_scan() {
        let cache = fleet(&[NodeState::Up]);
        let mut cursor = 0;
        let err = schedule(
            SchedPolicy::Greedy,
            &cache,
            &mut cursor,
            &VmSpec::new(0, 10, 1),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CcError::BadInput(_)));
    }
}
