use nimbus_core::CcError;
use nimbus_core::node::{NodeRecord, NodeState};
use tracing::{debug, warn};

use crate::sandbox::{self, CallFuture, OpBudget};

/// One NC a fan-out will talk to, lifted out of a cache snapshot so no
/// cache lock is held while calls run.
#[derive(Debug, Clone)]
pub struct FanoutTarget {
    /// Slot index in the resource cache.
    pub idx: usize,
    pub hostname: String,
    pub url: String,
    pub state: NodeState,
}

impl FanoutTarget {
    pub fn from_snapshot(nodes: &[NodeRecord]) -> Vec<Self> {
        nodes
            .iter()
            .enumerate()
            .map(|(idx, n)| Self {
                idx,
                hostname: n.hostname.clone(),
                url: n.nc_url.clone(),
                state: n.state,
            })
            .collect()
    }
}

/// Candidate slot range for an instance-addressed verb: the cached host if
/// the instance is known, otherwise the whole fleet. The broadcast fallback
/// is what makes delivery work when the cache is cold or stale.
pub fn candidate_range(cached_host_idx: Option<usize>, fleet_size: usize) -> std::ops::Range<usize> {
    match cached_host_idx {
        Some(idx) if idx < fleet_size => idx..idx + 1,
        _ => 0..fleet_size,
    }
}

/// Dispatch to targets in order, stopping at the first success. Returns the
/// winning slot index and payload. Failures are absorbed and the next
/// target is tried; the last error is reported when nothing succeeds.
pub async fn first_success<T: Send + 'static>(
    targets: &[FanoutTarget],
    budget: &OpBudget,
    label: &str,
    make_call: impl Fn(&FanoutTarget) -> CallFuture<T>,
) -> Result<(usize, T), CcError> {
    if targets.is_empty() {
        return Err(CcError::not_found(format!("{}: no candidate NC", label)));
    }

    let mut last_err = None;
    for (pos, target) in targets.iter().enumerate() {
        let deadline = budget.per_node(targets.len() - pos);
        debug!(call = %label, node = %target.hostname, deadline_secs = deadline.as_secs(), "Dispatching");
        match sandbox::isolated_call(deadline, label, make_call(target)).await {
            Ok(value) => return Ok((target.idx, value)),
            Err(e) => {
                warn!(call = %label, node = %target.hostname, error = %e, "NC call failed, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::up_node;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn targets(n: usize) -> Vec<FanoutTarget> {
        let nodes: Vec<NodeRecord> = (0..n).map(|i| up_node(&format!("nc{}", i))).collect();
        FanoutTarget::from_snapshot(&nodes)
    }

    #[test]
    fn test_candidate_range_cached() {
        assert_eq!(candidate_range(Some(2), 5), 2..3);
    }

    #[test]
    fn test_candidate_range_broadcast() {
        assert_eq!(candidate_range(None, 5), 0..5);
        // A stale index past the fleet falls back to broadcast too
        assert_eq!(candidate_range(Some(9), 5), 0..5);
    }

    #[tokio::test]
    async fn test_first_success_stops_at_winner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let budget = OpBudget::standard();
        let (idx, out) = first_success(&targets(4), &budget, "reboot", move |t| {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            let hostname = t.hostname.clone();
            Box::pin(async move {
                if n < 2 {
                    anyhow::bail!("{} unreachable", hostname);
                }
                Ok(n)
            })
        })
        .await
        .unwrap();

        assert_eq!(idx, 2);
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_success_reports_last_error() {
        let budget = OpBudget::standard();
        let result: Result<(usize, ()), _> =
            first_success(&targets(2), &budget, "attach", |t| {
                let hostname = t.hostname.clone();
                Box::pin(async move { anyhow::bail!("{} said no", hostname) })
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("nc1 said no"));
    }

    #[tokio::test]
    async fn test_first_success_empty_targets() {
        let budget = OpBudget::standard();
        let result: Result<(usize, ()), _> =
            first_success(&[], &budget, "console", |_| Box::pin(async { Ok(()) })).await;
        assert!(matches!(result.unwrap_err(), CcError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fanout_bounded_with_hung_targets() {
        // Every target hangs: total time is bounded by the operation budget
        // (per-node share of the remainder, floored), not N times the hang.
        let budget = OpBudget::standard();
        let started = tokio::time::Instant::now();
        let result: Result<(usize, ()), _> =
            first_success(&targets(3), &budget, "console", |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    anyhow::bail!("no payload")
                })
            })
            .await;
        assert!(result.is_err());
        // 3 targets x 20s floor == the 60s operation budget
        assert!(started.elapsed() <= Duration::from_secs(61));
    }
}
