use std::future::Future;
use std::pin::Pin;

use nimbus_core::CcError;
use tokio::time::{Duration, Instant};
use tracing::warn;

/// Overall budget for one multi-target operation.
pub const OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Floor for any single NC call's deadline.
pub const OP_TIMEOUT_PERNODE: Duration = Duration::from_secs(20);

/// A boxed NC call, owned so the sandbox can run it to completion or kill
/// it without borrowing from the caller.
pub type CallFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Time accounting for one operation's fan-out.
///
/// Each call gets the remaining budget divided by the targets still to go,
/// floored at `OP_TIMEOUT_PERNODE`, which keeps an N-target fan-out with one
/// hung NC bounded by the operation budget rather than N times the per-call
/// deadline.
#[derive(Debug, Clone)]
pub struct OpBudget {
    start: Instant,
    total: Duration,
}

impl OpBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            start: Instant::now(),
            total,
        }
    }

    pub fn standard() -> Self {
        Self::new(OP_TIMEOUT)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.start.elapsed())
    }

    /// Deadline for the next call when `targets_left` targets remain.
    pub fn per_node(&self, targets_left: usize) -> Duration {
        let share = self.remaining() / targets_left.max(1) as u32;
        share.max(OP_TIMEOUT_PERNODE).max(Duration::from_secs(1))
    }
}

/// Run one NC call in an isolated worker task with a hard deadline.
///
/// The caller must not hold any cache lock across this await. On timeout
/// the worker is aborted (it never keeps running behind our back) and the
/// call reports failure; transport panics are confined to the worker task.
pub async fn isolated_call<T: Send + 'static>(
    deadline: Duration,
    label: &str,
    call: CallFuture<T>,
) -> Result<T, CcError> {
    let worker = tokio::spawn(call);
    let abort = worker.abort_handle();

    match tokio::time::timeout(deadline, worker).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(CcError::nc_call(format!("{}: {}", label, e))),
        Ok(Err(join_err)) => Err(CcError::nc_call(format!(
            "{}: worker died: {}",
            label, join_err
        ))),
        Err(_) => {
            abort.abort();
            warn!(call = %label, deadline_secs = deadline.as_secs(), "NC call timed out, killing worker");
            Err(CcError::nc_call(format!(
                "{}: timed out after {}s",
                label,
                deadline.as_secs()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_node_divides_remaining() {
        let budget = OpBudget::new(Duration::from_secs(60));
        // 3 targets left: 20s each, exactly at the floor
        assert_eq!(budget.per_node(3), Duration::from_secs(20));
        // 1 target left: the whole remaining budget
        let d = budget.per_node(1);
        assert!(d > Duration::from_secs(55), "got {:?}", d);
    }

    #[test]
    fn test_per_node_floor() {
        let budget = OpBudget::new(Duration::from_secs(60));
        // Many targets would each get a sliver; the floor applies
        assert_eq!(budget.per_node(100), OP_TIMEOUT_PERNODE);
    }

    #[test]
    fn test_exhausted_budget_still_grants_floor() {
        let budget = OpBudget::new(Duration::ZERO);
        assert_eq!(budget.per_node(5), OP_TIMEOUT_PERNODE);
    }

    #[tokio::test]
    async fn test_isolated_call_success() {
        let result: Result<u32, _> = isolated_call(
            Duration::from_secs(5),
            "describe-resource",
            Box::pin(async { Ok(42u32) }),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_isolated_call_error_is_nc_call_failed() {
        let result: Result<u32, _> = isolated_call(
            Duration::from_secs(5),
            "reboot",
            Box::pin(async { anyhow::bail!("connection refused") }),
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CcError::NcCallFailed(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_isolated_call_timeout_kills_worker() {
        let started = Instant::now();
        let result: Result<(), _> = isolated_call(
            Duration::from_millis(50),
            "describe-instances",
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .await;
        assert!(matches!(result.unwrap_err(), CcError::NcCallFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_isolated_call_confines_panic() {
        let result: Result<(), _> = isolated_call(
            Duration::from_secs(5),
            "attach-volume",
            Box::pin(async { panic!("transport blew up") }),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("worker died"));
    }
}
