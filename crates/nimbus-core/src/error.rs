use thiserror::Error;

/// Error taxonomy for the cluster controller.
///
/// Handlers return these directly; the wire layer maps any error to a fault
/// reply, so the variants exist to drive *internal* decisions (broadcast on
/// NotFound, try-next-node on NcCallFailed) rather than wire codes.
#[derive(Debug, Error)]
pub enum CcError {
    /// Null/empty required argument or bounds violation. Returned before any
    /// lock is taken.
    #[error("bad input: {0}")]
    BadInput(String),

    /// A looked-up instance or address is absent from the cache.
    #[error("not found: {0}")]
    NotFound(String),

    /// A node-controller call failed or timed out.
    #[error("NC call failed: {0}")]
    NcCallFailed(String),

    /// The scheduler found no node with sufficient capacity.
    #[error("no resource with sufficient capacity for {mem_mb} MB / {disk_gb} GB / {cores} cores")]
    CapacityExhausted {
        mem_mb: u32,
        disk_gb: u32,
        cores: u32,
    },

    /// A lock was requested out of rank order.
    #[error("lock order violation: {held} is held, cannot acquire {requested}")]
    LockOrder { held: String, requested: String },

    /// Configuration could not be loaded or is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure in an external capability (vnet, host tools, checkpoint I/O).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CcError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn nc_call(msg: impl Into<String>) -> Self {
        Self::NcCallFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = CcError::bad_input("instanceId is empty");
        assert_eq!(e.to_string(), "bad input: instanceId is empty");

        let e = CcError::CapacityExhausted {
            mem_mb: 1024,
            disk_gb: 10,
            cores: 1,
        };
        assert!(e.to_string().contains("1024 MB"));
    }

    #[test]
    fn test_from_anyhow() {
        let inner = anyhow::anyhow!("disk full");
        let e: CcError = inner.into();
        assert!(matches!(e, CcError::Other(_)));
        assert_eq!(e.to_string(), "disk full");
    }
}
