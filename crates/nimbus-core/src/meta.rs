use serde::{Deserialize, Serialize};

/// Per-request metadata carried on every verb from the cloud controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub correlation_id: String,
    pub user_id: String,
}

impl RequestMeta {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
        }
    }

    /// Metadata used by the background monitor, which acts as the system user.
    pub fn monitor() -> Self {
        Self {
            correlation_id: "monitor".to_string(),
            user_id: "nimbus".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_correlation_id() {
        let a = RequestMeta::new("admin");
        let b = RequestMeta::new("admin");
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.user_id, "admin");
    }

    #[test]
    fn test_monitor_meta() {
        let m = RequestMeta::monitor();
        assert_eq!(m.correlation_id, "monitor");
        assert_eq!(m.user_id, "nimbus");
    }
}
