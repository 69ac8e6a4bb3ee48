use serde::Serialize;

/// Errors returned by adapter lifecycle, dispatch and interface operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WlanError {
    #[error("allocation failure: {what}")]
    AllocationFailure { what: String },

    #[error("invalid configuration: {message}")]
    ConfigurationInvalid { message: String },

    #[error("firmware failure: {reason}")]
    FirmwareFailure { reason: String },

    #[error("adapter removed")]
    Removed,

    #[error("timeout: {operation}")]
    Timeout { operation: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("busy: {resource}")]
    Busy { resource: String },

    #[error("adapter registry full ({capacity} slots)")]
    RegistryFull { capacity: usize },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("event payload too large: {len} bytes (max {max})")]
    EventTooLarge { len: usize, max: usize },

    #[error("event channel unavailable")]
    ChannelUnavailable,

    #[error("subsystem error: {message}")]
    Subsystem { message: String },

    #[error("request {id} already completed")]
    AlreadyCompleted { id: u64 },
}

impl WlanError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Busy { .. })
    }

    pub fn allocation(what: impl Into<String>) -> Self {
        Self::AllocationFailure { what: what.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            message: message.into(),
        }
    }

    pub fn firmware(reason: impl Into<String>) -> Self {
        Self::FirmwareFailure {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn subsystem(message: impl Into<String>) -> Self {
        Self::Subsystem {
            message: message.into(),
        }
    }
}

/// Outstanding resource counts observed when an adapter is released.
///
/// Every field is expected to be zero after a clean teardown. Non-zero values
/// are logged but never abort the teardown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub malloc_count: i64,
    pub lock_count: i64,
    pub timer_count: i64,
    pub mbuf_alloc_count: i64,
    pub request_count: i64,
    pub tx_pending: i32,
    pub rx_pending: i32,
    pub ioctl_pending: i32,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(WlanError::timeout("init").is_retryable());
        assert!(WlanError::busy("reassoc lock").is_retryable());
        assert!(!WlanError::Removed.is_retryable());
        assert!(!WlanError::config("x").is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = WlanError::EventTooLarge { len: 2000, max: 1024 };
        assert_eq!(err.to_string(), "event payload too large: 2000 bytes (max 1024)");
        assert_eq!(
            WlanError::RegistryFull { capacity: 2 }.to_string(),
            "adapter registry full (2 slots)"
        );
    }

    #[test]
    fn default_leak_report_is_clean() {
        let mut report = LeakReport::default();
        assert!(report.is_clean());
        report.mbuf_alloc_count = 1;
        assert!(!report.is_clean());
    }
}
