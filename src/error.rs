use crate::domain::classifier::FailureCause;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Billing service not connected")]
    NotConnected,
    #[error("Store error: {0}")]
    Store(#[from] StoreFailure),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Billing session has shut down")]
    Shutdown,
    #[error("Invalid scenario step: {0}")]
    InvalidStep(String),
}

pub type Result<T> = std::result::Result<T, BillingError>;

/// Response codes reported by the external store capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponseCode {
    ServiceTimeout,
    FeatureNotSupported,
    ServiceDisconnected,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    NetworkError,
}

impl StoreResponseCode {
    /// Conditions that no amount of reconnecting will fix on this host.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::BillingUnavailable | Self::FeatureNotSupported | Self::DeveloperError
        )
    }
}

impl fmt::Display for StoreResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServiceTimeout => "SERVICE_TIMEOUT",
            Self::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            Self::ServiceDisconnected => "SERVICE_DISCONNECTED",
            Self::UserCanceled => "USER_CANCELED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::BillingUnavailable => "BILLING_UNAVAILABLE",
            Self::ItemUnavailable => "ITEM_UNAVAILABLE",
            Self::DeveloperError => "DEVELOPER_ERROR",
            Self::Error => "ERROR",
            Self::ItemAlreadyOwned => "ITEM_ALREADY_OWNED",
            Self::ItemNotOwned => "ITEM_NOT_OWNED",
            Self::NetworkError => "NETWORK_ERROR",
        };
        f.write_str(name)
    }
}

/// A non-OK result from the store, with its debug message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {debug_message}")]
pub struct StoreFailure {
    pub code: StoreResponseCode,
    pub debug_message: String,
}

impl StoreFailure {
    pub fn new(code: StoreResponseCode, debug_message: impl Into<String>) -> Self {
        Self {
            code,
            debug_message: debug_message.into(),
        }
    }
}

/// Failure reported by the script-execution surface when asked to run a script.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("script surface not available")]
    Unavailable,
    #[error("script execution failed: {0}")]
    Failed(FailureCause),
}

/// Failures of a round-trip through the script surface to the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("could not dispatch script: {0}")]
    Dispatch(#[from] SurfaceError),
    #[error("no callback within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
    #[error("malformed script result: {0}")]
    Malformed(String),
    #[error("transaction cancelled: {0}")]
    Closed(String),
}

impl BackendError {
    /// The cause handed to the classifier.
    pub fn cause(&self) -> FailureCause {
        match self {
            Self::Dispatch(SurfaceError::Failed(cause)) => cause.clone(),
            Self::Dispatch(SurfaceError::Unavailable) => {
                FailureCause::Message("script surface not available".to_string())
            }
            Self::Timeout(after) => FailureCause::Timeout(format!("no callback within {after:?}")),
            Self::Rejected(message) | Self::Malformed(message) | Self::Closed(message) => {
                FailureCause::Message(message.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classifier::{ErrorType, classify};

    #[test]
    fn test_timeout_is_classified_as_timeout() {
        let err = BackendError::Timeout(Duration::from_secs(30));
        let info = classify(&err.cause());
        assert_eq!(info.error_type, ErrorType::Timeout);
        assert!(info.is_retryable);
    }

    #[test]
    fn test_rejection_keeps_backend_message() {
        let err = BackendError::Rejected("Invalid purchase token".to_string());
        assert_eq!(err.to_string(), "Invalid purchase token");
        assert_eq!(classify(&err.cause()).error_type, ErrorType::Unknown);
    }

    #[test]
    fn test_permanent_store_codes() {
        assert!(StoreResponseCode::BillingUnavailable.is_permanent());
        assert!(StoreResponseCode::FeatureNotSupported.is_permanent());
        assert!(!StoreResponseCode::ServiceDisconnected.is_permanent());
        assert!(!StoreResponseCode::NetworkError.is_permanent());
    }
}
