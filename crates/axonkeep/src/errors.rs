use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error suitable for returning to a surface client inside the
/// uniform `{success: false, error}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum KeeperError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// Wrong password and corrupted ciphertext are indistinguishable by
    /// design; never report which.
    #[error("decryption failed")]
    Decryption,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("address already exists in vault: {0}")]
    DuplicateAddress(String),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("key is locked: {0}")]
    Locked(String),

    #[error("too many failed unlock attempts; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("not connected to a chain node")]
    NotConnected,

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("{module}.{reason}: {description}")]
    Dispatch {
        module: String,
        reason: String,
        description: String,
    },

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("approval rejected")]
    ApprovalRejected,

    #[error("chain does not support this capability: {0}")]
    NotSupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("vault busy; retry the operation")]
    Busy,
}

impl KeeperError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Decryption => "decryption_error",
            Self::NotFound(_) => "not_found",
            Self::DuplicateAddress(_) => "duplicate_address",
            Self::InvalidSecret(_) => "invalid_secret",
            Self::Locked(_) => "locked",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotConnected => "not_connected",
            Self::NetworkTimeout(_) => "network_timeout",
            Self::Dispatch { .. } => "dispatch_error",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalRejected => "approval_rejected",
            Self::NotSupported(_) => "not_supported",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Busy => "busy",
        }
    }
}

impl From<KeeperError> for ErrorBody {
    fn from(e: KeeperError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Convert any error reaching a surface boundary into an `ErrorBody`.
///
/// Typed `KeeperError`s keep their code; everything else is internal.
pub fn to_error_body(e: &eyre::Report) -> ErrorBody {
    e.downcast_ref::<KeeperError>().map_or_else(
        || ErrorBody::new("internal_error", format!("{e:#}")),
        |ke| ErrorBody::from(ke.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeper_errors_map_to_stable_codes() {
        let e = KeeperError::RateLimited {
            retry_after_secs: 900,
        };
        let body = ErrorBody::from(e);
        assert_eq!(body.code, "rate_limited");
        assert!(body.message.contains("900"), "message: {}", body.message);
    }

    #[test]
    fn eyre_reports_become_internal_errors() {
        let report = eyre::eyre!("boom");
        let body = to_error_body(&report);
        assert_eq!(body.code, "internal_error");
    }

    #[test]
    fn typed_errors_survive_eyre_wrapping() {
        let report = eyre::Report::new(KeeperError::NotConnected);
        let body = to_error_body(&report);
        assert_eq!(body.code, "not_connected");
    }
}
