//! Error types for WAHA Core

use thiserror::Error;

use crate::engine::EngineError;
use crate::session::{ChallengeKind, SessionStatus};

/// Result type alias using WAHA Error
pub type Result<T> = std::result::Result<T, Error>;

/// WAHA error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{0}' already exists")]
    DuplicateSession(String),

    #[error("{operation} is only allowed in {expected} status. The current status is '{actual}'")]
    InvalidState {
        operation: &'static str,
        expected: String,
        actual: SessionStatus,
    },

    #[error("Session '{name}' must be STOPPED before it can be deleted. The current status is '{actual}'")]
    SessionNotInStoppedState { name: String, actual: SessionStatus },

    #[error("Wrong {kind}, {attempts_remaining} attempt(s) remaining")]
    InvalidCode {
        kind: ChallengeKind,
        attempts_remaining: u32,
    },

    #[error("No attempts left for the {0}")]
    ChallengeAttemptsExceeded(ChallengeKind),

    #[error("The {0} challenge timed out")]
    ChallengeTimeout(ChallengeKind),

    #[error("Engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an `InvalidState` error listing the statuses the operation accepts
    pub fn invalid_state(
        operation: &'static str,
        expected: &[SessionStatus],
        actual: SessionStatus,
    ) -> Self {
        let expected = expected
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" or ");
        Error::InvalidState {
            operation,
            expected,
            actual,
        }
    }

    /// HTTP status code the API layer answers with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::SessionNotFound(_) => 404,
            Error::DuplicateSession(_) => 409,
            Error::InvalidState { .. } | Error::SessionNotInStoppedState { .. } => 422,
            Error::InvalidCode { .. } | Error::InvalidRequest(_) => 400,
            Error::ChallengeAttemptsExceeded(_) => 429,
            Error::ChallengeTimeout(_) => 408,
            Error::EngineFailure(_) => 502,
            Error::Config(_) | Error::Serialization(_) => 500,
        }
    }

    /// Short machine-readable error name
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_) => "SessionNotFound",
            Error::DuplicateSession(_) => "DuplicateSession",
            Error::InvalidState { .. } => "InvalidState",
            Error::SessionNotInStoppedState { .. } => "SessionNotInStoppedState",
            Error::InvalidCode { .. } => "InvalidCode",
            Error::ChallengeAttemptsExceeded(_) => "ChallengeAttemptsExceeded",
            Error::ChallengeTimeout(_) => "ChallengeTimeout",
            Error::EngineFailure(_) => "EngineFailure",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::Config(_) => "Config",
            Error::Serialization(_) => "Serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state("Get QR", &[SessionStatus::ScanQrCode], SessionStatus::Working);
        assert_eq!(
            err.to_string(),
            "Get QR is only allowed in SCAN_QR_CODE status. The current status is 'WORKING'"
        );
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_invalid_state_lists_every_expected_status() {
        let err = Error::invalid_state(
            "Request code",
            &[SessionStatus::ScanQrCode, SessionStatus::ScanOtpCode],
            SessionStatus::Starting,
        );
        assert!(err.to_string().contains("SCAN_QR_CODE or SCAN_OTP_CODE"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::SessionNotFound("x".into()).status_code(), 404);
        assert_eq!(Error::DuplicateSession("x".into()).status_code(), 409);
        assert_eq!(
            Error::SessionNotInStoppedState {
                name: "x".into(),
                actual: SessionStatus::Working
            }
            .status_code(),
            422
        );
        assert_eq!(
            Error::InvalidCode {
                kind: ChallengeKind::Otp,
                attempts_remaining: 1
            }
            .status_code(),
            400
        );
        assert_eq!(Error::ChallengeAttemptsExceeded(ChallengeKind::Captcha).status_code(), 429);
        assert_eq!(Error::ChallengeTimeout(ChallengeKind::Otp).status_code(), 408);
        assert_eq!(
            Error::EngineFailure(EngineError::Connection("reset".into())).status_code(),
            502
        );
    }

    #[test]
    fn test_wrong_code_message() {
        let err = Error::InvalidCode {
            kind: ChallengeKind::Otp,
            attempts_remaining: 2,
        };
        assert_eq!(err.to_string(), "Wrong OTP code, 2 attempt(s) remaining");
        assert_eq!(err.kind(), "InvalidCode");
    }
}
