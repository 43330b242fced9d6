//! Session types shared by the state machine, the session handle and the API layer
//!
//! These types are the observable surface of a session: its status, the
//! challenge currently blocking authentication and the snapshot published
//! after every transition.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::coordinator::AuthPolicy;

/// Unique name of a session
pub type SessionName = String;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Engine is being started
    Starting,
    /// Waiting for the QR code to be scanned on the phone
    ScanQrCode,
    /// Waiting for the one-time code sent by SMS or voice call
    ScanOtpCode,
    /// Engine asked for a captcha before it can continue
    CaptchaRequired,
    /// Authenticated and connected
    Working,
    /// Terminal: engine failed or a challenge was exhausted
    Failed,
    /// Terminal: stopped on request
    Stopped,
}

impl SessionStatus {
    /// Statuses that carry a current challenge
    pub const CHALLENGE_PENDING: [SessionStatus; 3] = [
        SessionStatus::ScanQrCode,
        SessionStatus::ScanOtpCode,
        SessionStatus::CaptchaRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::ScanQrCode => "SCAN_QR_CODE",
            Self::ScanOtpCode => "SCAN_OTP_CODE",
            Self::CaptchaRequired => "CAPTCHA_REQUIRED",
            Self::Working => "WORKING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether this status blocks on an authentication challenge
    pub fn is_challenge_pending(&self) -> bool {
        Self::CHALLENGE_PENDING.contains(self)
    }

    /// FAILED and STOPPED are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of authentication challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Qr,
    Otp,
    Captcha,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Qr => "QR code",
            Self::Otp => "OTP code",
            Self::Captcha => "captcha",
        })
    }
}

/// Delivery method for the one-time code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeMethod {
    Sms,
    Voice,
}

impl fmt::Display for CodeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sms => "sms",
            Self::Voice => "voice",
        })
    }
}

/// Binary image produced by the engine (QR bitmap, captcha picture)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub mimetype: String,
    pub data: Vec<u8>,
}

impl ImageData {
    pub fn png(data: impl Into<Vec<u8>>) -> Self {
        Self {
            mimetype: "image/png".to_string(),
            data: data.into(),
        }
    }
}

/// Pending QR pairing challenge
#[derive(Debug, Clone, Serialize)]
pub struct QrChallenge {
    /// Changes every time the engine pushes a new QR
    pub id: String,
    /// Opaque pairing payload
    pub raw: String,
    /// Rendered QR, when the engine provides one
    #[serde(skip)]
    pub image: Option<ImageData>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Pending one-time code challenge
#[derive(Debug, Clone, Serialize)]
pub struct OtpChallenge {
    pub id: String,
    pub phone_number: String,
    /// `None` means a pairing code entered in the phone app
    pub method: Option<CodeMethod>,
    pub attempts_remaining: u32,
    pub requested_at: DateTime<Utc>,
}

/// Pending captcha challenge
#[derive(Debug, Clone, Serialize)]
pub struct CaptchaChallenge {
    pub id: String,
    #[serde(skip)]
    pub image: ImageData,
    pub attempts_remaining: u32,
    pub issued_at: DateTime<Utc>,
}

/// The single challenge a session may be blocked on
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Challenge {
    Qr(QrChallenge),
    Otp(OtpChallenge),
    Captcha(CaptchaChallenge),
}

impl Challenge {
    pub fn kind(&self) -> ChallengeKind {
        match self {
            Self::Qr(_) => ChallengeKind::Qr,
            Self::Otp(_) => ChallengeKind::Otp,
            Self::Captcha(_) => ChallengeKind::Captcha,
        }
    }

    /// Attempts left for OTP and captcha challenges
    pub fn attempts_remaining(&self) -> Option<u32> {
        match self {
            Self::Qr(_) => None,
            Self::Otp(otp) => Some(otp.attempts_remaining),
            Self::Captcha(captcha) => Some(captcha.attempts_remaining),
        }
    }
}

/// Point-in-time view of a session, published after every transition
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub name: SessionName,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<Challenge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub engine_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub(crate) fn starting(name: impl Into<SessionName>) -> Self {
        Self {
            name: name.into(),
            status: SessionStatus::Starting,
            challenge: None,
            last_error: None,
            engine_connected: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    /// Force the terminal STOPPED view once the worker is gone
    pub(crate) fn mark_stopped(&mut self) {
        self.status = SessionStatus::Stopped;
        self.challenge = None;
        self.engine_connected = false;
    }
}

/// Requested representation of the QR code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    /// Rendered image
    #[default]
    Image,
    /// Raw pairing payload
    Raw,
}

/// QR code in the requested representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrCode {
    Raw(String),
    Image(ImageData),
}

/// Engine acknowledgement of a code request, echoed to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRequestAck {
    pub method: Option<CodeMethod>,
    /// Code to type on the phone when no SMS/voice method was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Outcome of submitting a code to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Per-session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Attempt limits, timeouts and QR cadence for this session
    pub auth: AuthPolicy,
    /// Free-form labels passed to the engine factory
    pub metadata: HashMap<String, String>,
}

impl SessionConfig {
    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&SessionStatus::ScanQrCode).unwrap();
        assert_eq!(json, "\"SCAN_QR_CODE\"");
        let parsed: SessionStatus = serde_json::from_str("\"CAPTCHA_REQUIRED\"").unwrap();
        assert_eq!(parsed, SessionStatus::CaptchaRequired);
        assert_eq!(SessionStatus::ScanOtpCode.to_string(), "SCAN_OTP_CODE");
    }

    #[test]
    fn test_challenge_pending_statuses() {
        assert!(SessionStatus::ScanQrCode.is_challenge_pending());
        assert!(SessionStatus::CaptchaRequired.is_challenge_pending());
        assert!(!SessionStatus::Starting.is_challenge_pending());
        assert!(!SessionStatus::Working.is_challenge_pending());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Working.is_terminal());
    }

    #[test]
    fn test_mark_stopped_clears_challenge() {
        let mut snapshot = SessionSnapshot::starting("default");
        snapshot.status = SessionStatus::ScanOtpCode;
        snapshot.engine_connected = true;
        snapshot.challenge = Some(Challenge::Otp(OtpChallenge {
            id: "c1".to_string(),
            phone_number: "+15551234567".to_string(),
            method: Some(CodeMethod::Sms),
            attempts_remaining: 2,
            requested_at: Utc::now(),
        }));

        snapshot.mark_stopped();
        assert_eq!(snapshot.status, SessionStatus::Stopped);
        assert!(snapshot.challenge.is_none());
        assert!(!snapshot.engine_connected);
    }

    #[test]
    fn test_code_request_ack_camel_case() {
        let ack = CodeRequestAck {
            method: None,
            code: Some("ABCD-EFGH".to_string()),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["code"], "ABCD-EFGH");
        assert!(json["method"].is_null());
    }
}
