//! Request and response bodies of the router table

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::session::{
    Challenge, ChallengeKind, CodeMethod, ImageData, SessionName, SessionSnapshot, SessionStatus,
};

/// Body of `POST /api/{session}/auth/request-code`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCodeRequest {
    pub phone_number: String,
    /// Absent for a pairing code typed in the phone app
    #[serde(default)]
    pub method: Option<CodeMethod>,
}

/// Body of `POST /api/{session}/auth/authorize-code`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpRequest {
    pub code: String,
}

/// Body of `POST /api/{session}/auth/captcha`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaBody {
    pub code: String,
}

/// Body of `POST /api/sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub name: SessionName,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Raw QR payload, answered for `?format=raw`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCodeValue {
    pub value: String,
}

/// Binary file rendered as base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base64File {
    pub mimetype: String,
    pub data: String,
}

impl From<&ImageData> for Base64File {
    fn from(image: &ImageData) -> Self {
        Self {
            mimetype: image.mimetype.clone(),
            data: STANDARD.encode(&image.data),
        }
    }
}

impl Base64File {
    /// Decode back into raw bytes
    pub fn decode(&self) -> Result<Vec<u8>, Error> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| Error::InvalidRequest(format!("invalid base64 data: {}", e)))
    }
}

/// Summary of the challenge a session is blocked on
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeInfo {
    pub kind: ChallengeKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl From<&Challenge> for ChallengeInfo {
    fn from(challenge: &Challenge) -> Self {
        let (id, expires_at, phone_number) = match challenge {
            Challenge::Qr(qr) => (qr.id.clone(), Some(qr.expires_at), None),
            Challenge::Otp(otp) => (otp.id.clone(), None, Some(otp.phone_number.clone())),
            Challenge::Captcha(captcha) => (captcha.id.clone(), None, None),
        };
        Self {
            kind: challenge.kind(),
            id,
            attempts_remaining: challenge.attempts_remaining(),
            expires_at,
            phone_number,
        }
    }
}

/// Session as rendered by the session endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: SessionName,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub engine_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&SessionSnapshot> for SessionInfo {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            status: snapshot.status,
            challenge: snapshot.challenge.as_ref().map(ChallengeInfo::from),
            last_error: snapshot.last_error.clone(),
            engine_connected: snapshot.engine_connected,
            last_seen: snapshot.last_seen,
            created_at: snapshot.created_at,
        }
    }
}

/// Error body: `{statusCode, error, message}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error: reason_phrase(status_code).to_string(),
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self::new(error.status_code(), error.to_string())
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_code_camel_case() {
        let request: RequestCodeRequest =
            serde_json::from_str(r#"{"phoneNumber": "+15551234567", "method": "sms"}"#).unwrap();
        assert_eq!(request.phone_number, "+15551234567");
        assert_eq!(request.method, Some(CodeMethod::Sms));

        let request: RequestCodeRequest = serde_json::from_str(r#"{"phoneNumber": "+1"}"#).unwrap();
        assert!(request.method.is_none());
    }

    #[test]
    fn test_base64_file() {
        let file = Base64File::from(&ImageData::png(b"qr".to_vec()));
        assert_eq!(file.mimetype, "image/png");
        assert_eq!(file.data, "cXI=");
        assert_eq!(file.decode().unwrap(), b"qr".to_vec());
    }

    #[test]
    fn test_error_body() {
        let body = ErrorBody::from(&Error::SessionNotFound("x".to_string()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["statusCode"], 404);
        assert_eq!(json["error"], "Not Found");
        assert_eq!(json["message"], "Session 'x' not found");
    }

    #[test]
    fn test_session_info_from_snapshot() {
        let mut snapshot = SessionSnapshot::starting("default");
        snapshot.last_error = Some("boom".to_string());
        let json = serde_json::to_value(SessionInfo::from(&snapshot)).unwrap();
        assert_eq!(json["status"], "STARTING");
        assert_eq!(json["lastError"], "boom");
        assert!(json.get("challenge").is_none());
    }
}
