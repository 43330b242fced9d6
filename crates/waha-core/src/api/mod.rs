//! Router table for the session API
//!
//! Transport-agnostic: a request is a method, a path, query parameters and a
//! JSON body; a response is a status code and a JSON body. Routes are an
//! explicit registration table mapping (method, path pattern) to an
//! [`Endpoint`], and [`ApiContext::dispatch`] calls the session interfaces
//! directly. Errors are mapped to status codes through
//! [`Error::status_code`](crate::Error::status_code).
//!
//! Engine failures reach callers two ways. A failed engine call made on behalf
//! of `request-code`, `authorize-code` or `POST captcha` answers 502 right
//! away, keeps the session status and is recorded as the session's
//! `lastError`. Connection failures (disconnect, fatal error, failed startup)
//! are never answered synchronously: the session goes FAILED and callers find
//! out through the session status or `/health`.

pub mod dto;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::health::HealthAggregator;
use crate::session::{AuthPolicy, QrCode, QrFormat, SessionConfig, SessionManager, WhatsappSession};
use dto::{
    Base64File, CaptchaBody, ErrorBody, OtpRequest, QrCodeValue, RequestCodeRequest, SessionInfo,
    StartSessionRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// Operation a route resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    GetQr,
    RequestCode,
    AuthorizeCode,
    GetCaptcha,
    SaveCaptcha,
    Health,
    ListSessions,
    StartSession,
    GetSession,
    DeleteSession,
    StopSession,
    RestartSession,
}

/// Incoming request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    /// Path, optionally carrying a `?key=value` query string
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path.to_string(), parse_query(query)),
            None => (path, HashMap::new()),
        };
        Self {
            method,
            path,
            query,
            body: Value::Null,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Query parameter, from the map or the path's own query string
    fn param(&self, key: &str) -> Option<String> {
        if let Some(value) = self.query.get(key) {
            return Some(value.clone());
        }
        let (_, query) = self.path.split_once('?')?;
        parse_query(query).remove(key)
    }

    fn route_path(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(path, _)| path)
    }

    fn body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Error::InvalidRequest(format!("invalid request body: {}", e)))
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Outgoing response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: impl Serialize) -> Self {
        Self::with_status(200, body)
    }

    pub fn created(body: impl Serialize) -> Self {
        Self::with_status(201, body)
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: Value::Null,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::with_status(status, ErrorBody::new(status, message))
    }

    fn with_status(status: u16, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::from(&Error::Serialization(e)),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<&Error> for ApiResponse {
    fn from(error: &Error) -> Self {
        let body = ErrorBody::from(error);
        Self {
            status: body.status_code,
            body: serde_json::json!({
                "statusCode": body.status_code,
                "error": body.error,
                "message": body.message,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{session}` capture
    Session,
}

#[derive(Debug, Clone)]
struct Route {
    method: Method,
    segments: Vec<Segment>,
    endpoint: Endpoint,
}

impl Route {
    /// Session captured by the pattern, `Some(None)` when the pattern has none
    fn capture<'a>(&self, parts: &[&'a str]) -> Option<Option<&'a str>> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut session = None;
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Session if part.is_empty() => return None,
                Segment::Session => session = Some(*part),
            }
        }
        Some(session)
    }
}

/// Result of looking a request up in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Found {
        endpoint: Endpoint,
        session: Option<String>,
    },
    /// Path is known but not for this method
    MethodNotAllowed,
    NotFound,
}

/// Registration table of (method, path pattern) → endpoint
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every standard route
    pub fn standard() -> Self {
        Self::new()
            .route(Method::Get, "/api/{session}/auth/qr", Endpoint::GetQr)
            .route(Method::Post, "/api/{session}/auth/request-code", Endpoint::RequestCode)
            .route(Method::Post, "/api/{session}/auth/authorize-code", Endpoint::AuthorizeCode)
            .route(Method::Get, "/api/{session}/auth/captcha", Endpoint::GetCaptcha)
            .route(Method::Post, "/api/{session}/auth/captcha", Endpoint::SaveCaptcha)
            .route(Method::Get, "/health", Endpoint::Health)
            .route(Method::Get, "/api/sessions", Endpoint::ListSessions)
            .route(Method::Post, "/api/sessions", Endpoint::StartSession)
            .route(Method::Get, "/api/sessions/{session}", Endpoint::GetSession)
            .route(Method::Delete, "/api/sessions/{session}", Endpoint::DeleteSession)
            .route(Method::Post, "/api/sessions/{session}/stop", Endpoint::StopSession)
            .route(Method::Post, "/api/sessions/{session}/restart", Endpoint::RestartSession)
    }

    /// Register a route; earlier registrations win on overlap
    pub fn route(mut self, method: Method, pattern: &str, endpoint: Endpoint) -> Self {
        let segments = split_path(pattern)
            .into_iter()
            .map(|part| match part {
                "{session}" => Segment::Session,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        self.routes.push(Route {
            method,
            segments,
            endpoint,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, method: Method, path: &str) -> Resolved {
        let parts = split_path(path);
        let mut path_known = false;
        for route in &self.routes {
            let Some(session) = route.capture(&parts) else {
                continue;
            };
            if route.method == method {
                return Resolved::Found {
                    endpoint: route.endpoint,
                    session: session.map(str::to_string),
                };
            }
            path_known = true;
        }
        if path_known {
            Resolved::MethodNotAllowed
        } else {
            Resolved::NotFound
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

/// Everything a request handler needs
pub struct ApiContext {
    manager: Arc<SessionManager>,
    health: HealthAggregator,
    router: Router,
    /// Policy for sessions started through the API
    auth: AuthPolicy,
}

impl ApiContext {
    pub fn new(manager: Arc<SessionManager>, health: HealthAggregator) -> Self {
        Self {
            manager,
            health,
            router: Router::standard(),
            auth: AuthPolicy::default(),
        }
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_auth_policy(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Route a request and render the outcome
    pub async fn dispatch(&self, request: &ApiRequest) -> ApiResponse {
        let (endpoint, session) = match self.router.resolve(request.method, request.route_path()) {
            Resolved::Found { endpoint, session } => (endpoint, session),
            Resolved::MethodNotAllowed => {
                return ApiResponse::error(
                    405,
                    format!("Cannot {} {}", request.method, request.route_path()),
                );
            }
            Resolved::NotFound => {
                return ApiResponse::error(
                    404,
                    format!("Cannot {} {}", request.method, request.route_path()),
                );
            }
        };

        match self.handle(endpoint, session.as_deref(), request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(?endpoint, kind = e.kind(), error = %e, "Request failed");
                ApiResponse::from(&e)
            }
        }
    }

    async fn handle(&self, endpoint: Endpoint, session: Option<&str>, request: &ApiRequest) -> Result<ApiResponse> {
        match endpoint {
            Endpoint::Health => Ok(ApiResponse::ok(self.health.check().await)),
            Endpoint::ListSessions => {
                let mut sessions: Vec<_> = self
                    .manager
                    .sessions()
                    .await
                    .iter()
                    .map(|s| SessionInfo::from(&s.snapshot()))
                    .collect();
                sessions.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(ApiResponse::ok(sessions))
            }
            Endpoint::StartSession => {
                let body: StartSessionRequest = request.body()?;
                let config = SessionConfig {
                    auth: self.auth.clone(),
                    metadata: body.metadata,
                };
                let session = self.manager.start_session(&body.name, config).await?;
                Ok(ApiResponse::created(session_info(&session)))
            }
            _ => {
                let name = session.ok_or_else(|| Error::InvalidRequest("missing session name".to_string()))?;
                self.handle_session(endpoint, name, request).await
            }
        }
    }

    async fn handle_session(&self, endpoint: Endpoint, name: &str, request: &ApiRequest) -> Result<ApiResponse> {
        match endpoint {
            Endpoint::DeleteSession => {
                self.manager.delete_session(name).await?;
                return Ok(ApiResponse::no_content());
            }
            Endpoint::StopSession => {
                self.manager.stop_session(name).await?;
            }
            Endpoint::RestartSession => {
                let session = self.manager.restart_session(name).await?;
                return Ok(ApiResponse::ok(session_info(&session)));
            }
            _ => {}
        }

        let session = self.manager.get_session(name).await?;
        match endpoint {
            Endpoint::GetQr => {
                let format = match request.param("format").as_deref() {
                    None | Some("image") => QrFormat::Image,
                    Some("raw") => QrFormat::Raw,
                    Some(other) => {
                        return Err(Error::InvalidRequest(format!(
                            "unknown QR format '{}', expected 'image' or 'raw'",
                            other
                        )));
                    }
                };
                Ok(match session.get_qr(format).await? {
                    QrCode::Raw(value) => ApiResponse::ok(QrCodeValue { value }),
                    QrCode::Image(image) => ApiResponse::ok(Base64File::from(&image)),
                })
            }
            Endpoint::RequestCode => {
                let body: RequestCodeRequest = request.body()?;
                let ack = session.request_code(&body.phone_number, body.method).await?;
                Ok(ApiResponse::created(ack))
            }
            Endpoint::AuthorizeCode => {
                let body: OtpRequest = request.body()?;
                session.authorize_code(&body.code).await?;
                Ok(ApiResponse::created(session_info(&session)))
            }
            Endpoint::GetCaptcha => {
                let captcha = session.get_captcha().await?;
                Ok(ApiResponse::ok(Base64File::from(&captcha.image)))
            }
            Endpoint::SaveCaptcha => {
                let body: CaptchaBody = request.body()?;
                session.save_captcha(&body.code).await?;
                Ok(ApiResponse::created(session_info(&session)))
            }
            _ => Ok(ApiResponse::ok(session_info(&session))),
        }
    }
}

fn session_info(session: &WhatsappSession) -> SessionInfo {
    SessionInfo::from(&session.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_routes_resolve() {
        let router = Router::standard();
        assert_eq!(router.len(), 12);

        assert_eq!(
            router.resolve(Method::Get, "/api/default/auth/qr"),
            Resolved::Found {
                endpoint: Endpoint::GetQr,
                session: Some("default".to_string()),
            }
        );
        assert_eq!(
            router.resolve(Method::Post, "/api/default/auth/captcha"),
            Resolved::Found {
                endpoint: Endpoint::SaveCaptcha,
                session: Some("default".to_string()),
            }
        );
        assert_eq!(
            router.resolve(Method::Get, "/health/"),
            Resolved::Found {
                endpoint: Endpoint::Health,
                session: None,
            }
        );
        assert_eq!(
            router.resolve(Method::Delete, "/api/sessions/work"),
            Resolved::Found {
                endpoint: Endpoint::DeleteSession,
                session: Some("work".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_route_and_method() {
        let router = Router::standard();
        assert_eq!(router.resolve(Method::Get, "/api/default/auth"), Resolved::NotFound);
        assert_eq!(router.resolve(Method::Delete, "/health"), Resolved::MethodNotAllowed);
        assert_eq!(router.resolve(Method::Get, "/api//auth/qr"), Resolved::NotFound);
    }

    #[test]
    fn test_custom_registration() {
        let router = Router::new().route(Method::Get, "/status", Endpoint::Health);
        assert!(!router.is_empty());
        assert!(matches!(
            router.resolve(Method::Get, "/status"),
            Resolved::Found {
                endpoint: Endpoint::Health,
                ..
            }
        ));
    }

    #[test]
    fn test_request_query_parsing() {
        let request = ApiRequest::get("/api/default/auth/qr?format=raw");
        assert_eq!(request.path, "/api/default/auth/qr");
        assert_eq!(request.param("format").as_deref(), Some("raw"));
        assert_eq!(request.route_path(), "/api/default/auth/qr");
    }

    #[test]
    fn test_request_deserializes_from_json_line() {
        let request: ApiRequest = serde_json::from_str(
            r#"{"method": "POST", "path": "/api/default/auth/authorize-code", "body": {"code": "123456"}}"#,
        )
        .unwrap();
        assert_eq!(request.method, Method::Post);
        let body: OtpRequest = request.body().unwrap();
        assert_eq!(body.code, "123456");
    }

    #[test]
    fn test_error_response_shape() {
        let response = ApiResponse::from(&Error::DuplicateSession("default".to_string()));
        assert_eq!(response.status, 409);
        assert_eq!(response.body["statusCode"], 409);
        assert_eq!(response.body["error"], "Conflict");
        assert!(!response.is_success());
    }
}
