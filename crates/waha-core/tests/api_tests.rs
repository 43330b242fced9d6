//! Router table integration tests
//!
//! Requests go through `ApiContext::dispatch` exactly as a transport would
//! send them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use waha_core::api::dto::Base64File;
use waha_core::engine::{LoopbackFactory, LoopbackOptions};
use waha_core::session::{SessionManager, SessionStatus};
use waha_core::{ApiContext, ApiRequest, ApiResponse, HealthAggregator, HealthPolicy, Method};

const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<LoopbackFactory>, Arc<SessionManager>, ApiContext) {
    let factory = Arc::new(LoopbackFactory::new(LoopbackOptions::default().with_emit_qr(true)));
    let manager = Arc::new(SessionManager::new(factory.clone()));
    let health = HealthAggregator::new(Arc::clone(&manager), HealthPolicy::AnyFail);
    let api = ApiContext::new(Arc::clone(&manager), health);
    (factory, manager, api)
}

async fn wait_for(manager: &SessionManager, name: &str, status: SessionStatus) {
    let session = manager.get_session(name).await.unwrap();
    timeout(WAIT, session.wait_for_status(status))
        .await
        .expect("Timed out waiting for status");
    assert_eq!(session.status(), status);
}

async fn start(api: &ApiContext, name: &str) -> ApiResponse {
    api.dispatch(&ApiRequest::post("/api/sessions", json!({ "name": name })))
        .await
}

fn assert_error(response: &ApiResponse, status: u16) {
    assert_eq!(response.status, status, "body: {}", response.body);
    assert_eq!(response.body["statusCode"], status);
    assert!(response.body["error"].is_string());
    assert!(response.body["message"].is_string());
}

mod auth_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_qr_formats() {
        let (_factory, manager, api) = setup();
        assert_eq!(start(&api, "default").await.status, 201);
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let raw = api.dispatch(&ApiRequest::get("/api/default/auth/qr?format=raw")).await;
        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, json!({ "value": "loopback-qr-1" }));

        let image = api.dispatch(&ApiRequest::get("/api/default/auth/qr")).await;
        assert_eq!(image.status, 200);
        let file: Base64File = serde_json::from_value(image.body).unwrap();
        assert_eq!(file.mimetype, "image/png");
        assert_eq!(file.decode().unwrap(), b"png:loopback-qr-1".to_vec());

        let bad = api.dispatch(&ApiRequest::get("/api/default/auth/qr?format=svg")).await;
        assert_error(&bad, 400);
    }

    #[tokio::test]
    async fn test_otp_flow_over_routes() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let ack = api
            .dispatch(&ApiRequest::post(
                "/api/default/auth/request-code",
                json!({ "phoneNumber": "+15551234567", "method": "sms" }),
            ))
            .await;
        assert_eq!(ack.status, 201);
        assert_eq!(ack.body["method"], "sms");

        let wrong = api
            .dispatch(&ApiRequest::post(
                "/api/default/auth/authorize-code",
                json!({ "code": "000000" }),
            ))
            .await;
        assert_error(&wrong, 400);
        assert!(wrong.body["message"].as_str().unwrap().contains("2 attempt"));

        let session = api.dispatch(&ApiRequest::get("/api/sessions/default")).await;
        assert_eq!(session.body["status"], "SCAN_OTP_CODE");
        assert_eq!(session.body["challenge"]["kind"], "otp");
        assert_eq!(session.body["challenge"]["attemptsRemaining"], 2);

        let ok = api
            .dispatch(&ApiRequest::post(
                "/api/default/auth/authorize-code",
                json!({ "code": "123456" }),
            ))
            .await;
        assert_eq!(ok.status, 201);
        assert_eq!(ok.body["status"], "WORKING");
    }

    #[tokio::test]
    async fn test_wrong_status_is_422() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let captcha = api.dispatch(&ApiRequest::get("/api/default/auth/captcha")).await;
        assert_error(&captcha, 422);
        assert!(captcha.body["message"]
            .as_str()
            .unwrap()
            .contains("The current status is 'SCAN_QR_CODE'"));
    }

    #[tokio::test]
    async fn test_captcha_routes() {
        let (factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        factory
            .controller("default")
            .unwrap()
            .require_captcha(waha_core::session::ImageData::png(b"captcha".to_vec()));
        wait_for(&manager, "default", SessionStatus::CaptchaRequired).await;

        let image = api.dispatch(&ApiRequest::get("/api/default/auth/captcha")).await;
        assert_eq!(image.status, 200);
        assert_eq!(image.body["data"], "Y2FwdGNoYQ==");

        let solved = api
            .dispatch(&ApiRequest::post("/api/default/auth/captcha", json!({ "code": "captcha" })))
            .await;
        assert_eq!(solved.status, 201);
        assert_eq!(solved.body["status"], "SCAN_QR_CODE");
    }

    #[tokio::test]
    async fn test_engine_rejection_is_502() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let rejected = api
            .dispatch(&ApiRequest::post(
                "/api/default/auth/request-code",
                json!({ "phoneNumber": "not-a-phone", "method": "sms" }),
            ))
            .await;
        assert_error(&rejected, 502);

        let session = api.dispatch(&ApiRequest::get("/api/sessions/default")).await;
        assert_eq!(session.body["status"], "SCAN_QR_CODE");
        assert!(session.body["lastError"].as_str().unwrap().contains("not-a-phone"));
    }

    #[tokio::test]
    async fn test_otp_exhaustion_is_429() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;
        api.dispatch(&ApiRequest::post(
            "/api/default/auth/request-code",
            json!({ "phoneNumber": "+15551234567" }),
        ))
        .await;

        let wrong = ApiRequest::post("/api/default/auth/authorize-code", json!({ "code": "1" }));
        assert_eq!(api.dispatch(&wrong).await.status, 400);
        assert_eq!(api.dispatch(&wrong).await.status, 400);
        assert_error(&api.dispatch(&wrong).await, 429);
        assert_error(&api.dispatch(&wrong).await, 422);
    }
}

mod session_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_factory, manager, api) = setup();

        let created = start(&api, "default").await;
        assert_eq!(created.status, 201);
        assert_eq!(created.body["name"], "default");
        assert_error(&start(&api, "default").await, 409);

        let list = api.dispatch(&ApiRequest::get("/api/sessions")).await;
        assert_eq!(list.body.as_array().unwrap().len(), 1);

        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;
        assert_error(&api.dispatch(&ApiRequest::delete("/api/sessions/default")).await, 422);

        let stopped = api
            .dispatch(&ApiRequest::post("/api/sessions/default/stop", serde_json::Value::Null))
            .await;
        assert_eq!(stopped.status, 200);
        assert_eq!(stopped.body["status"], "STOPPED");

        let deleted = api.dispatch(&ApiRequest::delete("/api/sessions/default")).await;
        assert_eq!(deleted.status, 204);
        assert_error(&api.dispatch(&ApiRequest::get("/api/sessions/default")).await, 404);
        assert_error(&api.dispatch(&ApiRequest::get("/api/default/auth/qr")).await, 404);
    }

    #[tokio::test]
    async fn test_restart_route() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let restarted = api
            .dispatch(&ApiRequest::post("/api/sessions/default/restart", serde_json::Value::Null))
            .await;
        assert_eq!(restarted.status, 200);
        assert_eq!(restarted.body["name"], "default");
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;
    }

    #[tokio::test]
    async fn test_health_route() {
        let (factory, manager, api) = setup();
        let empty = api.dispatch(&ApiRequest::get("/health")).await;
        assert_eq!(empty.status, 200);
        assert_eq!(empty.body["overallStatus"], "pass");

        start(&api, "default").await;
        factory.controller("default").unwrap().fatal("crash");
        wait_for(&manager, "default", SessionStatus::Failed).await;

        let report = api.dispatch(&ApiRequest::get("/health")).await;
        assert_eq!(report.status, 200);
        assert_eq!(report.body["overallStatus"], "fail");
        assert_eq!(report.body["perSession"]["default"]["sessionStatus"], "FAILED");
    }
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let (_factory, _manager, api) = setup();

        assert_error(&api.dispatch(&ApiRequest::get("/api/unknown")).await, 404);
        assert_error(
            &api.dispatch(&ApiRequest::new(Method::Delete, "/health")).await,
            405,
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (_factory, _manager, api) = setup();
        let response = api
            .dispatch(&ApiRequest::post("/api/sessions", json!({ "nom": "default" })))
            .await;
        assert_error(&response, 400);
    }

    #[tokio::test]
    async fn test_request_from_json_line() {
        let (_factory, manager, api) = setup();
        start(&api, "default").await;
        wait_for(&manager, "default", SessionStatus::ScanQrCode).await;

        let request: ApiRequest =
            serde_json::from_str(r#"{"method": "GET", "path": "/api/default/auth/qr?format=raw"}"#).unwrap();
        let response = api.dispatch(&request).await;
        assert_eq!(response.body["value"], "loopback-qr-1");
    }
}
