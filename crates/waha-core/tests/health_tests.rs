//! Health aggregation integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use waha_core::engine::{LoopbackFactory, LoopbackOptions};
use waha_core::session::{SessionConfig, SessionManager, SessionStatus, WhatsappSession};
use waha_core::{HealthAggregator, HealthPolicy, HealthStatus};

const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<LoopbackFactory>, Arc<SessionManager>) {
    let factory = Arc::new(LoopbackFactory::new(LoopbackOptions::default()));
    let manager = Arc::new(SessionManager::new(factory.clone()));
    (factory, manager)
}

async fn wait_for(session: &WhatsappSession, status: SessionStatus) {
    let snapshot = timeout(WAIT, session.wait_for_status(status))
        .await
        .expect("Timed out waiting for status");
    assert_eq!(snapshot.status, status);
}

/// One WORKING and one FAILED session
async fn working_and_failed(factory: &LoopbackFactory, manager: &SessionManager) {
    let working = manager.start_session("working", SessionConfig::default()).await.unwrap();
    factory.controller("working").unwrap().authenticate();
    wait_for(&working, SessionStatus::Working).await;

    let failed = manager.start_session("failed", SessionConfig::default()).await.unwrap();
    factory.controller("failed").unwrap().fatal("engine crashed");
    wait_for(&failed, SessionStatus::Failed).await;
}

mod policy_tests {
    use super::*;

    #[tokio::test]
    async fn test_any_fail_policy() {
        let (factory, manager) = setup();
        working_and_failed(&factory, &manager).await;

        let report = HealthAggregator::new(Arc::clone(&manager), HealthPolicy::AnyFail)
            .check()
            .await;
        assert_eq!(report.overall_status, HealthStatus::Fail);
        assert_eq!(report.policy, HealthPolicy::AnyFail);
        assert_eq!(report.per_session["working"].status, HealthStatus::Pass);
        assert_eq!(report.per_session["failed"].status, HealthStatus::Fail);
        assert_eq!(report.per_session["failed"].session_status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_all_fail_policy() {
        let (factory, manager) = setup();
        working_and_failed(&factory, &manager).await;

        let aggregator = HealthAggregator::new(Arc::clone(&manager), HealthPolicy::AllFail);
        let report = aggregator.check().await;
        assert_eq!(report.overall_status, HealthStatus::Pass);
        assert_eq!(report.per_session["failed"].status, HealthStatus::Fail);

        manager.stop_session("working").await.unwrap();
        let report = aggregator.check().await;
        // STOPPED passes, so one entry still passes
        assert_eq!(report.per_session["working"].status, HealthStatus::Pass);
        assert!(report.is_pass());
    }

    #[tokio::test]
    async fn test_all_sessions_failed() {
        let (factory, manager) = setup();
        for name in ["a", "b"] {
            let session = manager.start_session(name, SessionConfig::default()).await.unwrap();
            factory.controller(name).unwrap().disconnect("gone");
            wait_for(&session, SessionStatus::Failed).await;
        }

        let report = HealthAggregator::new(manager, HealthPolicy::AllFail).check().await;
        assert_eq!(report.overall_status, HealthStatus::Fail);
    }
}

mod report_tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_sessions_pass() {
        let (factory, manager) = setup();
        let session = manager.start_session("pending", SessionConfig::default()).await.unwrap();
        factory.controller("pending").unwrap().emit_qr("qr");
        wait_for(&session, SessionStatus::ScanQrCode).await;

        let report = HealthAggregator::new(manager, HealthPolicy::AnyFail).check().await;
        assert!(report.is_pass());
        assert!(report.per_session["pending"].engine_connected);
        assert!(report.per_session["pending"].last_seen.is_some());
    }

    #[tokio::test]
    async fn test_check_does_not_change_sessions() {
        let (factory, manager) = setup();
        working_and_failed(&factory, &manager).await;
        let aggregator = HealthAggregator::new(Arc::clone(&manager), HealthPolicy::AnyFail);

        aggregator.check().await;
        aggregator.check().await;

        assert_eq!(manager.get_session("working").await.unwrap().status(), SessionStatus::Working);
        assert_eq!(manager.get_session("failed").await.unwrap().status(), SessionStatus::Failed);
        assert_eq!(manager.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_report_json_shape() {
        let (factory, manager) = setup();
        working_and_failed(&factory, &manager).await;

        let report = HealthAggregator::new(manager, HealthPolicy::AnyFail).check().await;
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["overallStatus"], "fail");
        assert_eq!(json["policy"], "any_fail");
        assert!(json["checkedAt"].is_string());
        assert_eq!(json["perSession"]["working"]["status"], "pass");
        assert_eq!(json["perSession"]["working"]["sessionStatus"], "WORKING");
        assert_eq!(json["perSession"]["working"]["engineConnected"], true);
        assert_eq!(json["perSession"]["failed"]["status"], "fail");
    }
}
