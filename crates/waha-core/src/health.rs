//! Health aggregation across all registered sessions
//!
//! `check()` only reads published snapshots; it never touches an engine or
//! changes session state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{SessionManager, SessionName, SessionSnapshot, SessionStatus};

/// How per-session results reduce to the overall status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Fail as soon as one session fails
    AnyFail,
    /// Fail only when every session fails
    #[default]
    AllFail,
}

impl fmt::Display for HealthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthPolicy::AnyFail => write!(f, "any_fail"),
            HealthPolicy::AllFail => write!(f, "all_fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Fail,
}

/// Liveness of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub status: HealthStatus,
    pub session_status: SessionStatus,
    pub engine_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Aggregate health report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub policy: HealthPolicy,
    pub checked_at: DateTime<Utc>,
    pub per_session: BTreeMap<SessionName, SessionHealth>,
}

impl HealthReport {
    pub fn is_pass(&self) -> bool {
        self.overall_status == HealthStatus::Pass
    }
}

/// Reduces session snapshots to a pass/fail report
pub struct HealthAggregator {
    manager: Arc<SessionManager>,
    policy: HealthPolicy,
    /// WORKING sessions not seen for longer than this fail
    stale_after: Option<Duration>,
}

impl HealthAggregator {
    pub fn new(manager: Arc<SessionManager>, policy: HealthPolicy) -> Self {
        Self {
            manager,
            policy,
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    /// Snapshot every registered session and reduce to a report
    pub async fn check(&self) -> HealthReport {
        let now = Utc::now();
        let per_session: BTreeMap<_, _> = self
            .manager
            .sessions()
            .await
            .into_iter()
            .map(|session| {
                let snapshot = session.snapshot();
                let health = self.evaluate(&snapshot, now);
                (snapshot.name, health)
            })
            .collect();

        let overall_status = reduce(self.policy, per_session.values().map(|h| h.status));
        debug!(
            sessions = per_session.len(),
            overall = ?overall_status,
            "Health check complete"
        );

        HealthReport {
            overall_status,
            policy: self.policy,
            checked_at: now,
            per_session,
        }
    }

    fn evaluate(&self, snapshot: &SessionSnapshot, now: DateTime<Utc>) -> SessionHealth {
        let status = match snapshot.status {
            SessionStatus::Failed => HealthStatus::Fail,
            SessionStatus::Working if !snapshot.engine_connected => HealthStatus::Fail,
            SessionStatus::Working if self.is_stale(snapshot.last_seen, now) => HealthStatus::Fail,
            _ => HealthStatus::Pass,
        };
        SessionHealth {
            status,
            session_status: snapshot.status,
            engine_connected: snapshot.engine_connected,
            last_seen: snapshot.last_seen,
        }
    }

    fn is_stale(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(stale_after) = self.stale_after else {
            return false;
        };
        match last_seen {
            Some(seen) => (now - seen).to_std().is_ok_and(|age| age > stale_after),
            None => true,
        }
    }
}

/// An empty set of sessions passes under either policy
fn reduce(policy: HealthPolicy, statuses: impl Iterator<Item = HealthStatus>) -> HealthStatus {
    let mut total = 0usize;
    let mut failed = 0usize;
    for status in statuses {
        total += 1;
        if status == HealthStatus::Fail {
            failed += 1;
        }
    }

    let fails = match policy {
        HealthPolicy::AnyFail => failed > 0,
        HealthPolicy::AllFail => total > 0 && failed == total,
    };
    if fails { HealthStatus::Fail } else { HealthStatus::Pass }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackFactory;

    use super::HealthStatus::{Fail, Pass};

    #[test]
    fn test_reduce_any_fail() {
        assert_eq!(reduce(HealthPolicy::AnyFail, [Pass, Fail].into_iter()), Fail);
        assert_eq!(reduce(HealthPolicy::AnyFail, [Pass, Pass].into_iter()), Pass);
    }

    #[test]
    fn test_reduce_all_fail() {
        assert_eq!(reduce(HealthPolicy::AllFail, [Pass, Fail].into_iter()), Pass);
        assert_eq!(reduce(HealthPolicy::AllFail, [Fail, Fail].into_iter()), Fail);
    }

    #[test]
    fn test_reduce_empty_passes() {
        assert_eq!(reduce(HealthPolicy::AnyFail, std::iter::empty()), Pass);
        assert_eq!(reduce(HealthPolicy::AllFail, std::iter::empty()), Pass);
    }

    #[test]
    fn test_policy_serialization() {
        assert_eq!(serde_json::to_string(&HealthPolicy::AnyFail).unwrap(), "\"any_fail\"");
        let parsed: HealthPolicy = serde_json::from_str("\"all_fail\"").unwrap();
        assert_eq!(parsed, HealthPolicy::AllFail);
        assert_eq!(HealthPolicy::default(), HealthPolicy::AllFail);
    }

    fn snapshot(status: SessionStatus, connected: bool, last_seen: Option<DateTime<Utc>>) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::starting("s");
        snapshot.status = status;
        snapshot.engine_connected = connected;
        snapshot.last_seen = last_seen;
        snapshot
    }

    #[test]
    fn test_evaluate_rules() {
        let manager = Arc::new(SessionManager::new(Arc::new(LoopbackFactory::default())));
        let aggregator = HealthAggregator::new(manager, HealthPolicy::AnyFail)
            .with_stale_after(Duration::from_secs(30));
        let now = Utc::now();

        let eval = |s: &SessionSnapshot| aggregator.evaluate(s, now).status;
        assert_eq!(eval(&snapshot(SessionStatus::Working, true, Some(now))), Pass);
        assert_eq!(eval(&snapshot(SessionStatus::Working, false, Some(now))), Fail);
        assert_eq!(
            eval(&snapshot(SessionStatus::Working, true, Some(now - chrono::Duration::seconds(60)))),
            Fail
        );
        assert_eq!(eval(&snapshot(SessionStatus::Failed, false, None)), Fail);
        assert_eq!(eval(&snapshot(SessionStatus::Stopped, false, None)), Pass);
        assert_eq!(eval(&snapshot(SessionStatus::ScanQrCode, true, Some(now))), Pass);
    }

    #[tokio::test]
    async fn test_empty_registry_report() {
        let manager = Arc::new(SessionManager::new(Arc::new(LoopbackFactory::default())));
        let report = HealthAggregator::new(manager, HealthPolicy::AnyFail).check().await;
        assert!(report.is_pass());
        assert!(report.per_session.is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["overallStatus"], "pass");
        assert_eq!(json["policy"], "any_fail");
        assert!(json["perSession"].as_object().unwrap().is_empty());
    }
}
