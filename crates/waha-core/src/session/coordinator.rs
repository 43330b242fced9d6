//! Auth challenge coordinator
//!
//! Owns the attempt-limit and timeout policy shared by the OTP and captcha
//! flows, and the QR refresh cadence. It holds no engine and performs no I/O:
//! the session worker asks it what to do and applies the answer.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use super::types::{
    CaptchaChallenge, ChallengeKind, CodeMethod, ImageData, OtpChallenge, QrChallenge,
};
use crate::error::Error;

/// Attempt limits, timeouts and QR cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    pub otp_max_attempts: u32,
    pub captcha_max_attempts: u32,
    pub otp_timeout: Duration,
    pub captcha_timeout: Duration,
    /// How long a QR is advertised as valid
    pub qr_ttl: Duration,
    /// How often the refresh check runs while a QR is displayed
    pub qr_refresh_interval: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            otp_max_attempts: 3,
            captcha_max_attempts: 3,
            otp_timeout: Duration::from_secs(300),
            captcha_timeout: Duration::from_secs(120),
            qr_ttl: Duration::from_secs(60),
            qr_refresh_interval: Duration::from_secs(20),
        }
    }
}

/// Why a challenge was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    AttemptsExhausted,
    TimedOut,
}

/// Signal that forces the session into FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeFailed {
    pub kind: ChallengeKind,
    pub reason: FailureReason,
}

impl From<ChallengeFailed> for Error {
    fn from(failed: ChallengeFailed) -> Self {
        match failed.reason {
            FailureReason::AttemptsExhausted => Error::ChallengeAttemptsExceeded(failed.kind),
            FailureReason::TimedOut => Error::ChallengeTimeout(failed.kind),
        }
    }
}

/// Result of a rejected code submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Retry { remaining: u32 },
    Exhausted(ChallengeFailed),
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    kind: ChallengeKind,
    at: Instant,
}

/// Issues challenges and tracks their clocks
#[derive(Debug)]
pub struct AuthChallengeCoordinator {
    policy: AuthPolicy,
    /// When the displayed QR stops being valid
    qr_expires: Option<Instant>,
    deadline: Option<Deadline>,
    /// OTP deadline parked while a captcha interrupts the flow
    suspended: Option<Deadline>,
}

impl AuthChallengeCoordinator {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            policy,
            qr_expires: None,
            deadline: None,
            suspended: None,
        }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    /// Build a QR challenge for a freshly pushed payload, superseding the previous one
    pub fn issue_qr(&mut self, raw: String, image: Option<ImageData>, now: Instant) -> QrChallenge {
        self.qr_expires = Some(now + self.policy.qr_ttl);
        let generated_at = Utc::now();
        QrChallenge {
            id: Uuid::new_v4().to_string(),
            raw,
            image,
            generated_at,
            expires_at: generated_at + chrono_duration(self.policy.qr_ttl),
        }
    }

    /// Build an OTP challenge.
    ///
    /// `carried` keeps the attempts left by a previous request; such a
    /// re-request also keeps the running deadline instead of starting a new one.
    pub fn issue_otp(
        &mut self,
        phone_number: String,
        method: Option<CodeMethod>,
        carried: Option<u32>,
        now: Instant,
    ) -> OtpChallenge {
        self.qr_expires = None;
        let at = match self.deadline {
            Some(running) if carried.is_some() && running.kind == ChallengeKind::Otp => running.at,
            _ => now + self.policy.otp_timeout,
        };
        self.deadline = Some(Deadline {
            kind: ChallengeKind::Otp,
            at,
        });
        OtpChallenge {
            id: Uuid::new_v4().to_string(),
            phone_number,
            method,
            attempts_remaining: carried.unwrap_or(self.policy.otp_max_attempts),
            requested_at: Utc::now(),
        }
    }

    /// Build a captcha challenge, parking any running OTP deadline until it is solved
    pub fn issue_captcha(&mut self, image: ImageData, carried: Option<u32>, now: Instant) -> CaptchaChallenge {
        if let Some(current) = self.deadline.take() {
            if current.kind != ChallengeKind::Captcha {
                self.suspended = Some(current);
            }
        }
        self.deadline = Some(Deadline {
            kind: ChallengeKind::Captcha,
            at: now + self.policy.captcha_timeout,
        });
        CaptchaChallenge {
            id: Uuid::new_v4().to_string(),
            image,
            attempts_remaining: carried.unwrap_or(self.policy.captcha_max_attempts),
            issued_at: Utc::now(),
        }
    }

    /// Captcha solved: restore whatever the captcha interrupted
    pub fn resume(&mut self) {
        self.deadline = self.suspended.take();
    }

    /// Count a wrong submission against `attempts_remaining`
    pub fn record_rejection(&self, kind: ChallengeKind, attempts_remaining: &mut u32) -> AttemptOutcome {
        *attempts_remaining = attempts_remaining.saturating_sub(1);
        if *attempts_remaining == 0 {
            AttemptOutcome::Exhausted(ChallengeFailed {
                kind,
                reason: FailureReason::AttemptsExhausted,
            })
        } else {
            AttemptOutcome::Retry {
                remaining: *attempts_remaining,
            }
        }
    }

    /// Instant the worker must wake up at to enforce the active timeout
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    /// Fire the active timeout if it has passed
    pub fn expire(&mut self, now: Instant) -> Option<ChallengeFailed> {
        match self.deadline {
            Some(deadline) if deadline.at <= now => {
                self.clear();
                Some(ChallengeFailed {
                    kind: deadline.kind,
                    reason: FailureReason::TimedOut,
                })
            }
            _ => None,
        }
    }

    /// Whether a new QR must be requested before the next refresh tick.
    ///
    /// True once the displayed QR would expire before the tick after this one,
    /// so a displayed QR never outlives its advertised expiry.
    pub fn qr_refresh_due(&self, now: Instant) -> bool {
        match self.qr_expires {
            Some(expires) => now + self.policy.qr_refresh_interval >= expires,
            None => true,
        }
    }

    /// Whether the displayed QR is already past its expiry
    pub fn qr_expired(&self, now: Instant) -> bool {
        self.qr_expires.is_some_and(|expires| expires <= now)
    }

    /// Drop every clock (authenticated, failed or stopped)
    pub fn clear(&mut self) {
        self.qr_expires = None;
        self.deadline = None;
        self.suspended = None;
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
