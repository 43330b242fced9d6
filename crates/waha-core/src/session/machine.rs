//! Per-session authentication state machine
//!
//! The machine holds the session phase and applies engine events and API
//! outcomes to it. Status and current challenge live in one [`Phase`] value,
//! so a challenge exists exactly when the status is challenge-pending. Every
//! transition is published as a whole [`SessionSnapshot`] on a watch channel;
//! readers never see a half-applied transition.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::coordinator::{AttemptOutcome, AuthChallengeCoordinator, AuthPolicy, ChallengeFailed};
use super::types::{
    CaptchaChallenge, Challenge, ChallengeKind, CodeMethod, OtpChallenge, QrChallenge, QrCode,
    QrFormat, SessionSnapshot, SessionStatus, Verdict,
};
use crate::engine::{EngineError, EngineEvent};
use crate::error::{Error, Result};

pub(crate) const QR_STATES: [SessionStatus; 1] = [SessionStatus::ScanQrCode];
pub(crate) const REQUEST_CODE_STATES: [SessionStatus; 2] =
    [SessionStatus::ScanQrCode, SessionStatus::ScanOtpCode];
pub(crate) const AUTHORIZE_CODE_STATES: [SessionStatus; 1] = [SessionStatus::ScanOtpCode];
pub(crate) const CAPTCHA_STATES: [SessionStatus; 1] = [SessionStatus::CaptchaRequired];

#[derive(Debug)]
enum Phase {
    Starting,
    ScanQr(QrChallenge),
    ScanOtp(OtpChallenge),
    Captcha {
        challenge: CaptchaChallenge,
        /// Phase the captcha interrupted
        resume: Box<Phase>,
    },
    Working,
    Failed,
    Stopped,
}

impl Phase {
    fn status(&self) -> SessionStatus {
        match self {
            Phase::Starting => SessionStatus::Starting,
            Phase::ScanQr(_) => SessionStatus::ScanQrCode,
            Phase::ScanOtp(_) => SessionStatus::ScanOtpCode,
            Phase::Captcha { .. } => SessionStatus::CaptchaRequired,
            Phase::Working => SessionStatus::Working,
            Phase::Failed => SessionStatus::Failed,
            Phase::Stopped => SessionStatus::Stopped,
        }
    }

    fn challenge(&self) -> Option<Challenge> {
        match self {
            Phase::ScanQr(qr) => Some(Challenge::Qr(qr.clone())),
            Phase::ScanOtp(otp) => Some(Challenge::Otp(otp.clone())),
            Phase::Captcha { challenge, .. } => Some(Challenge::Captcha(challenge.clone())),
            _ => None,
        }
    }
}

pub(crate) struct SessionMachine {
    name: String,
    phase: Phase,
    coordinator: AuthChallengeCoordinator,
    state: Arc<watch::Sender<SessionSnapshot>>,
    last_error: Option<String>,
    engine_connected: bool,
    last_seen: Option<DateTime<Utc>>,
}

impl SessionMachine {
    pub fn new(name: impl Into<String>, policy: AuthPolicy, state: Arc<watch::Sender<SessionSnapshot>>) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Starting,
            coordinator: AuthChallengeCoordinator::new(policy),
            state,
            last_error: None,
            engine_connected: false,
            last_seen: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.phase.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether the QR refresh cadence applies right now
    pub fn awaiting_qr(&self) -> bool {
        matches!(self.phase, Phase::ScanQr(_))
    }

    pub fn qr_refresh_due(&self, now: Instant) -> bool {
        self.awaiting_qr() && self.coordinator.qr_refresh_due(now)
    }

    pub fn qr_expired(&self, now: Instant) -> bool {
        self.awaiting_qr() && self.coordinator.qr_expired(now)
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        self.coordinator.policy().qr_refresh_interval
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.coordinator.next_deadline()
    }

    /// Publish the current state as one snapshot
    pub fn publish(&self) {
        let status = self.status();
        let from = self.state.borrow().status;
        if from != status {
            info!(session = %self.name, %from, to = %status, "Session status changed");
        }
        let challenge = self.phase.challenge();
        self.state.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.challenge = challenge;
            snapshot.last_error = self.last_error.clone();
            snapshot.engine_connected = self.engine_connected;
            snapshot.last_seen = self.last_seen;
        });
    }

    fn transition(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish();
    }

    fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// The engine finished starting
    pub fn engine_started(&mut self) {
        self.engine_connected = true;
        self.touch();
        self.publish();
    }

    /// Force the terminal FAILED state, recording `error`
    pub fn fail(&mut self, error: impl Display) {
        if self.is_terminal() {
            return;
        }
        warn!(session = %self.name, error = %error, "Session failed");
        self.last_error = Some(error.to_string());
        self.engine_connected = false;
        self.coordinator.clear();
        self.transition(Phase::Failed);
    }

    fn fail_challenge(&mut self, failed: ChallengeFailed) {
        self.fail(Error::from(failed));
    }

    /// Enter STOPPED. Not published until the worker has released the
    /// engine, so STOPPED is only observable once the session fully stopped.
    pub fn stop(&mut self) {
        self.engine_connected = false;
        self.coordinator.clear();
        self.phase = Phase::Stopped;
    }

    /// An engine call made on behalf of an API request failed; status is kept
    pub fn record_engine_error(&mut self, error: &EngineError) {
        warn!(session = %self.name, error = %error, "Engine call failed");
        self.last_error = Some(Error::EngineFailure(error.clone()).to_string());
        self.publish();
    }

    /// Apply an out-of-band engine event
    pub fn apply_event(&mut self, event: EngineEvent, now: Instant) {
        if self.is_terminal() {
            debug!(session = %self.name, ?event, "Ignoring engine event in terminal state");
            return;
        }
        self.touch();

        match event {
            EngineEvent::QrUpdated { raw, image } => match self.status() {
                SessionStatus::Starting | SessionStatus::ScanQrCode => {
                    let qr = self.coordinator.issue_qr(raw, image, now);
                    self.transition(Phase::ScanQr(qr));
                }
                SessionStatus::CaptchaRequired => {
                    // Solving the captcha lands on the newest QR
                    if let Phase::Captcha { resume, .. } = &mut self.phase {
                        if matches!(**resume, Phase::Starting | Phase::ScanQr(_)) {
                            **resume = Phase::ScanQr(self.coordinator.issue_qr(raw, image, now));
                        }
                    }
                    self.publish();
                }
                status => {
                    debug!(session = %self.name, %status, "Ignoring QR update");
                    self.publish();
                }
            },
            EngineEvent::Authenticated => {
                if self.status() == SessionStatus::Working {
                    self.publish();
                    return;
                }
                self.coordinator.clear();
                self.engine_connected = true;
                self.transition(Phase::Working);
            }
            EngineEvent::CaptchaRequired { image } => {
                match self.status() {
                    SessionStatus::Starting | SessionStatus::ScanQrCode | SessionStatus::ScanOtpCode => {
                        let resume = std::mem::replace(&mut self.phase, Phase::Starting);
                        let challenge = self.coordinator.issue_captcha(image, None, now);
                        self.phase = Phase::Captcha {
                            challenge,
                            resume: Box::new(resume),
                        };
                        self.publish();
                    }
                    SessionStatus::CaptchaRequired => {
                        if let Phase::Captcha { challenge, .. } = &mut self.phase {
                            let carried = Some(challenge.attempts_remaining);
                            *challenge = self.coordinator.issue_captcha(image, carried, now);
                        }
                        self.publish();
                    }
                    status => {
                        warn!(session = %self.name, %status, "Ignoring captcha request");
                        self.publish();
                    }
                }
            }
            EngineEvent::Disconnected { reason } => {
                self.fail(Error::EngineFailure(EngineError::Connection(reason)));
            }
            EngineEvent::FatalError { message } => {
                self.fail(Error::EngineFailure(EngineError::Connection(message)));
            }
        }
    }

    /// The displayed QR lapsed without the engine replacing it
    pub fn qr_lapsed(&mut self) {
        if !self.awaiting_qr() {
            return;
        }
        let lapsed = Error::ChallengeTimeout(ChallengeKind::Qr).to_string();
        if self.last_error.as_deref() != Some(lapsed.as_str()) {
            debug!(session = %self.name, "Displayed QR code expired");
            self.last_error = Some(lapsed);
            self.publish();
        }
    }

    /// Enforce the active challenge timeout
    pub fn on_deadline(&mut self, now: Instant) {
        if let Some(failed) = self.coordinator.expire(now) {
            self.fail_challenge(failed);
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionStatus]) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(Error::invalid_state(operation, allowed, status))
        }
    }

    /// The displayed QR; refused once it is past its advertised expiry
    pub fn qr(&self, format: QrFormat, now: Instant) -> Result<QrCode> {
        let Phase::ScanQr(qr) = &self.phase else {
            return Err(Error::invalid_state("Get QR code", &QR_STATES, self.status()));
        };
        if self.coordinator.qr_expired(now) {
            return Err(Error::ChallengeTimeout(ChallengeKind::Qr));
        }
        match format {
            QrFormat::Raw => Ok(QrCode::Raw(qr.raw.clone())),
            QrFormat::Image => qr.image.clone().map(QrCode::Image).ok_or_else(|| {
                EngineError::Unsupported("engine did not render the QR code".to_string()).into()
            }),
        }
    }

    pub fn captcha(&self) -> Result<CaptchaChallenge> {
        match &self.phase {
            Phase::Captcha { challenge, .. } => Ok(challenge.clone()),
            _ => Err(Error::invalid_state("Get captcha", &CAPTCHA_STATES, self.status())),
        }
    }

    pub fn check_request_code(&self) -> Result<()> {
        self.require("Request code", &REQUEST_CODE_STATES)
    }

    pub fn check_authorize_code(&self) -> Result<()> {
        self.require("Authorize code", &AUTHORIZE_CODE_STATES)
    }

    pub fn check_save_captcha(&self) -> Result<()> {
        self.require("Save captcha", &CAPTCHA_STATES)
    }

    /// The engine accepted a code request
    pub fn code_requested(&mut self, phone_number: String, method: Option<CodeMethod>, now: Instant) {
        let carried = match &self.phase {
            Phase::ScanOtp(otp) => Some(otp.attempts_remaining),
            _ => None,
        };
        self.touch();
        let otp = self.coordinator.issue_otp(phone_number, method, carried, now);
        self.transition(Phase::ScanOtp(otp));
    }

    /// Apply the engine's verdict on a submitted OTP code
    pub fn code_verdict(&mut self, verdict: Verdict) -> Result<()> {
        self.check_authorize_code()?;
        self.touch();

        if verdict == Verdict::Accepted {
            self.coordinator.clear();
            self.engine_connected = true;
            self.transition(Phase::Working);
            return Ok(());
        }

        let status = self.status();
        let outcome = match &mut self.phase {
            Phase::ScanOtp(otp) => self
                .coordinator
                .record_rejection(ChallengeKind::Otp, &mut otp.attempts_remaining),
            _ => return Err(Error::invalid_state("Authorize code", &AUTHORIZE_CODE_STATES, status)),
        };
        self.settle_rejection(ChallengeKind::Otp, outcome)
    }

    /// Apply the engine's verdict on a submitted captcha solution
    pub fn captcha_verdict(&mut self, verdict: Verdict) -> Result<()> {
        self.check_save_captcha()?;
        self.touch();

        if verdict == Verdict::Accepted {
            if let Phase::Captcha { resume, .. } = std::mem::replace(&mut self.phase, Phase::Starting) {
                self.phase = *resume;
            }
            self.coordinator.resume();
            self.publish();
            return Ok(());
        }

        let status = self.status();
        let outcome = match &mut self.phase {
            Phase::Captcha { challenge, .. } => self
                .coordinator
                .record_rejection(ChallengeKind::Captcha, &mut challenge.attempts_remaining),
            _ => return Err(Error::invalid_state("Save captcha", &CAPTCHA_STATES, status)),
        };
        self.settle_rejection(ChallengeKind::Captcha, outcome)
    }

    fn settle_rejection(&mut self, kind: ChallengeKind, outcome: AttemptOutcome) -> Result<()> {
        match outcome {
            AttemptOutcome::Retry { remaining } => {
                debug!(session = %self.name, %kind, remaining, "Wrong code submitted");
                self.publish();
                Err(Error::InvalidCode {
                    kind,
                    attempts_remaining: remaining,
                })
            }
            AttemptOutcome::Exhausted(failed) => {
                self.fail_challenge(failed);
                Err(failed.into())
            }
        }
    }
}
