//! Loopback engine: an in-memory engine driven by a controller.
//!
//! Nothing leaves the process. The controller injects engine events and
//! decides which OTP and captcha codes are accepted, which makes the session
//! state machine drivable from tests and from the CLI.
//!
//! # Example
//!
//! ```ignore
//! let factory = Arc::new(LoopbackFactory::new(LoopbackOptions::default()));
//! let manager = SessionManager::new(factory.clone());
//! manager.start_session("default", SessionConfig::default()).await?;
//!
//! let controller = factory.controller("default").unwrap();
//! controller.emit_qr("2@pairing-payload");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{EngineAdapter, EngineError, EngineEvent, EngineEventSender, EngineFactory, EngineResult};
use crate::error::Result;
use crate::session::{CodeMethod, CodeRequestAck, ImageData, SessionConfig, Verdict};

/// Pairing code handed out when no SMS/voice method is requested
const PAIRING_CODE: &str = "LOOP-BACK";

/// Behaviour knobs for loopback engines
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// OTP code `submit_code` accepts
    pub otp_code: String,
    /// Captcha solution `submit_captcha` accepts
    pub captcha_code: String,
    /// Emit a QR right after `start` and on every `request_qr`
    pub emit_qr: bool,
    /// Make `start` fail with this connection error
    pub fail_start: Option<String>,
    /// Hold `start` open until the gate is notified
    pub start_gate: Option<Arc<Notify>>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            otp_code: "123456".to_string(),
            captcha_code: "captcha".to_string(),
            emit_qr: false,
            fail_start: None,
            start_gate: None,
        }
    }
}

impl LoopbackOptions {
    pub fn with_otp_code(mut self, code: impl Into<String>) -> Self {
        self.otp_code = code.into();
        self
    }

    pub fn with_captcha_code(mut self, code: impl Into<String>) -> Self {
        self.captcha_code = code.into();
        self
    }

    pub fn with_emit_qr(mut self, emit: bool) -> Self {
        self.emit_qr = emit;
        self
    }

    pub fn with_fail_start(mut self, reason: impl Into<String>) -> Self {
        self.fail_start = Some(reason.into());
        self
    }

    pub fn with_start_gate(mut self, gate: Arc<Notify>) -> Self {
        self.start_gate = Some(gate);
        self
    }
}

/// A call the session made into the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start,
    Stop,
    RequestQr,
    SendCode { phone: String, method: Option<CodeMethod> },
    SubmitCode(String),
    SubmitCaptcha(String),
}

#[derive(Debug)]
struct LoopbackState {
    options: LoopbackOptions,
    events: Option<EngineEventSender>,
    /// Events injected before `start` handed us a channel
    pending: Vec<EngineEvent>,
    running: bool,
    qr_counter: u64,
    calls: Vec<EngineCall>,
}

impl LoopbackState {
    fn push(&mut self, event: EngineEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                self.pending.push(event);
                true
            }
        }
    }

    fn next_qr(&mut self) -> EngineEvent {
        self.qr_counter += 1;
        EngineEvent::QrUpdated {
            raw: format!("loopback-qr-{}", self.qr_counter),
            image: Some(ImageData::png(format!("png:loopback-qr-{}", self.qr_counter).into_bytes())),
        }
    }
}

/// In-memory engine
pub struct LoopbackEngine {
    shared: Arc<Mutex<LoopbackState>>,
}

impl LoopbackEngine {
    /// Create an engine and the controller that drives it
    pub fn new(options: LoopbackOptions) -> (Self, LoopbackController) {
        let shared = Arc::new(Mutex::new(LoopbackState {
            options,
            events: None,
            pending: Vec::new(),
            running: false,
            qr_counter: 0,
            calls: Vec::new(),
        }));
        let controller = LoopbackController {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, controller)
    }

    fn record(&self, call: EngineCall) -> parking_lot::MutexGuard<'_, LoopbackState> {
        let mut state = self.shared.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl EngineAdapter for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn start(&mut self, events: EngineEventSender) -> EngineResult<()> {
        let gate = self.record(EngineCall::Start).options.start_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.shared.lock();
        if let Some(reason) = state.options.fail_start.clone() {
            return Err(EngineError::Connection(reason));
        }

        for event in state.pending.drain(..) {
            let _ = events.send(event);
        }
        state.events = Some(events);
        state.running = true;

        if state.options.emit_qr {
            let qr = state.next_qr();
            state.push(qr);
        }
        Ok(())
    }

    async fn stop(&mut self) -> EngineResult<()> {
        let mut state = self.record(EngineCall::Stop);
        state.running = false;
        state.events = None;
        Ok(())
    }

    async fn request_qr(&mut self) -> EngineResult<()> {
        let mut state = self.record(EngineCall::RequestQr);
        if !state.running {
            return Err(EngineError::NotRunning);
        }
        if state.options.emit_qr {
            let qr = state.next_qr();
            state.push(qr);
        }
        Ok(())
    }

    async fn send_code(&mut self, phone: &str, method: Option<CodeMethod>) -> EngineResult<CodeRequestAck> {
        let state = self.record(EngineCall::SendCode {
            phone: phone.to_string(),
            method,
        });
        if !state.running {
            return Err(EngineError::NotRunning);
        }

        let digits = phone.strip_prefix('+').unwrap_or(phone);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::Rejected(format!("invalid phone number '{}'", phone)));
        }

        debug!(phone, ?method, "Loopback engine sent code");
        Ok(CodeRequestAck {
            method,
            code: method.is_none().then(|| PAIRING_CODE.to_string()),
        })
    }

    async fn submit_code(&mut self, code: &str) -> EngineResult<Verdict> {
        let state = self.record(EngineCall::SubmitCode(code.to_string()));
        if !state.running {
            return Err(EngineError::NotRunning);
        }
        Ok(if code == state.options.otp_code {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        })
    }

    async fn submit_captcha(&mut self, code: &str) -> EngineResult<Verdict> {
        let state = self.record(EngineCall::SubmitCaptcha(code.to_string()));
        if !state.running {
            return Err(EngineError::NotRunning);
        }
        Ok(if code == state.options.captcha_code {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        })
    }
}

/// Handle for injecting events into, and inspecting, a loopback engine
#[derive(Clone)]
pub struct LoopbackController {
    shared: Arc<Mutex<LoopbackState>>,
}

impl LoopbackController {
    /// Push an engine event; queued until the engine is started.
    ///
    /// Returns false when the session side of the channel is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.shared.lock().push(event)
    }

    pub fn emit_qr(&self, raw: impl Into<String>) -> bool {
        self.emit(EngineEvent::QrUpdated {
            raw: raw.into(),
            image: None,
        })
    }

    pub fn authenticate(&self) -> bool {
        self.emit(EngineEvent::Authenticated)
    }

    pub fn require_captcha(&self, image: ImageData) -> bool {
        self.emit(EngineEvent::CaptchaRequired { image })
    }

    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        self.emit(EngineEvent::Disconnected { reason: reason.into() })
    }

    pub fn fatal(&self, message: impl Into<String>) -> bool {
        self.emit(EngineEvent::FatalError { message: message.into() })
    }

    /// Change the OTP code the engine accepts
    pub fn set_otp_code(&self, code: impl Into<String>) {
        self.shared.lock().options.otp_code = code.into();
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Every call the session made, in order
    pub fn calls(&self) -> Vec<EngineCall> {
        self.shared.lock().calls.clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.shared.lock().calls.iter().filter(|c| *c == call).count()
    }
}

/// Factory producing loopback engines and keeping their controllers by session name
pub struct LoopbackFactory {
    options: LoopbackOptions,
    controllers: Mutex<HashMap<String, LoopbackController>>,
}

impl LoopbackFactory {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Controller of the most recent engine created for `session`
    pub fn controller(&self, session: &str) -> Option<LoopbackController> {
        self.controllers.lock().get(session).cloned()
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl EngineFactory for LoopbackFactory {
    fn create(&self, session: &str, _config: &SessionConfig) -> Result<Box<dyn EngineAdapter>> {
        let (engine, controller) = LoopbackEngine::new(self.options.clone());
        self.controllers.lock().insert(session.to_string(), controller);
        Ok(Box::new(engine))
    }
}
