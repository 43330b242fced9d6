//! WhatsappSession - the live handle of one named session
//!
//! Handles are cheap to clone and all clones observe the same live state.
//! Reads (`status`, `snapshot`) borrow the latest published snapshot; every
//! other operation is forwarded to the session worker, which applies it under
//! the session's single transition order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::machine::{
    SessionMachine, AUTHORIZE_CODE_STATES, CAPTCHA_STATES, QR_STATES, REQUEST_CODE_STATES,
};
use super::types::{
    CaptchaChallenge, CodeMethod, CodeRequestAck, QrCode, QrFormat, SessionConfig, SessionSnapshot,
    SessionStatus,
};
use super::worker::{Command, Reply, SessionWorker};
use crate::engine::EngineAdapter;
use crate::error::{Error, Result};

/// Commands buffered per session before callers wait
const COMMAND_BUFFER: usize = 32;

struct Inner {
    name: String,
    config: SessionConfig,
    commands: mpsc::Sender<Command>,
    state: Arc<watch::Sender<SessionSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running session
#[derive(Clone)]
pub struct WhatsappSession {
    inner: Arc<Inner>,
}

impl WhatsappSession {
    /// Spawn the session worker around `engine`; the session starts in STARTING
    pub(crate) fn spawn(name: &str, config: SessionConfig, engine: Box<dyn EngineAdapter>) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::starting(name));
        let state = Arc::new(state_tx);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let machine = SessionMachine::new(name, config.auth.clone(), Arc::clone(&state));
        let worker = SessionWorker::new(name.to_string(), engine, machine, command_rx);
        let task = tokio::spawn(worker.run());

        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                config,
                commands,
                state,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.inner.state.borrow().status
    }

    /// Current status, challenge, error and liveness
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `status` or a terminal state
    pub async fn wait_for_status(&self, status: SessionStatus) -> SessionSnapshot {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.status == status || s.status.is_terminal()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Current QR code; only in SCAN_QR_CODE
    pub async fn get_qr(&self, format: QrFormat) -> Result<QrCode> {
        self.call("Get QR code", &QR_STATES, |reply| Command::GetQr { format, reply })
            .await
    }

    /// Ask the engine to send a one-time code to `phone_number`
    pub async fn request_code(&self, phone_number: &str, method: Option<CodeMethod>) -> Result<CodeRequestAck> {
        let phone_number = phone_number.trim().to_string();
        if phone_number.is_empty() {
            return Err(Error::InvalidRequest("phone number must not be empty".to_string()));
        }
        self.call("Request code", &REQUEST_CODE_STATES, |reply| Command::RequestCode {
            phone_number,
            method,
            reply,
        })
        .await
    }

    /// Submit the one-time code; WORKING on success
    pub async fn authorize_code(&self, code: &str) -> Result<()> {
        let code = non_empty_code(code)?;
        self.call("Authorize code", &AUTHORIZE_CODE_STATES, |reply| Command::AuthorizeCode {
            code,
            reply,
        })
        .await
    }

    /// Current captcha; only in CAPTCHA_REQUIRED
    pub async fn get_captcha(&self) -> Result<CaptchaChallenge> {
        self.call("Get captcha", &CAPTCHA_STATES, |reply| Command::GetCaptcha { reply })
            .await
    }

    /// Submit the captcha solution; resumes the interrupted flow on success
    pub async fn save_captcha(&self, code: &str) -> Result<()> {
        let code = non_empty_code(code)?;
        self.call("Save captcha", &CAPTCHA_STATES, |reply| Command::SaveCaptcha { code, reply })
            .await
    }

    /// Stop the session and release its engine. Safe from any state, idempotent.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.inner.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = done.await;
        }

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session = %self.inner.name, error = %e, "Session worker panicked");
            }
        }

        self.inner.state.send_modify(|snapshot| snapshot.mark_stopped());
        debug!(session = %self.inner.name, "Session stopped");
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        allowed: &[SessionStatus],
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        if self.inner.commands.send(command(reply)).await.is_err() {
            // Worker is gone: the session is terminal
            return Err(Error::invalid_state(operation, allowed, self.status()));
        }
        response
            .await
            .unwrap_or_else(|_| Err(Error::invalid_state(operation, allowed, self.status())))
    }
}

fn non_empty_code(code: &str) -> Result<String> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::InvalidRequest("code must not be empty".to_string()));
    }
    Ok(code.to_string())
}

impl fmt::Debug for WhatsappSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsappSession")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
