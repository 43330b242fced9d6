//! Session worker - the task that owns one engine
//!
//! The worker is the only code path that touches the session's engine and the
//! only writer of the session state while it runs. API calls arrive as
//! [`Command`]s, engine events through the engine event channel, and timers
//! (challenge timeouts, QR refresh) are polled in the same `select!` loop.
//! Handling one input at a time is the transition lock: an API call and a
//! racing engine event are strictly ordered, first received wins.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::machine::{
    SessionMachine, AUTHORIZE_CODE_STATES, CAPTCHA_STATES, QR_STATES, REQUEST_CODE_STATES,
};
use super::types::{CaptchaChallenge, CodeMethod, CodeRequestAck, QrCode, QrFormat};
use crate::engine::{EngineAdapter, EngineEventReceiver, EngineEventSender};
use crate::error::{Error, Result};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent from a session handle to its worker
pub(crate) enum Command {
    GetQr {
        format: QrFormat,
        reply: Reply<QrCode>,
    },
    GetCaptcha {
        reply: Reply<CaptchaChallenge>,
    },
    RequestCode {
        phone_number: String,
        method: Option<CodeMethod>,
        reply: Reply<CodeRequestAck>,
    },
    AuthorizeCode {
        code: String,
        reply: Reply<()>,
    },
    SaveCaptcha {
        code: String,
        reply: Reply<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// How engine startup ended
enum Startup {
    Started,
    StopRequested(oneshot::Sender<()>),
    Abandoned,
}

pub(crate) struct SessionWorker {
    name: String,
    engine: Box<dyn EngineAdapter>,
    machine: SessionMachine,
    commands: mpsc::Receiver<Command>,
    events: EngineEventReceiver,
    events_tx: EngineEventSender,
    /// Engine-bound commands received while the engine was still starting
    deferred: VecDeque<Command>,
}

impl SessionWorker {
    pub fn new(
        name: String,
        engine: Box<dyn EngineAdapter>,
        machine: SessionMachine,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            name,
            engine,
            machine,
            commands,
            events,
            events_tx,
            deferred: VecDeque::new(),
        }
    }

    /// Run until the session is stopped, fails, or every handle is dropped.
    ///
    /// The engine is stopped before this returns and dropped with the worker.
    pub async fn run(mut self) {
        info!(session = %self.name, engine = self.engine.name(), "Session worker starting");

        let stop_reply = match self.start_engine().await {
            Startup::Started => self.drive().await,
            Startup::StopRequested(reply) => {
                self.machine.stop();
                Some(reply)
            }
            Startup::Abandoned => {
                self.machine.stop();
                None
            }
        };

        self.reject_deferred();
        self.release_engine().await;
        self.machine.publish();
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        info!(session = %self.name, status = %self.machine.status(), "Session worker ended");
    }

    /// Start the engine while still answering reads and honouring Stop
    async fn start_engine(&mut self) -> Startup {
        let outcome = {
            let start = self.engine.start(self.events_tx.clone());
            tokio::pin!(start);

            loop {
                tokio::select! {
                    result = &mut start => break Ok(result),
                    Some(event) = self.events.recv() => {
                        self.machine.apply_event(event, Instant::now());
                    }
                    command = self.commands.recv() => match command {
                        None => break Err(Startup::Abandoned),
                        Some(Command::Stop { reply }) => break Err(Startup::StopRequested(reply)),
                        Some(Command::GetQr { format, reply }) => {
                            let _ = reply.send(self.machine.qr(format, Instant::now()));
                        }
                        Some(Command::GetCaptcha { reply }) => {
                            let _ = reply.send(self.machine.captcha());
                        }
                        Some(command) => self.deferred.push_back(command),
                    },
                }
            }
        };

        match outcome {
            Ok(Ok(())) => {
                debug!(session = %self.name, "Engine started");
                self.machine.engine_started();
                Startup::Started
            }
            Ok(Err(e)) => {
                self.machine.fail(Error::EngineFailure(e));
                Startup::Started
            }
            Err(startup) => {
                debug!(session = %self.name, "Engine startup cancelled");
                startup
            }
        }
    }

    /// Replay commands deferred during startup, then serve until a terminal state.
    ///
    /// Returns the Stop reply when the session ended on request.
    async fn drive(&mut self) -> Option<oneshot::Sender<()>> {
        // Events the engine pushed while starting come before deferred commands
        while let Ok(event) = self.events.try_recv() {
            self.machine.apply_event(event, Instant::now());
        }

        while !self.machine.is_terminal() {
            let Some(command) = self.deferred.pop_front() else {
                break;
            };
            if let Some(reply) = self.handle_command(command).await {
                return Some(reply);
            }
        }

        let interval = self.machine.refresh_interval();
        let mut refresh = tokio::time::interval_at(Instant::now() + interval, interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.machine.is_terminal() {
            let deadline = self.machine.next_deadline();
            let awaiting_qr = self.machine.awaiting_qr();

            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        debug!(session = %self.name, "All session handles dropped");
                        self.machine.stop();
                    }
                    Some(command) => {
                        if let Some(reply) = self.handle_command(command).await {
                            return Some(reply);
                        }
                    }
                },
                Some(event) = self.events.recv() => {
                    self.machine.apply_event(event, Instant::now());
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.machine.on_deadline(Instant::now());
                }
                _ = refresh.tick(), if awaiting_qr => {
                    self.refresh_qr().await;
                }
            }
        }
        None
    }

    /// Handle one command. Returns the Stop reply when the session must end.
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::GetQr { format, reply } => {
                let _ = reply.send(self.machine.qr(format, Instant::now()));
            }
            Command::GetCaptcha { reply } => {
                let _ = reply.send(self.machine.captcha());
            }
            Command::RequestCode {
                phone_number,
                method,
                reply,
            } => {
                let _ = reply.send(self.request_code(phone_number, method).await);
            }
            Command::AuthorizeCode { code, reply } => {
                let _ = reply.send(self.authorize_code(&code).await);
            }
            Command::SaveCaptcha { code, reply } => {
                let _ = reply.send(self.save_captcha(&code).await);
            }
            Command::Stop { reply } => {
                self.machine.stop();
                return Some(reply);
            }
        }
        None
    }

    // Engine failures on API-triggered calls are returned to the caller
    // (EngineFailure) and recorded as the last error; the status is kept.
    async fn request_code(&mut self, phone_number: String, method: Option<CodeMethod>) -> Result<CodeRequestAck> {
        self.machine.check_request_code()?;
        match self.engine.send_code(&phone_number, method).await {
            Ok(ack) => {
                self.machine.code_requested(phone_number, method, Instant::now());
                Ok(ack)
            }
            Err(e) => {
                self.machine.record_engine_error(&e);
                Err(e.into())
            }
        }
    }

    async fn authorize_code(&mut self, code: &str) -> Result<()> {
        self.machine.check_authorize_code()?;
        match self.engine.submit_code(code).await {
            Ok(verdict) => self.machine.code_verdict(verdict),
            Err(e) => {
                self.machine.record_engine_error(&e);
                Err(e.into())
            }
        }
    }

    async fn save_captcha(&mut self, code: &str) -> Result<()> {
        self.machine.check_save_captcha()?;
        let verdict = match self.engine.submit_captcha(code).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.machine.record_engine_error(&e);
                return Err(e.into());
            }
        };
        self.machine.captcha_verdict(verdict)?;

        // Resuming to a QR that expired while the captcha was pending
        if self.machine.qr_expired(Instant::now()) {
            self.refresh_qr().await;
        }
        Ok(())
    }

    async fn refresh_qr(&mut self) {
        if !self.machine.qr_refresh_due(Instant::now()) {
            return;
        }
        debug!(session = %self.name, "Requesting QR refresh");
        if let Err(e) = self.engine.request_qr().await {
            self.machine.record_engine_error(&e);
        }

        // The engine answers with QrUpdated; until then an expired QR is not served
        if self.machine.qr_expired(Instant::now()) {
            self.machine.qr_lapsed();
        }
    }

    /// Answer commands still queued when the session ends
    fn reject_deferred(&mut self) {
        let status = self.machine.status();
        for command in self.deferred.drain(..) {
            match command {
                Command::GetQr { reply, .. } => {
                    let _ = reply.send(Err(Error::invalid_state("Get QR code", &QR_STATES, status)));
                }
                Command::GetCaptcha { reply } => {
                    let _ = reply.send(Err(Error::invalid_state("Get captcha", &CAPTCHA_STATES, status)));
                }
                Command::RequestCode { reply, .. } => {
                    let _ = reply.send(Err(Error::invalid_state("Request code", &REQUEST_CODE_STATES, status)));
                }
                Command::AuthorizeCode { reply, .. } => {
                    let _ = reply.send(Err(Error::invalid_state(
                        "Authorize code",
                        &AUTHORIZE_CODE_STATES,
                        status,
                    )));
                }
                Command::SaveCaptcha { reply, .. } => {
                    let _ = reply.send(Err(Error::invalid_state("Save captcha", &CAPTCHA_STATES, status)));
                }
                Command::Stop { reply } => {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn release_engine(&mut self) {
        if let Err(e) = self.engine.stop().await {
            warn!(session = %self.name, error = %e, "Engine did not stop cleanly");
        }
    }
}
