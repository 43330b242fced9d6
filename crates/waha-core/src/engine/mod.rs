//! Engine contract
//!
//! An engine is the automation connection that actually talks to WhatsApp Web
//! for one session. The orchestration core never looks inside it: it calls the
//! [`EngineAdapter`] methods from the session's worker task and consumes the
//! [`EngineEvent`]s the engine pushes back through the channel handed over in
//! [`EngineAdapter::start`].

pub mod loopback;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::{CodeMethod, CodeRequestAck, ImageData, SessionConfig, Verdict};

pub use loopback::{EngineCall, LoopbackController, LoopbackEngine, LoopbackFactory, LoopbackOptions};

/// Result type for engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Channel the engine uses to push out-of-band events to its session
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiving side of the engine event channel, owned by the session worker
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Engine-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Engine rejected the request: {0}")]
    Rejected(String),

    #[error("Not supported by this engine: {0}")]
    Unsupported(String),

    #[error("Engine is not running")]
    NotRunning,
}

/// Events emitted by an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A new QR pairing payload is available; supersedes the previous one
    QrUpdated { raw: String, image: Option<ImageData> },
    /// The phone confirmed the pairing
    Authenticated,
    /// The network wants a captcha solved before continuing
    CaptchaRequired { image: ImageData },
    /// The connection dropped
    Disconnected { reason: String },
    /// The engine hit an unrecoverable error
    FatalError { message: String },
}

/// One automation engine instance, exclusively owned by a single session
#[async_trait]
pub trait EngineAdapter: Send {
    /// Engine implementation name, for logs
    fn name(&self) -> &str;

    /// Connect and start pushing events into `events`
    async fn start(&mut self, events: EngineEventSender) -> EngineResult<()>;

    /// Disconnect and release every resource held by the engine
    async fn stop(&mut self) -> EngineResult<()>;

    /// Ask for a fresh QR code; the engine answers with `QrUpdated`
    async fn request_qr(&mut self) -> EngineResult<()>;

    /// Ask the network to deliver a one-time code to `phone`
    async fn send_code(&mut self, phone: &str, method: Option<CodeMethod>) -> EngineResult<CodeRequestAck>;

    /// Submit the one-time code the user received
    async fn submit_code(&mut self, code: &str) -> EngineResult<Verdict>;

    /// Submit the captcha solution
    async fn submit_captcha(&mut self, code: &str) -> EngineResult<Verdict>;
}

/// Creates one engine per session
pub trait EngineFactory: Send + Sync {
    fn create(&self, session: &str, config: &SessionConfig) -> Result<Box<dyn EngineAdapter>>;
}
