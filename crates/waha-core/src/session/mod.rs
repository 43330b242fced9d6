//! Session module - per-session authentication actors
//!
//! Key components:
//!
//! - `SessionManager`: Registry of named sessions, the only way to create or delete one
//! - `WhatsappSession`: Cloneable handle to one live session
//! - `AuthChallengeCoordinator`: Attempt limits, challenge timeouts and QR cadence
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   SessionManager                      │
//! │                                                       │
//! │  ┌─────────────────────────────────────────────────┐  │
//! │  │  HashMap<SessionName, WhatsappSession>          │  │
//! │  │                                                 │  │
//! │  │  default -> cmd_tx ──▶ [SessionWorker] ◀── engine events
//! │  │                          │    owns EngineAdapter│  │
//! │  │                          ▼                      │  │
//! │  │                   watch<SessionSnapshot> ──────────▶ status / health
//! │  └─────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Each worker handles one input at a time (API command, engine event or
//! timer), so transitions of one session are totally ordered while sessions
//! run in parallel.
//!
//! # Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use waha_core::engine::LoopbackFactory;
//! use waha_core::session::{SessionConfig, SessionManager, SessionStatus};
//!
//! let manager = SessionManager::new(Arc::new(LoopbackFactory::default()));
//! let session = manager.start_session("default", SessionConfig::default()).await?;
//!
//! session.wait_for_status(SessionStatus::ScanQrCode).await;
//! session.request_code("+15551234567", None).await?;
//! session.authorize_code("123456").await?;
//! assert_eq!(session.status(), SessionStatus::Working);
//! ```

mod coordinator;
mod machine;
mod manager;
mod types;
mod whatsapp;
mod worker;

pub use coordinator::{AttemptOutcome, AuthChallengeCoordinator, AuthPolicy, ChallengeFailed, FailureReason};
pub use manager::SessionManager;
pub use types::{
    CaptchaChallenge, Challenge, ChallengeKind, CodeMethod, CodeRequestAck, ImageData, OtpChallenge,
    QrChallenge, QrCode, QrFormat, SessionConfig, SessionName, SessionSnapshot, SessionStatus, Verdict,
};
pub use whatsapp::WhatsappSession;
