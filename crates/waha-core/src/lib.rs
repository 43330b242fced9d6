//! WAHA Core - WhatsApp session orchestration
//!
//! This crate provides the core functionality behind the WAHA API:
//! - A registry of named sessions, each driving its own engine connection
//! - The per-session authentication state machine (QR, OTP, captcha)
//! - Attempt limits, challenge timeouts and QR refresh cadence
//! - Aggregate health reporting
//! - A transport-agnostic router table for the HTTP surface

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod session;

pub use api::{ApiContext, ApiRequest, ApiResponse, Endpoint, Method, Router};
pub use config::{Config, ConfigManager, SessionEntry};
pub use engine::{EngineAdapter, EngineError, EngineEvent, EngineFactory, LoopbackFactory, LoopbackOptions};
pub use error::{Error, Result};
pub use health::{HealthAggregator, HealthPolicy, HealthReport, HealthStatus, SessionHealth};

// Session exports
pub use session::{
    AuthPolicy, Challenge, ChallengeKind, CodeMethod, QrCode, QrFormat, SessionConfig, SessionManager,
    SessionSnapshot, SessionStatus, WhatsappSession,
};
