//! Story Voice Gateway - real-time voice sessions for interactive storytelling
//!
//! A child listens to a story and can talk back. Each session turns a
//! bidirectional audio/control stream into turn-based, content-safe AI
//! dialogue:
//! - Voice activity detection with ambient noise calibration
//! - Streaming transcription against pluggable STT backends
//! - Content safety filtering of child input and AI output
//! - AI replies with retry, fallback and cancel-on-interrupt
//! - A per-session state machine and a WebSocket protocol gateway
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Client (audio frames + JSON control)          │
//! └────────────────────┬────────────────────────────────┘
//!                      │ /ws/interaction/{sessionId}
//! ┌────────────────────▼────────────────────────────────┐
//! │   Protocol Gateway  │  Session Registry              │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Session Machine                       │
//! │   VAD  │  Transcription  │  AI Responder  │  Safety  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   SQLite store  │  STT provider  │  LLM provider     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod ai;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod safety;
pub mod session;
pub mod voice;

pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use safety::{ContentCategory, ContentFilter, FilterContext, FilterResult};
pub use session::{SessionMachine, SessionRegistry};
