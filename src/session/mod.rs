//! Session lifecycle: state machine, events, persistence seams and registry

mod events;
mod machine;
mod registry;
mod store;
mod types;

pub use events::{EventHandler, EventHub, SessionEvent, SubscriptionId};
pub use machine::{CalibrationSettings, SessionConfig, SessionMachine, SessionServices};
pub use registry::SessionRegistry;
pub use store::{SessionStore, TranscriptRecord, TranscriptSink};
pub use types::{
    ContextUpdate, NewSession, Session, SessionMode, SessionStatus, SessionSummary, VoiceSegment,
};
