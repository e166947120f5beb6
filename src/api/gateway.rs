//! Per-connection protocol handling
//!
//! The gateway does not know about sockets: it reads [`Inbound`] items from
//! a stream and writes [`Outbound`] items to a channel. The websocket route
//! adapts an axum socket to this shape; tests drive it directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::auth::TokenValidator;
use super::protocol::{ClientMessage, ServerEvent, parse_client_message};
use crate::session::{
    SessionEvent, SessionMachine, SessionMode, SessionRegistry, SessionSummary,
};
use crate::{Error, Result};

/// Close codes sent by the gateway
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const UNAUTHORIZED: u16 = 4001;
    pub const SESSION_NOT_FOUND: u16 = 4004;
    pub const SESSION_EXPIRED: u16 = 4008;
}

/// Something received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Binary frame of PCM audio
    Audio(Vec<u8>),
    /// Text frame holding a JSON control message
    Control(String),
    /// The client went away
    Close,
}

/// Something to send to the client
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}

/// Serves interaction connections against the session registry
pub struct ProtocolGateway {
    registry: Arc<SessionRegistry>,
    validator: Arc<TokenValidator>,
    idle_timeout: Duration,
}

/// Live link to one client
struct Connection {
    tx: mpsc::UnboundedSender<Outbound>,
    last_activity: Mutex<Instant>,
    alive: AtomicBool,
}

impl Connection {
    fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            last_activity: Mutex::new(Instant::now()),
            alive: AtomicBool::new(true),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        *self.last_activity.lock() + idle_timeout
    }

    fn send(&self, event: ServerEvent) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::Protocol("connection closed".to_string()));
        }
        tracing::trace!(event = event.kind(), "outbound event");
        self.tx
            .send(Outbound::Event(event))
            .map_err(|_| Error::Protocol("connection closed".to_string()))?;
        self.touch();
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

enum Flow {
    Continue,
    Close,
}

fn reject(tx: &mpsc::UnboundedSender<Outbound>, code: u16, reason: &str) {
    let _ = tx.send(Outbound::Close {
        code,
        reason: reason.to_string(),
    });
}

impl ProtocolGateway {
    #[must_use]
    pub const fn new(
        registry: Arc<SessionRegistry>,
        validator: Arc<TokenValidator>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            validator,
            idle_timeout,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one connection to completion
    ///
    /// Authenticates, attaches to the session and pumps messages until the
    /// client leaves, ends the session, or goes idle.
    pub async fn serve<S>(
        &self,
        session_id: &str,
        token: Option<&str>,
        inbound: S,
        tx: mpsc::UnboundedSender<Outbound>,
    ) where
        S: Stream<Item = Inbound> + Send,
    {
        let auth = self.validator.validate(token);
        if !auth.valid {
            tracing::warn!(session_id, "rejecting connection: invalid token");
            reject(&tx, close_code::UNAUTHORIZED, "unauthorized");
            return;
        }

        let machine = match self.registry.get(session_id).await {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                tracing::warn!(session_id, "rejecting connection: session not found");
                reject(&tx, close_code::SESSION_NOT_FOUND, "session not found");
                return;
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "session lookup failed");
                reject(&tx, close_code::INTERNAL_ERROR, "session lookup failed");
                return;
            }
        };

        if let Some(subject) = &auth.subject {
            if *subject != machine.snapshot().parent_id {
                tracing::warn!(session_id, subject = %subject, "rejecting connection: token subject does not own session");
                reject(&tx, close_code::UNAUTHORIZED, "unauthorized");
                return;
            }
        }

        let conn = Arc::new(Connection::new(tx));
        let subscription = {
            let conn = Arc::clone(&conn);
            machine.subscribe(Arc::new(move |event: &SessionEvent| {
                match ServerEvent::from_session_event(event) {
                    Some(server_event) => conn.send(server_event),
                    None => Ok(()),
                }
            }))
        };
        machine.attach();
        tracing::info!(session_id, "interaction connected");

        let established = ServerEvent::ConnectionEstablished {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        };
        if conn.send(established).is_ok() {
            self.pump(&machine, &conn, inbound).await;
        }

        machine.unsubscribe(subscription);
        machine.detach();
        conn.close(close_code::NORMAL, "closed");
        tracing::info!(session_id, "interaction disconnected");
    }

    async fn pump<S>(&self, machine: &Arc<SessionMachine>, conn: &Connection, inbound: S)
    where
        S: Stream<Item = Inbound> + Send,
    {
        let mut inbound = std::pin::pin!(inbound);

        loop {
            let deadline = conn.idle_deadline(self.idle_timeout);
            tokio::select! {
                item = inbound.next() => {
                    let Some(item) = item else { return };
                    conn.touch();
                    let flow = match item {
                        Inbound::Close => {
                            tracing::debug!(session_id = %machine.id(), "client closed connection");
                            return;
                        }
                        Inbound::Audio(bytes) => {
                            Self::handle_audio(machine, conn, &bytes);
                            Flow::Continue
                        }
                        Inbound::Control(text) => self.handle_control(machine, conn, &text).await,
                    };
                    if matches!(flow, Flow::Close) {
                        return;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    // outbound events may have moved the deadline meanwhile
                    if conn.idle_deadline(self.idle_timeout) <= Instant::now() {
                        tracing::info!(session_id = %machine.id(), "connection idle, expiring");
                        let _ = conn.send(ServerEvent::error(
                            "session_expired",
                            "connection was idle for too long",
                            false,
                        ));
                        conn.close(close_code::SESSION_EXPIRED, "session expired");
                        return;
                    }
                }
            }
        }
    }

    fn handle_audio(machine: &Arc<SessionMachine>, conn: &Connection, bytes: &[u8]) {
        if let Err(e) = machine.process_audio(bytes) {
            tracing::debug!(session_id = %machine.id(), error = %e, "audio rejected");
            let _ = conn.send(ServerEvent::error(e.code(), e.to_string(), true));
        }
    }

    async fn handle_control(
        &self,
        machine: &Arc<SessionMachine>,
        conn: &Connection,
        text: &str,
    ) -> Flow {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(session_id = %machine.id(), code = e.code, "bad control message");
                let _ = conn.send(ServerEvent::error(e.code, e.message, true));
                return Flow::Continue;
            }
        };

        match self.dispatch(machine, conn, message).await {
            Ok(flow) => flow,
            Err(e) => {
                tracing::debug!(session_id = %machine.id(), error = %e, "control message failed");
                let _ = conn.send(ServerEvent::error(e.code(), e.to_string(), true));
                Flow::Continue
            }
        }
    }

    async fn dispatch(
        &self,
        machine: &Arc<SessionMachine>,
        conn: &Connection,
        message: ClientMessage,
    ) -> Result<Flow> {
        match message {
            ClientMessage::StartListening => machine.switch_mode(SessionMode::Interactive).await?,
            ClientMessage::StopListening => machine.switch_mode(SessionMode::Passive).await?,
            ClientMessage::SpeechStarted => machine.begin_speech()?,
            ClientMessage::SpeechEnded { duration_ms } => machine.end_speech(duration_ms)?,
            ClientMessage::InterruptAi => {
                let marker = machine.interrupt_ai();
                conn.send(ServerEvent::AiResponseCompleted {
                    response_id: marker.id,
                    was_interrupted: true,
                    timestamp: Utc::now(),
                })?;
            }
            ClientMessage::PauseSession => machine.pause().await?,
            ClientMessage::ResumeSession => machine.resume()?,
            ClientMessage::EndSession => {
                let summary = self.end_session(machine).await;
                let _ = conn.send(ServerEvent::session_ended(&summary));
                conn.close(close_code::NORMAL, "session ended");
                return Ok(Flow::Close);
            }
            ClientMessage::UpdateContext(update) => machine.update_context(update)?,
            ClientMessage::Ping => conn.send(ServerEvent::Pong {
                timestamp: Utc::now(),
            })?,
            ClientMessage::StartCalibration => machine.start_calibration()?,
            ClientMessage::CompleteCalibration => {
                machine.complete_calibration()?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn end_session(&self, machine: &Arc<SessionMachine>) -> SessionSummary {
        match self.registry.end_session(machine.id()).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(session_id = %machine.id(), error = %e, "session could not be finalized");
                let snapshot = machine.snapshot();
                SessionSummary {
                    session_id: snapshot.id,
                    status: snapshot.status,
                    transcript_id: None,
                    turn_count: machine.history().len(),
                    total_duration_ms: 0,
                }
            }
        }
    }
}
