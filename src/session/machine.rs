//! Per-session state machine
//!
//! `SessionMachine` is the only writer of session state. Its lock is a
//! plain mutex held for short synchronous sections; every backend call, STT
//! stop and generation happens after the lock is released, so pause and
//! interrupt requests are never stuck behind a slow provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{EventHandler, EventHub, SessionEvent, SubscriptionId};
use super::store::{SessionStore, TranscriptRecord, TranscriptSink};
use super::types::{
    ContextUpdate, Session, SessionMode, SessionStatus, SessionSummary, VoiceSegment,
};
use crate::ai::{
    AiResponder, AiResponse, ConversationContext, LlmBackend, ResponderConfig, Speaker,
    TriggerType, Turn,
};
use crate::voice::transcription::final_for_flush;
use crate::voice::{
    AudioSink, CalibrationResult, FrameAssembler, SttBackend, TranscriptionConfig,
    TranscriptionCoordinator, VadConfig, VadEngine, VadEvent,
};
use crate::{Error, Result};

/// Calibration phase settings
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// How long the client should record ambient noise
    pub duration_ms: u64,
    /// Frames kept for calibration; extra frames are dropped
    pub max_frames: usize,
    /// Text shown to the child while calibrating
    pub instructions: String,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            duration_ms: 3000,
            max_frames: 1000,
            instructions: "請保持安靜三秒鐘，讓我聽聽周圍的聲音。".to_string(),
        }
    }
}

/// Engine settings shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub vad: VadConfig,
    pub transcription: TranscriptionConfig,
    pub responder: ResponderConfig,
    /// How long an utterance waits for its final transcription
    pub final_timeout: Duration,
    pub calibration: CalibrationSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            transcription: TranscriptionConfig::default(),
            responder: ResponderConfig::default(),
            final_timeout: Duration::from_secs(10),
            calibration: CalibrationSettings::default(),
        }
    }
}

/// Collaborators injected into every session
pub struct SessionServices {
    pub store: Arc<dyn SessionStore>,
    pub transcripts: Arc<dyn TranscriptSink>,
    pub stt: Arc<dyn SttBackend>,
    pub llm: Arc<dyn LlmBackend>,
    /// Present only when audio recording is enabled
    pub recorder: Option<Arc<dyn AudioSink>>,
    pub config: SessionConfig,
}

struct OpenSegment {
    id: String,
    sequence: u32,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
    audio: Vec<u8>,
}

struct ClosedSegment {
    id: String,
    sequence: u32,
    audio: Vec<u8>,
}

struct MachineState {
    session: Session,
    history: Vec<Turn>,
    segments: Vec<VoiceSegment>,
    assembler: FrameAssembler,
    calibration_frames: Vec<Vec<u8>>,
    pre_roll: VecDeque<Vec<u8>>,
    segment: Option<OpenSegment>,
    next_sequence: u32,
    connections: u32,
    detached_since: Option<Instant>,
}

#[allow(clippy::cast_possible_truncation)]
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Orchestrates VAD, transcription and AI replies for one session
pub struct SessionMachine {
    id: String,
    state: Mutex<MachineState>,
    vad: VadEngine,
    stt: TranscriptionCoordinator,
    responder: AiResponder,
    events: EventHub,
    services: Arc<SessionServices>,
    /// Serializes flush-to-final waits so finals pair with their utterance
    turn_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionMachine {
    /// Build a machine around a stored or freshly created session
    ///
    /// # Errors
    ///
    /// Returns error if the VAD configuration is invalid
    pub fn new(session: Session, services: Arc<SessionServices>) -> Result<Self> {
        let config = &services.config;
        let vad = VadEngine::new(config.vad.clone())?;
        if let Some(calibration) = &session.calibration {
            vad.set_noise_floor(calibration.noise_floor_db);
        }
        let stt = TranscriptionCoordinator::new(
            Arc::clone(&services.stt),
            config.transcription.clone(),
        );
        let responder = AiResponder::new(Arc::clone(&services.llm), config.responder.clone());
        let assembler = FrameAssembler::new(vad.frame_bytes());

        Ok(Self {
            id: session.id.clone(),
            state: Mutex::new(MachineState {
                session,
                history: Vec::new(),
                segments: Vec::new(),
                assembler,
                calibration_frames: Vec::new(),
                pre_roll: VecDeque::new(),
                segment: None,
                next_sequence: 1,
                connections: 0,
                detached_since: Some(Instant::now()),
            }),
            vad,
            stt,
            responder,
            events: EventHub::new(),
            services,
            turn_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.state.lock().session.status
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.state.lock().session.mode
    }

    /// Copy of the current session record
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.state.lock().session.clone()
    }

    /// Finalized and pending segments, oldest first
    #[must_use]
    pub fn segments(&self) -> Vec<VoiceSegment> {
        self.state.lock().segments.clone()
    }

    /// Dialogue so far
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        self.state.lock().history.clone()
    }

    #[must_use]
    pub fn vad(&self) -> &VadEngine {
        &self.vad
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.responder.is_generating()
    }

    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        tracing::debug!(session_id = %self.id, event = event.name(), "session event");
        self.events.emit(&event);
    }

    fn persist_status(&self, status: SessionStatus) {
        if let Err(e) = self.services.store.update_status(&self.id, status) {
            tracing::warn!(session_id = %self.id, error = %e, "failed to persist session status");
        }
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<SessionStatus> {
        let mut state = self.state.lock();
        let from = state.session.status;
        if !allowed.contains(&from) {
            return Err(Error::InvalidTransition { from, action });
        }
        state.session.status = to;
        Ok(from)
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Calibrating or Paused → Active
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status
    pub fn activate(&self) -> Result<()> {
        let from = self.transition(
            "activate",
            &[SessionStatus::Calibrating, SessionStatus::Paused],
            SessionStatus::Active,
        )?;
        tracing::info!(session_id = %self.id, from = %from, "session activated");
        self.persist_status(SessionStatus::Active);
        self.emit(SessionEvent::Activated);
        Ok(())
    }

    /// Active → Paused; any open utterance is dropped
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is active
    pub async fn pause(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from != SessionStatus::Active {
                return Err(Error::InvalidTransition {
                    from,
                    action: "pause",
                });
            }
            state.session.status = SessionStatus::Paused;
            self.discard_utterance(&mut state);
        }
        self.stt.stop_session().await;

        tracing::info!(session_id = %self.id, "session paused");
        self.persist_status(SessionStatus::Paused);
        self.emit(SessionEvent::Paused);
        Ok(())
    }

    /// Paused → Active
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is paused
    pub fn resume(&self) -> Result<()> {
        self.transition("resume", &[SessionStatus::Paused], SessionStatus::Active)?;
        tracing::info!(session_id = %self.id, "session resumed");
        self.persist_status(SessionStatus::Active);
        self.emit(SessionEvent::Resumed);
        Ok(())
    }

    /// Complete the session, persisting its transcript
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub async fn end(&self) -> Result<SessionSummary> {
        self.finish(SessionStatus::Completed).await
    }

    /// Drive the session into `Error` after a fatal condition
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub async fn fail(&self, message: &str) -> Result<SessionSummary> {
        tracing::error!(session_id = %self.id, message, "fatal session error");
        self.emit(SessionEvent::Error {
            code: "session_error".to_string(),
            message: message.to_string(),
            recoverable: false,
        });
        self.finish(SessionStatus::Error).await
    }

    async fn finish(&self, status: SessionStatus) -> Result<SessionSummary> {
        let (session, turns) = {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from.is_terminal() {
                return Err(Error::InvalidTransition { from, action: "end" });
            }
            state.session.status = status;
            state.session.ended_at = Some(Utc::now());
            self.discard_utterance(&mut state);
            (state.session.clone(), state.history.clone())
        };

        let _ = self.responder.cancel_current_response();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.stt.stop_session().await;

        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        if let Err(e) = self.services.store.end(&self.id, status, ended_at) {
            tracing::warn!(session_id = %self.id, error = %e, "failed to persist session end");
        }

        let total_duration_ms =
            u64::try_from((ended_at - session.created_at).num_milliseconds()).unwrap_or(0);
        let record = TranscriptRecord {
            session_id: session.id.clone(),
            story_id: session.story_id.clone(),
            parent_id: session.parent_id.clone(),
            turns,
            total_duration_ms,
            created_at: ended_at,
        };
        let transcript_id = match self.services.transcripts.save(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to save transcript");
                None
            }
        };

        tracing::info!(
            session_id = %self.id,
            status = %status,
            turns = record.turn_count(),
            total_duration_ms,
            "session ended"
        );
        self.emit(SessionEvent::Ended { status });

        Ok(SessionSummary {
            session_id: self.id.clone(),
            status,
            transcript_id,
            turn_count: record.turn_count(),
            total_duration_ms,
        })
    }

    /// Switch between interactive and passive listening
    ///
    /// Leaving interactive stops transcription and resets the VAD. Entering
    /// interactive always returns to `Calibrating`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub async fn switch_mode(&self, mode: SessionMode) -> Result<()> {
        let status = {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from.is_terminal() {
                return Err(Error::InvalidTransition {
                    from,
                    action: "switch mode",
                });
            }
            if state.session.mode == mode {
                return Ok(());
            }

            state.session.mode = mode;
            state.calibration_frames.clear();
            self.discard_utterance(&mut state);
            match mode {
                SessionMode::Interactive => state.session.status = SessionStatus::Calibrating,
                SessionMode::Passive if from == SessionStatus::Calibrating => {
                    state.session.status = SessionStatus::Active;
                }
                SessionMode::Passive => {}
            }
            state.session.status
        };

        if mode == SessionMode::Passive {
            self.stt.stop_session().await;
        }

        tracing::info!(session_id = %self.id, mode = %mode, status = %status, "session mode switched");
        self.persist_status(status);
        self.emit(SessionEvent::ModeSwitched { mode, status });
        Ok(())
    }

    // -- Calibration ----------------------------------------------------------

    /// Begin collecting ambient frames
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is calibrating
    pub fn start_calibration(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from != SessionStatus::Calibrating {
                return Err(Error::InvalidTransition {
                    from,
                    action: "start calibration",
                });
            }
            state.calibration_frames.clear();
            state.assembler.clear();
        }
        self.vad.reset();

        let settings = &self.services.config.calibration;
        self.emit(SessionEvent::CalibrationStarted {
            duration_ms: settings.duration_ms,
            instructions: settings.instructions.clone(),
        });
        Ok(())
    }

    /// Calibrate on the collected frames and activate
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is calibrating
    pub fn complete_calibration(&self) -> Result<CalibrationResult> {
        let frames = {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from != SessionStatus::Calibrating {
                return Err(Error::InvalidTransition {
                    from,
                    action: "complete calibration",
                });
            }
            std::mem::take(&mut state.calibration_frames)
        };

        let result = self.vad.calibrate(&frames);
        self.vad.reset();
        self.state.lock().session.calibration = Some(result);

        if let Err(e) = self.services.store.update_calibration(&self.id, &result) {
            tracing::warn!(session_id = %self.id, error = %e, "failed to persist calibration");
        }
        self.emit(SessionEvent::CalibrationCompleted(result));
        self.activate()?;
        Ok(result)
    }

    // -- Audio ----------------------------------------------------------------

    /// Route a binary audio message according to the current status
    ///
    /// Calibrating buffers frames for calibration; active interactive
    /// sessions run them through the VAD and into transcription; paused and
    /// passive sessions drop them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub fn process_audio(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let mut events = Vec::new();
        let mut closed = Vec::new();

        {
            let mut state = self.state.lock();
            let status = state.session.status;
            match (status, state.session.mode) {
                (s, _) if s.is_terminal() => {
                    return Err(Error::InvalidTransition {
                        from: s,
                        action: "process audio",
                    });
                }
                (SessionStatus::Calibrating, _) => {
                    let frames = state.assembler.push(bytes);
                    let cap = self.services.config.calibration.max_frames;
                    let room = cap.saturating_sub(state.calibration_frames.len());
                    if frames.len() > room {
                        tracing::trace!(session_id = %self.id, "calibration buffer full");
                    }
                    state
                        .calibration_frames
                        .extend(frames.into_iter().take(room));
                }
                (SessionStatus::Active, SessionMode::Interactive) => {
                    for frame in state.assembler.push(bytes) {
                        match self.vad.process_frame(&frame)? {
                            Some(VadEvent::SpeechStarted { .. }) if state.segment.is_none() => {
                                self.buffer_pre_roll(&mut state, frame);
                                if let Some(event) = self.open_segment(&mut state)? {
                                    events.push(event);
                                }
                                continue;
                            }
                            Some(VadEvent::SpeechEnded { duration_ms }) => {
                                self.feed_frame(&mut state, frame);
                                if let Some((event, segment)) =
                                    self.close_segment(&mut state, Some(u64::from(duration_ms)))
                                {
                                    events.push(event);
                                    closed.push(segment);
                                }
                                continue;
                            }
                            Some(VadEvent::SpeechStarted { .. }) | None => {}
                        }
                        self.feed_frame(&mut state, frame);
                    }
                }
                _ => state.assembler.clear(),
            }
        }

        for event in events {
            self.emit(event);
        }
        for segment in closed {
            self.spawn_turn(segment);
        }
        Ok(())
    }

    /// Open a speech segment (client or VAD driven); no-op while speaking
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is active, or
    /// a protocol error in passive mode
    pub fn begin_speech(&self) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from != SessionStatus::Active {
                return Err(Error::InvalidTransition {
                    from,
                    action: "start speech",
                });
            }
            if state.session.mode == SessionMode::Passive {
                return Err(Error::Protocol(
                    "speech events are not accepted in passive mode".to_string(),
                ));
            }
            self.open_segment(&mut state)?
        };

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Close the open segment and start its turn; no-op while silent
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub fn end_speech(self: &Arc<Self>, duration_ms: Option<u64>) -> Result<()> {
        let closed = {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from.is_terminal() {
                return Err(Error::InvalidTransition {
                    from,
                    action: "end speech",
                });
            }
            let closed = self.close_segment(&mut state, duration_ms);
            if closed.is_some() {
                state.pre_roll.clear();
                self.vad.reset();
            }
            closed
        };

        if let Some((event, segment)) = closed {
            self.emit(event);
            self.spawn_turn(segment);
        }
        Ok(())
    }

    fn buffer_pre_roll(&self, state: &mut MachineState, frame: Vec<u8>) {
        let cap = self.services.config.vad.min_speech_frames.max(1) as usize;
        state.pre_roll.push_back(frame);
        while state.pre_roll.len() > cap {
            state.pre_roll.pop_front();
        }
    }

    fn feed_frame(&self, state: &mut MachineState, frame: Vec<u8>) {
        let Some(segment) = state.segment.as_mut() else {
            self.buffer_pre_roll(state, frame);
            return;
        };
        segment.audio.extend_from_slice(&frame);
        if let Err(e) = self.stt.send_audio(frame) {
            tracing::warn!(session_id = %self.id, error = %e, "dropped frame for transcription");
        }
    }

    fn open_segment(&self, state: &mut MachineState) -> Result<Option<SessionEvent>> {
        if state.segment.is_some() {
            return Ok(None);
        }
        if !self.stt.is_streaming() {
            self.stt.start_session(&self.id)?;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let id = Uuid::new_v4().to_string();

        let mut audio = Vec::new();
        for frame in state.pre_roll.drain(..) {
            audio.extend_from_slice(&frame);
            if let Err(e) = self.stt.send_audio(frame) {
                tracing::warn!(session_id = %self.id, error = %e, "dropped pre-roll frame");
            }
        }

        state.segment = Some(OpenSegment {
            id: id.clone(),
            sequence,
            started_at: Utc::now(),
            started: Instant::now(),
            audio,
        });
        state.session.is_speaking = true;
        state.session.current_segment_id = Some(id.clone());

        tracing::debug!(session_id = %self.id, segment_id = %id, sequence, "speech segment opened");
        Ok(Some(SessionEvent::SpeechStarted {
            segment_id: id,
            sequence,
        }))
    }

    fn close_segment(
        &self,
        state: &mut MachineState,
        duration_hint: Option<u64>,
    ) -> Option<(SessionEvent, ClosedSegment)> {
        let open = state.segment.take()?;
        state.session.is_speaking = false;
        state.session.current_segment_id = None;

        let duration_ms = duration_hint.unwrap_or_else(|| millis(open.started.elapsed()));
        state.segments.push(VoiceSegment {
            id: open.id.clone(),
            sequence: open.sequence,
            started_at: open.started_at,
            ended_at: Some(Utc::now()),
            transcript: None,
            confidence: None,
        });

        tracing::debug!(session_id = %self.id, segment_id = %open.id, duration_ms, "speech segment closed");
        Some((
            SessionEvent::SpeechEnded {
                segment_id: open.id.clone(),
                duration_ms,
            },
            ClosedSegment {
                id: open.id,
                sequence: open.sequence,
                audio: open.audio,
            },
        ))
    }

    fn discard_utterance(&self, state: &mut MachineState) {
        if let Some(open) = state.segment.take() {
            tracing::debug!(session_id = %self.id, segment_id = %open.id, "discarding open segment");
        }
        state.session.is_speaking = false;
        state.session.current_segment_id = None;
        state.pre_roll.clear();
        state.assembler.clear();
        self.vad.reset();
    }

    // -- Turns ----------------------------------------------------------------

    fn spawn_turn(self: &Arc<Self>, segment: ClosedSegment) {
        let machine = Arc::clone(self);
        let handle = tokio::spawn(async move { machine.run_turn(segment).await });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn run_turn(&self, segment: ClosedSegment) {
        let result = {
            let _turn = self.turn_lock.lock().await;
            let mut rx = self.stt.subscribe();
            match self.stt.flush() {
                Ok(flush_id) => {
                    final_for_flush(&mut rx, flush_id, self.services.config.final_timeout).await
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "could not flush transcription");
                    None
                }
            }
        };

        if result.is_none() {
            tracing::warn!(session_id = %self.id, segment_id = %segment.id, "no final transcription for segment");
        }
        let (text, confidence) = result
            .map_or((String::new(), 0.0), |r| (r.text.trim().to_string(), r.confidence));

        {
            let mut state = self.state.lock();
            if state.session.status.is_terminal() {
                return;
            }
            if let Some(stored) = state.segments.iter_mut().rev().find(|s| s.id == segment.id) {
                stored.transcript = Some(text.clone());
                stored.confidence = Some(confidence);
            }
        }

        self.record(&segment).await;

        self.emit(SessionEvent::TranscriptionFinal {
            segment_id: segment.id.clone(),
            text: text.clone(),
            confidence,
        });
        if text.is_empty() {
            self.emit(SessionEvent::Error {
                code: "transcription_empty".to_string(),
                message: "no speech was recognized".to_string(),
                recoverable: true,
            });
        }

        self.generate(&text, TriggerType::ChildSpeech).await;
    }

    async fn record(&self, segment: &ClosedSegment) {
        let Some(recorder) = self.services.recorder.clone() else {
            return;
        };
        if segment.audio.is_empty() {
            return;
        }

        let session_id = self.id.clone();
        let sequence = segment.sequence;
        let audio = segment.audio.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            recorder.record_segment(&session_id, sequence, &audio)
        })
        .await;

        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to record segment");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "segment recording task failed");
            }
        }
    }

    async fn generate(&self, child_text: &str, trigger: TriggerType) -> Option<AiResponse> {
        let context = {
            let mut state = self.state.lock();
            let context = ConversationContext {
                story: state.session.story.clone(),
                history: state.history.clone(),
            };
            if !child_text.is_empty() {
                state.history.push(Turn::now(Speaker::Child, child_text));
            }
            context
        };

        // own the turn before announcing it so an interrupt always finds it
        let generation = self.responder.begin(trigger);
        self.emit(SessionEvent::AiProcessingStarted { trigger });
        let response = self.responder.run(generation, child_text, &context).await;
        if response.was_interrupted {
            return None;
        }

        let delivered = self.responder.deliver_if_current(&response, |r| {
            self.events.emit(&SessionEvent::AiResponded(r.clone()));
        });
        if !delivered {
            return None;
        }

        tracing::info!(
            session_id = %self.id,
            response_id = %response.id,
            latency_ms = response.latency_ms,
            is_fallback = response.is_fallback,
            "AI response delivered"
        );
        self.state
            .lock()
            .history
            .push(Turn::now(Speaker::Assistant, response.text.clone()));
        Some(response)
    }

    /// Generate a reply without child input
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the session is active, or
    /// a protocol error for the child-speech trigger
    pub async fn prompt(&self, trigger: TriggerType) -> Result<Option<AiResponse>> {
        if trigger == TriggerType::ChildSpeech {
            return Err(Error::Protocol(
                "child-speech turns come from finalized speech".to_string(),
            ));
        }
        let from = self.status();
        if from != SessionStatus::Active {
            return Err(Error::InvalidTransition {
                from,
                action: "prompt",
            });
        }
        Ok(self.generate("", trigger).await)
    }

    /// Cancel the in-flight reply; always returns an interrupted marker
    pub fn interrupt_ai(&self) -> AiResponse {
        self.responder.cancel_current_response()
    }

    /// Merge story context and playback position from the client
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the session already ended
    pub fn update_context(&self, update: ContextUpdate) -> Result<()> {
        {
            let mut state = self.state.lock();
            let from = state.session.status;
            if from.is_terminal() {
                return Err(Error::InvalidTransition {
                    from,
                    action: "update context",
                });
            }

            let story = &mut state.session.story;
            if let Some(story_id) = update.story_id {
                story.story_id = Some(story_id);
            }
            if let Some(title) = update.story_title {
                story.title = title;
            }
            if let Some(synopsis) = update.story_synopsis {
                story.synopsis = Some(synopsis);
            }
            if let Some(characters) = update.characters {
                story.characters = characters;
            }
            if let Some(scene) = update.current_scene {
                story.current_scene = Some(scene);
            }
            if let Some(position) = update.playback_position_ms {
                state.session.playback_position_ms = position;
            }
        }

        self.emit(SessionEvent::ContextUpdated);
        Ok(())
    }

    // -- Connections ----------------------------------------------------------

    /// Note that a connection is serving this session
    pub fn attach(&self) {
        let mut state = self.state.lock();
        state.connections += 1;
        state.detached_since = None;
    }

    /// Note that a connection went away
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.connections = state.connections.saturating_sub(1);
        if state.connections == 0 {
            state.detached_since = Some(Instant::now());
        }
    }

    /// How long the session has had no connection
    #[must_use]
    pub fn detached_for(&self) -> Option<Duration> {
        self.state.lock().detached_since.map(|t| t.elapsed())
    }
}
