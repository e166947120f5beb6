//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use story_voice_gateway::ai::{ChatMessage, LlmBackend, LlmError, StoryContext};
use story_voice_gateway::api::{Inbound, Outbound, ProtocolGateway, TokenValidator};
use story_voice_gateway::db::{self, SqliteSessionStore, SqliteTranscriptStore};
use story_voice_gateway::session::{
    NewSession, SessionConfig, SessionMode, SessionRegistry, SessionServices,
};
use story_voice_gateway::voice::{Recognition, SttBackend, SttInput};
use story_voice_gateway::{DbPool, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Bytes in one 30 ms frame at 16 kHz
pub const FRAME_BYTES: usize = 960;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// A frame holding a sine tone of the given peak amplitude
#[must_use]
pub fn tone_frame(amplitude: f32) -> Vec<u8> {
    (0..FRAME_BYTES / 2)
        .flat_map(|i| {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let sample = (amplitude * (2.0 * PI * 440.0 * i as f32 / 16_000.0).sin()) as i16;
            sample.to_le_bytes()
        })
        .collect()
}

/// Quiet room noise, around -50 dB
#[must_use]
pub fn ambient_frame() -> Vec<u8> {
    tone_frame(140.0)
}

/// A child talking, around -15 dB
#[must_use]
pub fn speech_frame() -> Vec<u8> {
    tone_frame(8000.0)
}

/// STT backend that answers each flush with the next scripted text
#[derive(Default)]
pub struct ScriptedStt {
    replies: Mutex<VecDeque<String>>,
    delays: Mutex<VecDeque<Duration>>,
    pub flushes: AtomicUsize,
    pub frames: AtomicUsize,
}

impl ScriptedStt {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            ..Self::default()
        })
    }

    /// Delay the answers to the next flushes, in order
    pub fn with_delays(self: Arc<Self>, delays: &[Duration]) -> Arc<Self> {
        self.delays.lock().extend(delays.iter().copied());
        self
    }
}

#[async_trait]
impl SttBackend for ScriptedStt {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        mut input: mpsc::UnboundedReceiver<SttInput>,
        output: mpsc::Sender<Recognition>,
    ) -> Result<()> {
        while let Some(item) = input.recv().await {
            match item {
                SttInput::Audio(_) => {
                    self.frames.fetch_add(1, Ordering::SeqCst);
                }
                SttInput::Flush => {
                    self.flushes.fetch_add(1, Ordering::SeqCst);
                    let delay = self.delays.lock().pop_front();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let text = self.replies.lock().pop_front().unwrap_or_default();
                    let _ = output.send(Recognition::interim(text.clone(), 0.5)).await;
                    let _ = output.send(Recognition::final_text(text, 0.92)).await;
                }
            }
        }
        Ok(())
    }
}

/// LLM backend with scripted replies and per-call delays
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<std::result::Result<String, LlmError>>>,
    delays: Mutex<VecDeque<Duration>>,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| Ok((*r).to_string())).collect()),
            ..Self::default()
        })
    }

    /// Delay the next calls, in order
    pub fn with_delays(self: Arc<Self>, delays: &[Duration]) -> Arc<Self> {
        self.delays.lock().extend(delays.iter().copied());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
        _timeout: Duration,
    ) -> std::result::Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("小兔子跑得好快喔！".to_string()))
    }
}

/// Engine settings tuned for fast tests
#[must_use]
pub fn test_session_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.final_timeout = Duration::from_secs(2);
    config.responder.timeout = Duration::from_secs(10);
    config.responder.retry.base_delay = Duration::from_millis(10);
    config.responder.retry.max_delay = Duration::from_millis(20);
    config
}

/// Services over an in-memory database
#[must_use]
pub fn test_services(
    pool: &DbPool,
    stt: Arc<dyn SttBackend>,
    llm: Arc<dyn LlmBackend>,
) -> SessionServices {
    SessionServices {
        store: Arc::new(SqliteSessionStore::new(pool.clone())),
        transcripts: Arc::new(SqliteTranscriptStore::new(pool.clone())),
        stt,
        llm,
        recorder: None,
        config: test_session_config(),
    }
}

/// Registry over a fresh in-memory database
#[must_use]
pub fn test_registry(
    stt: Arc<dyn SttBackend>,
    llm: Arc<dyn LlmBackend>,
) -> (DbPool, Arc<SessionRegistry>) {
    let pool = setup_test_db();
    let registry = Arc::new(SessionRegistry::new(test_services(&pool, stt, llm)));
    (pool, registry)
}

#[must_use]
pub fn new_session(mode: SessionMode) -> NewSession {
    NewSession {
        story_id: "story-wolf".to_string(),
        parent_id: "parent-1".to_string(),
        mode,
        story: Some(StoryContext {
            title: "小兔子與大野狼".to_string(),
            characters: vec!["小兔子".to_string(), "大野狼".to_string()],
            ..StoryContext::default()
        }),
    }
}

/// Gateway in development auth mode
#[must_use]
pub fn test_gateway(registry: &Arc<SessionRegistry>, idle_timeout: Duration) -> Arc<ProtocolGateway> {
    Arc::new(ProtocolGateway::new(
        Arc::clone(registry),
        Arc::new(TokenValidator::development()),
        idle_timeout,
    ))
}

/// A client connected to the gateway through channels
pub struct TestClient {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    pub task: JoinHandle<()>,
}

impl TestClient {
    pub fn connect(gateway: &Arc<ProtocolGateway>, session_id: &str, token: Option<&str>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let gateway = Arc::clone(gateway);
        let session_id = session_id.to_string();
        let token = token.map(ToString::to_string);
        let task = tokio::spawn(async move {
            gateway
                .serve(
                    &session_id,
                    token.as_deref(),
                    UnboundedReceiverStream::new(inbound_rx),
                    outbound_tx,
                )
                .await;
        });

        Self {
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }

    pub fn send(&self, message: Value) {
        self.inbound
            .send(Inbound::Control(message.to_string()))
            .expect("gateway gone");
    }

    pub fn send_raw(&self, text: &str) {
        self.inbound
            .send(Inbound::Control(text.to_string()))
            .expect("gateway gone");
    }

    pub fn send_type(&self, kind: &str) {
        self.send(serde_json::json!({
            "type": kind,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
    }

    pub fn send_audio(&self, frame: Vec<u8>) {
        self.inbound.send(Inbound::Audio(frame)).expect("gateway gone");
    }

    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    /// Next outbound item, failing the test after five seconds
    pub async fn next(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for gateway output")
            .expect("gateway output closed")
    }

    /// Next item, which must be an event; returned as wire JSON
    pub async fn next_event(&mut self) -> Value {
        match self.next().await {
            Outbound::Event(event) => serde_json::to_value(&event).expect("event serializes"),
            Outbound::Close { code, reason } => {
                panic!("expected an event, got close {code} ({reason})")
            }
        }
    }

    /// Skip events until one of `kind` arrives
    pub async fn expect_event(&mut self, kind: &str) -> Value {
        loop {
            let event = self.next_event().await;
            if event["type"] == kind {
                return event;
            }
        }
    }

    /// Next item, which must be a close; returns its code
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            if let Outbound::Close { code, .. } = self.next().await {
                return code;
            }
        }
    }

    /// Everything sent within `window`
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Outbound> {
        let mut items = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(item)) = tokio::time::timeout_at(deadline, self.outbound.recv()).await {
            items.push(item);
        }
        items
    }
}

/// Wire `type`s of drained items, closes shown as `close:<code>`
#[must_use]
pub fn kinds(items: &[Outbound]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            Outbound::Event(event) => event.kind().to_string(),
            Outbound::Close { code, .. } => format!("close:{code}"),
        })
        .collect()
}
