//! Transcription coordinator
//!
//! Owns at most one streaming recognition session at a time. Audio is
//! queued without blocking; a supervisor task feeds it to the backend and
//! republishes recognitions to any number of result subscribers.
//!
//! Backends have a hard ceiling on how long one call may stream. The
//! supervisor rotates to a fresh call once the configured duration has
//! passed, but never with unflushed audio: mid-utterance it waits for the
//! next flush, so a final always covers the whole utterance. Callers only
//! notice a possible gap in interim results. Backend failures
//! never surface as errors: each one becomes a single empty final result
//! with zero confidence.
//!
//! Every flush gets an id, and the next final from the backend is tagged
//! with the oldest unanswered flush. A flush the backend never answers gets
//! an empty final when its call ends, so waiters can tell their own final
//! from a late one belonging to an earlier utterance.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::stt::{Recognition, SttBackend, SttInput};
use crate::{Error, Result};

/// Capacity of the result fan-out channel
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Coordinator timing configuration
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Rotate backend calls after this long
    pub max_stream_duration: Duration,
    /// How long `stop_session` waits for the backend to finish
    pub stop_timeout: Duration,
    /// First delay before reopening a failed backend call (doubles, capped at 2s)
    pub restart_backoff: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            max_stream_duration: Duration::from_secs(290),
            stop_timeout: Duration::from_secs(2),
            restart_backoff: Duration::from_millis(250),
        }
    }
}

/// A transcription result published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    pub is_final: bool,
    /// Confidence of a final result
    pub confidence: f32,
    /// Stability of an interim result
    pub stability: f32,
    /// Minted for final results only
    pub segment_id: Option<String>,
    /// The flush a final result answers
    pub flush_id: Option<u64>,
}

impl TranscriptionResult {
    fn from_recognition(recognition: Recognition, flush_id: Option<u64>) -> Self {
        let segment_id = recognition
            .is_final
            .then(|| Uuid::new_v4().to_string());
        Self {
            text: recognition.text,
            is_final: recognition.is_final,
            confidence: recognition.confidence,
            stability: recognition.stability,
            segment_id,
            flush_id,
        }
    }

    fn empty_final(flush_id: Option<u64>) -> Self {
        Self {
            text: String::new(),
            is_final: true,
            confidence: 0.0,
            stability: 0.0,
            segment_id: Some(Uuid::new_v4().to_string()),
            flush_id,
        }
    }
}

/// Work queued for the supervisor
enum Queued {
    Audio(Vec<u8>),
    Flush(u64),
}

struct ActiveStream {
    session_id: String,
    input: mpsc::UnboundedSender<Queued>,
    task: JoinHandle<()>,
}

/// Coordinates one streaming transcription session against a backend
pub struct TranscriptionCoordinator {
    backend: Arc<dyn SttBackend>,
    config: TranscriptionConfig,
    active: Mutex<Option<ActiveStream>>,
    results: broadcast::Sender<TranscriptionResult>,
    next_flush: AtomicU64,
}

impl TranscriptionCoordinator {
    /// Create a coordinator for `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn SttBackend>, config: TranscriptionConfig) -> Self {
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            backend,
            config,
            active: Mutex::new(None),
            results,
            next_flush: AtomicU64::new(0),
        }
    }

    /// Open the streaming session
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStreaming`] if a session is already open
    pub fn start_session(&self, session_id: &str) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(stream) = active.as_ref() {
            if !stream.task.is_finished() {
                return Err(Error::AlreadyStreaming(stream.session_id.clone()));
            }
        }

        let (input, input_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.backend),
            input_rx,
            self.results.clone(),
            self.config.clone(),
            session_id.to_string(),
        ));

        tracing::debug!(session_id, backend = self.backend.name(), "transcription started");

        *active = Some(ActiveStream {
            session_id: session_id.to_string(),
            input,
            task,
        });
        Ok(())
    }

    fn send(&self, item: Queued) -> Result<()> {
        let active = self.active.lock();
        let stream = active.as_ref().ok_or(Error::NotStreaming)?;
        stream.input.send(item).map_err(|_| Error::NotStreaming)
    }

    /// Queue a frame for the open stream
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStreaming`] if no session is open
    pub fn send_audio(&self, frame: Vec<u8>) -> Result<()> {
        self.send(Queued::Audio(frame))
    }

    /// Mark the end of the current utterance
    ///
    /// Returns the flush id the answering final result will carry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStreaming`] if no session is open
    pub fn flush(&self) -> Result<u64> {
        let flush_id = self.next_flush.fetch_add(1, Ordering::Relaxed);
        self.send(Queued::Flush(flush_id))?;
        Ok(flush_id)
    }

    /// Whether a session is open
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Subscribe to results published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptionResult> {
        self.results.subscribe()
    }

    /// Stream of results published from now on
    ///
    /// Each call returns an independent stream; a lagging consumer skips
    /// results instead of blocking the coordinator.
    pub fn results(&self) -> impl Stream<Item = TranscriptionResult> + Send + 'static {
        BroadcastStream::new(self.results.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
    }

    /// Close the session; safe to call when nothing is open
    pub async fn stop_session(&self) {
        let Some(stream) = self.active.lock().take() else {
            return;
        };

        let ActiveStream {
            session_id,
            input,
            mut task,
        } = stream;
        drop(input);

        if tokio::time::timeout(self.config.stop_timeout, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(session_id = %session_id, "transcription did not stop in time, aborting");
            task.abort();
        }

        tracing::debug!(session_id = %session_id, "transcription stopped");
    }
}

/// Wait for the next final result on `rx`
///
/// Returns `None` if `timeout` elapses first.
pub async fn next_final(
    rx: &mut broadcast::Receiver<TranscriptionResult>,
    timeout: Duration,
) -> Option<TranscriptionResult> {
    wait_final(rx, timeout, |_| true).await
}

/// Wait for the final result answering `flush_id`
///
/// Finals for other flushes are skipped. Returns `None` if `timeout`
/// elapses first.
pub async fn final_for_flush(
    rx: &mut broadcast::Receiver<TranscriptionResult>,
    flush_id: u64,
    timeout: Duration,
) -> Option<TranscriptionResult> {
    wait_final(rx, timeout, |result| result.flush_id == Some(flush_id)).await
}

async fn wait_final<F>(
    rx: &mut broadcast::Receiver<TranscriptionResult>,
    timeout: Duration,
    accept: F,
) -> Option<TranscriptionResult>
where
    F: Fn(&TranscriptionResult) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(result) if result.is_final && accept(&result) => return Some(result),
                Ok(result) if result.is_final => {
                    tracing::debug!(flush_id = ?result.flush_id, "skipping final for another flush");
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Why a backend call ended
enum CallEnd {
    /// Input closed by `stop_session`
    Stopped,
    /// Rotated at the duration ceiling
    Rotated,
    /// The backend returned on its own
    Returned,
}

fn publish(results: &broadcast::Sender<TranscriptionResult>, result: TranscriptionResult) {
    // no subscribers is fine
    let _ = results.send(result);
}

/// Tag a final with the oldest unanswered flush
fn answer(recognition: Recognition, pending: &mut VecDeque<u64>) -> TranscriptionResult {
    let flush_id = if recognition.is_final {
        pending.pop_front()
    } else {
        None
    };
    TranscriptionResult::from_recognition(recognition, flush_id)
}

async fn supervise(
    backend: Arc<dyn SttBackend>,
    mut input: mpsc::UnboundedReceiver<Queued>,
    results: broadcast::Sender<TranscriptionResult>,
    config: TranscriptionConfig,
    session_id: String,
) {
    let mut backoff = config.restart_backoff;

    loop {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel::<Recognition>(RESULT_CHANNEL_CAPACITY);

        let call = backend.stream(call_rx, out_tx);
        tokio::pin!(call);

        let ceiling = tokio::time::sleep_until(Instant::now() + config.max_stream_duration);
        tokio::pin!(ceiling);

        let mut call_tx = Some(call_tx);
        let mut end = CallEnd::Returned;
        // audio sent to this call since its last flush
        let mut unflushed = false;
        let mut rotate_after_flush = false;
        let mut pending: VecDeque<u64> = VecDeque::new();

        let outcome = loop {
            tokio::select! {
                result = &mut call => break result,
                Some(recognition) = out_rx.recv() => {
                    publish(&results, answer(recognition, &mut pending));
                }
                item = input.recv(), if call_tx.is_some() => match item {
                    Some(Queued::Audio(frame)) => {
                        unflushed = true;
                        if let Some(tx) = &call_tx {
                            let _ = tx.send(SttInput::Audio(frame));
                        }
                    }
                    Some(Queued::Flush(flush_id)) => {
                        unflushed = false;
                        pending.push_back(flush_id);
                        if let Some(tx) = &call_tx {
                            let _ = tx.send(SttInput::Flush);
                        }
                        if rotate_after_flush {
                            tracing::debug!(session_id = %session_id, "rotating transcription stream after flush");
                            end = CallEnd::Rotated;
                            call_tx = None;
                        }
                    }
                    None => {
                        end = CallEnd::Stopped;
                        call_tx = None;
                    }
                },
                () = &mut ceiling, if call_tx.is_some() && !rotate_after_flush => {
                    if unflushed {
                        tracing::debug!(session_id = %session_id, "duration ceiling reached mid-utterance, rotating after flush");
                        rotate_after_flush = true;
                    } else {
                        tracing::debug!(session_id = %session_id, "rotating transcription stream at duration ceiling");
                        end = CallEnd::Rotated;
                        call_tx = None;
                    }
                }
            }
        };

        while let Ok(recognition) = out_rx.try_recv() {
            publish(&results, answer(recognition, &mut pending));
        }

        let failed = match outcome {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    backend = backend.name(),
                    error = %e,
                    "transcription backend failed"
                );
                true
            }
        };
        if failed && pending.is_empty() {
            publish(&results, TranscriptionResult::empty_final(None));
        }
        for flush_id in pending.drain(..) {
            publish(&results, TranscriptionResult::empty_final(Some(flush_id)));
        }

        match end {
            CallEnd::Stopped => return,
            CallEnd::Rotated if !failed => backoff = config.restart_backoff,
            CallEnd::Rotated | CallEnd::Returned => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(2));
            }
        }
    }
}
