//! AI response generator
//!
//! One responder serves one session. Each call runs the pipeline
//! input check → prompt → bounded retries → output check → truncation, and
//! always produces an [`AiResponse`]; failures become canned fallbacks.
//!
//! A call owns its turn until the response is delivered. Interrupting or
//! starting a newer call takes ownership away, and delivery re-checks
//! ownership under the same lock, so a cancelled turn can never reach the
//! client even when the backend answers at the same instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::context::{ConversationContext, Speaker};
use super::llm::{ChatMessage, LlmBackend, LlmError};
use super::prompt::{fallback_text, system_prompt, trigger_instruction};
use super::retry::{RetryCause, RetryPolicy, sample_jitter};
use super::truncate::truncate_response;
use crate::safety::{ContentCategory, ContentFilter};

/// Responder tuning
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Hard timeout for each backend call
    pub timeout: Duration,
    /// Retry budget and backoff for transient failures and unsafe output
    pub retry: RetryPolicy,
    /// Maximum reply length in characters
    pub max_response_chars: usize,
    /// Number of history turns sent to the model
    pub history_turns: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_response_chars: 120,
            history_turns: 6,
        }
    }
}

/// What caused a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ChildSpeech,
    Timeout,
    StoryPrompt,
}

/// Outcome of one generation call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponse {
    pub id: String,
    pub trigger: TriggerType,
    pub text: String,
    pub was_redirected: bool,
    pub is_fallback: bool,
    pub was_interrupted: bool,
    /// How far into the generation the interrupt landed
    pub interrupted_offset_ms: Option<u64>,
    pub latency_ms: u64,
}

impl AiResponse {
    fn interrupted(id: String, trigger: TriggerType, offset: Option<Duration>) -> Self {
        let offset_ms = offset.map(duration_ms);
        Self {
            id,
            trigger,
            text: String::new(),
            was_redirected: false,
            is_fallback: false,
            was_interrupted: true,
            interrupted_offset_ms: offset_ms,
            latency_ms: offset_ms.unwrap_or(0),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

struct InFlight {
    response_id: String,
    trigger: TriggerType,
    cancel: watch::Sender<bool>,
    started: Instant,
}

/// A registered generation that owns the turn until run or cancelled
#[derive(Debug)]
pub struct Generation {
    response_id: String,
    trigger: TriggerType,
    cancel_rx: watch::Receiver<bool>,
    started: Instant,
}

impl Generation {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.response_id
    }
}

struct Generated {
    text: String,
    was_redirected: bool,
    is_fallback: bool,
}

/// Generates safe, length-bounded replies for one session
pub struct AiResponder {
    backend: Arc<dyn LlmBackend>,
    filter: ContentFilter,
    config: ResponderConfig,
    in_flight: Mutex<Option<InFlight>>,
    rotation: AtomicUsize,
}

impl AiResponder {
    /// Create a responder over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, config: ResponderConfig) -> Self {
        Self {
            backend,
            filter: ContentFilter::new(),
            config,
            in_flight: Mutex::new(None),
            rotation: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Whether a generation currently owns the turn
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Generate a reply to `child_text`
    ///
    /// Supersedes any generation already in flight. Returns an interrupted
    /// marker if this call is cancelled or superseded before it finishes.
    pub async fn respond(
        &self,
        child_text: &str,
        context: &ConversationContext,
        trigger: TriggerType,
    ) -> AiResponse {
        let generation = self.begin(trigger);
        self.run(generation, child_text, context).await
    }

    /// Take ownership of the turn for a new generation
    ///
    /// Any generation already in flight is cancelled. From this point an
    /// interrupt cancels the returned generation even if [`Self::run`] has
    /// not started yet.
    pub fn begin(&self, trigger: TriggerType) -> Generation {
        let started = Instant::now();
        let response_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let superseded = self.in_flight.lock().replace(InFlight {
            response_id: response_id.clone(),
            trigger,
            cancel: cancel_tx,
            started,
        });
        if let Some(old) = superseded {
            tracing::debug!(response_id = %old.response_id, "superseding in-flight generation");
            let _ = old.cancel.send(true);
        }

        Generation {
            response_id,
            trigger,
            cancel_rx,
            started,
        }
    }

    /// Run a generation registered by [`Self::begin`]
    pub async fn run(
        &self,
        generation: Generation,
        child_text: &str,
        context: &ConversationContext,
    ) -> AiResponse {
        let Generation {
            response_id,
            trigger,
            mut cancel_rx,
            started,
        } = generation;

        let outcome = tokio::select! {
            biased;
            () = cancelled(&mut cancel_rx) => None,
            generated = self.generate(child_text, context, trigger) => Some(generated),
        };

        let still_owned = self
            .in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.response_id == response_id);

        match outcome {
            Some(generated) if still_owned => AiResponse {
                id: response_id,
                trigger,
                text: generated.text,
                was_redirected: generated.was_redirected,
                is_fallback: generated.is_fallback,
                was_interrupted: false,
                interrupted_offset_ms: None,
                latency_ms: duration_ms(started.elapsed()),
            },
            _ => {
                tracing::debug!(response_id = %response_id, "generation cancelled");
                AiResponse::interrupted(response_id, trigger, Some(started.elapsed()))
            }
        }
    }

    /// Cancel the in-flight generation, if any
    ///
    /// Always returns an interrupted marker; with nothing in flight the
    /// marker carries a fresh id and no offset.
    pub fn cancel_current_response(&self) -> AiResponse {
        let Some(current) = self.in_flight.lock().take() else {
            return AiResponse::interrupted(
                Uuid::new_v4().to_string(),
                TriggerType::ChildSpeech,
                None,
            );
        };

        let _ = current.cancel.send(true);
        tracing::info!(response_id = %current.response_id, "AI response interrupted");
        AiResponse::interrupted(
            current.response_id,
            current.trigger,
            Some(current.started.elapsed()),
        )
    }

    /// Run `emit` for `response` only if it still owns the turn
    ///
    /// The ownership check and `emit` happen under one lock, so an interrupt
    /// either lands before (and nothing is emitted) or after delivery.
    pub fn deliver_if_current<F>(&self, response: &AiResponse, emit: F) -> bool
    where
        F: FnOnce(&AiResponse),
    {
        let mut slot = self.in_flight.lock();
        let owned = !response.was_interrupted
            && slot
                .as_ref()
                .is_some_and(|f| f.response_id == response.id);
        if !owned {
            return false;
        }
        slot.take();
        emit(response);
        true
    }

    fn fallback(&self, trigger: TriggerType, was_redirected: bool) -> Generated {
        let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
        Generated {
            text: fallback_text(trigger, was_redirected, rotation).to_string(),
            was_redirected,
            is_fallback: true,
        }
    }

    async fn generate(
        &self,
        child_text: &str,
        context: &ConversationContext,
        trigger: TriggerType,
    ) -> Generated {
        let child_text = child_text.trim();
        let user_text = match trigger_instruction(trigger) {
            Some(instruction) if child_text.is_empty() => instruction,
            _ => child_text,
        };
        if user_text.is_empty() {
            return self.fallback(trigger, false);
        }

        let filter_context = context.story.filter_context();
        let was_redirected = !child_text.is_empty() && {
            let verdict = self.filter.filter(child_text, Some(&filter_context));
            !verdict.is_safe || verdict.has(ContentCategory::PersonalInfoRequest)
        };
        if was_redirected {
            tracing::info!("child input needs redirection");
        }

        let max_chars = self.config.max_response_chars;
        let system = system_prompt(&context.story, was_redirected, max_chars);
        let mut messages: Vec<ChatMessage> = context
            .window(self.config.history_turns)
            .iter()
            .map(|turn| match turn.speaker {
                Speaker::Child => ChatMessage::user(turn.text.clone()),
                Speaker::Assistant => ChatMessage::assistant(turn.text.clone()),
            })
            .collect();
        messages.push(ChatMessage::user(user_text));

        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                self.config.timeout,
                self.backend.generate(&system, &messages, self.config.timeout),
            )
            .await
            .unwrap_or(Err(LlmError::Timeout));

            // None: regenerate immediately; Some: back off first
            let backoff = match result {
                Ok(raw) => {
                    let text = truncate_response(&raw, max_chars);
                    if !text.is_empty() && self.filter.is_safe_in(&text, Some(&filter_context)) {
                        return Generated {
                            text,
                            was_redirected,
                            is_fallback: false,
                        };
                    }
                    tracing::warn!(attempt, "generated reply failed safety check");
                    None
                }
                Err(LlmError::RateLimited { retry_after }) => {
                    tracing::warn!(attempt, backend = self.backend.name(), "LLM rate limited");
                    Some(RetryCause::RateLimited { retry_after })
                }
                Err(LlmError::Timeout) => {
                    tracing::warn!(attempt, backend = self.backend.name(), "LLM request timed out");
                    Some(RetryCause::Timeout)
                }
                Err(e) => {
                    tracing::error!(backend = self.backend.name(), error = %e, "LLM call failed, using fallback");
                    return self.fallback(trigger, was_redirected);
                }
            };

            if attempt >= policy.max_retries {
                tracing::warn!(attempts = attempt + 1, "LLM retries exhausted, using fallback");
                return self.fallback(trigger, was_redirected);
            }
            if let Some(cause) = backoff {
                tokio::time::sleep(policy.backoff(attempt, cause, sample_jitter())).await;
            }
            attempt += 1;
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if *rx.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::ai::context::{StoryContext, Turn};

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        delay: Duration,
        calls: AtomicU32,
        last_messages: Mutex<Vec<ChatMessage>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                last_messages: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                delay,
                calls: AtomicU32::new(0),
                last_messages: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock() = messages.to_vec();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("小兔子好勇敢！".to_string()))
        }
    }

    fn fast_config() -> ResponderConfig {
        ResponderConfig {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            max_response_chars: 40,
            history_turns: 2,
        }
    }

    fn context() -> ConversationContext {
        ConversationContext {
            story: StoryContext {
                title: "小兔子與大野狼".to_string(),
                ..StoryContext::default()
            },
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn empty_input_falls_back_without_backend_call() {
        let backend = Scripted::new(vec![]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("  ", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.is_fallback);
        assert!(!response.text.is_empty());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn reply_is_delivered_once() {
        let backend = Scripted::new(vec![Ok("大野狼睡著了，小兔子輕輕走過去。".to_string())]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("大野狼在做什麼", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(!response.is_fallback);
        assert!(!response.was_interrupted);
        assert_eq!(response.text, "大野狼睡著了，小兔子輕輕走過去。");

        let mut emitted = 0;
        assert!(responder.deliver_if_current(&response, |_| emitted += 1));
        assert!(!responder.deliver_if_current(&response, |_| emitted += 1));
        assert_eq!(emitted, 1);
        assert!(!responder.is_generating());
    }

    #[tokio::test]
    async fn timeouts_exhaust_retries_then_fall_back() {
        let backend = Scripted::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
        ]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("你好", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.is_fallback);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn slow_backend_hits_hard_timeout() {
        let backend = Scripted::slow(Duration::from_secs(5));
        let mut config = fast_config();
        config.timeout = Duration::from_millis(20);
        config.retry.max_retries = 1;
        let responder = AiResponder::new(backend.clone(), config);

        let response = responder
            .respond("你好", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.is_fallback);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let backend = Scripted::new(vec![
            Err(LlmError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            }),
            Ok("我們一起看下去吧！".to_string()),
        ]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("然後呢", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(!response.is_fallback);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn api_error_aborts_immediately() {
        let backend = Scripted::new(vec![Err(LlmError::Api("500".to_string()))]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("你好", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.is_fallback);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn unsafe_reply_is_regenerated() {
        let backend = Scripted::new(vec![
            Ok("the monster will kill you".to_string()),
            Ok("小兔子找到好朋友了！".to_string()),
        ]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond("然後呢", &context(), TriggerType::ChildSpeech)
            .await;
        assert_eq!(response.text, "小兔子找到好朋友了！");
        assert_eq!(backend.calls(), 2);
    }

    fn english_story(title: &str) -> ConversationContext {
        ConversationContext {
            story: StoryContext {
                title: title.to_string(),
                ..StoryContext::default()
            },
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn violent_reply_is_never_delivered_under_a_shared_title() {
        let violent = "I will kill you and the blood will flow.";
        let backend = Scripted::new(vec![
            Ok(violent.to_string()),
            Ok(violent.to_string()),
            Ok(violent.to_string()),
        ]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond(
                "what happens next",
                &english_story("The Three Little Pigs"),
                TriggerType::ChildSpeech,
            )
            .await;
        assert!(response.is_fallback);
        assert!(!response.text.contains("kill"));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn story_chase_reply_is_delivered() {
        let backend = Scripted::new(vec![Ok("The wolf chases the rabbit!".to_string())]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder
            .respond(
                "what does the wolf do",
                &english_story("The Wolf and the Rabbit"),
                TriggerType::ChildSpeech,
            )
            .await;
        assert!(!response.is_fallback);
        assert_eq!(response.text, "The wolf chases the rabbit!");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn long_reply_is_truncated() {
        let long = "小兔子跑啊跑".repeat(20);
        let backend = Scripted::new(vec![Ok(long)]);
        let responder = AiResponder::new(backend, fast_config());

        let response = responder
            .respond("然後呢", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.text.chars().count() <= 40);
        assert!(response.text.ends_with('…'));
    }

    #[tokio::test]
    async fn personal_info_question_is_redirected() {
        let backend = Scripted::new(vec![]);
        let responder = AiResponder::new(backend, fast_config());

        let response = responder
            .respond("你住在哪裡", &context(), TriggerType::ChildSpeech)
            .await;
        assert!(response.was_redirected);
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let backend = Scripted::new(vec![]);
        let responder = AiResponder::new(backend.clone(), fast_config());
        let mut ctx = context();
        for i in 0..5 {
            ctx.history.push(Turn::now(Speaker::Child, format!("turn {i}")));
        }

        responder
            .respond("最後一句", &ctx, TriggerType::ChildSpeech)
            .await;
        let messages = backend.last_messages.lock().clone();
        // two history turns plus the new utterance
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "turn 3");
        assert_eq!(messages[2].content, "最後一句");
    }

    #[tokio::test]
    async fn prompt_trigger_calls_backend_without_child_text() {
        let backend = Scripted::new(vec![]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let response = responder.respond("", &context(), TriggerType::Timeout).await;
        assert!(!response.is_fallback);
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn cancel_with_nothing_in_flight_is_well_formed() {
        let responder = AiResponder::new(Scripted::new(vec![]), fast_config());
        let marker = responder.cancel_current_response();
        assert!(marker.was_interrupted);
        assert!(marker.interrupted_offset_ms.is_none());
        assert!(!marker.id.is_empty());
    }

    #[tokio::test]
    async fn cancel_wins_over_in_flight_generation() {
        let backend = Scripted::slow(Duration::from_secs(5));
        let responder = Arc::new(AiResponder::new(backend, ResponderConfig::default()));

        let task = {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                responder
                    .respond("你好", &context(), TriggerType::ChildSpeech)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let marker = responder.cancel_current_response();
        assert!(marker.was_interrupted);
        assert!(marker.interrupted_offset_ms.is_some());

        let response = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(response.was_interrupted);
        assert_eq!(response.id, marker.id);
        assert!(!responder.deliver_if_current(&response, |_| panic!("delivered after cancel")));
    }

    #[tokio::test]
    async fn cancel_between_begin_and_run_is_honoured() {
        let backend = Scripted::new(vec![]);
        let responder = AiResponder::new(backend.clone(), fast_config());

        let generation = responder.begin(TriggerType::ChildSpeech);
        let id = generation.id().to_string();
        assert!(responder.is_generating());

        let marker = responder.cancel_current_response();
        assert_eq!(marker.id, id);
        assert!(marker.interrupted_offset_ms.is_some());

        let response = responder.run(generation, "你好", &context()).await;
        assert!(response.was_interrupted);
        assert_eq!(response.id, id);
        assert!(!responder.deliver_if_current(&response, |_| panic!("delivered after cancel")));
    }

    #[tokio::test]
    async fn newer_generation_supersedes_older() {
        let backend = Scripted::slow(Duration::from_millis(200));
        let responder = Arc::new(AiResponder::new(backend, ResponderConfig::default()));

        let first = {
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                responder
                    .respond("第一句", &context(), TriggerType::ChildSpeech)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = responder
            .respond("第二句", &context(), TriggerType::ChildSpeech)
            .await;

        let first = first.await.unwrap();
        assert!(first.was_interrupted);
        assert!(!second.was_interrupted);
        assert!(responder.deliver_if_current(&second, |_| {}));
    }
}
