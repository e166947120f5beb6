//! AI response generation for story dialogue

mod context;
pub mod llm;
mod prompt;
pub mod responder;
mod retry;
mod truncate;

pub use context::{ConversationContext, Speaker, StoryContext, Turn};
pub use llm::{ChatMessage, LlmBackend, LlmError, OpenAiCompatibleLlm, Role, UnconfiguredLlm};
pub use responder::{AiResponder, AiResponse, Generation, ResponderConfig, TriggerType};
pub use retry::{RetryCause, RetryPolicy, sample_jitter};
pub use truncate::truncate_response;
