//! Story and conversation context handed to the responder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::safety::FilterContext;

/// The story currently being told
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryContext {
    pub story_id: Option<String>,
    pub title: String,
    pub synopsis: Option<String>,
    pub characters: Vec<String>,
    pub current_scene: Option<String>,
}

impl StoryContext {
    /// Vocabulary the content filter treats as in-story
    #[must_use]
    pub fn filter_context(&self) -> FilterContext {
        let mut keywords = self.characters.clone();
        keywords.extend(self.current_scene.iter().cloned());
        FilterContext::new(self.title.clone(), keywords)
    }

    /// Whether any story information is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.synopsis.is_none()
            && self.characters.is_empty()
            && self.current_scene.is_none()
    }
}

/// Who spoke a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Child,
    Assistant,
}

/// One turn of the dialogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    /// A turn spoken now
    #[must_use]
    pub fn now(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Everything the responder needs besides the child's words
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub story: StoryContext,
    pub history: Vec<Turn>,
}

impl ConversationContext {
    /// The last `turns` turns of history
    #[must_use]
    pub fn window(&self, turns: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(turns);
        &self.history[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_latest_turns() {
        let ctx = ConversationContext {
            story: StoryContext::default(),
            history: (0..10)
                .map(|i| Turn::now(Speaker::Child, format!("{i}")))
                .collect(),
        };
        let window = ctx.window(3);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].text, "7");
        assert_eq!(ctx.window(50).len(), 10);
    }

    #[test]
    fn filter_context_includes_characters() {
        let story = StoryContext {
            title: "三隻小豬".to_string(),
            characters: vec!["大野狼".to_string()],
            ..StoryContext::default()
        };
        let ctx = story.filter_context();
        assert_eq!(ctx.story_title, "三隻小豬");
        assert_eq!(ctx.keywords, vec!["大野狼".to_string()]);
    }
}
