//! System prompt and canned replies

use std::fmt::Write;

use super::context::StoryContext;
use super::responder::TriggerType;

/// Pre-approved replies for child-speech turns
const CHILD_FALLBACKS: &[&str] = &[
    "嗯嗯，你說得真好！我們繼續聽故事吧。",
    "好有趣喔！你覺得接下來會發生什麼事呢？",
    "謝謝你告訴我！我們一起看看故事怎麼發展。",
];

/// Pre-approved replies steering away from an unsafe topic
const REDIRECT_FALLBACKS: &[&str] = &[
    "我們來聊聊故事裡的朋友好不好？",
    "這個問題我們問問爸爸媽媽吧！現在一起回到故事裡。",
];

/// Pre-approved prompts when the child has been quiet or the story asks a question
const PROMPT_FALLBACKS: &[&str] = &[
    "你喜歡故事裡的哪一個角色呢？",
    "你猜猜看，接下來會發生什麼事？",
];

/// Pick a canned reply
#[must_use]
pub fn fallback_text(trigger: TriggerType, redirected: bool, rotation: usize) -> &'static str {
    let pool = if redirected {
        REDIRECT_FALLBACKS
    } else {
        match trigger {
            TriggerType::ChildSpeech => CHILD_FALLBACKS,
            TriggerType::Timeout | TriggerType::StoryPrompt => PROMPT_FALLBACKS,
        }
    };
    pool[rotation % pool.len()]
}

/// Stand-in user message for turns without child input
#[must_use]
pub const fn trigger_instruction(trigger: TriggerType) -> Option<&'static str> {
    match trigger {
        TriggerType::ChildSpeech => None,
        TriggerType::Timeout => Some(
            "(The child has been quiet for a while. Gently invite them to share what they think about the story.)",
        ),
        TriggerType::StoryPrompt => Some(
            "(The story reached a moment for a question. Ask the child one simple question about what just happened.)",
        ),
    }
}

/// Build the safety-oriented system prompt for a story
#[must_use]
pub fn system_prompt(story: &StoryContext, redirect: bool, max_chars: usize) -> String {
    let mut prompt = String::from(
        "You are a warm, patient storytelling companion talking with a young child (ages 3-8) \
         while a story is read aloud.\n\
         Rules:\n\
         - Reply in the language the child uses; default to Traditional Chinese.\n\
         - Use short, simple sentences a small child understands.\n\
         - Never ask for or repeat personal information such as names, addresses, phone numbers or schools.\n\
         - Never describe violence, scary details, adult topics or bad words.\n\
         - Keep the conversation about the story and encourage imagination.\n",
    );
    let _ = writeln!(prompt, "- Answer in at most {max_chars} characters.");

    if !story.is_empty() {
        prompt.push_str("\nStory:\n");
        if !story.title.is_empty() {
            let _ = writeln!(prompt, "Title: {}", story.title);
        }
        if let Some(synopsis) = &story.synopsis {
            let _ = writeln!(prompt, "Synopsis: {synopsis}");
        }
        if !story.characters.is_empty() {
            let _ = writeln!(prompt, "Characters: {}", story.characters.join(", "));
        }
        if let Some(scene) = &story.current_scene {
            let _ = writeln!(prompt, "Current scene: {scene}");
        }
    }

    if redirect {
        prompt.push_str(
            "\nThe child just said something that is not appropriate to discuss. \
             Do not repeat it. Kindly steer the conversation back to the story.\n",
        );
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_story_details() {
        let story = StoryContext {
            title: "小兔子與大野狼".to_string(),
            synopsis: Some("小兔子在森林裡迷路了".to_string()),
            characters: vec!["小兔子".to_string(), "大野狼".to_string()],
            current_scene: Some("森林".to_string()),
            ..StoryContext::default()
        };
        let prompt = system_prompt(&story, false, 120);
        assert!(prompt.contains("Title: 小兔子與大野狼"));
        assert!(prompt.contains("Characters: 小兔子, 大野狼"));
        assert!(prompt.contains("at most 120 characters"));
        assert!(!prompt.contains("steer the conversation"));
    }

    #[test]
    fn redirect_adds_instruction() {
        let prompt = system_prompt(&StoryContext::default(), true, 80);
        assert!(prompt.contains("steer the conversation back"));
        assert!(!prompt.contains("Story:"));
    }

    #[test]
    fn fallbacks_rotate_within_pool() {
        let a = fallback_text(TriggerType::ChildSpeech, false, 0);
        let b = fallback_text(TriggerType::ChildSpeech, false, CHILD_FALLBACKS.len());
        assert_eq!(a, b);
        assert!(REDIRECT_FALLBACKS.contains(&fallback_text(TriggerType::ChildSpeech, true, 1)));
    }
}
