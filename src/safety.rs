//! Content safety filter
//!
//! A pure, deterministic check applied to both the child's words and the
//! generated reply. Independent pattern detectors each report a category
//! and a confidence; the overall confidence is the minimum across them.
//!
//! Verdict precedence:
//! 1. Empty or whitespace-only text is safe.
//! 2. Adult content and profanity are always unsafe.
//! 3. Text that shares a content word with the active story clears
//!    violence, fear and off-topic from the verdict (they are still
//!    reported), and a safe verdict is raised to at least 0.85 confidence.
//!    Graphic violence (weapons, blood, killing) is never cleared.
//! 4. Remaining violence is unsafe.
//! 5. Two or more remaining soft categories are unsafe.
//!
//! Function words never count as shared story vocabulary.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence floor for story-related safe verdicts
const STORY_OVERRIDE_CONFIDENCE: f32 = 0.85;

/// Category of detected content
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentCategory {
    PersonalInfoRequest,
    Violence,
    FearInducing,
    AdultContent,
    Profanity,
    OffTopic,
}

impl ContentCategory {
    /// Categories that make text unsafe on their own
    #[must_use]
    pub const fn is_severe(self) -> bool {
        matches!(self, Self::Violence | Self::AdultContent | Self::Profanity)
    }

    /// Categories a story-related context can clear
    #[must_use]
    pub const fn story_overridable(self) -> bool {
        matches!(self, Self::Violence | Self::FearInducing | Self::OffTopic)
    }

    /// Confidence that text in this category is safe
    const fn confidence(self) -> f32 {
        match self {
            Self::AdultContent => 0.1,
            Self::Profanity => 0.2,
            Self::Violence => 0.3,
            Self::PersonalInfoRequest => 0.4,
            Self::FearInducing => 0.6,
            Self::OffTopic => 0.7,
        }
    }
}

/// Outcome of filtering a piece of text
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterResult {
    pub is_safe: bool,
    pub categories: BTreeSet<ContentCategory>,
    pub confidence: f32,
    /// Text with profanity masked, when any was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_text: Option<String>,
}

impl FilterResult {
    fn clean() -> Self {
        Self {
            is_safe: true,
            categories: BTreeSet::new(),
            confidence: 1.0,
            modified_text: None,
        }
    }

    /// Whether a category was detected
    #[must_use]
    pub fn has(&self, category: ContentCategory) -> bool {
        self.categories.contains(&category)
    }
}

/// Story vocabulary the filter may treat as in-context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    pub story_title: String,
    pub keywords: Vec<String>,
}

impl FilterContext {
    /// Context for a story title plus extra keywords (characters, scene)
    #[must_use]
    pub fn new(story_title: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            story_title: story_title.into(),
            keywords,
        }
    }

    fn vocabulary(&self) -> BTreeSet<String> {
        let mut vocab = tokenize(&self.story_title);
        for keyword in &self.keywords {
            vocab.extend(tokenize(keyword));
        }
        vocab
    }
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("valid regex")
}

static PERSONAL_INFO: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(phone\s*number|your\s+address|where\s+do\s+you\s+live|home\s+address|what\s+school|your\s+password|your\s+(full|real)\s+name|電話|號碼|地址|住在哪|住哪|哪間學校|哪個學校|密碼|身分證)",
    )
});

static VIOLENCE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bfight|\battack|\bhurt|\bchas(e|es|ed|ing)\b|\bbit(e|es|ing)\b|攻擊|咬|追|打架|受傷)",
    )
});

/// Violence no story context excuses
static GRAPHIC_VIOLENCE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(\bkill|\bmurder|\bblood|\bguns?\b|\bknife|\bknives\b|\bweapon|\bstab|殺|血|槍|刀|打死)")
});

/// English words too common to tie text to a story
const STOPWORDS: &[&str] = &[
    "about", "after", "all", "and", "any", "are", "but", "can", "did", "does", "for", "from",
    "had", "has", "have", "her", "here", "him", "his", "how", "its", "not", "now", "once",
    "one", "our", "out", "she", "that", "the", "their", "them", "then", "there", "they",
    "this", "three", "time", "two", "upon", "very", "was", "were", "what", "when", "where",
    "which", "who", "why", "will", "with", "would", "you", "your", "big", "little", "small",
    "old", "new", "good", "bad",
];

/// CJK function characters; bigrams containing one are not story vocabulary
const CJK_FUNCTION_CHARS: &str = "的了是在與和跟我你他她它們也都就很嗎呢吧啊有這那個一不要";

static FEAR: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bghosts?\b|\bmonsters?\b|\bscary|\bdie\b|\bdead\b|\bdeath|\bnightmare|鬼|怪物|可怕|死|惡夢|恐怖)",
    )
});

static ADULT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bsex|\bnaked|\bnude|\bporn|\balcohol|\bbeer\b|\bdrunk|\bcigarettes?\b|\bdrugs?\b|色情|裸|喝酒|抽菸|毒品)",
    )
});

static PROFANITY: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(\bfuck\w*|\bshit\w*|\bdamn\b|\bbitch\w*|\bbastard|\bidiot|笨蛋|白痴|王八蛋|靠北|幹你)")
});

static OFF_TOPIC: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)(\bvideo\s*games?\b|\byoutube\b|\btiktok\b|\bmoney\b|\bcredit\s*card|\bbuy\b|\bpolitics|\belection|電動|手機|打電玩|買東西|信用卡|政治|選舉)",
    )
});

/// Stateless content safety filter
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentFilter;

impl ContentFilter {
    /// Create a filter
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Check `text`, optionally against the active story
    #[must_use]
    pub fn filter(&self, text: &str, context: Option<&FilterContext>) -> FilterResult {
        if text.trim().is_empty() {
            return FilterResult::clean();
        }

        let detectors: [(&Regex, ContentCategory); 6] = [
            (&PERSONAL_INFO, ContentCategory::PersonalInfoRequest),
            (&VIOLENCE, ContentCategory::Violence),
            (&FEAR, ContentCategory::FearInducing),
            (&ADULT, ContentCategory::AdultContent),
            (&PROFANITY, ContentCategory::Profanity),
            (&OFF_TOPIC, ContentCategory::OffTopic),
        ];

        let graphic = GRAPHIC_VIOLENCE.is_match(text);
        let mut categories: BTreeSet<ContentCategory> = detectors
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|&(_, category)| category)
            .collect();
        if graphic {
            categories.insert(ContentCategory::Violence);
        }

        let mut confidence = categories
            .iter()
            .map(|c| c.confidence())
            .fold(1.0_f32, f32::min);

        let modified_text = categories
            .contains(&ContentCategory::Profanity)
            .then(|| mask(&PROFANITY, text));

        let story_related = context.is_some_and(|ctx| shares_vocabulary(text, ctx));

        let effective: Vec<ContentCategory> = categories
            .iter()
            .copied()
            .filter(|&c| {
                let cleared = story_related
                    && c.story_overridable()
                    && !(graphic && c == ContentCategory::Violence);
                !cleared
            })
            .collect();

        let severe = effective.iter().any(|c| c.is_severe());
        let soft = effective.iter().filter(|c| !c.is_severe()).count();
        let is_safe = !severe && soft < 2;

        if is_safe && story_related && !categories.is_empty() {
            confidence = confidence.max(STORY_OVERRIDE_CONFIDENCE);
        }

        if !categories.is_empty() {
            tracing::debug!(
                ?categories,
                is_safe,
                story_related,
                confidence,
                "content filter flagged text"
            );
        }

        FilterResult {
            is_safe,
            categories,
            confidence,
            modified_text,
        }
    }

    /// Convenience boolean verdict without story context
    #[must_use]
    pub fn is_safe(&self, text: &str) -> bool {
        self.filter(text, None).is_safe
    }

    /// Convenience boolean verdict against the active story
    #[must_use]
    pub fn is_safe_in(&self, text: &str, context: Option<&FilterContext>) -> bool {
        self.filter(text, context).is_safe
    }
}

fn mask(re: &Regex, text: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| "*".repeat(caps[0].chars().count()))
        .into_owned()
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{F900}'..='\u{FAFF}')
}

/// Story-matching tokens: lowercase non-stopwords of three or more letters,
/// plus CJK bigrams without function characters
fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, tokens: &mut BTreeSet<String>| {
        let lower = word.to_lowercase();
        if lower.chars().count() >= 3 && !STOPWORDS.contains(&lower.as_str()) {
            tokens.insert(lower);
        }
        word.clear();
    };
    let flush_run = |run: &mut Vec<char>, tokens: &mut BTreeSet<String>| {
        // lone characters are too ambiguous to count as shared vocabulary
        for pair in run.windows(2) {
            if !pair.iter().any(|c| CJK_FUNCTION_CHARS.contains(*c)) {
                tokens.insert(pair.iter().collect());
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_run(&mut cjk_run, &mut tokens);
            word.push(c);
        } else {
            flush_word(&mut word, &mut tokens);
            flush_run(&mut cjk_run, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_run(&mut cjk_run, &mut tokens);

    tokens
}

fn shares_vocabulary(text: &str, context: &FilterContext) -> bool {
    let vocab = context.vocabulary();
    if vocab.is_empty() {
        return false;
    }
    tokenize(text).iter().any(|t| vocab.contains(t))
}
