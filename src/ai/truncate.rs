//! Response length enforcement
//!
//! Lengths are counted in characters, so a cut never lands inside a
//! multi-byte character.

/// Sentence-ending punctuation, full-width and ASCII
const SENTENCE_END: &[char] = &['。', '！', '？', '.', '!', '?', '…'];

/// Clause-level punctuation
const CLAUSE_END: &[char] = &['，', '、', '；', '：', ',', ';', ':'];

const ELLIPSIS: char = '…';

/// Shorten `text` to at most `max_chars` characters
///
/// In priority order: cut after the last sentence end that lies at least
/// halfway into the budget, else replace the last clause mark at least 70%
/// into the budget with an ellipsis, else hard-cut and append an ellipsis.
#[must_use]
pub fn truncate_response(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let chars: Vec<char> = text.chars().collect();

    if chars.len() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let window = &chars[..max_chars];

    let sentence_cut = window
        .iter()
        .rposition(|c| SENTENCE_END.contains(c))
        .filter(|&i| (i + 1) * 2 >= max_chars);
    if let Some(i) = sentence_cut {
        return window[..=i].iter().collect();
    }

    let clause_cut = window
        .iter()
        .rposition(|c| CLAUSE_END.contains(c))
        .filter(|&i| (i + 1) * 10 >= max_chars * 7);
    if let Some(i) = clause_cut {
        let mut out: String = window[..i].iter().collect();
        out.push(ELLIPSIS);
        return out;
    }

    let mut out: String = window[..max_chars - 1].iter().collect();
    out.push(ELLIPSIS);
    out
}
