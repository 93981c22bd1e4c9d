//! Model output cleanup.
//!
//! [`clean`] is total and idempotent: it never fails and applying it twice
//! yields the same text as applying it once.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static MARKUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*#_]+").expect("valid markup pattern"));

// Underscores are gone by the time this runs, so `ROBOTACTION:` must match too.
static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)ROBOT_?ACTION:.*$").expect("valid directive pattern"));

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+").expect("valid sentence pattern"));

/// Sanitized single-sentence reply text.
///
/// Contains no `*`, `#` or `_`, has collapsed whitespace, and (unless empty
/// or pure punctuation) is one sentence ending in `.`, `!` or `?`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanText(String);

impl CleanText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Whitespace-delimited slices whose concatenation is the full text.
    pub fn deltas(&self) -> Vec<String> {
        let words: Vec<&str> = self.0.split(' ').filter(|w| !w.is_empty()).collect();
        let last = words.len().saturating_sub(1);
        words
            .iter()
            .enumerate()
            .map(|(i, w)| if i < last { format!("{w} ") } else { (*w).to_string() })
            .collect()
    }
}

impl fmt::Display for CleanText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CleanText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reduce raw model output to its first clean sentence.
pub fn clean(raw: &str) -> CleanText {
    let text = MARKUP_RE.replace_all(raw, "");
    let text = DIRECTIVE_RE.replace(&text, "");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.is_empty() {
        return CleanText(text);
    }

    // Each boundary is the span of a terminator run; the end of the text is
    // an empty boundary.
    let boundaries = SENTENCE_END_RE
        .find_iter(&text)
        .map(|m| m.range())
        .chain(std::iter::once(text.len()..text.len()));

    let mut start = 0;
    for boundary in boundaries {
        let sentence = text[start..boundary.start].trim();
        if !sentence.is_empty() {
            let terminator = text[boundary.clone()].chars().next().unwrap_or('.');
            return CleanText(format!("{sentence}{terminator}"));
        }
        start = boundary.end;
    }

    // Nothing but terminators, e.g. "?!"
    CleanText(text)
}
