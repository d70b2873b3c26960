//! Stateless intent classifiers.
//!
//! Each predicate works on a lower-cased, mention-stripped message body and
//! shares no state with the others; the orchestrator decides priority among
//! matches. Patterns cover French and English phrasings.

use regex::Regex;
use std::sync::LazyLock;

/// Explicit private-room phrasing, including `mp`/`dm` shorthands.
static CREATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        \b(
          (parl(ons|er)\s+en\s+priv[ée]?)|
          (en\s*priv[ée]\b)|
          ((salon|canal|channel|discussion|conversation)s?\s+(priv[ée]s?))|
          ((ouvre(r)?|cr(é|e)er?|open|create)\s+(moi\s+)?(un|une)?\s*(salon|canal|channel|discussion|conversation)?\s*(priv[ée]s?)?)|
          \bmp\b|\bdm\b
        )\b
        ",
    )
    .unwrap()
});

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(combien|nombre|compte|count|how\s+many)\b.*\binstances?\b").unwrap()
});

// Order-independent fallback: both words present anywhere.
static INSTANCE_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binstances?\b").unwrap());
static COUNT_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(combien|nombre|compte)\b").unwrap());

static PURGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(purge|vider|effacer|clear|wipe)\b").unwrap());

static GOODBYE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(au\s*revoir|aurevoir|bye|à\s*plus|ciao)\b").unwrap());

/// Trailing `tags: a, b, c` clause.
static TAG_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)tags?\s*:\s*(.+)$").unwrap());

const CREATE_VERBS: &[&str] = &[
    "crée",
    "cree",
    "créer",
    "creer",
    "ouvre",
    "ouvrir",
    "open",
    "create",
    "fait",
    "faire",
    "peux-tu",
    "peux tu",
    "pourrais-tu",
];

const PRIVATE_WORDS: &[&str] = &[
    "privé",
    "privée",
    "prive",
    "privee",
    "confidentiel",
    "confidentielle",
    "secret",
    "discret",
    "dm",
    "mp",
];

const PLACE_WORDS: &[&str] = &[
    "salon",
    "canal",
    "channel",
    "discussion",
    "conversation",
    "espace",
];

/// Word-boundary containment check for one term from a word list.
fn contains_word(text: &str, word: &str) -> bool {
    // Word lists are small and messages are short; compiling per lookup
    // would be wasteful, so scan on word boundaries by hand.
    let mut start = 0;
    while let Some(pos) = text[start..].find(word) {
        let begin = start + pos;
        let end = begin + word.len();
        let before_ok = begin == 0
            || !text[..begin]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        let after_ok = end == text.len()
            || !text[end..].chars().next().is_some_and(char::is_alphanumeric);
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| contains_word(text, w))
}

/// Does the user ask for a private instance?
///
/// Matches explicit private-room phrasing, a private word co-occurring with
/// a place word, or a creation verb co-occurring with a private word.
pub fn wants_instance(text: &str) -> bool {
    let text = text.to_lowercase();
    if CREATE_RE.is_match(&text) {
        return true;
    }
    if contains_any(&text, PRIVATE_WORDS) && contains_any(&text, PLACE_WORDS) {
        return true;
    }
    if contains_any(&text, CREATE_VERBS) && contains_any(&text, PRIVATE_WORDS) {
        return true;
    }
    false
}

/// Does the user ask how many instances are live?
///
/// Either the counting phrase precedes "instance", or both words appear
/// anywhere in the message.
pub fn wants_count(text: &str) -> bool {
    COUNT_RE.is_match(text) || (INSTANCE_WORD_RE.is_match(text) && COUNT_WORD_RE.is_match(text))
}

/// Does the user ask to purge the channel?
pub fn wants_purge(text: &str) -> bool {
    PURGE_RE.is_match(text)
}

/// Does the message say goodbye? Matched against the raw message body.
pub fn wants_goodbye(text: &str) -> bool {
    GOODBYE_RE.is_match(text)
}

/// Parse a trailing `tags: a, b, c` directive.
///
/// Returns the raw tag list, trimmed and lower-cased, split on comma, pipe,
/// semicolon or slash. Validation against the known vocabulary is the
/// caller's concern. `None` when the message carries no directive.
pub fn parse_tag_directive(text: &str) -> Option<Vec<String>> {
    let caps = TAG_DIRECTIVE_RE.captures(text)?;
    let raw = caps.get(1).map_or("", |m| m.as_str());
    Some(
        raw.split(['|', ',', ';', '/'])
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
    )
}
