//! Text helpers for the Discord surface: message chunking, channel links
//! and the channel-name slug convention.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum message payload sent per Discord message.
///
/// Slightly under Discord's 2000-character limit to leave headroom.
pub const MAX_MESSAGE_LENGTH: usize = 1990;

/// Prefix of every instance channel name.
pub const CHANNEL_PREFIX: &str = "lycoris-";

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());
static DEDUP_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d+$").unwrap());

/// Split long text into fixed-size chunks of at most `maxlen` characters.
///
/// Chunks preserve order and concatenate back to the original text; splits
/// land on character boundaries so multi-byte content stays intact. Empty
/// input yields no chunks, so nothing gets sent.
pub fn split_chunks(text: &str, maxlen: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == maxlen {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Direct URL to a guild channel.
pub fn channel_link(guild_id: u64, channel_id: u64) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}")
}

/// Lower-case a display name into the channel-name alphabet.
///
/// Non `[a-z0-9-]` runs collapse to `-`, leading/trailing `-` are trimmed.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    NON_SLUG
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// Recover the owner slug from an instance channel name.
///
/// Strips the `lycoris-` prefix and any `-N` de-duplication suffix.
/// Empty when the name does not follow the convention.
pub fn slug_from_channel_name(name: &str) -> String {
    match name.strip_prefix(CHANNEL_PREFIX) {
        Some(tail) => DEDUP_SUFFIX.replace(tail, "").to_string(),
        None => String::new(),
    }
}
