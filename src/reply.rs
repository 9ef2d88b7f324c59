use rand::seq::SliceRandom;
use rand::Rng;

/// Marker that precedes the model's turn in the prompt.
pub const AI_MARKER: &str = "AI:";

pub const MOOD_BOOSTERS: [&str; 6] = ["😊", "🌟", "💪", "✨", "🎉", "🌈"];

pub const SHORT_REPLY_PREFIX: &str = "That's interesting! ";

pub const EMPTY_REPLY_FALLBACK: &str = "I'm here to listen and help boost your mood! 😊";

/// Returned to the user whenever generation itself fails.
pub const GENERATION_FALLBACK: &str =
    "I'm here to boost your mood! Tell me what's on your mind and I'll try to help! 😊";

const MIN_REPLY_CHARS: usize = 10;

pub fn build_prompt(message: &str) -> String {
    format!("User: {message}\n{AI_MARKER}")
}

/// Pull the model's turn out of the decoded sequence.
///
/// Prefers the text after the last `AI:` marker; failing that, the text after
/// the last echo of the prompt; failing that, the whole decoded text.
pub fn extract_reply(decoded: &str, prompt: &str) -> String {
    if let Some((_, tail)) = decoded.rsplit_once(AI_MARKER) {
        return tail.trim().to_string();
    }
    if !prompt.is_empty() {
        if let Some((_, tail)) = decoded.rsplit_once(prompt) {
            return tail.trim().to_string();
        }
    }
    decoded.to_string()
}

/// Keep at most the first two sentences and make sure they end with punctuation.
pub fn collapse_sentences(text: &str) -> String {
    let pieces: Vec<&str> = text.split('.').collect();
    if pieces.len() <= 1 {
        return text.to_string();
    }

    let mut out = pieces
        .iter()
        .take(2)
        .map(|p| p.trim())
        .collect::<Vec<_>>()
        .join(". ")
        .trim()
        .to_string();
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

/// Shape a raw reply: trim to two sentences, maybe add an emoji, pad short
/// replies and never hand back an empty string.
///
/// Steps run in a fixed order; the emoji is appended before the length check.
pub fn post_process<R: Rng>(text: &str, _original_message: &str, rng: &mut R) -> String {
    let mut reply = collapse_sentences(text);

    if rng.gen::<f64>() > 0.5 {
        if let Some(emoji) = MOOD_BOOSTERS.choose(rng) {
            reply = format!("{reply} {emoji}");
        }
    }

    if reply.chars().count() < MIN_REPLY_CHARS {
        reply = format!("{SHORT_REPLY_PREFIX}{reply}");
    }

    if reply.trim().is_empty() {
        reply = EMPTY_REPLY_FALLBACK.to_string();
    }

    reply
}
