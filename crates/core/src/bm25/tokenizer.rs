//! Tokenizer pipeline for the BM25 engine.
//!
//! Splits on runs of non-word characters (`-` and `_` count as word
//! characters), then optionally lowercases, drops short tokens, removes
//! stop words, and applies a light suffix stemmer. Every stage is
//! controlled by [`Bm25Config`](crate::bm25::Bm25Config); documents and
//! queries must go through the same pipeline for scores to make sense.

use crate::bm25::engine::Bm25Config;
use std::collections::HashSet;
use std::sync::LazyLock;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
        "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with", "this",
        "but", "they", "have",
    ]
    .into_iter()
    .collect()
});

/// Strip `-ing`, `-ed`, and a trailing `-s` (but not `-ss`) from words
/// longer than three characters.
fn stem(word: &str) -> &str {
    if word.len() <= 3 {
        return word;
    }
    if let Some(base) = word.strip_suffix("ing") {
        return base;
    }
    if let Some(base) = word.strip_suffix("ed") {
        return base;
    }
    if !word.ends_with("ss") {
        if let Some(base) = word.strip_suffix('s') {
            return base;
        }
    }
    word
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Run the full pipeline over a document or query string.
pub fn tokenize(text: &str, config: &Bm25Config) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text.split(|c| !is_word_char(c)) {
        if raw.is_empty() {
            continue;
        }
        let token = if config.lowercase {
            raw.to_lowercase()
        } else {
            raw.to_string()
        };
        if token.chars().count() < config.min_term_length {
            continue;
        }
        if config.strip_stop_words && STOP_WORDS.contains(token.as_str()) {
            continue;
        }
        if config.stemming {
            tokens.push(stem(&token).to_string());
        } else {
            tokens.push(token);
        }
    }
    tokens
}
