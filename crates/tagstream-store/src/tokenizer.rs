//! Entry tokenization and the persistent vocabulary

use regex::Regex;
use std::collections::HashMap;
use tagstream_core::{Error, Result, TokenId};

const MIN_WORD_CHARS: usize = 2;
const MAX_WORD_CHARS: usize = 40;

/// Splits entry text into lowercase word tokens
pub struct Tokenizer {
    markup_regex: Regex,
    entity_regex: Regex,
    word_regex: Regex,
}

impl Tokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            markup_regex: Regex::new(r"(?s)<!--.*?-->|<[^>]*>")
                .map_err(|e| Error::internal(format!("Failed to compile markup regex: {}", e)))?,
            entity_regex: Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);")
                .map_err(|e| Error::internal(format!("Failed to compile entity regex: {}", e)))?,
            word_regex: Regex::new(r"[\p{L}\p{N}]+(?:['_][\p{L}\p{N}]+)*")
                .map_err(|e| Error::internal(format!("Failed to compile word regex: {}", e)))?,
        })
    }

    /// Word frequencies for an HTML fragment
    pub fn tokenize(&self, html: &str) -> HashMap<String, u64> {
        let text = self.markup_regex.replace_all(html, " ");
        let text = self
            .entity_regex
            .replace_all(&text, |caps: &regex::Captures<'_>| decode_entity(&caps[1]));

        let mut words = HashMap::new();
        for word in self.word_regex.find_iter(&text) {
            let len = word.as_str().chars().count();
            if !(MIN_WORD_CHARS..=MAX_WORD_CHARS).contains(&len) {
                continue;
            }
            *words.entry(word.as_str().to_lowercase()).or_insert(0) += 1;
        }
        words
    }
}

fn decode_entity(name: &str) -> String {
    let decoded = match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else {
                name.strip_prefix('#').and_then(|dec| dec.parse::<u32>().ok())
            };
            code.and_then(char::from_u32)
        }
    };
    decoded.map(String::from).unwrap_or_else(|| " ".to_string())
}

/// Bidirectional word to token-id map
#[derive(Debug, Default)]
pub struct Vocabulary {
    by_text: HashMap<String, TokenId>,
    by_id: HashMap<TokenId, String>,
    max_id: TokenId,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TokenId, text: String) {
        self.max_id = self.max_id.max(id);
        self.by_id.insert(id, text.clone());
        self.by_text.insert(text, id);
    }

    pub fn id(&self, text: &str) -> Option<TokenId> {
        self.by_text.get(text).copied()
    }

    pub fn text(&self, id: TokenId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Next unallocated id; ids start at 1
    pub fn next_id(&self) -> TokenId {
        self.max_id + 1
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_strips_markup() {
        let tokenizer = Tokenizer::new().unwrap();
        let words = tokenizer.tokenize("<p>Rust <b>rust</b> &amp; Tokio</p><!-- hidden -->");
        assert_eq!(words.get("rust"), Some(&2));
        assert_eq!(words.get("tokio"), Some(&1));
        assert!(!words.contains_key("hidden"));
        assert!(!words.contains_key("b"));
    }

    #[test]
    fn test_tokenize_decodes_entities_and_filters_length() {
        let tokenizer = Tokenizer::new().unwrap();
        let words = tokenizer.tokenize("caf&#233; a don't x");
        assert_eq!(words.get("café"), Some(&1));
        assert_eq!(words.get("don't"), Some(&1));
        assert!(!words.contains_key("a"));
        assert!(!words.contains_key("x"));
    }

    #[test]
    fn test_vocabulary_allocates_after_max() {
        let mut vocab = Vocabulary::new();
        assert_eq!(vocab.next_id(), 1);
        vocab.insert(7, "seven".into());
        vocab.insert(3, "three".into());
        assert_eq!(vocab.next_id(), 8);
        assert_eq!(vocab.id("three"), Some(3));
        assert_eq!(vocab.text(7), Some("seven"));
        assert_eq!(vocab.len(), 2);
    }
}
