//! Deterministic token counting for budget arithmetic.
//!
//! The engine never needs an exact match with any particular BPE/WordPiece
//! encoder — budgets only rely on counts being deterministic and roughly
//! monotonic in text length. When a vocab file (`tokenizer.json`, either a
//! flat `{"token": id}` object or the nested `{"model": {"vocab": ...}}`
//! shape) is present, words are counted with a greedy WordPiece-style
//! simulation; otherwise a character heuristic applies.
//!
//! Counts are cached by content hash; the cache and the counter are safe to
//! share across threads.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

/// Words longer than this many characters are treated as a single unknown
/// token rather than matched against the vocab.
const MAX_INPUT_CHARS_PER_WORD: usize = 100;

/// Fallback chars-per-token ratio when no vocab is available.
const CHARS_PER_TOKEN: usize = 4;

pub struct Tokenizer {
    vocab: Option<HashSet<String>>,
    cache: RwLock<HashMap<[u8; 32], usize>>,
}

impl Tokenizer {
    /// Create a tokenizer, loading the vocab file when it exists. A missing
    /// or unreadable vocab silently degrades to the character heuristic.
    pub fn new(config_path: &Path) -> Self {
        let vocab = load_vocab(config_path);
        if let Some(ref v) = vocab {
            debug!(entries = v.len(), "Loaded tokenizer vocab");
        }
        Self {
            vocab,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Tokenizer with no vocab file; counts use the character heuristic.
    pub fn approximate() -> Self {
        Self {
            vocab: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Count tokens in `text`. `add_specials` accounts for the two
    /// sequence-wrapping special tokens.
    pub fn count(&self, text: &str, add_specials: bool) -> usize {
        if text.is_empty() {
            return if add_specials { 2 } else { 0 };
        }

        let key = cache_key(text, add_specials);
        if let Some(&cached) = self.cache.read().unwrap().get(&key) {
            return cached;
        }

        let mut count = 0;
        for word in text.split_whitespace() {
            count += self.count_word(word);
        }
        if add_specials {
            count += 2;
        }

        self.cache.write().unwrap().insert(key, count);
        count
    }

    fn count_word(&self, word: &str) -> usize {
        let chars: Vec<char> = word.chars().collect();
        if chars.len() > MAX_INPUT_CHARS_PER_WORD {
            return 1; // [UNK]
        }
        match &self.vocab {
            Some(vocab) => simulate_wordpiece(&chars, vocab),
            None => (chars.len() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN,
        }
    }
}

/// Greedy longest-match WordPiece: subsequent pieces are looked up with a
/// `##` continuation prefix. A word with no matching prefix is one token.
fn simulate_wordpiece(chars: &[char], vocab: &HashSet<String>) -> usize {
    let lower: Vec<char> = chars.iter().flat_map(|c| c.to_lowercase()).collect();
    let mut start = 0;
    let mut pieces = 0;

    while start < lower.len() {
        let mut end = lower.len();
        let mut matched = false;
        while end > start {
            let mut piece: String = lower[start..end].iter().collect();
            if start > 0 {
                piece = format!("##{}", piece);
            }
            if vocab.contains(&piece) {
                matched = true;
                break;
            }
            end -= 1;
        }
        if !matched {
            // Unknown word: the whole thing collapses to one token.
            return pieces + 1;
        }
        pieces += 1;
        start = end;
    }
    pieces.max(1)
}

fn cache_key(text: &str, add_specials: bool) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([add_specials as u8]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

fn load_vocab(path: &Path) -> Option<HashSet<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let json: serde_json::Value = serde_json::from_str(&content).ok()?;

    // Accept both a flat vocab object and the HuggingFace tokenizer.json
    // shape with model.vocab.
    let vocab_obj = json
        .get("model")
        .and_then(|m| m.get("vocab"))
        .or(Some(&json))?;

    let map = vocab_obj.as_object()?;
    if map.is_empty() {
        return None;
    }
    Some(map.keys().cloned().collect())
}
