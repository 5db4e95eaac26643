use crate::core::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static WORD_PATTERN: Lazy<fancy_regex::Regex> = Lazy::new(|| {
    fancy_regex::Regex::new(r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+")
        .expect("word split pattern is valid")
});

pub const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Vocabulary stored in a model file, in id order.
#[derive(Debug, Clone)]
pub struct TokenDictionary {
    tokens: Vec<Vec<u8>>,
    lookup: HashMap<String, TokenId>,
    eos: Option<TokenId>,
}

impl TokenDictionary {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        let tokens: Vec<Vec<u8>> = tokens.into_iter().map(Into::into).collect();
        let mut lookup = HashMap::with_capacity(tokens.len());
        for (i, bytes) in tokens.iter().enumerate() {
            // Byte fragments that are not valid UTF-8 can never match text.
            if let Ok(word) = std::str::from_utf8(bytes) {
                lookup.entry(word.to_string()).or_insert(TokenId(i as u32));
            }
        }
        let eos = lookup.get(END_OF_TEXT).copied();

        Self { tokens, lookup, eos }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn eos(&self) -> Option<TokenId> {
        self.eos
    }

    pub fn token_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.tokens.get(id.index()).map(|t| t.as_slice())
    }

    pub fn lookup(&self, word: &str) -> Option<TokenId> {
        self.lookup.get(word).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.tokens.iter().map(|t| t.as_slice())
    }

    /// Splits `text` into words, then greedily takes the longest dictionary entry
    /// at each position. Characters with no entry at all are dropped.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut ids = Vec::new();

        for word in WORD_PATTERN.find_iter(text) {
            let word = word.map_err(|e| Error::format(format!("tokenizer: {}", e)))?.as_str();
            let bounds: Vec<usize> = word
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(word.len()))
                .collect();

            let mut start = 0;
            while start + 1 < bounds.len() {
                let found = (start + 1..bounds.len())
                    .rev()
                    .find_map(|end| self.lookup(&word[bounds[start]..bounds[end]]).map(|id| (end, id)));

                match found {
                    Some((end, id)) => {
                        ids.push(id);
                        start = end;
                    }
                    None => start += 1,
                }
            }
        }

        Ok(ids)
    }

    pub fn decode(&self, ids: &[TokenId]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| self.token_bytes(id))
            .flatten()
            .copied()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
