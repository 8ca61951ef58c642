//! Tokenizer: text to token ids and back
//!
//! Byte-pair-encoding tokenizer driven entirely by the vocabulary and merge
//! rules stored in the model descriptor. Role-marker tokens such as
//! `<|user|>` are matched literally before BPE runs, so template markup
//! can never be split or merged with surrounding text.
//!
//! Encoding and decoding are pure functions of the loaded model: same
//! input, same ids, no internal state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Vocabulary mapping between token fragments and ids
///
/// Ids are dense and contiguous from zero; the fragment list index is the
/// token id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Fragment for each id (index = token id)
    fragments: Vec<String>,
    /// Reverse lookup
    #[serde(skip)]
    fragment_to_id: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build a vocabulary from an ordered fragment list
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the list is empty or contains duplicates.
    pub fn from_fragments(fragments: Vec<String>) -> Result<Self> {
        if fragments.is_empty() {
            return Err(InferirError::InvalidInput {
                reason: "vocabulary cannot be empty".to_string(),
            });
        }

        let mut fragment_to_id = HashMap::with_capacity(fragments.len());
        for (id, fragment) in fragments.iter().enumerate() {
            let id = u32::try_from(id).map_err(|_| InferirError::InvalidInput {
                reason: format!("token id {id} exceeds u32 range"),
            })?;
            if fragment_to_id.insert(fragment.clone(), id).is_some() {
                return Err(InferirError::InvalidInput {
                    reason: format!("duplicate vocabulary fragment: {fragment:?}"),
                });
            }
        }

        Ok(Self {
            fragments,
            fragment_to_id,
        })
    }

    /// Rebuild the reverse lookup after deserialization
    pub(crate) fn rebuild_index(&mut self) {
        self.fragment_to_id = self
            .fragments
            .iter()
            .enumerate()
            .map(|(id, f)| (f.clone(), id as u32))
            .collect();
    }

    /// Id for a fragment, if present
    #[must_use]
    pub fn get_id(&self, fragment: &str) -> Option<u32> {
        self.fragment_to_id.get(fragment).copied()
    }

    /// Fragment for an id, if in range
    #[must_use]
    pub fn get_fragment(&self, id: u32) -> Option<&str> {
        self.fragments.get(id as usize).map(String::as_str)
    }

    /// Number of tokens
    #[must_use]
    pub fn size(&self) -> usize {
        self.fragments.len()
    }
}

/// BPE tokenizer over a fixed vocabulary and ordered merge rules
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vocabulary,
    /// Merge rules in priority order
    merges: Vec<(String, String)>,
    /// Multi-character fragments matched literally before BPE,
    /// longest first
    special_fragments: Vec<String>,
}

impl Tokenizer {
    /// Create a tokenizer from a vocabulary and merge rules
    ///
    /// Fragments of the form `<...>` are treated as special markers and
    /// matched literally during encoding.
    #[must_use]
    pub fn new(vocab: Vocabulary, merges: Vec<(String, String)>) -> Self {
        let mut special_fragments: Vec<String> = vocab
            .fragments
            .iter()
            .filter(|f| f.starts_with('<') && f.ends_with('>') && f.chars().count() > 1)
            .cloned()
            .collect();
        // Longest first so "<|user|>" wins over a hypothetical "<|u|>"
        special_fragments.sort_by_key(|f| std::cmp::Reverse(f.len()));

        Self {
            vocab,
            merges,
            special_fragments,
        }
    }

    /// The underlying vocabulary
    #[must_use]
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Encode text into token ids
    ///
    /// Special marker fragments are matched literally; the remaining text is
    /// split per word (GPT-2 leading-space convention), character-seeded,
    /// and merged by rule priority.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a piece of the text has no vocabulary
    /// entry after all merges apply.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for segment in self.split_specials(text) {
            match segment {
                Segment::Special(fragment) => {
                    // Membership guaranteed: special_fragments come from the vocab
                    if let Some(id) = self.vocab.get_id(fragment) {
                        ids.push(id);
                    }
                }
                Segment::Text(piece) => self.encode_plain(piece, &mut ids)?,
            }
        }
        Ok(ids)
    }

    /// Decode one token id to its fragment
    ///
    /// # Errors
    ///
    /// Returns `UnknownToken` for an out-of-range id. This indicates a
    /// model/tokenizer mismatch and is not recoverable.
    pub fn decode(&self, id: u32) -> Result<&str> {
        self.vocab
            .get_fragment(id)
            .ok_or(InferirError::UnknownToken {
                id,
                vocab_size: self.vocab.size(),
            })
    }

    /// Decode a sequence of ids by fragment concatenation
    ///
    /// # Errors
    ///
    /// Returns `UnknownToken` on the first out-of-range id.
    pub fn decode_sequence(&self, ids: &[u32]) -> Result<String> {
        let mut text = String::new();
        for &id in ids {
            text.push_str(self.decode(id)?);
        }
        Ok(text)
    }

    fn split_specials<'a>(&'a self, text: &'a str) -> Vec<Segment<'a>> {
        let mut segments = Vec::new();
        let mut rest = text;

        'outer: while !rest.is_empty() {
            let mut earliest: Option<(usize, &str)> = None;
            for special in &self.special_fragments {
                if let Some(pos) = rest.find(special.as_str()) {
                    let better = match earliest {
                        None => true,
                        Some((best_pos, best)) => {
                            pos < best_pos || (pos == best_pos && special.len() > best.len())
                        }
                    };
                    if better {
                        earliest = Some((pos, special.as_str()));
                    }
                }
            }

            match earliest {
                Some((pos, special)) => {
                    if pos > 0 {
                        segments.push(Segment::Text(&rest[..pos]));
                    }
                    segments.push(Segment::Special(special));
                    rest = &rest[pos + special.len()..];
                }
                None => {
                    segments.push(Segment::Text(rest));
                    break 'outer;
                }
            }
        }

        segments
    }

    fn encode_plain(&self, text: &str, ids: &mut Vec<u32>) -> Result<()> {
        // Split on single spaces, re-attaching the space to the following
        // word (GPT-2 convention); newlines stay inside their word piece.
        let mut words: Vec<String> = Vec::new();
        for (i, word) in text.split(' ').enumerate() {
            if word.is_empty() {
                if i > 0 {
                    // Consecutive spaces: a bare space piece
                    words.push(" ".to_string());
                }
                continue;
            }
            if i == 0 {
                words.push(word.to_string());
            } else {
                words.push(format!(" {word}"));
            }
        }

        for word in words {
            let mut pieces: Vec<String> = word.chars().map(|c| c.to_string()).collect();
            for (first, second) in &self.merges {
                pieces = apply_merge(&pieces, first, second);
            }

            for piece in pieces {
                let id = self
                    .vocab
                    .get_id(&piece)
                    .ok_or_else(|| InferirError::InvalidInput {
                        reason: format!("no vocabulary entry for text piece {piece:?}"),
                    })?;
                ids.push(id);
            }
        }

        Ok(())
    }
}

enum Segment<'a> {
    Special(&'a str),
    Text(&'a str),
}

fn apply_merge(pieces: &[String], first: &str, second: &str) -> Vec<String> {
    if pieces.len() < 2 {
        return pieces.to_vec();
    }

    let mut result = Vec::with_capacity(pieces.len());
    let mut i = 0;
    while i < pieces.len() {
        if i + 1 < pieces.len() && pieces[i] == first && pieces[i + 1] == second {
            result.push(format!("{first}{second}"));
            i += 2;
        } else {
            result.push(pieces[i].clone());
            i += 1;
        }
    }
    result
}
