//! Deriving the fixed-order crop vocabulary from a training corpus.

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::corpus::CleanedCorpus;
use crate::schema::{FeatureSchema, DEFAULT_DELIMITER, SEQUENCE_FIELD};
use crate::sequence::{tokenize_with, CropToken};

/// Sorted, duplicate-free list of crop tokens observed at fit time.
///
/// The vocabulary is the sole authority for which crop indicator columns exist
/// and in what order. It is built once per training run and is read-only
/// afterwards; there is no way to add entries to an existing value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "Vec<CropToken>", into = "Vec<CropToken>")]
pub struct Vocabulary {
    tokens: Vec<CropToken>,
}

impl Vocabulary {
    /// Rebuilds a vocabulary from persisted tokens, re-establishing the sort and
    /// uniqueness invariants.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CropToken>,
    {
        let set: BTreeSet<CropToken> = tokens
            .into_iter()
            .map(Into::into)
            .map(|token: CropToken| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();
        Self {
            tokens: set.into_iter().collect(),
        }
    }

    /// Tokens in column order.
    #[must_use]
    pub fn tokens(&self) -> &[CropToken] {
        &self.tokens
    }

    /// Number of crop indicator columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` when no crops were observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Column index of `token`, if known.
    #[must_use]
    pub fn position(&self, token: &str) -> Option<usize> {
        self.tokens
            .binary_search_by(|probe| probe.as_str().cmp(token))
            .ok()
    }

    /// Returns `true` when `token` has an indicator column.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.position(token).is_some()
    }

    /// Iterates over the tokens in column order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

impl From<Vec<CropToken>> for Vocabulary {
    fn from(tokens: Vec<CropToken>) -> Self {
        Self::from_tokens(tokens)
    }
}

impl From<Vocabulary> for Vec<CropToken> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.tokens
    }
}

impl<'a> IntoIterator for &'a Vocabulary {
    type Item = &'a CropToken;
    type IntoIter = std::slice::Iter<'a, CropToken>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.iter()
    }
}

/// Scans corpus sequences and emits the sorted union of their crop tokens.
#[derive(Debug, Clone)]
pub struct VocabularyBuilder {
    delimiter: String,
}

impl Default for VocabularyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl VocabularyBuilder {
    /// Creates a builder splitting sequences on `delimiter`.
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    /// Builds the vocabulary from every sequence in `corpus`.
    ///
    /// Tokens are ordered by ordinal (byte-wise, case-sensitive) comparison, so the
    /// output is identical for any permutation of the same rows. An empty corpus
    /// produces an empty vocabulary.
    pub fn build<'a, I>(&self, corpus: I) -> Vocabulary
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let mut set: BTreeSet<CropToken> = BTreeSet::new();
        let mut sequences = 0usize;
        for sequence in corpus {
            sequences += 1;
            set.extend(tokenize_with(sequence, &self.delimiter));
        }
        debug!(
            "vocabulary built from {sequences} sequences: {} distinct crops",
            set.len()
        );
        Vocabulary {
            tokens: set.into_iter().collect(),
        }
    }
}

/// Derives the vocabulary a training run fits against from its cleaned corpus.
///
/// Schemas without crop features get an empty vocabulary.
#[must_use]
pub fn derive_vocabulary(corpus: &CleanedCorpus, schema: &FeatureSchema) -> Vocabulary {
    if !schema.crop_features {
        return Vocabulary::default();
    }
    VocabularyBuilder::new(schema.delimiter.clone()).build(
        corpus
            .records
            .iter()
            .map(|record| record.get(SEQUENCE_FIELD).and_then(serde_json::Value::as_str)),
    )
}
