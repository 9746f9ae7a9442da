//! Splitting delimited crop-rotation strings into crop tokens.

use crate::schema::DEFAULT_DELIMITER;

/// A single trimmed, non-empty crop name parsed out of a rotation sequence.
pub type CropToken = String;

/// Splits `sequence` on `delimiter`, trimming each piece and discarding empty ones.
///
/// `None`, empty and whitespace-only inputs yield no tokens. Order of appearance
/// is preserved and duplicates are kept; deduplication belongs to
/// [`crate::vocabulary::VocabularyBuilder`]. This never fails: a string with no
/// delimiter simply yields a single token.
#[must_use]
pub fn tokenize_with(sequence: Option<&str>, delimiter: &str) -> Vec<CropToken> {
    let Some(sequence) = sequence else {
        return Vec::new();
    };
    if sequence.trim().is_empty() {
        return Vec::new();
    }
    if delimiter.is_empty() {
        return vec![sequence.trim().to_string()];
    }
    sequence
        .split(delimiter)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tokenizes with the default `>` delimiter.
#[must_use]
pub fn tokenize(sequence: Option<&str>) -> Vec<CropToken> {
    tokenize_with(sequence, DEFAULT_DELIMITER)
}
