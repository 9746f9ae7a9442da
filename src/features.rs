//! Assembling fixed-schema feature rows from records.
//!
//! A row is laid out as the schema's base fields in declaration order, then
//! `sequence_length`, then one `crop_<token>` indicator per vocabulary entry.
//! The same [`FeatureLayout`] is produced for every row assembled against a
//! given schema and vocabulary, which is what lets the serving path rebuild the
//! exact columns the model was fitted on.

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{FieldValue, Record};
use crate::schema::{
    FeatureSchema, FieldKind, CROP_COLUMN_PREFIX, SEQUENCE_FIELD, SEQUENCE_LENGTH_COLUMN,
};
use crate::sequence::tokenize_with;
use crate::vocabulary::Vocabulary;

/// How the pipeline treats a column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Integer or float base field, or the derived sequence length.
    Numeric,
    /// Categorical base field, one-hot encoded.
    Categorical,
    /// Binary crop presence flag.
    Indicator,
}

/// A named column of the feature matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column treatment.
    pub kind: ColumnKind,
}

/// Ordered column set fully determined by a schema and a vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FeatureLayout {
    columns: Vec<Column>,
}

impl FeatureLayout {
    /// Derives the layout for `schema` expanded with `vocabulary`.
    #[must_use]
    pub fn new(schema: &FeatureSchema, vocabulary: &Vocabulary) -> Self {
        let mut columns: Vec<Column> = schema
            .fields
            .iter()
            .map(|field| Column {
                name: field.name.clone(),
                kind: match field.kind {
                    FieldKind::Categorical => ColumnKind::Categorical,
                    FieldKind::Integer | FieldKind::Float => ColumnKind::Numeric,
                },
            })
            .collect();
        if schema.crop_features {
            columns.push(Column {
                name: SEQUENCE_LENGTH_COLUMN.to_string(),
                kind: ColumnKind::Numeric,
            });
            columns.extend(vocabulary.iter().map(|token| Column {
                name: format!("{CROP_COLUMN_PREFIX}{token}"),
                kind: ColumnKind::Indicator,
            }));
        }
        Self { columns }
    }

    /// Columns in order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` when the layout has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Crop tokens encoded by the indicator columns, in order.
    pub fn crop_tokens(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|column| column.kind == ColumnKind::Indicator)
            .filter_map(|column| column.name.strip_prefix(CROP_COLUMN_PREFIX))
    }
}

/// One fully expanded row, aligned with a [`FeatureLayout`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureRow {
    values: Vec<FieldValue>,
}

impl FeatureRow {
    /// Values in layout order.
    #[must_use]
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` for a zero-width row.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }
}

/// Assembles one record into a feature row.
///
/// Base fields are copied with their declared types (categorical strings
/// trimmed), `sequence_length` counts the record's crop tokens, and each
/// vocabulary entry contributes `1` when present in the sequence and `0`
/// otherwise. Tokens absent from `vocabulary` contribute to no column and are
/// not an error. A missing or mistyped base field is a
/// [`crate::IftError::SchemaMismatch`].
pub fn assemble(
    record: &Record,
    vocabulary: &Vocabulary,
    schema: &FeatureSchema,
) -> Result<FeatureRow> {
    let mut values = Vec::with_capacity(schema.fields.len() + 1 + vocabulary.len());
    for field in &schema.fields {
        values.push(record.field(field)?);
    }
    if schema.crop_features {
        let tokens = tokenize_with(record.sequence(SEQUENCE_FIELD)?, &schema.delimiter);
        let mut indicators = vec![0i64; vocabulary.len()];
        let mut unseen = 0usize;
        for token in &tokens {
            match vocabulary.position(token) {
                Some(index) => indicators[index] = 1,
                None => unseen += 1,
            }
        }
        if unseen > 0 {
            debug!("{unseen} crop token(s) outside the vocabulary were ignored");
        }
        values.push(FieldValue::Integer(tokens.len() as i64));
        values.extend(indicators.into_iter().map(FieldValue::Integer));
    }
    Ok(FeatureRow { values })
}

/// Assembles many records against a fixed schema and vocabulary.
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    schema: FeatureSchema,
    vocabulary: Vocabulary,
    layout: FeatureLayout,
}

impl FeatureAssembler {
    /// Creates an assembler; the layout is derived once up front.
    #[must_use]
    pub fn new(schema: FeatureSchema, vocabulary: Vocabulary) -> Self {
        let layout = FeatureLayout::new(&schema, &vocabulary);
        Self {
            schema,
            vocabulary,
            layout,
        }
    }

    /// Layout every produced row conforms to.
    #[must_use]
    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// The vocabulary this assembler expands against.
    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// The schema this assembler reads.
    #[must_use]
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Assembles a single record.
    pub fn assemble(&self, record: &Record) -> Result<FeatureRow> {
        assemble(record, &self.vocabulary, &self.schema)
    }

    /// Assembles records in parallel, preserving input order.
    pub fn assemble_all(&self, records: &[Record]) -> Result<Vec<FeatureRow>> {
        records
            .par_iter()
            .map(|record| self.assemble(record))
            .collect()
    }
}
