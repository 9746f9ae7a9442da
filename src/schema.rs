//! Declarative feature schemas shared by the fitting and serving stages.
//!
//! A [`FeatureSchema`] is the single definition of which base fields a deployment
//! consumes, in which order, and with which primitive type. Both the
//! [`crate::trainer::Trainer`] and the [`crate::service::PredictionService`] read
//! the same value, and the trained artifact records it so the two halves cannot
//! silently diverge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IftError, Result};

/// Name of the field holding the delimited crop sequence.
pub const SEQUENCE_FIELD: &str = "sequence_cultures";
/// Name of the regression target.
pub const TARGET_FIELD: &str = "ift_histo_chimique_tot";
/// Name of the derived crop-count column.
pub const SEQUENCE_LENGTH_COLUMN: &str = "sequence_length";
/// Prefix applied to crop indicator columns.
pub const CROP_COLUMN_PREFIX: &str = "crop_";
/// Delimiter separating crops in [`SEQUENCE_FIELD`].
pub const DEFAULT_DELIMITER: &str = ">";

/// Primitive type of a base field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Non-negative integer count.
    Integer,
    /// Non-negative finite float.
    Float,
    /// Free-form category, one-hot encoded by the pipeline.
    Categorical,
}

impl FieldKind {
    /// Returns `true` for integer and float fields.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// A named, typed base field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    /// Record key.
    pub name: String,
    /// Primitive type.
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Builds a field specification.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered list of base fields plus the crop-sequence settings of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSchema {
    /// Base fields in column order.
    pub fields: Vec<FieldSpec>,
    /// Whether the crop sequence is expanded into `sequence_length` + indicator columns.
    pub crop_features: bool,
    /// Delimiter used to split [`SEQUENCE_FIELD`].
    pub delimiter: String,
}

impl FeatureSchema {
    /// Creates a schema, rejecting duplicate or reserved field names.
    pub fn new(fields: Vec<FieldSpec>, crop_features: bool) -> Result<Self> {
        let schema = Self {
            fields,
            crop_features,
            delimiter: DEFAULT_DELIMITER.to_string(),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Overrides the crop delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Farm context only: supply chain, department and farming type.
    #[must_use]
    pub fn context() -> Self {
        Self {
            fields: vec![
                FieldSpec::new("sdc_filiere", FieldKind::Categorical),
                FieldSpec::new("departement", FieldKind::Categorical),
                FieldSpec::new("sdc_type_agriculture", FieldKind::Categorical),
            ],
            crop_features: false,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }

    /// Rotation practices plus the crop sequence.
    #[must_use]
    pub fn rotation() -> Self {
        Self {
            fields: vec![
                FieldSpec::new("nb_cultures_rotation", FieldKind::Integer),
                FieldSpec::new("recours_macroorganismes", FieldKind::Categorical),
                FieldSpec::new("nbre_de_passages_desherbage_meca", FieldKind::Integer),
                FieldSpec::new("type_de_travail_du_sol", FieldKind::Categorical),
            ],
            crop_features: true,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }

    /// Rotation practices, crop sequence, and farm context with nitrogen input.
    #[must_use]
    pub fn rotation_context() -> Self {
        let mut schema = Self::rotation();
        schema.fields.extend([
            FieldSpec::new("departement", FieldKind::Categorical),
            FieldSpec::new("sdc_type_agriculture", FieldKind::Categorical),
            FieldSpec::new("ferti_n_tot", FieldKind::Float),
        ]);
        schema
    }

    /// Checks that field names are unique and do not collide with derived columns.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() && !self.crop_features {
            return Err(IftError::InvalidConfig(
                "schema must declare at least one base field or enable crop features".into(),
            ));
        }
        if self.crop_features && self.delimiter.is_empty() {
            return Err(IftError::InvalidConfig(
                "crop delimiter must not be empty".into(),
            ));
        }
        let mut seen = rustc_hash::FxHashSet::default();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(IftError::InvalidConfig("field names must not be empty".into()));
            }
            if field.name == TARGET_FIELD
                || field.name == SEQUENCE_FIELD
                || field.name == SEQUENCE_LENGTH_COLUMN
                || field.name.starts_with(CROP_COLUMN_PREFIX)
            {
                return Err(IftError::InvalidConfig(format!(
                    "field name `{}` is reserved",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(IftError::InvalidConfig(format!(
                    "field `{}` declared twice",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Names of the base fields in column order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Names of every field a request must carry.
    #[must_use]
    pub fn required_fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.field_names().collect();
        if self.crop_features {
            names.push(SEQUENCE_FIELD);
        }
        names
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::rotation_context()
    }
}

/// Named schema presets selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaPreset {
    /// [`FeatureSchema::context`].
    Context,
    /// [`FeatureSchema::rotation`].
    Rotation,
    /// [`FeatureSchema::rotation_context`].
    #[default]
    RotationContext,
}

impl SchemaPreset {
    /// Materialises the preset.
    #[must_use]
    pub fn schema(self) -> FeatureSchema {
        match self {
            Self::Context => FeatureSchema::context(),
            Self::Rotation => FeatureSchema::rotation(),
            Self::RotationContext => FeatureSchema::rotation_context(),
        }
    }
}

impl fmt::Display for SchemaPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Context => "context",
            Self::Rotation => "rotation",
            Self::RotationContext => "rotation-context",
        };
        f.write_str(label)
    }
}

impl FromStr for SchemaPreset {
    type Err = IftError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "context" => Ok(Self::Context),
            "rotation" => Ok(Self::Rotation),
            "rotation-context" | "rotation_context" => Ok(Self::RotationContext),
            other => Err(IftError::InvalidConfig(format!(
                "unknown schema preset `{other}` (expected context, rotation or rotation-context)"
            ))),
        }
    }
}
