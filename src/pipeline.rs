//! Preprocessing plus tree-ensemble regression over assembled feature rows.
//!
//! The [`Preprocessor`] is fitted once on the training split and then reused
//! verbatim: categorical columns are one-hot encoded against the categories
//! seen at fit time (unseen values encode as an all-zero block), numeric
//! columns pass through or are standardised with training statistics, and
//! crop indicators always pass through. The encoded matrix feeds a
//! gradient-boosted ensemble of regression trees from the `gbdt` crate.

use std::collections::BTreeSet;
use std::fmt;

use gbdt::config::Config as GbdtConfig;
use gbdt::decision_tree::{Data, DataVec, ValueType};
use gbdt::gradient_boost::GBDT;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{NumericScaling, RegressorConfig};
use crate::error::{IftError, Result};
use crate::features::{ColumnKind, FeatureLayout, FeatureRow};
use crate::record::FieldValue;

/// Loss used for the regression ensemble.
const SQUARED_ERROR_LOSS: &str = "SquaredError";

/// Per-column transformation learned at fit time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum ColumnTransform {
    /// Emit the numeric value unchanged.
    Passthrough,
    /// Emit `(value - mean) / scale`.
    Standardize {
        /// Training-split mean.
        mean: f64,
        /// Training-split standard deviation (1.0 for constant columns).
        scale: f64,
    },
    /// Emit one flag per known category, in sorted order.
    OneHot {
        /// Categories observed in the training split.
        categories: Vec<String>,
    },
}

impl ColumnTransform {
    fn width(&self) -> usize {
        match self {
            Self::OneHot { categories } => categories.len(),
            Self::Passthrough | Self::Standardize { .. } => 1,
        }
    }
}

/// Column-wise encoder turning feature rows into dense numeric vectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preprocessor {
    layout: FeatureLayout,
    transforms: Vec<ColumnTransform>,
}

impl Preprocessor {
    /// Learns per-column transforms from `rows`, which must conform to `layout`.
    pub fn fit(layout: &FeatureLayout, rows: &[FeatureRow], scaling: NumericScaling) -> Result<Self> {
        for row in rows {
            check_width(layout, row)?;
        }
        let transforms = layout
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| match column.kind {
                ColumnKind::Categorical => {
                    let categories: BTreeSet<String> = rows
                        .iter()
                        .filter_map(|row| row.get(index).and_then(FieldValue::as_text))
                        .map(str::to_string)
                        .collect();
                    ColumnTransform::OneHot {
                        categories: categories.into_iter().collect(),
                    }
                }
                ColumnKind::Numeric if scaling == NumericScaling::Standardize => {
                    let values: Vec<f64> = rows
                        .iter()
                        .filter_map(|row| row.get(index).and_then(FieldValue::as_f64))
                        .collect();
                    let (mean, scale) = mean_and_scale(&values);
                    ColumnTransform::Standardize { mean, scale }
                }
                ColumnKind::Numeric | ColumnKind::Indicator => ColumnTransform::Passthrough,
            })
            .collect();
        Ok(Self {
            layout: layout.clone(),
            transforms,
        })
    }

    /// Layout the preprocessor was fitted on.
    #[must_use]
    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Learned transforms, one per layout column.
    #[must_use]
    pub fn transforms(&self) -> &[ColumnTransform] {
        &self.transforms
    }

    /// Width of the encoded vectors.
    #[must_use]
    pub fn output_width(&self) -> usize {
        self.transforms.iter().map(ColumnTransform::width).sum()
    }

    /// Names of the encoded columns (`field=category` for one-hot blocks).
    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        self.layout
            .columns()
            .iter()
            .zip(&self.transforms)
            .flat_map(|(column, transform)| match transform {
                ColumnTransform::OneHot { categories } => categories
                    .iter()
                    .map(|category| format!("{}={category}", column.name))
                    .collect::<Vec<_>>(),
                _ => vec![column.name.clone()],
            })
            .collect()
    }

    /// Encodes one row.
    pub fn transform(&self, row: &FeatureRow) -> Result<Vec<f64>> {
        check_width(&self.layout, row)?;
        let mut encoded = Vec::with_capacity(self.output_width());
        for ((column, transform), value) in self
            .layout
            .columns()
            .iter()
            .zip(&self.transforms)
            .zip(row.values())
        {
            match transform {
                ColumnTransform::OneHot { categories } => {
                    let label = value.as_text().ok_or_else(|| {
                        IftError::Internal(format!(
                            "column `{}` expects a categorical value, found {value:?}",
                            column.name
                        ))
                    })?;
                    let start = encoded.len();
                    encoded.resize(start + categories.len(), 0.0);
                    match categories.binary_search_by(|probe| probe.as_str().cmp(label)) {
                        Ok(position) => encoded[start + position] = 1.0,
                        Err(_) => debug!(
                            "unseen category `{label}` for column `{}` encoded as zeros",
                            column.name
                        ),
                    }
                }
                ColumnTransform::Passthrough => encoded.push(numeric(column.name.as_str(), value)?),
                ColumnTransform::Standardize { mean, scale } => {
                    encoded.push((numeric(column.name.as_str(), value)? - mean) / scale);
                }
            }
        }
        Ok(encoded)
    }
}

fn check_width(layout: &FeatureLayout, row: &FeatureRow) -> Result<()> {
    if row.len() != layout.len() {
        return Err(IftError::Internal(format!(
            "feature row has {} values but the layout declares {} columns",
            row.len(),
            layout.len()
        )));
    }
    Ok(())
}

fn numeric(column: &str, value: &FieldValue) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        IftError::Internal(format!(
            "column `{column}` expects a numeric value, found {value:?}"
        ))
    })
}

fn mean_and_scale(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let scale = variance.sqrt();
    if scale > f64::EPSILON {
        (mean, scale)
    } else {
        (mean, 1.0)
    }
}

/// Fitted preprocessing and regression stages, persisted as one unit.
#[derive(Serialize, Deserialize)]
pub struct ModelPipeline {
    preprocessor: Preprocessor,
    regressor: GBDT,
    n_trees: usize,
}

impl fmt::Debug for ModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPipeline")
            .field("columns", &self.preprocessor.layout().len())
            .field("encoded_width", &self.preprocessor.output_width())
            .field("n_trees", &self.n_trees)
            .finish_non_exhaustive()
    }
}

impl ModelPipeline {
    /// Fits the preprocessor and the regressor on `rows` / `targets`.
    ///
    /// An empty matrix, a zero-width encoding, or non-finite targets abort the fit.
    pub fn fit(
        layout: &FeatureLayout,
        rows: &[FeatureRow],
        targets: &[f64],
        scaling: NumericScaling,
        regressor: &RegressorConfig,
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(IftError::Fit("cannot fit on an empty feature matrix".into()));
        }
        if rows.len() != targets.len() {
            return Err(IftError::Internal(format!(
                "{} feature rows but {} targets",
                rows.len(),
                targets.len()
            )));
        }
        if let Some(bad) = targets.iter().find(|target| !target.is_finite()) {
            return Err(IftError::Fit(format!("non-finite target value {bad}")));
        }

        let preprocessor = Preprocessor::fit(layout, rows, scaling)?;
        let width = preprocessor.output_width();
        if width == 0 {
            return Err(IftError::Fit(
                "feature matrix is rank-deficient: encoding produced zero columns".into(),
            ));
        }

        let encoded = encode_all(&preprocessor, rows)?;
        let mut training: DataVec = encoded
            .into_iter()
            .zip(targets)
            .map(|(features, &target)| {
                Data::new_training_data(to_value_types(&features), 1.0, target as ValueType, None)
            })
            .collect();

        let mut cfg = GbdtConfig::new();
        cfg.set_feature_size(width);
        cfg.set_max_depth(regressor.max_depth);
        cfg.set_iterations(regressor.n_trees);
        cfg.set_shrinkage(regressor.learning_rate);
        cfg.set_min_leaf_size(regressor.min_leaf_size);
        cfg.set_loss(SQUARED_ERROR_LOSS);
        cfg.set_data_sample_ratio(1.0);
        cfg.set_feature_sample_ratio(1.0);
        cfg.set_training_optimization_level(2);
        cfg.set_debug(false);

        debug!(
            "fitting {} trees on {} rows x {width} encoded columns",
            regressor.n_trees,
            training.len()
        );
        let mut model = GBDT::new(&cfg);
        model.fit(&mut training);

        Ok(Self {
            preprocessor,
            regressor: model,
            n_trees: regressor.n_trees,
        })
    }

    /// Layout the pipeline expects every row to follow.
    #[must_use]
    pub fn layout(&self) -> &FeatureLayout {
        self.preprocessor.layout()
    }

    /// Rejects a layout that differs from the one the pipeline was fitted on.
    pub fn check_layout(&self, layout: &FeatureLayout) -> Result<()> {
        let fitted = self.layout();
        if fitted == layout {
            return Ok(());
        }
        let first_difference = fitted
            .names()
            .zip(layout.names())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| fitted.len().min(layout.len()));
        Err(IftError::Internal(format!(
            "feature layout drift: pipeline expects {} columns, assembler produces {} (first difference at column {first_difference})",
            fitted.len(),
            layout.len()
        )))
    }

    /// The fitted preprocessing stage.
    #[must_use]
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Number of trees in the ensemble.
    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    /// Predicts a batch of rows.
    pub fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<f64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = encode_all(&self.preprocessor, rows)?;
        let data: DataVec = encoded
            .iter()
            .map(|features| Data::new_test_data(to_value_types(features), None))
            .collect();
        Ok(self
            .regressor
            .predict(&data)
            .into_iter()
            .map(f64::from)
            .collect())
    }

    /// Predicts a single row.
    pub fn predict_one(&self, row: &FeatureRow) -> Result<f64> {
        self.predict(std::slice::from_ref(row))?
            .pop()
            .ok_or_else(|| IftError::Internal("regressor returned no prediction".into()))
    }

    /// Serialises the pipeline to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Restores a pipeline from JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn encode_all(preprocessor: &Preprocessor, rows: &[FeatureRow]) -> Result<Vec<Vec<f64>>> {
    rows.par_iter()
        .map(|row| preprocessor.transform(row))
        .collect()
}

fn to_value_types(features: &[f64]) -> Vec<ValueType> {
    features.iter().map(|&value| value as ValueType).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::assemble;
    use crate::record::Record;
    use crate::schema::{FeatureSchema, FieldKind, FieldSpec, SEQUENCE_FIELD};
    use crate::vocabulary::Vocabulary;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(
            vec![
                FieldSpec::new("type_de_travail_du_sol", FieldKind::Categorical),
                FieldSpec::new("ferti_n_tot", FieldKind::Float),
            ],
            true,
        )
        .expect("schema")
    }

    fn record(soil: &str, nitrogen: f64, sequence: &str) -> Record {
        Record::new()
            .with("type_de_travail_du_sol", soil)
            .with("ferti_n_tot", nitrogen)
            .with(SEQUENCE_FIELD, sequence)
    }

    fn corpus() -> (FeatureLayout, Vec<FeatureRow>, Vec<f64>, Vocabulary) {
        let schema = schema();
        let vocab = Vocabulary::from_tokens(["Blé", "Colza", "Maïs"]);
        let layout = FeatureLayout::new(&schema, &vocab);
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..40 {
            let (soil, sequence, base) = match i % 4 {
                0 => ("Labour", "Blé > Colza", 4.0),
                1 => ("Semis direct", "Maïs", 1.0),
                2 => ("Labour", "Blé > Maïs > Blé", 3.0),
                _ => ("TCS", "Colza", 2.0),
            };
            let nitrogen = f64::from(i % 5) * 10.0;
            rows.push(assemble(&record(soil, nitrogen, sequence), &vocab, &schema).expect("row"));
            targets.push(base + nitrogen / 100.0);
        }
        (layout, rows, targets, vocab)
    }

    fn small_regressor() -> RegressorConfig {
        RegressorConfig {
            n_trees: 40,
            max_depth: 4,
            ..RegressorConfig::default()
        }
    }

    #[test]
    fn one_hot_ignores_unseen_categories() {
        let (layout, rows, _, vocab) = corpus();
        let pre = Preprocessor::fit(&layout, &rows, NumericScaling::Passthrough).expect("fit");
        // 3 soil categories + nitrogen + sequence_length + 3 crops
        assert_eq!(pre.output_width(), 8);
        let unseen = assemble(&record("Strip-till", 0.0, "Orge"), &vocab, &schema()).expect("row");
        let encoded = pre.transform(&unseen).expect("transform");
        assert_eq!(&encoded[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(encoded[4], 1.0);
        assert!(encoded[5..].iter().all(|flag| *flag == 0.0));
    }

    #[test]
    fn standardize_uses_training_statistics() {
        let (layout, rows, _, _) = corpus();
        let pre = Preprocessor::fit(&layout, &rows, NumericScaling::Standardize).expect("fit");
        match &pre.transforms()[1] {
            ColumnTransform::Standardize { mean, scale } => {
                assert!((mean - 20.0).abs() < 1e-9);
                assert!(*scale > 0.0);
            }
            other => panic!("expected standardize, got {other:?}"),
        }
        assert_eq!(pre.transforms()[3], ColumnTransform::Passthrough);
        assert!(pre.output_names().contains(&"type_de_travail_du_sol=Labour".to_string()));
    }

    #[test]
    fn fit_rejects_empty_and_zero_width_matrices() {
        let (layout, _, _, _) = corpus();
        let err = ModelPipeline::fit(
            &layout,
            &[],
            &[],
            NumericScaling::Passthrough,
            &small_regressor(),
        )
        .expect_err("empty matrix");
        assert!(matches!(err, IftError::Fit(_)));

        let schema = FeatureSchema::new(
            vec![FieldSpec::new("sdc_filiere", FieldKind::Categorical)],
            false,
        )
        .expect("schema");
        let layout = FeatureLayout::new(&schema, &Vocabulary::default());
        let row = assemble(
            &Record::new().with("sdc_filiere", "GC"),
            &Vocabulary::default(),
            &schema,
        )
        .expect("row");
        // a single category still yields one column, so the fit succeeds
        let pipeline = ModelPipeline::fit(
            &layout,
            &[row],
            &[1.0],
            NumericScaling::Passthrough,
            &small_regressor(),
        )
        .expect("single column fit");
        assert_eq!(pipeline.preprocessor().output_width(), 1);
    }

    #[test]
    fn fits_and_separates_groups() {
        let (layout, rows, targets, _) = corpus();
        let pipeline = ModelPipeline::fit(
            &layout,
            &rows,
            &targets,
            NumericScaling::Passthrough,
            &small_regressor(),
        )
        .expect("fit");
        let predictions = pipeline.predict(&rows[..2]).expect("predict");
        assert!(predictions.iter().all(|p| p.is_finite()));
        assert!(predictions[0] > predictions[1]);
    }

    #[test]
    fn serialized_pipeline_predicts_identically() {
        let (layout, rows, targets, _) = corpus();
        let pipeline = ModelPipeline::fit(
            &layout,
            &rows,
            &targets,
            NumericScaling::Standardize,
            &small_regressor(),
        )
        .expect("fit");
        let bytes = pipeline.to_json_bytes().expect("serialize");
        let first = ModelPipeline::from_json_slice(&bytes).expect("load");
        let second = ModelPipeline::from_json_slice(&bytes).expect("load");
        let a = first.predict(&rows).expect("predict");
        let b = second.predict(&rows).expect("predict");
        let original = pipeline.predict(&rows).expect("predict");
        assert_eq!(
            a.iter().map(|p| p.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|p| p.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(a, original);
        assert_eq!(first.layout(), &layout);
    }

    #[test]
    fn refitting_is_deterministic() {
        let (layout, rows, targets, _) = corpus();
        let fit = || {
            ModelPipeline::fit(
                &layout,
                &rows,
                &targets,
                NumericScaling::Passthrough,
                &small_regressor(),
            )
            .expect("fit")
            .predict(&rows)
            .expect("predict")
        };
        assert_eq!(fit(), fit());
    }

    #[test]
    fn transform_rejects_misaligned_rows() {
        let (layout, rows, _, _) = corpus();
        let pre = Preprocessor::fit(&layout, &rows, NumericScaling::Passthrough).expect("fit");
        let short = FeatureLayout::new(&schema(), &Vocabulary::from_tokens(["Blé"]));
        let row = assemble(&record("Labour", 1.0, "Blé"), &Vocabulary::from_tokens(["Blé"]), &schema())
            .expect("row");
        assert_eq!(row.len(), short.len());
        assert!(matches!(pre.transform(&row), Err(IftError::Internal(_))));
    }
}
