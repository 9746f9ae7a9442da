//! Corpus suppliers and the cleaning step that turns raw rows into training data.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{IftError, Result};
use crate::record::{Coerced, Record};
use crate::schema::{FeatureSchema, SEQUENCE_FIELD, TARGET_FIELD};

/// File extensions recognised when walking a directory for JSON-lines files.
const LINE_FILE_EXTENSIONS: &[&str] = &["jsonl", "ndjson", "json"];

/// Supplier of raw training rows.
///
/// Implementations only hand back rows; filtering garbage is the job of
/// [`clean`].
pub trait CorpusSource: Send + Sync {
    /// Short human readable description used in logs.
    fn describe(&self) -> String;

    /// Fetches every row of the corpus.
    fn fetch(&self) -> Result<Vec<Record>>;
}

impl CorpusSource for Vec<Record> {
    fn describe(&self) -> String {
        format!("{} in-memory rows", self.len())
    }

    fn fetch(&self) -> Result<Vec<Record>> {
        Ok(self.clone())
    }
}

/// Reads one JSON object per line from files or directories.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    inputs: Vec<PathBuf>,
}

impl JsonLinesSource {
    /// Creates a source over files and/or directories.
    pub fn new<I, P>(inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolves the inputs to concrete files, walking directories recursively.
    ///
    /// Files named explicitly are always taken; files found inside directories
    /// must carry a `.jsonl`, `.ndjson` or `.json` extension.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for path in &self.inputs {
            let metadata = fs::metadata(path).map_err(|err| IftError::io(err, Some(path.clone())))?;
            if metadata.is_file() {
                files.push(path.clone());
                continue;
            }
            let mut found = Vec::new();
            for entry in WalkDir::new(path).follow_links(true) {
                let entry = entry.map_err(|err| IftError::Source(err.to_string()))?;
                if entry.file_type().is_file() && is_line_file(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            files.extend(found);
        }
        if files.is_empty() {
            return Err(IftError::Source(
                "no JSON-lines files discovered in the provided inputs".into(),
            ));
        }
        Ok(files)
    }
}

fn is_line_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| LINE_FILE_EXTENSIONS.contains(&ext))
}

impl CorpusSource for JsonLinesSource {
    fn describe(&self) -> String {
        format!("JSON lines from {} input path(s)", self.inputs.len())
    }

    fn fetch(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for file in self.files()? {
            let text = fs::read_to_string(&file).map_err(|err| IftError::io(err, Some(file.clone())))?;
            let before = records.len();
            for (index, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record = Record::from_json_str(line).map_err(|err| {
                    IftError::Source(format!("{}:{}: {err}", file.display(), index + 1))
                })?;
                records.push(record);
            }
            debug!("read {} rows from {}", records.len() - before, file.display());
        }
        Ok(records)
    }
}

/// Per-reason accounting of the cleaning step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleaningReport {
    /// Rows handed to the cleaning step.
    pub input_rows: usize,
    /// Rows that survived.
    pub kept_rows: usize,
    /// Rows dropped because the target was absent or `null`.
    pub dropped_null_target: usize,
    /// Rows dropped per base field found absent or `null` (first offending field wins).
    pub dropped_null_field: BTreeMap<String, usize>,
    /// Rows dropped because a numeric value (target included) failed coercion.
    pub dropped_invalid_numeric: usize,
    /// Rows dropped because the crop sequence was not a string.
    pub dropped_invalid_sequence: usize,
    /// Exact duplicates removed when duplicate dropping is enabled.
    pub dropped_duplicates: usize,
}

impl CleaningReport {
    /// Total number of dropped rows.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.input_rows - self.kept_rows
    }
}

/// Output of [`clean`]: normalised records aligned with their targets.
#[derive(Debug, Clone)]
pub struct CleanedCorpus {
    /// Records holding only schema fields, typed and trimmed.
    pub records: Vec<Record>,
    /// Target values, one per record.
    pub targets: Vec<f64>,
    /// What was dropped and why.
    pub report: CleaningReport,
}

enum RowOutcome {
    Keep(Record, f64),
    NullTarget,
    NullField(String),
    InvalidNumeric,
    InvalidSequence,
}

/// Filters and normalises raw rows against `schema`.
///
/// Rows with a null target or a null base field are dropped, never imputed.
/// Numeric fields are coerced (numeric strings accepted), categorical values
/// and sequences are trimmed. A target or base field that is null in every row
/// and an empty result are both [`IftError::DataQuality`] errors.
pub fn clean(records: Vec<Record>, schema: &FeatureSchema, drop_duplicates: bool) -> Result<CleanedCorpus> {
    if records.is_empty() {
        return Err(IftError::DataQuality("the corpus source returned no rows".into()));
    }
    if records.iter().all(|record| record.is_null(TARGET_FIELD)) {
        return Err(IftError::DataQuality(format!(
            "target `{TARGET_FIELD}` is null in every row"
        )));
    }
    for field in &schema.fields {
        if records.iter().all(|record| record.is_null(&field.name)) {
            return Err(IftError::DataQuality(format!(
                "required field `{}` is null in every row",
                field.name
            )));
        }
    }

    let mut report = CleaningReport {
        input_rows: records.len(),
        ..CleaningReport::default()
    };
    let mut seen = FxHashSet::default();
    let mut kept = Vec::new();
    let mut targets = Vec::new();
    for record in &records {
        match clean_row(record, schema) {
            RowOutcome::Keep(normalised, target) => {
                if drop_duplicates {
                    let key = format!("{}|{target}", serde_json::to_string(&normalised)?);
                    if !seen.insert(key) {
                        report.dropped_duplicates += 1;
                        continue;
                    }
                }
                kept.push(normalised);
                targets.push(target);
            }
            RowOutcome::NullTarget => report.dropped_null_target += 1,
            RowOutcome::NullField(name) => *report.dropped_null_field.entry(name).or_default() += 1,
            RowOutcome::InvalidNumeric => report.dropped_invalid_numeric += 1,
            RowOutcome::InvalidSequence => report.dropped_invalid_sequence += 1,
        }
    }
    report.kept_rows = kept.len();

    info!(
        "cleaning kept {}/{} rows (null target: {}, null field: {}, invalid numeric: {}, invalid sequence: {}, duplicates: {})",
        report.kept_rows,
        report.input_rows,
        report.dropped_null_target,
        report.dropped_null_field.values().sum::<usize>(),
        report.dropped_invalid_numeric,
        report.dropped_invalid_sequence,
        report.dropped_duplicates,
    );
    if kept.is_empty() {
        return Err(IftError::DataQuality(
            "no training rows left after cleaning".into(),
        ));
    }
    Ok(CleanedCorpus {
        records: kept,
        targets,
        report,
    })
}

fn clean_row(record: &Record, schema: &FeatureSchema) -> RowOutcome {
    let target = match record.coerce_target(TARGET_FIELD) {
        Coerced::Value(target) => target,
        Coerced::Null => return RowOutcome::NullTarget,
        Coerced::Invalid => return RowOutcome::InvalidNumeric,
    };
    let mut normalised = Record::new();
    for field in &schema.fields {
        match record.coerce_field(field) {
            Coerced::Value(value) => normalised.set_field(field.name.clone(), value),
            Coerced::Null => return RowOutcome::NullField(field.name.clone()),
            Coerced::Invalid => return RowOutcome::InvalidNumeric,
        }
    }
    if schema.crop_features {
        match record.coerce_sequence(SEQUENCE_FIELD) {
            Coerced::Value(sequence) => normalised.insert(SEQUENCE_FIELD, sequence),
            Coerced::Null => normalised.insert(SEQUENCE_FIELD, serde_json::Value::Null),
            Coerced::Invalid => return RowOutcome::InvalidSequence,
        }
    }
    RowOutcome::Keep(normalised, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use crate::schema::{FieldKind, FieldSpec};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(
            vec![
                FieldSpec::new("nb_cultures_rotation", FieldKind::Integer),
                FieldSpec::new("type_de_travail_du_sol", FieldKind::Categorical),
            ],
            true,
        )
        .expect("schema")
    }

    fn row(value: Value) -> Record {
        Record::from_json(value).expect("object")
    }

    #[test]
    fn drops_and_normalises_rows() {
        let records = vec![
            row(json!({"ift_histo_chimique_tot": 2.5, "nb_cultures_rotation": "3", "type_de_travail_du_sol": " Labour ", "sequence_cultures": " Blé > Orge ", "extra": 1})),
            row(json!({"ift_histo_chimique_tot": null, "nb_cultures_rotation": 2, "type_de_travail_du_sol": "TCS", "sequence_cultures": "Blé"})),
            row(json!({"ift_histo_chimique_tot": "1,5", "nb_cultures_rotation": null, "type_de_travail_du_sol": "TCS", "sequence_cultures": "Blé"})),
            row(json!({"ift_histo_chimique_tot": 1.0, "nb_cultures_rotation": "abc", "type_de_travail_du_sol": "TCS", "sequence_cultures": "Blé"})),
            row(json!({"ift_histo_chimique_tot": 1.0, "nb_cultures_rotation": 4, "type_de_travail_du_sol": "TCS", "sequence_cultures": 12})),
            row(json!({"ift_histo_chimique_tot": 0.0, "nb_cultures_rotation": 1, "type_de_travail_du_sol": "TCS", "sequence_cultures": null})),
        ];
        let cleaned = clean(records, &schema(), false).expect("clean");
        assert_eq!(cleaned.targets, vec![2.5, 0.0]);
        let first = &cleaned.records[0];
        assert_eq!(first.get("extra"), None);
        assert_eq!(first.get("sequence_cultures"), Some(&json!("Blé > Orge")));
        assert_eq!(
            first
                .field(&FieldSpec::new("nb_cultures_rotation", FieldKind::Integer))
                .expect("typed"),
            FieldValue::Integer(3)
        );
        assert_eq!(
            first
                .field(&FieldSpec::new("type_de_travail_du_sol", FieldKind::Categorical))
                .expect("trimmed"),
            FieldValue::Text("Labour".into())
        );
        let report = cleaned.report;
        assert_eq!(report.input_rows, 6);
        assert_eq!(report.kept_rows, 2);
        assert_eq!(report.dropped_null_target, 1);
        assert_eq!(report.dropped_null_field.get("nb_cultures_rotation"), Some(&1));
        assert_eq!(report.dropped_invalid_numeric, 1);
        assert_eq!(report.dropped_invalid_sequence, 1);
        assert_eq!(report.dropped(), 4);
    }

    #[test]
    fn all_null_target_is_data_quality_error() {
        let records = vec![
            row(json!({"ift_histo_chimique_tot": null, "nb_cultures_rotation": 1, "type_de_travail_du_sol": "TCS"})),
            row(json!({"nb_cultures_rotation": 2, "type_de_travail_du_sol": "TCS"})),
        ];
        let err = clean(records, &schema(), false).expect_err("null target");
        assert!(matches!(err, IftError::DataQuality(message) if message.contains("ift_histo_chimique_tot")));
    }

    #[test]
    fn all_null_field_is_data_quality_error() {
        let records = vec![row(
            json!({"ift_histo_chimique_tot": 1.0, "nb_cultures_rotation": 1, "type_de_travail_du_sol": null}),
        )];
        let err = clean(records, &schema(), false).expect_err("null field");
        assert!(matches!(err, IftError::DataQuality(message) if message.contains("type_de_travail_du_sol")));
    }

    #[test]
    fn empty_after_cleaning_is_data_quality_error() {
        let records = vec![
            row(json!({"ift_histo_chimique_tot": -1.0, "nb_cultures_rotation": 1, "type_de_travail_du_sol": "TCS"})),
            row(json!({"ift_histo_chimique_tot": 1.0, "nb_cultures_rotation": null, "type_de_travail_du_sol": "TCS"})),
            row(json!({"ift_histo_chimique_tot": null, "nb_cultures_rotation": 2, "type_de_travail_du_sol": null})),
        ];
        assert!(matches!(
            clean(records, &schema(), false),
            Err(IftError::DataQuality(_))
        ));
        assert!(matches!(
            clean(Vec::new(), &schema(), false),
            Err(IftError::DataQuality(_))
        ));
    }

    #[test]
    fn duplicates_dropped_only_when_enabled() {
        let make = || {
            vec![
                row(json!({"ift_histo_chimique_tot": 1.0, "nb_cultures_rotation": 1, "type_de_travail_du_sol": "TCS", "sequence_cultures": "Blé"})),
                row(json!({"ift_histo_chimique_tot": "1", "nb_cultures_rotation": "1", "type_de_travail_du_sol": "TCS ", "sequence_cultures": "Blé "})),
            ]
        };
        assert_eq!(clean(make(), &schema(), false).expect("clean").records.len(), 2);
        let cleaned = clean(make(), &schema(), true).expect("clean");
        assert_eq!(cleaned.records.len(), 1);
        assert_eq!(cleaned.report.dropped_duplicates, 1);
    }

    #[test]
    fn json_lines_source_walks_directories() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("create nested");
        fs::write(
            dir.path().join("a.jsonl"),
            "{\"ift_histo_chimique_tot\": 1.0}\n\n{\"ift_histo_chimique_tot\": 2.0}\n",
        )
        .expect("write a");
        fs::write(nested.join("b.jsonl"), "{\"ift_histo_chimique_tot\": 3.0}\n").expect("write b");
        fs::write(nested.join("notes.txt"), "not json").expect("write notes");

        let source = JsonLinesSource::new([dir.path()]);
        assert_eq!(source.files().expect("files").len(), 2);
        let records = source.fetch().expect("fetch");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].coerce_target(TARGET_FIELD), Coerced::Value(1.0));
    }

    #[test]
    fn malformed_line_names_file_and_line() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("bad.jsonl");
        fs::write(&file, "{\"a\": 1}\n[1, 2]\n").expect("write");
        let err = JsonLinesSource::new([&file]).fetch().expect_err("malformed");
        assert!(matches!(err, IftError::Source(message) if message.contains("bad.jsonl:2")));
    }
}
