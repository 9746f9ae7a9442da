//! Training job: fetch, clean, derive the vocabulary, fit, evaluate, persist.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactMetadata, ArtifactStore};
use crate::config::{TrainerBuilder, TrainerConfig};
use crate::corpus::{clean, CleaningReport, CorpusSource};
use crate::error::{IftError, Result};
use crate::features::{FeatureAssembler, FeatureRow};
use crate::metrics::{EvaluationMetrics, StageTimings};
use crate::pipeline::ModelPipeline;
use crate::record::Record;
use crate::schema::FeatureSchema;
use crate::vocabulary::{derive_vocabulary, Vocabulary};

/// States of a training run, in execution order; `Failed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingStage {
    /// Reading rows from the corpus source.
    Fetching,
    /// Dropping null / invalid rows and normalising values.
    Cleaning,
    /// Deriving the crop vocabulary from the cleaned corpus.
    BuildingVocab,
    /// Expanding records into feature rows.
    Assembling,
    /// Seeded train/test split.
    Splitting,
    /// Fitting the preprocessing + regression pipeline.
    Fitting,
    /// Scoring the held-out split.
    Evaluating,
    /// Writing the artifact pair.
    Persisting,
    /// Run finished successfully.
    Done,
    /// Run aborted; nothing was written.
    Failed,
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetching => "FETCHING",
            Self::Cleaning => "CLEANING",
            Self::BuildingVocab => "BUILDING_VOCAB",
            Self::Assembling => "ASSEMBLING",
            Self::Splitting => "SPLITTING",
            Self::Fitting => "FITTING",
            Self::Evaluating => "EVALUATING",
            Self::Persisting => "PERSISTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Callback notified on every stage transition.
pub type StageObserver = Arc<dyn Fn(TrainingStage) + Send + Sync>;

/// Summary of a training run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingReport {
    /// Cleaning accounting.
    pub cleaning: CleaningReport,
    /// Held-out metrics.
    pub metrics: EvaluationMetrics,
    /// Number of crop tokens in the derived vocabulary.
    pub vocabulary_size: usize,
    /// Per-stage wall-clock time.
    pub timings: StageTimings,
}

/// Held-out rows of a run and the predictions scored against them.
#[derive(Debug, Clone, Default)]
pub struct HeldOut {
    /// Cleaned test-split records, in evaluation order.
    pub records: Vec<Record>,
    /// Their targets.
    pub targets: Vec<f64>,
    /// What the fitted pipeline predicted for them while evaluating.
    pub predictions: Vec<f64>,
}

/// Everything a successful run produces.
#[must_use]
#[derive(Debug)]
pub struct TrainerArtifacts {
    /// Fitted pipeline.
    pub pipeline: ModelPipeline,
    /// Vocabulary the pipeline was fitted against.
    pub vocabulary: Vocabulary,
    /// Sidecar metadata (fingerprint set once persisted).
    pub metadata: ArtifactMetadata,
    /// Run summary.
    pub report: TrainingReport,
    /// Test split with its evaluation predictions.
    pub held_out: HeldOut,
}

impl fmt::Display for TrainerArtifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = &self.report.metrics;
        writeln!(f, "rows: {}", metrics.rows)?;
        writeln!(f, "train_rows: {}", metrics.train_rows)?;
        writeln!(f, "test_rows: {}", metrics.test_rows)?;
        writeln!(f, "mae: {:.4}", metrics.mae)?;
        writeln!(f, "rmse: {:.4}", metrics.rmse)?;
        writeln!(f, "r2: {:.4}", metrics.r2)?;
        writeln!(f, "known_crops: {}", self.vocabulary.len())?;
        writeln!(f, "duration: {:.2?}", self.report.timings.total())
    }
}

/// Configured training job for one schema.
#[derive(Clone)]
pub struct Trainer {
    cfg: TrainerConfig,
    schema: FeatureSchema,
    observer: Option<StageObserver>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("cfg", &self.cfg)
            .field("schema", &self.schema)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Trainer {
    /// Creates a trainer for `schema`.
    #[must_use]
    pub fn new(cfg: TrainerConfig, schema: FeatureSchema) -> Self {
        Self {
            cfg,
            schema,
            observer: None,
        }
    }

    /// Returns a [`TrainerBuilder`] with default settings.
    #[must_use]
    pub fn builder() -> TrainerBuilder {
        TrainerConfig::builder()
    }

    /// Registers a callback invoked on each stage transition.
    #[must_use]
    pub fn with_stage_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.cfg
    }

    /// The schema rows are assembled against.
    #[must_use]
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Runs every stage and persists the result through `store`.
    ///
    /// Any failure moves the job to [`TrainingStage::Failed`] before an
    /// artifact file is touched.
    pub fn run(&self, source: &dyn CorpusSource, store: &ArtifactStore) -> Result<TrainerArtifacts> {
        let result = self.fit_source(source).and_then(|mut artifacts| {
            self.enter(TrainingStage::Persisting);
            let started = Instant::now();
            artifacts.metadata = store.save(&artifacts.pipeline, artifacts.metadata.clone())?;
            artifacts.report.timings.persist = started.elapsed();
            Ok(artifacts)
        });
        self.finish(result)
    }

    /// Runs every stage except persistence.
    pub fn train(&self, source: &dyn CorpusSource) -> Result<TrainerArtifacts> {
        let result = self.fit_source(source);
        self.finish(result)
    }

    /// Runs the stages from cleaning through evaluation on in-memory rows.
    pub fn train_records(&self, records: Vec<Record>) -> Result<TrainerArtifacts> {
        let result = self.validate().and_then(|()| self.fit_records(records));
        self.finish(result)
    }

    fn validate(&self) -> Result<()> {
        self.cfg.validate()?;
        self.schema.validate()
    }

    fn fit_source(&self, source: &dyn CorpusSource) -> Result<TrainerArtifacts> {
        self.validate()?;
        self.enter(TrainingStage::Fetching);
        let started = Instant::now();
        let records = source.fetch()?;
        let elapsed = started.elapsed();
        info!("fetched {} rows from {}", records.len(), source.describe());
        let mut artifacts = self.fit_records(records)?;
        artifacts.report.timings.fetch = elapsed;
        Ok(artifacts)
    }

    fn fit_records(&self, records: Vec<Record>) -> Result<TrainerArtifacts> {
        let mut timings = StageTimings::default();

        self.enter(TrainingStage::Cleaning);
        let started = Instant::now();
        let cleaned = clean(records, &self.schema, self.cfg.drop_duplicates)?;
        timings.clean = started.elapsed();

        self.enter(TrainingStage::BuildingVocab);
        let started = Instant::now();
        let vocabulary = derive_vocabulary(&cleaned, &self.schema);
        info!("vocabulary holds {} crop tokens", vocabulary.len());

        self.enter(TrainingStage::Assembling);
        let assembler = FeatureAssembler::new(self.schema.clone(), vocabulary);
        let rows = assembler.assemble_all(&cleaned.records)?;
        timings.assemble = started.elapsed();
        debug!("assembled {} rows x {} columns", rows.len(), assembler.layout().len());

        self.enter(TrainingStage::Splitting);
        let split = split_rows(rows, cleaned.targets, self.cfg.test_fraction, self.cfg.seed)?;
        info!(
            "split {} train / {} test rows (seed {})",
            split.train_rows.len(),
            split.test_rows.len(),
            self.cfg.seed
        );

        self.enter(TrainingStage::Fitting);
        let started = Instant::now();
        let pipeline = ModelPipeline::fit(
            assembler.layout(),
            &split.train_rows,
            &split.train_targets,
            self.cfg.numeric_scaling,
            &self.cfg.regressor,
        )?;
        timings.fit = started.elapsed();

        self.enter(TrainingStage::Evaluating);
        let started = Instant::now();
        let predictions = pipeline.predict(&split.test_rows)?;
        let metrics = EvaluationMetrics::evaluate(&split.test_targets, &predictions, split.train_rows.len());
        timings.evaluate = started.elapsed();
        info!(
            "held-out mae {:.4} rmse {:.4} r2 {:.4}",
            metrics.mae, metrics.rmse, metrics.r2
        );

        let held_out = HeldOut {
            records: split
                .test_positions
                .iter()
                .map(|&index| cleaned.records[index].clone())
                .collect(),
            targets: split.test_targets,
            predictions,
        };
        let vocabulary = assembler.vocabulary().clone();
        let metadata = ArtifactMetadata::new(
            metrics,
            vocabulary.clone(),
            self.schema.clone(),
            assembler.layout(),
        );
        Ok(TrainerArtifacts {
            pipeline,
            report: TrainingReport {
                cleaning: cleaned.report,
                metrics,
                vocabulary_size: vocabulary.len(),
                timings,
            },
            vocabulary,
            metadata,
            held_out,
        })
    }

    fn finish(&self, result: Result<TrainerArtifacts>) -> Result<TrainerArtifacts> {
        match result {
            Ok(artifacts) => {
                self.enter(TrainingStage::Done);
                Ok(artifacts)
            }
            Err(err) => {
                warn!("training failed: {err}");
                self.enter(TrainingStage::Failed);
                Err(err)
            }
        }
    }

    fn enter(&self, stage: TrainingStage) {
        if self.cfg.show_progress {
            info!("stage={stage}");
        } else {
            debug!("stage={stage}");
        }
        if let Some(observer) = &self.observer {
            observer(stage);
        }
    }
}

/// Rows partitioned by [`split_rows`].
#[derive(Debug, Clone)]
pub struct Split {
    /// Training rows.
    pub train_rows: Vec<FeatureRow>,
    /// Training targets.
    pub train_targets: Vec<f64>,
    /// Held-out rows.
    pub test_rows: Vec<FeatureRow>,
    /// Held-out targets.
    pub test_targets: Vec<f64>,
    /// Input positions of the held-out rows, in split order.
    pub test_positions: Vec<usize>,
}

/// Seeded shuffle split; the test side receives `ceil(n * test_fraction)` rows.
pub fn split_rows(rows: Vec<FeatureRow>, targets: Vec<f64>, test_fraction: f64, seed: u64) -> Result<Split> {
    if rows.len() != targets.len() {
        return Err(IftError::Internal(format!(
            "{} rows but {} targets",
            rows.len(),
            targets.len()
        )));
    }
    let n = rows.len();
    let n_test = ((n as f64) * test_fraction).ceil() as usize;
    if n_test >= n {
        return Err(IftError::DataQuality(format!(
            "{n} cleaned row(s) cannot be split with test_fraction {test_fraction}; the training split would be empty"
        )));
    }
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let mut slots: Vec<Option<(FeatureRow, f64)>> = rows.into_iter().zip(targets).map(Some).collect();
    let mut split = Split {
        train_rows: Vec::with_capacity(n - n_test),
        train_targets: Vec::with_capacity(n - n_test),
        test_rows: Vec::with_capacity(n_test),
        test_targets: Vec::with_capacity(n_test),
        test_positions: Vec::with_capacity(n_test),
    };
    for (rank, index) in order.into_iter().enumerate() {
        let Some((row, target)) = slots[index].take() else {
            continue;
        };
        if rank < n_test {
            split.test_rows.push(row);
            split.test_targets.push(target);
            split.test_positions.push(index);
        } else {
            split.train_rows.push(row);
            split.train_targets.push(target);
        }
    }
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactPaths;
    use crate::features::assemble;
    use crate::record::FieldValue;
    use crate::service::PredictionService;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn config() -> TrainerConfig {
        TrainerConfig::builder()
            .n_trees(30)
            .max_depth(4)
            .show_progress(false)
            .build()
            .expect("config")
    }

    fn corpus(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let (soil, sequence, base) = match i % 3 {
                    0 => ("Labour", "Blé tendre > Colza > Orge", 4.5),
                    1 => ("Semis direct", "Maïs grain > Soja", 1.5),
                    _ => ("TCS", "Blé tendre > Tournesol", 3.0),
                };
                Record::from_json(json!({
                    "ift_histo_chimique_tot": base + (i % 4) as f64 * 0.1,
                    "nb_cultures_rotation": 2 + i % 3,
                    "recours_macroorganismes": if i % 2 == 0 { "Oui" } else { "Non" },
                    "nbre_de_passages_desherbage_meca": i % 4,
                    "type_de_travail_du_sol": soil,
                    "sequence_cultures": sequence,
                }))
                .expect("object")
            })
            .collect()
    }

    #[test]
    fn split_is_seeded_and_sized() {
        let rows: Vec<FeatureRow> = (0..10)
            .map(|i| {
                let record = Record::new().with("n", i);
                let schema = FeatureSchema::new(
                    vec![crate::schema::FieldSpec::new("n", crate::schema::FieldKind::Integer)],
                    false,
                )
                .expect("schema");
                assemble(&record, &Vocabulary::default(), &schema).expect("row")
            })
            .collect();
        let targets: Vec<f64> = (0..10).map(f64::from).collect();
        let a = split_rows(rows.clone(), targets.clone(), 0.2, 42).expect("split");
        let b = split_rows(rows, targets, 0.2, 42).expect("split");
        assert_eq!(a.test_rows.len(), 2);
        assert_eq!(a.train_rows.len(), 8);
        assert_eq!(a.test_targets, b.test_targets);
        for (row, target) in a.test_rows.iter().zip(&a.test_targets) {
            assert_eq!(row.get(0), Some(&FieldValue::Integer(*target as i64)));
        }
    }

    #[test]
    fn split_rejects_empty_input() {
        let err = split_rows(Vec::new(), Vec::new(), 0.2, 1).expect_err("empty");
        assert!(matches!(err, IftError::DataQuality(_)));
    }

    #[test]
    fn vocabulary_covers_every_cleaned_row() {
        let trainer = Trainer::new(config(), FeatureSchema::rotation());
        let artifacts = trainer.train_records(corpus(30)).expect("train");
        assert_eq!(
            artifacts.vocabulary.tokens(),
            &["Blé tendre", "Colza", "Maïs grain", "Orge", "Soja", "Tournesol"]
        );
        assert_eq!(artifacts.report.metrics.rows, 30);
        assert_eq!(artifacts.report.metrics.test_rows, 6);
        assert_eq!(artifacts.metadata.known_crops, artifacts.vocabulary);
        assert!(artifacts.report.metrics.mae.is_finite());
    }

    #[test]
    fn run_persists_and_reports_stages() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(ArtifactPaths::new(
            dir.path().join("model.json"),
            dir.path().join("metrics.json"),
        ));
        let seen: Arc<Mutex<Vec<TrainingStage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trainer = Trainer::new(config(), FeatureSchema::rotation()).with_stage_observer(
            Arc::new(move |stage: TrainingStage| sink.lock().expect("lock").push(stage)),
        );
        let artifacts = trainer.run(&corpus(20), &store).expect("run");
        assert_eq!(artifacts.metadata.fingerprint.len(), 64);
        assert!(store.paths().model.exists());
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                TrainingStage::Fetching,
                TrainingStage::Cleaning,
                TrainingStage::BuildingVocab,
                TrainingStage::Assembling,
                TrainingStage::Splitting,
                TrainingStage::Fitting,
                TrainingStage::Evaluating,
                TrainingStage::Persisting,
                TrainingStage::Done,
            ]
        );
    }

    #[test]
    fn null_targets_fail_without_writing_artifacts() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(ArtifactPaths::new(
            dir.path().join("model.json"),
            dir.path().join("metrics.json"),
        ));
        let records: Vec<Record> = corpus(5)
            .into_iter()
            .map(|mut record| {
                record.insert("ift_histo_chimique_tot", Value::Null);
                record
            })
            .collect();
        let seen: Arc<Mutex<Vec<TrainingStage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trainer = Trainer::new(config(), FeatureSchema::rotation()).with_stage_observer(
            Arc::new(move |stage: TrainingStage| sink.lock().expect("lock").push(stage)),
        );
        let err = trainer.run(&records, &store).expect_err("all targets null");
        assert!(matches!(err, IftError::DataQuality(_)));
        assert_eq!(seen.lock().expect("lock").last(), Some(&TrainingStage::Failed));
        assert!(!store.paths().model.exists());
        assert!(!store.paths().metrics.exists());
    }

    #[test]
    fn served_predictions_match_evaluation_predictions() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(ArtifactPaths::new(
            dir.path().join("model.json"),
            dir.path().join("metrics.json"),
        ));
        let artifacts = Trainer::new(config(), FeatureSchema::rotation())
            .run(&corpus(30), &store)
            .expect("run");
        let held_out = &artifacts.held_out;
        assert_eq!(held_out.records.len(), artifacts.report.metrics.test_rows);
        assert_eq!(held_out.predictions.len(), held_out.records.len());

        let service = PredictionService::initialize(&store, None).expect("init");
        for (record, expected) in held_out.records.iter().zip(&held_out.predictions) {
            let served = service.predict_one(record).expect("predict");
            assert_eq!(served.to_bits(), expected.to_bits());
        }
    }

    #[test]
    fn split_positions_index_the_input() {
        let schema = FeatureSchema::new(
            vec![crate::schema::FieldSpec::new("n", crate::schema::FieldKind::Integer)],
            false,
        )
        .expect("schema");
        let rows: Vec<FeatureRow> = (0..10)
            .map(|i| assemble(&Record::new().with("n", i), &Vocabulary::default(), &schema).expect("row"))
            .collect();
        let targets: Vec<f64> = (0..10).map(f64::from).collect();
        let split = split_rows(rows, targets, 0.3, 7).expect("split");
        let positions: Vec<f64> = split.test_positions.iter().map(|&i| i as f64).collect();
        assert_eq!(positions, split.test_targets);
    }

    #[test]
    fn stage_labels_match_state_names() {
        assert_eq!(TrainingStage::BuildingVocab.to_string(), "BUILDING_VOCAB");
        assert_eq!(
            serde_json::to_string(&TrainingStage::Failed).expect("json"),
            "\"FAILED\""
        );
    }
}
