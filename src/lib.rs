//! Fit and serve a chemical-treatment intensity index (IFT) regressor.
//!
//! The crate covers both halves of the model's life: a training job that
//! cleans a historical corpus, derives the crop vocabulary, fits a
//! preprocessing + tree-ensemble pipeline and persists it, and a prediction
//! service that reloads the frozen artifact and rebuilds exactly the same
//! feature row for each request. The vocabulary is computed once at fit time
//! and travels with the model; serving never re-derives it.
//!
//! ```no_run
//! use dephy_ift::{
//!     ArtifactPaths, ArtifactStore, FeatureSchema, JsonLinesSource, PredictionService, Record,
//!     Trainer, TrainerConfig,
//! };
//!
//! # fn main() -> dephy_ift::Result<()> {
//! let cfg = TrainerConfig::builder().seed(42).show_progress(false).build()?;
//! let store = ArtifactStore::new(ArtifactPaths::default());
//! let trainer = Trainer::new(cfg, FeatureSchema::rotation());
//! let artifacts = trainer.run(&JsonLinesSource::new(["corpus.jsonl"]), &store)?;
//! println!("{artifacts}");
//!
//! let service = PredictionService::initialize(&store, None)?;
//! let request = Record::from_json_str(
//!     r#"{"nb_cultures_rotation": 3, "recours_macroorganismes": "Non",
//!         "nbre_de_passages_desherbage_meca": 1, "type_de_travail_du_sol": "Labour",
//!         "sequence_cultures": "Blé tendre > Colza > Orge"}"#,
//! )?;
//! println!("{}", service.predict_one(&request)?);
//! # Ok(())
//! # }
//! ```
//!
//! The `cli` and `server` features (both on by default) add the `dephy-ift`
//! binary and the axum HTTP boundary; `postgres` adds a corpus source reading
//! the DEPHY tables directly.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    rust_2018_idioms,
    future_incompatible,
    unused_lifetimes,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::multiple_crate_versions
)]

pub mod artifact;
pub mod config;
pub mod corpus;
pub mod error;
pub mod features;
pub mod metrics;
pub mod pipeline;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod schema;
pub mod sequence;
#[cfg(feature = "server")]
pub mod server;
pub mod service;
pub mod trainer;
pub mod vocabulary;

pub use artifact::{ArtifactMetadata, ArtifactStore, FittedArtifact};
pub use config::{ArtifactPaths, NumericScaling, RegressorConfig, TrainerBuilder, TrainerConfig};
pub use corpus::{clean, CleaningReport, CorpusSource, JsonLinesSource};
pub use error::{IftError, Result};
pub use features::{assemble, FeatureAssembler, FeatureLayout, FeatureRow};
pub use metrics::EvaluationMetrics;
pub use pipeline::ModelPipeline;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSource;
pub use record::{FieldValue, Record};
pub use schema::{FeatureSchema, FieldKind, FieldSpec, SchemaPreset};
pub use sequence::{tokenize, CropToken};
pub use service::{Prediction, PredictionService};
pub use trainer::{HeldOut, Trainer, TrainerArtifacts, TrainingReport, TrainingStage};
pub use vocabulary::{derive_vocabulary, Vocabulary, VocabularyBuilder};
