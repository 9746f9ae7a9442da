//! Serving-side orchestration over a frozen artifact.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{ArtifactMetadata, ArtifactStore, FittedArtifact};
use crate::error::{IftError, Result};
use crate::features::FeatureAssembler;
use crate::pipeline::ModelPipeline;
use crate::record::Record;
use crate::schema::FeatureSchema;
use crate::vocabulary::Vocabulary;

/// Response body of a prediction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    /// Predicted chemical-treatment intensity index.
    pub ift_histo_chimique_tot: f64,
}

/// Read-only prediction state shared by every request.
///
/// The vocabulary and pipeline come from one verified artifact and are never
/// touched again; the type is `Send + Sync` and needs no locking.
#[derive(Debug)]
pub struct PredictionService {
    assembler: FeatureAssembler,
    pipeline: ModelPipeline,
    metadata: ArtifactMetadata,
}

impl PredictionService {
    /// Loads the artifact from `store`, failing on anything unusable.
    ///
    /// When `expected` is given, the persisted schema must equal it.
    pub fn initialize(store: &ArtifactStore, expected: Option<&FeatureSchema>) -> Result<Self> {
        let artifact = store.load()?;
        if let Some(expected) = expected {
            if *expected != artifact.metadata.schema {
                return Err(IftError::artifact_load(
                    &store.paths().metrics,
                    "artifact was trained with a different feature schema",
                ));
            }
        }
        Self::from_artifact(artifact)
    }

    /// Builds the service from an already verified artifact.
    ///
    /// This is where the assembler layout is matched against the pipeline,
    /// once for the lifetime of the service.
    pub fn from_artifact(artifact: FittedArtifact) -> Result<Self> {
        let FittedArtifact { pipeline, metadata } = artifact;
        let assembler = FeatureAssembler::new(metadata.schema.clone(), metadata.known_crops.clone());
        pipeline.check_layout(assembler.layout())?;
        info!(
            "model loaded with {} known crops: {:?} (fingerprint {})",
            metadata.known_crops.len(),
            metadata.known_crops.tokens(),
            metadata.fingerprint
        );
        Ok(Self {
            assembler,
            pipeline,
            metadata,
        })
    }

    /// Predicts one record: tokenize, assemble, predict.
    ///
    /// The assembler layout was checked against the pipeline when the service
    /// was built and cannot change afterwards.
    pub fn predict_one(&self, record: &Record) -> Result<f64> {
        let row = self.assembler.assemble(record)?;
        let value = self.pipeline.predict_one(&row)?;
        if !value.is_finite() {
            return Err(IftError::Internal(format!(
                "regressor produced a non-finite prediction ({value})"
            )));
        }
        Ok(value)
    }

    /// Predicts a JSON request body.
    pub fn predict_json(&self, body: Value) -> Result<Prediction> {
        let record = Record::from_json(body)?;
        Ok(Prediction {
            ift_histo_chimique_tot: self.predict_one(&record)?,
        })
    }

    /// The persisted vocabulary.
    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        self.assembler.vocabulary()
    }

    /// The persisted schema.
    #[must_use]
    pub fn schema(&self) -> &FeatureSchema {
        self.assembler.schema()
    }

    /// Sidecar metadata of the loaded artifact.
    #[must_use]
    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }
}
