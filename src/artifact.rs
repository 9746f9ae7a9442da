//! Persistence of fitted pipelines and their metadata sidecar.
//!
//! A trained model lives in two co-located files: the serialized
//! [`ModelPipeline`] blob and a JSON sidecar carrying the evaluation metrics,
//! the vocabulary (`known_crops`) and the schema. The sidecar also records the
//! SHA-256 fingerprint of the blob so a blob from one run can never be paired
//! with the sidecar of another.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::ArtifactPaths;
use crate::error::{IftError, Result};
use crate::features::FeatureLayout;
use crate::metrics::EvaluationMetrics;
use crate::pipeline::ModelPipeline;
use crate::schema::FeatureSchema;
use crate::vocabulary::Vocabulary;

/// Contents of the JSON sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    /// Row counts and held-out scores.
    #[serde(flatten)]
    pub metrics: EvaluationMetrics,
    /// Vocabulary the pipeline's indicator columns were built from.
    pub known_crops: Vocabulary,
    /// Schema the pipeline was trained with.
    pub schema: FeatureSchema,
    /// Feature column names, in order.
    pub feature_columns: Vec<String>,
    /// Hex SHA-256 of the pipeline blob.
    pub fingerprint: String,
    /// When the training run finished.
    pub trained_at: DateTime<Utc>,
    /// Version of this crate that wrote the artifact.
    pub crate_version: String,
}

impl ArtifactMetadata {
    /// Builds the metadata for a freshly fitted pipeline; the fingerprint is
    /// filled in by [`ArtifactStore::save`].
    #[must_use]
    pub fn new(
        metrics: EvaluationMetrics,
        known_crops: Vocabulary,
        schema: FeatureSchema,
        layout: &FeatureLayout,
    ) -> Self {
        Self {
            metrics,
            known_crops,
            schema,
            feature_columns: layout.names().map(str::to_string).collect(),
            fingerprint: String::new(),
            trained_at: Utc::now(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A loaded, verified artifact.
#[derive(Debug)]
pub struct FittedArtifact {
    /// The fitted pipeline.
    pub pipeline: ModelPipeline,
    /// Sidecar metadata.
    pub metadata: ArtifactMetadata,
}

impl FittedArtifact {
    /// The vocabulary persisted with the pipeline.
    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.metadata.known_crops
    }
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reads and writes artifacts at a fixed pair of paths.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    paths: ArtifactPaths,
}

impl ArtifactStore {
    /// Creates a store over explicit paths.
    #[must_use]
    pub fn new(paths: ArtifactPaths) -> Self {
        Self { paths }
    }

    /// Creates a store honouring `MODEL_PATH` / `METRICS_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ArtifactPaths::from_env())
    }

    /// Paths this store reads and writes.
    #[must_use]
    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Writes the pipeline blob, then the sidecar, each via a temporary file
    /// renamed into place. Returns the metadata with its fingerprint set.
    pub fn save(&self, pipeline: &ModelPipeline, mut metadata: ArtifactMetadata) -> Result<ArtifactMetadata> {
        let blob = pipeline.to_json_bytes()?;
        metadata.fingerprint = fingerprint(&blob);
        let sidecar = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&self.paths.model, &blob)?;
        write_atomic(&self.paths.metrics, &sidecar)?;
        info!(
            "saved pipeline to {} and metadata to {} (fingerprint {})",
            self.paths.model.display(),
            self.paths.metrics.display(),
            short(&metadata.fingerprint)
        );
        Ok(metadata)
    }

    /// Reads the sidecar only.
    pub fn load_metadata(&self) -> Result<ArtifactMetadata> {
        let path = &self.paths.metrics;
        let bytes = fs::read(path)
            .map_err(|err| IftError::artifact_load(path, format!("cannot read sidecar: {err}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| IftError::artifact_load(path, format!("malformed sidecar: {err}")))
    }

    /// Loads and verifies both files.
    ///
    /// Fails when either file is missing or malformed, when the blob does not
    /// match the sidecar fingerprint, or when the pipeline's feature layout
    /// disagrees with the persisted schema and vocabulary.
    pub fn load(&self) -> Result<FittedArtifact> {
        let metadata = self.load_metadata()?;
        let path = &self.paths.model;
        let blob = fs::read(path)
            .map_err(|err| IftError::artifact_load(path, format!("cannot read pipeline: {err}")))?;
        let actual = fingerprint(&blob);
        if actual != metadata.fingerprint {
            return Err(IftError::artifact_load(
                path,
                format!(
                    "fingerprint mismatch: sidecar expects {}, blob hashes to {}",
                    short(&metadata.fingerprint),
                    short(&actual)
                ),
            ));
        }
        let pipeline = ModelPipeline::from_json_slice(&blob)
            .map_err(|err| IftError::artifact_load(path, format!("malformed pipeline: {err}")))?;
        let expected = FeatureLayout::new(&metadata.schema, &metadata.known_crops);
        pipeline
            .check_layout(&expected)
            .map_err(|err| IftError::artifact_load(path, err.to_string()))?;
        Ok(FittedArtifact { pipeline, metadata })
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| IftError::io(err, Some(parent.clone())))?;
    let mut tmp = NamedTempFile::new_in(&parent).map_err(|err| IftError::io(err, Some(parent.clone())))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| IftError::io(err, Some(path.to_path_buf())))?;
    tmp.persist(path)
        .map_err(|err| IftError::io(err.error, Some(path.to_path_buf())))?;
    Ok(())
}
