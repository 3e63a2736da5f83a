//! Error taxonomy.
//!
//! Three layers, matching how the pipeline reacts to them:
//!
//! * [`ConfigError`] — rejected at construction time, before any data is read.
//! * [`StoreError`]  — raised by a [`SignalStore`](crate::store::SignalStore);
//!   per-subject load failures are recoverable (the subject is skipped),
//!   everything else propagates.
//! * [`PipelineError`] — fatal conditions that abort the run.
//!
//! Per-item conditions (a difference wave with no shared subjects, an empty
//! condition stack) are not errors at all; they are recorded in the
//! [`RunReport`](crate::report::RunReport).
use thiserror::Error;

use crate::condition::ConditionCode;
use crate::recording::SubjectId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("condition code {0} is not part of the vocabulary")]
    UnknownCondition(ConditionCode),

    #[error("electrode '{electrode}' referenced by {context} is not in the montage")]
    UnknownElectrode { electrode: String, context: String },

    #[error("difference-wave table row {row}: {reason}")]
    MalformedWaveTable { row: usize, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field: field.into(), reason: reason.into() }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no recording found for subject {0}")]
    NotFound(SubjectId),

    #[error("recording for subject {subject} has no trial metadata")]
    MissingMetadata { subject: SubjectId },

    #[error("artifact '{0}' not found")]
    MissingArtifact(String),

    #[error("malformed store entry '{name}': {reason}")]
    Malformed { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Load failures that only cost the run one subject.
    pub fn is_per_subject(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::MissingMetadata { .. }
                | StoreError::Malformed { .. }
                | StoreError::Io(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("accuracy undefined for subject {subject}: no visible-target trials")]
    UndefinedAccuracy { subject: SubjectId },

    #[error("component '{component}': no candidate cluster contains the maximal-deflection electrode {electrode}")]
    NoEligibleCluster { component: String, electrode: String },

    #[error("component '{component}': no electrode combination satisfies the cluster constraints")]
    NoValidCombination { component: String },

    #[error("component '{component}': time window {t_min_ms}..{t_max_ms} ms contains no samples")]
    EmptyWindow { component: String, t_min_ms: f64, t_max_ms: f64 },

    #[error("required artifact missing in load mode: {0}")]
    MissingArtifact(String),

    #[error("stack for condition {code} is inconsistent: slot {slot} holds {found}, expected {expected}")]
    InconsistentStack {
        code: ConditionCode,
        slot: usize,
        expected: SubjectId,
        found: String,
    },

    #[error("invalid trial input: {0}")]
    TrialInput(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
