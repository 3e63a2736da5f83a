//! Subject recordings: epoched signal plus per-trial behavioural labels.
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::condition::ConditionCode;
use crate::error::StoreError;

/// Subject identifier, e.g. `"sub-07"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        SubjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        SubjectId(s.to_string())
    }
}

/// Metadata of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialMeta {
    /// Base condition code.
    pub code: ConditionCode,
    /// Response time in **seconds**.
    pub rt_s: f64,
    /// Trial number in the behavioural log.
    pub index: u32,
}

/// One subject's preprocessed, epoched session. Read-only to the pipeline.
#[derive(Debug, Clone)]
pub struct SubjectRecording {
    pub subject: SubjectId,
    pub ch_names: Vec<String>,
    /// Sampling rate (Hz).
    pub sfreq: f64,
    /// Epoch time axis in seconds, length `T`.
    pub times_s: Vec<f64>,
    /// `[C, T, N]` — channels × time × trials.
    pub data: Array3<f64>,
    /// One entry per trial, aligned with `data`'s trailing axis.
    pub trials: Vec<TrialMeta>,
}

impl SubjectRecording {
    pub fn n_channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn n_times(&self) -> usize {
        self.data.dim().1
    }

    pub fn n_trials(&self) -> usize {
        self.data.dim().2
    }

    /// Check that labels, time axis and trial metadata agree with `data`.
    pub fn validate(&self) -> Result<(), StoreError> {
        let (n_ch, n_t, n_tr) = self.data.dim();
        let bad = |reason: String| StoreError::Malformed {
            name: self.subject.to_string(),
            reason,
        };
        if self.trials.is_empty() && n_tr > 0 {
            return Err(StoreError::MissingMetadata { subject: self.subject.clone() });
        }
        if self.ch_names.len() != n_ch {
            return Err(bad(format!("{} channel names for {n_ch} channels", self.ch_names.len())));
        }
        if self.times_s.len() != n_t {
            return Err(bad(format!("{} time points for {n_t} samples", self.times_s.len())));
        }
        if self.trials.len() != n_tr {
            return Err(bad(format!("{} trial labels for {n_tr} epochs", self.trials.len())));
        }
        Ok(())
    }

    /// Response times (seconds) of the trials at `positions`.
    pub fn response_times(&self, positions: &[usize]) -> Vec<f64> {
        positions.iter().map(|&i| self.trials[i].rt_s).collect()
    }

    /// Mean over the trials at `positions`, shape `[C, T]`.
    /// `None` when `positions` is empty.
    pub fn average_trials(&self, positions: &[usize]) -> Option<Array2<f64>> {
        if positions.is_empty() {
            return None;
        }
        self.data.select(Axis(2), positions).mean_axis(Axis(2))
    }
}
