//! Signal-store interface.
//!
//! The pipeline never touches files directly: subject recordings come in and
//! result arrays and tables go out through a [`SignalStore`]. Two stores ship
//! with the crate — [`MemoryStore`] below and the safetensors-backed
//! [`SafetensorsStore`](crate::io::SafetensorsStore).
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::recording::{SubjectId, SubjectRecording};

/// Channel layout and time axis shared by every array of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub ch_names: Vec<String>,
    pub sfreq: f64,
    pub times_s: Vec<f64>,
}

impl Layout {
    pub fn of(rec: &SubjectRecording) -> Self {
        Self {
            ch_names: rec.ch_names.clone(),
            sfreq: rec.sfreq,
            times_s: rec.times_s.clone(),
        }
    }

    pub fn n_channels(&self) -> usize {
        self.ch_names.len()
    }

    pub fn n_times(&self) -> usize {
        self.times_s.len()
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.ch_names.iter().position(|c| c == name)
    }

    /// Sample indices with `t_min_ms <= t <= t_max_ms`.
    pub fn window_samples(&self, t_min_ms: f64, t_max_ms: f64) -> Vec<usize> {
        self.times_s
            .iter()
            .enumerate()
            .filter(|(_, &t)| {
                let ms = t * 1000.0;
                ms >= t_min_ms && ms <= t_max_ms
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Descriptive metadata saved with every array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub name: String,
    pub layout: Layout,
    /// Subject behind each slice of the trailing axis.
    pub subjects: Vec<SubjectId>,
}

/// A `[C, T, N]` array with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledArray {
    pub data: Array3<f64>,
    pub meta: ArrayMeta,
}

impl LabeledArray {
    /// Wrap a single `[C, T]` slice as `[C, T, 1]`.
    pub fn single(data: Array2<f64>, meta: ArrayMeta) -> Self {
        Self { data: data.insert_axis(Axis(2)), meta }
    }
}

pub trait SignalStore: Send + Sync {
    /// Fails with [`StoreError::NotFound`] when the subject has no recording.
    fn load_subject(&self, subject: &SubjectId) -> Result<SubjectRecording, StoreError>;

    fn save_array(&self, array: &LabeledArray) -> Result<(), StoreError>;

    fn load_array(&self, name: &str) -> Result<LabeledArray, StoreError>;

    fn save_table(&self, name: &str, table: &serde_json::Value) -> Result<(), StoreError>;

    fn load_table(&self, name: &str) -> Result<serde_json::Value, StoreError>;
}

/// In-process store. Recordings are fixed at construction; saved arrays and
/// tables are kept behind a mutex so the store can be shared across threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    recordings: BTreeMap<SubjectId, SubjectRecording>,
    arrays: Mutex<BTreeMap<String, LabeledArray>>,
    tables: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new(recordings: impl IntoIterator<Item = SubjectRecording>) -> Self {
        Self {
            recordings: recordings.into_iter().map(|r| (r.subject.clone(), r)).collect(),
            ..Self::default()
        }
    }

    pub fn array_names(&self) -> Vec<String> {
        lock(&self.arrays).keys().cloned().collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.tables).keys().cloned().collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SignalStore for MemoryStore {
    fn load_subject(&self, subject: &SubjectId) -> Result<SubjectRecording, StoreError> {
        let rec = self
            .recordings
            .get(subject)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(subject.clone()))?;
        rec.validate()?;
        Ok(rec)
    }

    fn save_array(&self, array: &LabeledArray) -> Result<(), StoreError> {
        lock(&self.arrays).insert(array.meta.name.clone(), array.clone());
        Ok(())
    }

    fn load_array(&self, name: &str) -> Result<LabeledArray, StoreError> {
        lock(&self.arrays)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::MissingArtifact(name.to_string()))
    }

    fn save_table(&self, name: &str, table: &serde_json::Value) -> Result<(), StoreError> {
        lock(&self.tables).insert(name.to_string(), table.clone());
        Ok(())
    }

    fn load_table(&self, name: &str) -> Result<serde_json::Value, StoreError> {
        lock(&self.tables)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::MissingArtifact(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_inclusive_in_ms() {
        let layout = Layout {
            ch_names: vec!["Cz".into()],
            sfreq: 4.0,
            times_s: vec![0.0, 0.25, 0.5, 0.75, 1.0],
        };
        assert_eq!(layout.window_samples(250.0, 750.0), vec![1, 2, 3]);
        assert!(layout.window_samples(800.0, 900.0).is_empty());
    }

    #[test]
    fn missing_subject_is_not_found() {
        let store = MemoryStore::new(vec![]);
        assert!(matches!(
            store.load_subject(&"nobody".into()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn missing_array_is_missing_artifact() {
        let store = MemoryStore::default();
        assert!(matches!(store.load_array("x"), Err(StoreError::MissingArtifact(_))));
    }
}
