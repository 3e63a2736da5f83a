//! # erp-post — offline ERP post-processing
//!
//! `erp-post` turns preprocessed, epoched EEG recordings of a group of
//! subjects into grand averages, subject-paired difference waves and
//! data-driven electrode clusters for ERP components.
//!
//! ## Pipeline overview
//!
//! ```text
//! <subject>.safetensors  [C, T, N] + trial labels
//!   │
//!   ├─ trim::trim_trials()            RT lower bound, then ±k·SD outliers (per condition)
//!   ├─ inclusion                      tier 1: accuracy + primary minima → dataset
//!   │                                 tier 2: per-condition minimum     → stack
//!   ├─ average::TwoStageAverager      subject means [C, T] → stacks [C, T, N_c]
//!   ├─ difference::difference_waves   minuend − subtrahend, paired by subject
//!   └─ cluster::select_clusters       reference waveform → strategy A / B
//!        │
//!        └─→ RunReport  (included / excluded subjects, skips, clusters)
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use erp_post::{Pipeline, PipelineConfig, SafetensorsStore, SubjectId};
//!
//! let store = SafetensorsStore::new("data/epochs", "out/run-1").unwrap();
//! let cfg = PipelineConfig::default();
//! let subjects: Vec<SubjectId> = ["sub-01", "sub-02", "sub-03"].map(SubjectId::from).to_vec();
//!
//! let out = Pipeline::new(&store, cfg).unwrap().run(&subjects).unwrap();
//! for c in &out.clusters {
//!     println!("{}: {:?} (mean {:.3})", c.component, c.electrodes, c.mean_amplitude);
//! }
//! print!("{}", out.report);
//! ```
//!
//! ## Running individual steps
//!
//! ```no_run
//! use erp_post::{trim_trials, TrimConfig};
//!
//! // Response times in seconds; positions refer to the recording's trials.
//! let kept = trim_trials(&[0, 1, 2], &[0.12, 0.45, 0.52], &TrimConfig::default()).unwrap();
//! assert_eq!(kept.kept, vec![1, 2]);
//! ```
//!
//! ## Subject order
//!
//! The order of the subject list handed to [`Pipeline::run`] is the
//! canonical order. A subject's slot in any condition's stack is derived from
//! it by [`InclusionTable::position_of`] and never stored separately.

pub mod average;
pub mod cluster;
pub mod condition;
pub mod config;
pub mod difference;
pub mod error;
pub mod inclusion;
pub mod io;
pub mod pipeline;
pub mod recording;
pub mod report;
pub mod store;
pub mod trim;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// config
pub use config::{
    ClusterConfig, ClusterStrategy, ComponentConfig, DifferenceWaveSpec, InclusionConfig,
    PipelineConfig, Polarity, StepMode, StepModes, TrimConfig,
};

// conditions and recordings
pub use condition::{ConditionCode, ConditionVocabulary};
pub use recording::{SubjectId, SubjectRecording, TrialMeta};

// processing steps
pub use average::{GrandAverage, TwoStageAverager};
pub use cluster::graph::ElectrodeGraph;
pub use cluster::{reference_waveform, select_clusters, ClusterResult, ReferenceWaveform};
pub use difference::{difference_waves, DifferenceWave, WaveSet};
pub use inclusion::{InclusionEvaluator, InclusionTable, StatsTable};
pub use trim::{trim_trials, TrialStats};

// orchestration and I/O
pub use error::{ConfigError, PipelineError, StoreError};
pub use io::{SafetensorsStore, StWriter};
pub use pipeline::{Pipeline, RunOutput};
pub use report::RunReport;
pub use store::{LabeledArray, MemoryStore, SignalStore};
