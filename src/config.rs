//! Pipeline configuration.
//!
//! [`PipelineConfig`] holds every tunable parameter of a run, grouped into one
//! record per component. All records have defaults matching the study's
//! analysis plan, and every field is `pub` so a variant can be built with
//! struct-update syntax:
//!
//! ```
//! use erp_post::config::{PipelineConfig, TrimConfig};
//!
//! let cfg = PipelineConfig {
//!     trim: TrimConfig { rt_lower_bound_ms: 200.0, ..TrimConfig::default() },
//!     ..PipelineConfig::default()
//! };
//! cfg.validate().unwrap();
//! ```
//!
//! Configurations can also be read from JSON; missing fields take their
//! defaults. [`PipelineConfig::validate`] is the single place where
//! consistency is checked, so the algorithms never fall back on defaults.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::cluster::graph::ElectrodeGraph;
use crate::condition::{ConditionCode, ConditionVocabulary};
use crate::error::ConfigError;

/// Reaction-time trimming (see [`crate::trim`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Trials faster than this are dropped. `0` disables the filter.
    ///
    /// Default: `150.0` ms.
    pub rt_lower_bound_ms: f64,

    /// Trials further than `rt_outlier_sd × SD` from the condition mean are
    /// dropped. `0` disables the filter.
    ///
    /// Default: `3.0`.
    pub rt_outlier_sd: f64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self { rt_lower_bound_ms: 150.0, rt_outlier_sd: 3.0 }
    }
}

impl TrimConfig {
    /// Both filters off: every trial survives.
    pub fn disabled() -> Self {
        Self { rt_lower_bound_ms: 0.0, rt_outlier_sd: 0.0 }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rt_lower_bound_ms.is_finite() || self.rt_lower_bound_ms < 0.0 {
            return Err(ConfigError::invalid("trim.rt_lower_bound_ms", "must be finite and >= 0"));
        }
        if !self.rt_outlier_sd.is_finite() || self.rt_outlier_sd < 0.0 {
            return Err(ConfigError::invalid("trim.rt_outlier_sd", "must be finite and >= 0"));
        }
        Ok(())
    }
}

/// A per-condition minimum trial count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMinimum {
    pub code: ConditionCode,
    pub min_trials: usize,
}

impl ConditionMinimum {
    pub fn new(code: u16, min_trials: usize) -> Self {
        Self { code: ConditionCode(code), min_trials }
    }
}

/// Codes entering the visible-target accuracy ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyConfig {
    pub correct_codes: Vec<ConditionCode>,
    pub error_codes: Vec<ConditionCode>,
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        let codes = |cs: &[u16]| cs.iter().copied().map(ConditionCode).collect();
        Self {
            correct_codes: codes(&[111, 211]),
            error_codes: codes(&[112, 113, 212, 213]),
        }
    }
}

/// Two-tier subject inclusion (see [`crate::inclusion`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InclusionConfig {
    /// Minimum visible-target accuracy for dataset inclusion.
    ///
    /// Default: `0.60`.
    pub accuracy_threshold: f64,

    pub accuracy: AccuracyConfig,

    /// Conditions gating dataset inclusion, each with its own minimum.
    ///
    /// Default: the four invisible-target conditions, 10 trials each.
    pub primary_conditions: Vec<ConditionMinimum>,

    /// Minimum for every non-primary condition without an override.
    ///
    /// Default: `10`.
    pub secondary_min_trials: usize,

    /// Per-condition overrides of `secondary_min_trials`.
    pub secondary_overrides: Vec<ConditionMinimum>,
}

impl Default for InclusionConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold: 0.60,
            accuracy: AccuracyConfig::default(),
            primary_conditions: [121, 122, 221, 222]
                .iter()
                .map(|&c| ConditionMinimum::new(c, 10))
                .collect(),
            secondary_min_trials: 10,
            secondary_overrides: vec![],
        }
    }
}

impl InclusionConfig {
    /// Minimum trial count used by the per-condition (Tier 2) decision.
    pub fn min_trials(&self, code: ConditionCode) -> usize {
        self.primary_conditions
            .iter()
            .chain(self.secondary_overrides.iter())
            .find(|m| m.code == code)
            .map(|m| m.min_trials)
            .unwrap_or(self.secondary_min_trials)
    }

    pub fn validate(&self, vocab: &ConditionVocabulary) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.accuracy_threshold) {
            return Err(ConfigError::invalid("inclusion.accuracy_threshold", "must lie in [0, 1]"));
        }
        if self.accuracy.correct_codes.is_empty() && self.accuracy.error_codes.is_empty() {
            return Err(ConfigError::invalid("inclusion.accuracy", "no codes given"));
        }
        let listed = self
            .accuracy
            .correct_codes
            .iter()
            .chain(self.accuracy.error_codes.iter())
            .chain(self.primary_conditions.iter().map(|m| &m.code))
            .chain(self.secondary_overrides.iter().map(|m| &m.code));
        for &code in listed {
            if !vocab.contains(code) {
                return Err(ConfigError::UnknownCondition(code));
            }
        }
        let mut seen = BTreeSet::new();
        for m in self.primary_conditions.iter().chain(self.secondary_overrides.iter()) {
            if !seen.insert(m.code) {
                return Err(ConfigError::invalid(
                    "inclusion",
                    format!("minimum for condition {} given more than once", m.code),
                ));
            }
        }
        Ok(())
    }
}

/// One row of the difference-wave table: `minuend − subtrahend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferenceWaveSpec {
    pub name: String,
    pub minuend: ConditionCode,
    pub subtrahend: ConditionCode,
}

impl DifferenceWaveSpec {
    pub fn new(name: &str, minuend: u16, subtrahend: u16) -> Self {
        Self {
            name: name.to_string(),
            minuend: ConditionCode(minuend),
            subtrahend: ConditionCode(subtrahend),
        }
    }
}

/// Shape check of the whole table. Any failure here is fatal.
pub fn validate_wave_table(
    table: &[DifferenceWaveSpec],
    vocab: &ConditionVocabulary,
) -> Result<(), ConfigError> {
    let mut names = BTreeSet::new();
    for (row, spec) in table.iter().enumerate() {
        let malformed = |reason: String| ConfigError::MalformedWaveTable { row, reason };
        if spec.name.trim().is_empty() {
            return Err(malformed("empty wave name".into()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(malformed(format!("duplicate wave name '{}'", spec.name)));
        }
        if spec.minuend == spec.subtrahend {
            return Err(malformed(format!("'{}' subtracts {} from itself", spec.name, spec.minuend)));
        }
        for code in [spec.minuend, spec.subtrahend] {
            if !vocab.contains(code) {
                return Err(malformed(format!("unknown condition {code}")));
            }
        }
    }
    Ok(())
}

/// Which extreme a component is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    /// Strictly more extreme: ties keep the incumbent.
    #[inline]
    pub fn beats(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Polarity::Negative => candidate < incumbent,
            Polarity::Positive => candidate > incumbent,
        }
    }
}

/// How a component's cluster is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterStrategy {
    /// Strategy A: every constrained combination of `cluster_size` electrodes
    /// from `search_region`.
    Exhaustive { cluster_size: usize, search_region: Vec<String> },
    /// Strategy B: fixed candidates, gated by the maximal-deflection electrode.
    ///
    /// The gate is searched over `superset`, or over the union of the
    /// candidates when it is empty.
    Gated {
        candidate_clusters: Vec<Vec<String>>,
        #[serde(default)]
        superset: Vec<String>,
    },
}

/// One ERP component of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub polarity: Polarity,
    /// Inclusive `[start, end]` in milliseconds.
    pub window_ms: [f64; 2],
    pub strategy: ClusterStrategy,
}

/// Electrode adjacency and midline designation. `None` fields in
/// [`ClusterConfig`] fall back to [`ElectrodeGraph::default_montage`].
///
/// The graph is given either as `edges` or as an `adjacency` list, not both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MontageConfig {
    /// Undirected edges between electrode labels.
    pub edges: Vec<[String; 2]>,
    /// Electrode → neighbours. Every neighbour must have its own entry.
    pub adjacency: BTreeMap<String, Vec<String>>,
    pub midline: Vec<String>,
}

impl MontageConfig {
    pub fn graph(&self) -> Result<ElectrodeGraph, ConfigError> {
        match (self.edges.is_empty(), self.adjacency.is_empty()) {
            (false, false) => Err(ConfigError::invalid(
                "cluster.montage",
                "give either edges or adjacency, not both",
            )),
            (true, false) => {
                let adjacency: Vec<(String, Vec<String>)> =
                    self.adjacency.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                ElectrodeGraph::from_adjacency(&adjacency, &self.midline)
            }
            _ => ElectrodeGraph::from_edges(&self.edges, &self.midline),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Difference waves averaged into the reference waveform.
    pub reference_waves: Vec<String>,
    pub components: Vec<ComponentConfig>,
    pub montage: Option<MontageConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let labels = |ls: &[&str]| ls.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            reference_waves: labels(&["social_awareness", "nonsocial_awareness"]),
            components: vec![
                ComponentConfig {
                    name: "VAN".into(),
                    polarity: Polarity::Negative,
                    window_ms: [200.0, 300.0],
                    strategy: ClusterStrategy::Exhaustive {
                        cluster_size: 4,
                        search_region: labels(&[
                            "P3", "P1", "Pz", "P2", "P4", "PO7", "PO3", "POz", "PO4", "PO8", "O1",
                            "Oz", "O2",
                        ]),
                    },
                },
                ComponentConfig {
                    name: "LP".into(),
                    polarity: Polarity::Positive,
                    window_ms: [400.0, 600.0],
                    strategy: ClusterStrategy::Gated {
                        candidate_clusters: vec![
                            labels(&["CPz", "Pz"]),
                            labels(&["CP1", "CPz", "CP2"]),
                            labels(&["CP1", "CPz", "CP2", "Pz"]),
                            labels(&["P1", "Pz", "P2"]),
                            labels(&["Cz", "CPz", "Pz"]),
                        ],
                        superset: vec![],
                    },
                },
            ],
            montage: None,
        }
    }
}

impl ClusterConfig {
    /// Build (and validate) the adjacency graph this configuration uses.
    pub fn graph(&self) -> Result<ElectrodeGraph, ConfigError> {
        match &self.montage {
            Some(m) => m.graph(),
            None => Ok(ElectrodeGraph::default_montage()),
        }
    }

    pub fn validate(&self, waves: &[DifferenceWaveSpec]) -> Result<(), ConfigError> {
        let graph = self.graph()?;
        if self.components.is_empty() {
            return Err(ConfigError::invalid("cluster.components", "no components configured"));
        }
        if self.reference_waves.is_empty() {
            return Err(ConfigError::invalid("cluster.reference_waves", "no reference waves"));
        }
        for name in &self.reference_waves {
            if !waves.iter().any(|w| &w.name == name) {
                return Err(ConfigError::invalid(
                    "cluster.reference_waves",
                    format!("'{name}' is not in the difference-wave table"),
                ));
            }
        }
        let mut names = BTreeSet::new();
        for comp in &self.components {
            let field = format!("cluster.components.{}", comp.name);
            if !names.insert(comp.name.as_str()) {
                return Err(ConfigError::invalid(field, "duplicate component name"));
            }
            let [t0, t1] = comp.window_ms;
            if !(t0.is_finite() && t1.is_finite() && t0 <= t1) {
                return Err(ConfigError::invalid(field, "window must be finite with start <= end"));
            }
            let check = |e: &String| -> Result<(), ConfigError> {
                if graph.index_of(e).is_none() {
                    return Err(ConfigError::UnknownElectrode {
                        electrode: e.clone(),
                        context: comp.name.clone(),
                    });
                }
                Ok(())
            };
            match &comp.strategy {
                ClusterStrategy::Exhaustive { cluster_size, search_region } => {
                    if !(1..=5).contains(cluster_size) {
                        return Err(ConfigError::invalid(field, "cluster_size must be 1..=5"));
                    }
                    if search_region.len() < *cluster_size {
                        return Err(ConfigError::invalid(
                            field,
                            "search_region is smaller than cluster_size",
                        ));
                    }
                    search_region.iter().try_for_each(check)?;
                }
                ClusterStrategy::Gated { candidate_clusters, superset } => {
                    if candidate_clusters.is_empty() || candidate_clusters.iter().any(Vec::is_empty) {
                        return Err(ConfigError::invalid(field, "empty candidate cluster list"));
                    }
                    candidate_clusters.iter().flatten().try_for_each(check)?;
                    superset.iter().try_for_each(check)?;
                }
            }
        }
        Ok(())
    }
}

/// What a pipeline step does on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Recompute from upstream data.
    Compute,
    /// Reuse the artifacts of a previous run.
    Load,
    /// Do not run the step.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepModes {
    pub grand_averages: StepMode,
    pub difference_waves: StepMode,
    pub clusters: StepMode,
}

impl Default for StepModes {
    fn default() -> Self {
        Self {
            grand_averages: StepMode::Compute,
            difference_waves: StepMode::Compute,
            clusters: StepMode::Compute,
        }
    }
}

impl StepModes {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grand_averages == StepMode::Skip {
            return Err(ConfigError::invalid("steps.grand_averages", "cannot be skipped"));
        }
        if self.difference_waves == StepMode::Skip && self.clusters != StepMode::Skip {
            return Err(ConfigError::invalid(
                "steps.clusters",
                "needs difference waves; set it to 'skip' as well",
            ));
        }
        if self.clusters == StepMode::Load {
            return Err(ConfigError::invalid("steps.clusters", "cluster selection is never loaded"));
        }
        Ok(())
    }

    pub fn needs_previous_run(&self) -> bool {
        self.grand_averages == StepMode::Load || self.difference_waves == StepMode::Load
    }
}

/// Configuration of a full run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub conditions: ConditionVocabulary,
    pub trim: TrimConfig,
    pub inclusion: InclusionConfig,
    pub difference_waves: Vec<DifferenceWaveSpec>,
    pub cluster: ClusterConfig,
    pub steps: StepModes,

    /// Save every subject × condition average next to the grand averages.
    ///
    /// Default: `false`.
    pub export_subject_averages: bool,

    /// Run stage 1 of the averager on the rayon thread pool.
    ///
    /// Default: `false`.
    pub parallel_subjects: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conditions: ConditionVocabulary::study(),
            trim: TrimConfig::default(),
            inclusion: InclusionConfig::default(),
            difference_waves: vec![
                DifferenceWaveSpec::new("social_awareness", 111, 123),
                DifferenceWaveSpec::new("nonsocial_awareness", 211, 223),
                DifferenceWaveSpec::new("social_error", 114, 111),
                DifferenceWaveSpec::new("nonsocial_error", 214, 211),
            ],
            cluster: ClusterConfig::default(),
            steps: StepModes::default(),
            export_subject_averages: false,
            parallel_subjects: false,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON configuration file and validate it.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: PipelineConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conditions.validate()?;
        self.trim.validate()?;
        self.inclusion.validate(&self.conditions)?;
        validate_wave_table(&self.difference_waves, &self.conditions)?;
        self.steps.validate()?;
        if self.steps.clusters != StepMode::Skip {
            self.cluster.validate(&self.difference_waves)?;
        }
        Ok(())
    }
}
