//! Pipeline coordinator.
//!
//! ```text
//! subjects ─► [grand_averages]  compute: TwoStageAverager    load: inclusion + stacks
//!                  │
//!                  ▼
//!             [difference_waves] compute: subject-paired     load: wave index + waves
//!                  │
//!                  ▼
//!             [clusters]        compute: reference waveform → strategy A/B   | skip
//! ```
//!
//! Every product goes to the [`SignalStore`]: one array per stack and wave,
//! plus the `inclusion`, `trial_stats`, `difference_waves` and `report`
//! tables.
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::average::{AveragerOutput, GrandAverage, TwoStageAverager};
use crate::cluster::{reference_waveform, select_clusters, ClusterResult};
use crate::condition::ConditionCode;
use crate::config::{PipelineConfig, StepMode};
use crate::difference::{difference_waves, DifferenceWave, WaveIndex, WaveSet};
use crate::error::{PipelineError, Result, StoreError};
use crate::inclusion::{InclusionTable, StatsTable};
use crate::recording::SubjectId;
use crate::report::RunReport;
use crate::store::{Layout, SignalStore};

pub const INCLUSION_TABLE: &str = "inclusion";
pub const STATS_TABLE: &str = "trial_stats";
pub const WAVE_INDEX_TABLE: &str = "difference_waves";
pub const REPORT_TABLE: &str = "report";

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub averages: AveragerOutput,
    pub waves: WaveSet,
    pub clusters: Vec<ClusterResult>,
    pub report: RunReport,
}

pub struct Pipeline<'a, S: SignalStore> {
    store: &'a S,
    cfg: PipelineConfig,
}

/// Missing artifacts are fatal in load mode; everything else passes through.
fn required<T>(r: std::result::Result<T, StoreError>) -> Result<T> {
    r.map_err(|e| match e {
        StoreError::MissingArtifact(name) => PipelineError::MissingArtifact(name),
        other => PipelineError::Store(other),
    })
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        PipelineError::Store(StoreError::Malformed { name: name.to_string(), reason: e.to_string() })
    })
}

fn encode(value: &impl serde::Serialize) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| PipelineError::Store(StoreError::Json(e)))
}

impl<'a, S: SignalStore> Pipeline<'a, S> {
    /// Validates `cfg` up front; nothing is read before it passes.
    pub fn new(store: &'a S, cfg: PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { store, cfg })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn run(&self, subjects: &[SubjectId]) -> Result<RunOutput> {
        let steps = self.cfg.steps;
        let mut report = RunReport::new(steps);

        let averages = match steps.grand_averages {
            StepMode::Load => self.load_grand_averages()?,
            _ => self.compute_grand_averages(subjects)?,
        };
        report.record_averages(&averages);

        let waves = match steps.difference_waves {
            StepMode::Compute => self.compute_difference_waves(&averages)?,
            StepMode::Load => self.load_difference_waves()?,
            StepMode::Skip => {
                report.skip_step("difference_waves", "disabled by configuration");
                WaveSet::default()
            }
        };
        report.record_waves(&waves);

        let clusters = match steps.clusters {
            StepMode::Skip => {
                report.skip_step("clusters", "disabled by configuration");
                vec![]
            }
            _ => {
                let names = &self.cfg.cluster.reference_waves;
                match reference_waveform(&waves.waves, names) {
                    Some(reference) => {
                        info!(waves = ?reference.waves, "reference waveform");
                        report.reference_waves = reference.waves.clone();
                        let graph = self.cfg.cluster.graph()?;
                        select_clusters(&reference, &averages.layout, &graph, &self.cfg.cluster.components)?
                    }
                    None => {
                        warn!(wanted = ?names, "no reference wave available; cluster selection skipped");
                        report.skip_step("clusters", format!("none of {names:?} was computed"));
                        vec![]
                    }
                }
            }
        };
        report.clusters = clusters.clone();

        let json = report.to_json().map_err(|e| PipelineError::Store(StoreError::Json(e)))?;
        self.store.save_table(REPORT_TABLE, &json)?;
        info!(
            included = report.included.len(),
            excluded = report.excluded.len(),
            waves = report.waves.len(),
            clusters = report.clusters.len(),
            "run complete"
        );
        Ok(RunOutput { averages, waves, clusters, report })
    }

    // ── Grand averages ───────────────────────────────────────────────────────

    fn compute_grand_averages(&self, subjects: &[SubjectId]) -> Result<AveragerOutput> {
        info!(n_subjects = subjects.len(), parallel = self.cfg.parallel_subjects, "averaging");
        let out = TwoStageAverager::new(self.store, &self.cfg).run(subjects)?;
        for ga in out.grand_averages.values() {
            self.store.save_array(&ga.to_labeled(&out.layout))?;
        }
        self.store.save_table(INCLUSION_TABLE, &encode(&out.table)?)?;
        self.store.save_table(STATS_TABLE, &encode(&out.stats)?)?;
        Ok(out)
    }

    fn load_grand_averages(&self) -> Result<AveragerOutput> {
        let table: InclusionTable =
            decode(INCLUSION_TABLE, required(self.store.load_table(INCLUSION_TABLE))?)?;
        if !table.is_consistent() {
            return Err(PipelineError::Store(StoreError::Malformed {
                name: INCLUSION_TABLE.into(),
                reason: "subject order and records disagree".into(),
            }));
        }
        // Stats are informational; a run without them still loads.
        let stats: StatsTable = match self.store.load_table(STATS_TABLE) {
            Ok(v) => decode(STATS_TABLE, v)?,
            Err(StoreError::MissingArtifact(_)) => StatsTable::default(),
            Err(e) => return Err(e.into()),
        };

        let mut layout: Option<Layout> = None;
        let mut grand_averages = BTreeMap::new();
        for code in self.cfg.conditions.codes() {
            let name = GrandAverage::artifact_name(code);
            let array = required(self.store.load_array(&name))?;
            if layout.as_ref().is_some_and(|l| *l != array.meta.layout) {
                return Err(PipelineError::Shape(format!(
                    "{name}: channel layout or time axis differs from the other stacks"
                )));
            }
            if layout.is_none() {
                layout = Some(array.meta.layout.clone());
            }
            let ga = GrandAverage::from_labeled(code, array)?;
            check_stack(&table, &ga)?;
            grand_averages.insert(code, ga);
        }
        let layout = layout.ok_or_else(|| PipelineError::MissingArtifact("grand averages".into()))?;
        info!(n_conditions = grand_averages.len(), "grand averages loaded");

        // Carry the loaded stacks into this run's output.
        for ga in grand_averages.values() {
            self.store.save_array(&ga.to_labeled(&layout))?;
        }
        self.store.save_table(INCLUSION_TABLE, &encode(&table)?)?;
        self.store.save_table(STATS_TABLE, &encode(&stats)?)?;
        Ok(AveragerOutput { layout, table, stats, grand_averages })
    }

    // ── Difference waves ─────────────────────────────────────────────────────

    fn compute_difference_waves(&self, averages: &AveragerOutput) -> Result<WaveSet> {
        let set = difference_waves(&self.cfg.difference_waves, &averages.table, &averages.grand_averages)?;
        self.save_waves(&set, &averages.layout)?;
        Ok(set)
    }

    fn load_difference_waves(&self) -> Result<WaveSet> {
        let index: WaveIndex =
            decode(WAVE_INDEX_TABLE, required(self.store.load_table(WAVE_INDEX_TABLE))?)?;
        let mut set = WaveSet { skipped: index.skipped, ..WaveSet::default() };
        let mut layout = None;
        for spec in &self.cfg.difference_waves {
            if !index.computed.contains(&spec.name) {
                continue;
            }
            let array = required(self.store.load_array(&DifferenceWave::artifact_name(&spec.name)))?;
            layout.get_or_insert_with(|| array.meta.layout.clone());
            set.waves.insert(spec.name.clone(), DifferenceWave::from_labeled(spec, array)?);
        }
        info!(n_waves = set.waves.len(), "difference waves loaded");
        if let Some(layout) = layout {
            self.save_waves(&set, &layout)?;
        }
        Ok(set)
    }

    fn save_waves(&self, set: &WaveSet, layout: &Layout) -> Result<()> {
        for wave in set.waves.values() {
            self.store.save_array(&wave.to_labeled(layout))?;
        }
        self.store.save_table(WAVE_INDEX_TABLE, &encode(&set.index())?)?;
        Ok(())
    }
}

/// A loaded stack must hold exactly the subjects the loaded table includes
/// for its condition, in canonical order.
fn check_stack(table: &InclusionTable, ga: &GrandAverage) -> Result<()> {
    let expected = table.included_for(ga.code);
    for (slot, subject) in expected.iter().enumerate() {
        if ga.subjects.get(slot) != Some(subject) {
            return Err(inconsistent(ga.code, slot, subject, ga.subjects.get(slot)));
        }
    }
    if ga.subjects.len() > expected.len() {
        let slot = expected.len();
        return Err(PipelineError::InconsistentStack {
            code: ga.code,
            slot,
            expected: SubjectId::new("<end of stack>"),
            found: ga.subjects[slot].to_string(),
        });
    }
    Ok(())
}

fn inconsistent(code: ConditionCode, slot: usize, expected: &SubjectId, found: Option<&SubjectId>) -> PipelineError {
    PipelineError::InconsistentStack {
        code,
        slot,
        expected: expected.clone(),
        found: found.map_or_else(|| "nothing".to_string(), |s| s.to_string()),
    }
}
