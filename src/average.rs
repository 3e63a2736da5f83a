//! Two-stage averaging.
//!
//! ```text
//! stage 1 (per subject)     trim each condition → inclusion → mean over trials   [C, T]
//! stage 2 (per condition)   stack condition-included subjects                    [C, T, N]
//! ```
//!
//! Stage 2 places every subject at [`InclusionTable::position_of`], the same
//! function the difference-wave computer uses to find it again.
use ndarray::{s, Array2, Array3, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::condition::ConditionCode;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, StoreError};
use crate::inclusion::{
    visible_accuracy, InclusionEvaluator, InclusionRecord, InclusionTable, StatsTable,
};
use crate::pipeline::{INCLUSION_TABLE, STATS_TABLE};
use crate::recording::{SubjectId, SubjectRecording};
use crate::store::{ArrayMeta, LabeledArray, Layout, SignalStore};
use crate::trim::{trim_trials, TrialStats};

/// Per-condition stack of subject averages, `[C, T, N]`.
#[derive(Debug, Clone, PartialEq)]
pub struct GrandAverage {
    pub code: ConditionCode,
    pub data: Array3<f64>,
    /// `subjects[i]` is the subject behind slice `i`.
    pub subjects: Vec<SubjectId>,
}

impl GrandAverage {
    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Average over subjects, `[C, T]`. `None` for an empty stack.
    pub fn subject_mean(&self) -> Option<Array2<f64>> {
        if self.is_empty() {
            return None;
        }
        self.data.mean_axis(Axis(2))
    }

    pub fn artifact_name(code: ConditionCode) -> String {
        format!("grand_average_{code}")
    }

    pub fn to_labeled(&self, layout: &Layout) -> LabeledArray {
        LabeledArray {
            data: self.data.clone(),
            meta: ArrayMeta {
                name: Self::artifact_name(self.code),
                layout: layout.clone(),
                subjects: self.subjects.clone(),
            },
        }
    }

    pub fn from_labeled(code: ConditionCode, array: LabeledArray) -> Result<Self> {
        let n = array.data.dim().2;
        if n != array.meta.subjects.len() {
            return Err(PipelineError::Shape(format!(
                "{}: {n} slices but {} subjects",
                array.meta.name,
                array.meta.subjects.len()
            )));
        }
        Ok(Self { code, data: array.data, subjects: array.meta.subjects })
    }
}

/// Stage-1 result for one subject.
#[derive(Debug, Clone)]
pub struct SubjectOutcome {
    pub record: InclusionRecord,
    pub stats: BTreeMap<ConditionCode, TrialStats>,
    /// Present only for dataset-included subjects and conditions with trials left.
    pub averages: BTreeMap<ConditionCode, Array2<f64>>,
}

/// Stage 1 for one loaded recording.
///
/// Every condition is trimmed (the counts are needed for the inclusion
/// decision and for reporting); averages are only computed once the subject
/// is known to be in the dataset.
pub fn process_subject(rec: &SubjectRecording, cfg: &PipelineConfig) -> Result<SubjectOutcome> {
    let codes = cfg.conditions.codes();
    let mut stats = BTreeMap::new();
    let mut kept = BTreeMap::new();
    for &code in &codes {
        let positions = cfg.conditions.select_trials(code, &rec.trials);
        let rts = rec.response_times(&positions);
        let trimmed = trim_trials(&positions, &rts, &cfg.trim)?;
        debug!(
            subject = %rec.subject, %code,
            original = trimmed.stats.original, kept = trimmed.stats.final_count,
            "trimmed"
        );
        stats.insert(code, trimmed.stats);
        kept.insert(code, trimmed.kept);
    }

    let accuracy = visible_accuracy(&rec.subject, &rec.trials, &cfg.inclusion.accuracy)?;
    let record = InclusionEvaluator::new(&cfg.inclusion, codes).evaluate(&rec.subject, &stats, accuracy);

    let mut averages = BTreeMap::new();
    if record.dataset_included {
        for (code, positions) in &kept {
            if let Some(avg) = rec.average_trials(positions) {
                averages.insert(*code, avg);
            }
        }
    }
    Ok(SubjectOutcome { record, stats, averages })
}

/// Stage 2 for one condition.
pub fn stack_condition(
    code: ConditionCode,
    table: &InclusionTable,
    averages: &BTreeMap<SubjectId, BTreeMap<ConditionCode, Array2<f64>>>,
    layout: &Layout,
) -> Result<GrandAverage> {
    let subjects = table.included_for(code);
    let mut data = Array3::<f64>::zeros((layout.n_channels(), layout.n_times(), subjects.len()));
    for subject in &subjects {
        let slot = table
            .position_of(subject, code)
            .ok_or_else(|| PipelineError::InconsistentStack {
                code,
                slot: usize::MAX,
                expected: subject.clone(),
                found: "no slot".into(),
            })?;
        let avg = averages.get(subject).and_then(|m| m.get(&code)).ok_or_else(|| {
            PipelineError::InconsistentStack {
                code,
                slot,
                expected: subject.clone(),
                found: "no subject average".into(),
            }
        })?;
        if avg.dim() != (layout.n_channels(), layout.n_times()) {
            return Err(PipelineError::Shape(format!(
                "average of {subject} for {code} is {:?}",
                avg.dim()
            )));
        }
        data.slice_mut(s![.., .., slot]).assign(avg);
    }
    Ok(GrandAverage { code, data, subjects })
}

/// Everything the averager produces.
#[derive(Debug, Clone)]
pub struct AveragerOutput {
    pub layout: Layout,
    pub table: InclusionTable,
    pub stats: StatsTable,
    pub grand_averages: BTreeMap<ConditionCode, GrandAverage>,
}

impl AveragerOutput {
    /// Conditions whose stack came out empty.
    pub fn empty_conditions(&self) -> Vec<ConditionCode> {
        self.grand_averages.values().filter(|g| g.is_empty()).map(|g| g.code).collect()
    }
}

/// Runs both stages over a list of subjects given in canonical order.
pub struct TwoStageAverager<'a, S: SignalStore> {
    store: &'a S,
    cfg: &'a PipelineConfig,
}

impl<'a, S: SignalStore> TwoStageAverager<'a, S> {
    pub fn new(store: &'a S, cfg: &'a PipelineConfig) -> Self {
        Self { store, cfg }
    }

    fn load_and_process(&self, subject: &SubjectId) -> Result<Result<(Layout, SubjectOutcome), StoreError>> {
        let rec = match self.store.load_subject(subject) {
            Ok(rec) => rec,
            Err(e) if e.is_per_subject() => return Ok(Err(e)),
            Err(e) => return Err(e.into()),
        };
        let outcome = process_subject(&rec, self.cfg)?;
        Ok(Ok((Layout::of(&rec), outcome)))
    }

    pub fn run(&self, subjects: &[SubjectId]) -> Result<AveragerOutput> {
        let codes = self.cfg.conditions.codes();

        // Stage 1. Results come back in canonical order either way.
        let results: Vec<_> = if self.cfg.parallel_subjects {
            subjects.par_iter().map(|s| self.load_and_process(s)).collect()
        } else {
            subjects.iter().map(|s| self.load_and_process(s)).collect()
        };

        let mut layout: Option<Layout> = None;
        let mut records = Vec::with_capacity(subjects.len());
        let mut stats = StatsTable::default();
        let mut averages = BTreeMap::new();

        for (subject, result) in subjects.iter().zip(results) {
            let loaded = match result? {
                Ok((sub_layout, outcome)) => {
                    if layout.as_ref().is_some_and(|l| *l != sub_layout) {
                        Err(StoreError::Malformed {
                            name: subject.to_string(),
                            reason: "channel layout or time axis differs from the first subject"
                                .into(),
                        })
                    } else {
                        if layout.is_none() {
                            layout = Some(sub_layout);
                        }
                        Ok(outcome)
                    }
                }
                Err(e) => Err(e),
            };
            match loaded {
                Ok(outcome) => {
                    if outcome.record.dataset_included {
                        info!(%subject, conditions = outcome.averages.len(), "subject included");
                    } else {
                        warn!(%subject, reasons = ?outcome.record.exclusions, "subject excluded");
                    }
                    if self.cfg.export_subject_averages {
                        if let Some(l) = &layout {
                            self.export(subject, &outcome.averages, l)?;
                        }
                    }
                    stats.insert(subject.clone(), outcome.stats);
                    averages.insert(subject.clone(), outcome.averages);
                    records.push(outcome.record);
                }
                Err(e) => {
                    warn!(%subject, error = %e, "skipping subject");
                    stats.insert_zeroed(subject.clone(), &codes);
                    records.push(InclusionRecord::load_failed(subject.clone(), &e, &codes));
                }
            }
        }

        let table = InclusionTable::from_records(records);
        let Some(layout) = layout else {
            // Leave the per-subject account behind before giving up.
            let json = serde_json::to_value(&table).map_err(StoreError::Json)?;
            self.store.save_table(INCLUSION_TABLE, &json)?;
            let json = serde_json::to_value(&stats).map_err(StoreError::Json)?;
            self.store.save_table(STATS_TABLE, &json)?;
            return Err(PipelineError::Store(StoreError::MissingArtifact(
                "no readable subject recording".into(),
            )));
        };

        // Stage 2.
        let mut grand_averages = BTreeMap::new();
        for &code in &codes {
            let ga = stack_condition(code, &table, &averages, &layout)?;
            if ga.is_empty() {
                warn!(%code, "no subject qualifies; empty grand average");
            } else {
                info!(%code, n_subjects = ga.n_subjects(), "grand average");
            }
            grand_averages.insert(code, ga);
        }

        Ok(AveragerOutput { layout, table, stats, grand_averages })
    }

    fn export(
        &self,
        subject: &SubjectId,
        averages: &BTreeMap<ConditionCode, Array2<f64>>,
        layout: &Layout,
    ) -> Result<()> {
        for (code, avg) in averages {
            let meta = ArrayMeta {
                name: format!("subject_{subject}_{code}"),
                layout: layout.clone(),
                subjects: vec![subject.clone()],
            };
            self.store.save_array(&LabeledArray::single(avg.clone(), meta))?;
        }
        Ok(())
    }
}
