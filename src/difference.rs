//! Difference waves: subject-paired subtraction of two grand-average stacks.
//!
//! Stacks of different conditions hold different subject sets, so slice `i`
//! of the minuend is in general *not* the same subject as slice `i` of the
//! subtrahend. For every subject present in both, its slot is re-derived
//! separately on each side through [`InclusionTable::position_of`], then the
//! two slices are subtracted.
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::average::GrandAverage;
use crate::condition::ConditionCode;
use crate::config::DifferenceWaveSpec;
use crate::error::{PipelineError, Result};
use crate::inclusion::InclusionTable;
use crate::recording::SubjectId;
use crate::store::{ArrayMeta, LabeledArray, Layout};

/// `minuend − subtrahend`, one slice per shared subject, `[C, T, M]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferenceWave {
    pub name: String,
    pub minuend: ConditionCode,
    pub subtrahend: ConditionCode,
    pub data: Array3<f64>,
    pub subjects: Vec<SubjectId>,
}

impl DifferenceWave {
    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    /// Average over subjects, `[C, T]`.
    pub fn subject_mean(&self) -> Option<Array2<f64>> {
        if self.subjects.is_empty() {
            return None;
        }
        self.data.mean_axis(Axis(2))
    }

    pub fn artifact_name(name: &str) -> String {
        format!("difference_wave_{name}")
    }

    pub fn to_labeled(&self, layout: &Layout) -> LabeledArray {
        LabeledArray {
            data: self.data.clone(),
            meta: ArrayMeta {
                name: Self::artifact_name(&self.name),
                layout: layout.clone(),
                subjects: self.subjects.clone(),
            },
        }
    }

    pub fn from_labeled(spec: &DifferenceWaveSpec, array: LabeledArray) -> Result<Self> {
        if array.data.dim().2 != array.meta.subjects.len() {
            return Err(PipelineError::Shape(format!(
                "{}: {} slices but {} subjects",
                array.meta.name,
                array.data.dim().2,
                array.meta.subjects.len()
            )));
        }
        Ok(Self {
            name: spec.name.clone(),
            minuend: spec.minuend,
            subtrahend: spec.subtrahend,
            data: array.data,
            subjects: array.meta.subjects,
        })
    }
}

/// Why a table row produced no wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MissingStack { code: ConditionCode },
    NoSharedSubjects,
}

/// A table row that produced no wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedWave {
    pub name: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaveOutcome {
    Computed(DifferenceWave),
    Skipped(SkipReason),
}

/// Slot of `subject` in `stack`, checked against the stack's own subject list.
fn slot_in(table: &InclusionTable, stack: &GrandAverage, subject: &SubjectId) -> Result<usize> {
    let inconsistent = |slot: usize, found: String| PipelineError::InconsistentStack {
        code: stack.code,
        slot,
        expected: subject.clone(),
        found,
    };
    let slot = table
        .position_of(subject, stack.code)
        .ok_or_else(|| inconsistent(usize::MAX, "no slot".into()))?;
    match stack.subjects.get(slot) {
        Some(s) if s == subject => Ok(slot),
        Some(s) => Err(inconsistent(slot, s.to_string())),
        None => Err(inconsistent(slot, "nothing (stack too short)".into())),
    }
}

/// Compute one difference wave.
pub fn difference_wave(
    spec: &DifferenceWaveSpec,
    table: &InclusionTable,
    grand_averages: &BTreeMap<ConditionCode, GrandAverage>,
) -> Result<WaveOutcome> {
    let Some(minuend) = grand_averages.get(&spec.minuend) else {
        return Ok(WaveOutcome::Skipped(SkipReason::MissingStack { code: spec.minuend }));
    };
    let Some(subtrahend) = grand_averages.get(&spec.subtrahend) else {
        return Ok(WaveOutcome::Skipped(SkipReason::MissingStack { code: spec.subtrahend }));
    };
    let (n_ch, n_t, _) = minuend.data.dim();
    let (s_ch, s_t, _) = subtrahend.data.dim();
    if (n_ch, n_t) != (s_ch, s_t) {
        return Err(PipelineError::Shape(format!(
            "'{}': {} is {n_ch}×{n_t}, {} is {s_ch}×{s_t}",
            spec.name, spec.minuend, spec.subtrahend
        )));
    }

    let shared: Vec<SubjectId> = table
        .dataset_included()
        .into_iter()
        .filter(|s| table.is_included(s, spec.minuend) && table.is_included(s, spec.subtrahend))
        .collect();
    if shared.is_empty() {
        return Ok(WaveOutcome::Skipped(SkipReason::NoSharedSubjects));
    }

    let mut data = Array3::<f64>::zeros((n_ch, n_t, shared.len()));
    for (k, subject) in shared.iter().enumerate() {
        let i = slot_in(table, minuend, subject)?;
        let j = slot_in(table, subtrahend, subject)?;
        let diff = &minuend.data.slice(s![.., .., i]) - &subtrahend.data.slice(s![.., .., j]);
        data.slice_mut(s![.., .., k]).assign(&diff);
    }

    Ok(WaveOutcome::Computed(DifferenceWave {
        name: spec.name.clone(),
        minuend: spec.minuend,
        subtrahend: spec.subtrahend,
        data,
        subjects: shared,
    }))
}

/// Computed waves plus the rows that were skipped.
#[derive(Debug, Clone, Default)]
pub struct WaveSet {
    pub waves: BTreeMap<String, DifferenceWave>,
    pub skipped: Vec<SkippedWave>,
}

impl WaveSet {
    pub fn index(&self) -> WaveIndex {
        WaveIndex {
            computed: self.waves.keys().cloned().collect(),
            skipped: self.skipped.clone(),
        }
    }
}

/// What a run wrote for the difference-wave table; saved next to the waves
/// so a later run can load exactly those.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveIndex {
    pub computed: Vec<String>,
    pub skipped: Vec<SkippedWave>,
}

/// Process every row independently. A skipped row never affects the others;
/// only fatal errors (inconsistent stacks, shape mismatches) propagate.
pub fn difference_waves(
    table_rows: &[DifferenceWaveSpec],
    table: &InclusionTable,
    grand_averages: &BTreeMap<ConditionCode, GrandAverage>,
) -> Result<WaveSet> {
    let mut set = WaveSet::default();
    for spec in table_rows {
        match difference_wave(spec, table, grand_averages)? {
            WaveOutcome::Computed(w) => {
                info!(wave = %w.name, n_subjects = w.n_subjects(), "difference wave");
                set.waves.insert(w.name.clone(), w);
            }
            WaveOutcome::Skipped(reason) => {
                warn!(wave = %spec.name, ?reason, "difference wave skipped");
                set.skipped.push(SkippedWave { name: spec.name.clone(), reason });
            }
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inclusion::InclusionRecord;

    const M: ConditionCode = ConditionCode(1);
    const S: ConditionCode = ConditionCode(2);

    fn table(rows: &[(&str, bool, bool)]) -> InclusionTable {
        InclusionTable::from_records(
            rows.iter()
                .map(|&(s, m, sub)| InclusionRecord {
                    subject: s.into(),
                    dataset_included: true,
                    accuracy: Some(1.0),
                    exclusions: vec![],
                    conditions: [(M, m), (S, sub)].into_iter().collect(),
                })
                .collect(),
        )
    }

    /// Stack whose slice for subject `x` is filled with `value(x)`.
    fn stack(code: ConditionCode, t: &InclusionTable, value: impl Fn(&str) -> f64) -> GrandAverage {
        let subjects = t.included_for(code);
        let mut data = Array3::zeros((1, 2, subjects.len()));
        for (i, s) in subjects.iter().enumerate() {
            data.slice_mut(s![.., .., i]).fill(value(s.as_str()));
        }
        GrandAverage { code, data, subjects }
    }

    fn value_of(s: &str) -> f64 {
        match s {
            "A" => 1.0,
            "B" => 2.0,
            "C" => 3.0,
            _ => 4.0,
        }
    }

    #[test]
    fn pairs_by_subject_not_by_slot() {
        // minuend {A, B, C}, subtrahend {B, C, D}
        let t = table(&[("A", true, false), ("B", true, true), ("C", true, true), ("D", false, true)]);
        let mut gas = BTreeMap::new();
        gas.insert(M, stack(M, &t, |s| 10.0 * value_of(s)));
        gas.insert(S, stack(S, &t, value_of));

        let spec = DifferenceWaveSpec { name: "d".into(), minuend: M, subtrahend: S };
        let WaveOutcome::Computed(w) = difference_wave(&spec, &t, &gas).unwrap() else {
            panic!("expected a wave");
        };
        assert_eq!(w.subjects, vec![SubjectId::from("B"), "C".into()]);
        assert_eq!(w.data.dim(), (1, 2, 2));
        // B: 20 − 2, C: 30 − 3
        assert_eq!(w.data[[0, 0, 0]], 18.0);
        assert_eq!(w.data[[0, 1, 1]], 27.0);
        assert!(w.n_subjects() <= gas[&M].n_subjects().min(gas[&S].n_subjects()));
    }

    #[test]
    fn identical_sets_use_every_subject() {
        let t = table(&[("A", true, true), ("B", true, true)]);
        let mut gas = BTreeMap::new();
        gas.insert(M, stack(M, &t, value_of));
        gas.insert(S, stack(S, &t, value_of));
        let spec = DifferenceWaveSpec { name: "d".into(), minuend: M, subtrahend: S };
        let WaveOutcome::Computed(w) = difference_wave(&spec, &t, &gas).unwrap() else {
            panic!("expected a wave");
        };
        assert_eq!(w.n_subjects(), 2);
        assert!(w.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn disjoint_sets_are_skipped() {
        let t = table(&[("A", true, false), ("B", false, true)]);
        let mut gas = BTreeMap::new();
        gas.insert(M, stack(M, &t, value_of));
        gas.insert(S, stack(S, &t, value_of));
        let spec = DifferenceWaveSpec { name: "d".into(), minuend: M, subtrahend: S };
        assert_eq!(
            difference_wave(&spec, &t, &gas).unwrap(),
            WaveOutcome::Skipped(SkipReason::NoSharedSubjects)
        );
    }

    #[test]
    fn one_bad_row_does_not_block_the_others() {
        let t = table(&[("A", true, true)]);
        let mut gas = BTreeMap::new();
        gas.insert(M, stack(M, &t, value_of));
        gas.insert(S, stack(S, &t, value_of));
        let rows = vec![
            DifferenceWaveSpec { name: "missing".into(), minuend: ConditionCode(9), subtrahend: S },
            DifferenceWaveSpec { name: "ok".into(), minuend: M, subtrahend: S },
        ];
        let set = difference_waves(&rows, &t, &gas).unwrap();
        assert!(set.waves.contains_key("ok"));
        assert_eq!(set.skipped.len(), 1);
        assert_eq!(set.skipped[0].name, "missing");
        assert_eq!(set.index().computed, vec!["ok".to_string()]);
    }

    #[test]
    fn stack_from_another_run_is_rejected() {
        let t = table(&[("A", true, true), ("B", true, true)]);
        let mut gas = BTreeMap::new();
        let mut swapped = stack(M, &t, value_of);
        swapped.subjects.reverse();
        gas.insert(M, swapped);
        gas.insert(S, stack(S, &t, value_of));
        let spec = DifferenceWaveSpec { name: "d".into(), minuend: M, subtrahend: S };
        assert!(matches!(
            difference_wave(&spec, &t, &gas),
            Err(PipelineError::InconsistentStack { .. })
        ));
    }
}
