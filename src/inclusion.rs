//! Two-tier subject inclusion.
//!
//! **Tier 1 — dataset inclusion.** A subject enters the dataset when its
//! visible-target accuracy reaches `accuracy_threshold` *and* every primary
//! condition keeps at least its minimum number of trials after trimming.
//!
//! **Tier 2 — condition inclusion.** For a dataset-included subject, each
//! condition is decided on its own trial count only; failing one condition
//! never affects another.
//!
//! Subjects failing Tier 1 are kept in the [`InclusionTable`] with their
//! reasons, so the run report can account for them.
//!
//! The table also owns the **canonical subject order**. Stack positions are
//! never stored: [`InclusionTable::position_of`] re-derives them, and both the
//! averager and the difference-wave computer go through it.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::ConditionCode;
use crate::config::{AccuracyConfig, InclusionConfig};
use crate::error::{PipelineError, Result, StoreError};
use crate::recording::{SubjectId, TrialMeta};
use crate::trim::TrialStats;

/// Trial statistics keyed by subject, then condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsTable(pub BTreeMap<SubjectId, BTreeMap<ConditionCode, TrialStats>>);

impl StatsTable {
    pub fn get(&self, subject: &SubjectId, code: ConditionCode) -> Option<TrialStats> {
        self.0.get(subject).and_then(|m| m.get(&code)).copied()
    }

    pub fn subject(&self, subject: &SubjectId) -> Option<&BTreeMap<ConditionCode, TrialStats>> {
        self.0.get(subject)
    }

    pub fn insert(&mut self, subject: SubjectId, stats: BTreeMap<ConditionCode, TrialStats>) {
        self.0.insert(subject, stats);
    }

    /// All-zero stats for a subject whose data could not be read.
    pub fn insert_zeroed(&mut self, subject: SubjectId, codes: &[ConditionCode]) {
        let zeros = codes.iter().map(|&c| (c, TrialStats::default())).collect();
        self.0.insert(subject, zeros);
    }
}

/// Why a subject is not in the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    LoadFailed { detail: String },
    LowAccuracy { accuracy: f64, required: f64 },
    TooFewTrials { code: ConditionCode, final_count: usize, required: usize },
}

/// Inclusion decision for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InclusionRecord {
    pub subject: SubjectId,
    pub dataset_included: bool,
    pub accuracy: Option<f64>,
    /// Empty iff `dataset_included`.
    pub exclusions: Vec<ExclusionReason>,
    /// Tier-2 flags; all `false` for excluded subjects.
    pub conditions: BTreeMap<ConditionCode, bool>,
}

impl InclusionRecord {
    pub fn load_failed(subject: SubjectId, err: &StoreError, codes: &[ConditionCode]) -> Self {
        Self {
            subject,
            dataset_included: false,
            accuracy: None,
            exclusions: vec![ExclusionReason::LoadFailed { detail: err.to_string() }],
            conditions: codes.iter().map(|&c| (c, false)).collect(),
        }
    }

    pub fn includes(&self, code: ConditionCode) -> bool {
        self.dataset_included && self.conditions.get(&code).copied().unwrap_or(false)
    }
}

/// `1 − errors / (correct + errors)` over the configured visible-target codes.
///
/// Uses untrimmed counts. A subject without any visible-target trial has no
/// defined accuracy, which is reported as an error rather than guessed.
pub fn visible_accuracy(
    subject: &SubjectId,
    trials: &[TrialMeta],
    cfg: &AccuracyConfig,
) -> Result<f64> {
    let count = |codes: &[ConditionCode]| trials.iter().filter(|t| codes.contains(&t.code)).count();
    let correct = count(&cfg.correct_codes);
    let errors = count(&cfg.error_codes);
    let targets = correct + errors;
    if targets == 0 {
        return Err(PipelineError::UndefinedAccuracy { subject: subject.clone() });
    }
    Ok(1.0 - errors as f64 / targets as f64)
}

/// Applies both tiers for one subject at a time.
pub struct InclusionEvaluator<'a> {
    cfg: &'a InclusionConfig,
    codes: Vec<ConditionCode>,
}

impl<'a> InclusionEvaluator<'a> {
    /// `codes`: every condition a Tier-2 flag is produced for.
    pub fn new(cfg: &'a InclusionConfig, codes: Vec<ConditionCode>) -> Self {
        Self { cfg, codes }
    }

    pub fn evaluate(
        &self,
        subject: &SubjectId,
        stats: &BTreeMap<ConditionCode, TrialStats>,
        accuracy: f64,
    ) -> InclusionRecord {
        let final_of = |c: ConditionCode| stats.get(&c).map(|s| s.final_count).unwrap_or(0);

        let mut exclusions = vec![];
        if accuracy < self.cfg.accuracy_threshold {
            exclusions.push(ExclusionReason::LowAccuracy {
                accuracy,
                required: self.cfg.accuracy_threshold,
            });
        }
        for p in &self.cfg.primary_conditions {
            let n = final_of(p.code);
            if n < p.min_trials {
                exclusions.push(ExclusionReason::TooFewTrials {
                    code: p.code,
                    final_count: n,
                    required: p.min_trials,
                });
            }
        }
        let dataset_included = exclusions.is_empty();

        let conditions = self
            .codes
            .iter()
            .map(|&c| {
                let n = final_of(c);
                (c, dataset_included && n > 0 && n >= self.cfg.min_trials(c))
            })
            .collect();

        InclusionRecord {
            subject: subject.clone(),
            dataset_included,
            accuracy: Some(accuracy),
            exclusions,
            conditions,
        }
    }
}

/// Inclusion records in canonical subject order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InclusionTable {
    order: Vec<SubjectId>,
    records: BTreeMap<SubjectId, InclusionRecord>,
}

impl InclusionTable {
    /// Build from records given in canonical order.
    pub fn from_records(records: Vec<InclusionRecord>) -> Self {
        let order = records.iter().map(|r| r.subject.clone()).collect();
        let records = records.into_iter().map(|r| (r.subject.clone(), r)).collect();
        Self { order, records }
    }

    /// Every order entry has a record and vice versa.
    pub fn is_consistent(&self) -> bool {
        self.order.len() == self.records.len()
            && self.order.iter().all(|s| self.records.contains_key(s))
    }

    pub fn order(&self) -> &[SubjectId] {
        &self.order
    }

    pub fn record(&self, subject: &SubjectId) -> Option<&InclusionRecord> {
        self.records.get(subject)
    }

    /// Records in canonical order.
    pub fn records(&self) -> impl Iterator<Item = &InclusionRecord> {
        self.order.iter().filter_map(|s| self.records.get(s))
    }

    pub fn is_included(&self, subject: &SubjectId, code: ConditionCode) -> bool {
        self.records.get(subject).is_some_and(|r| r.includes(code))
    }

    pub fn dataset_included(&self) -> Vec<SubjectId> {
        self.records().filter(|r| r.dataset_included).map(|r| r.subject.clone()).collect()
    }

    pub fn excluded(&self) -> Vec<&InclusionRecord> {
        self.records().filter(|r| !r.dataset_included).collect()
    }

    /// Subjects contributing to `code`'s stack, in stack order.
    pub fn included_for(&self, code: ConditionCode) -> Vec<SubjectId> {
        self.order.iter().filter(|s| self.is_included(s, code)).cloned().collect()
    }

    /// Slot of `subject` in the stack of `code`: the number of subjects
    /// included for `code` that come before it in canonical order.
    ///
    /// `None` when the subject does not contribute to that stack.
    pub fn position_of(&self, subject: &SubjectId, code: ConditionCode) -> Option<usize> {
        if !self.is_included(subject, code) {
            return None;
        }
        let mut slot = 0;
        for s in &self.order {
            if s == subject {
                return Some(slot);
            }
            if self.is_included(s, code) {
                slot += 1;
            }
        }
        None
    }
}
