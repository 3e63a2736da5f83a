//! Run account: who was included, what was skipped, what was selected.
//!
//! Built for every completed run, including runs where individual subjects,
//! waves or steps were skipped, and saved as the `report` table.
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::average::AveragerOutput;
use crate::cluster::ClusterResult;
use crate::condition::ConditionCode;
use crate::config::StepModes;
use crate::difference::{SkippedWave, WaveSet};
use crate::inclusion::{ExclusionReason, InclusionTable, StatsTable};
use crate::recording::SubjectId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedSubject {
    pub subject: SubjectId,
    pub reasons: Vec<ExclusionReason>,
}

/// A pipeline step that ran in neither compute nor load mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedStep {
    pub step: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// RFC 3339 timestamp of report creation.
    pub generated_at: String,
    pub steps: Option<StepModes>,
    pub included: Vec<SubjectId>,
    pub excluded: Vec<ExcludedSubject>,
    /// Subjects behind each condition's stack.
    pub stack_sizes: BTreeMap<ConditionCode, usize>,
    pub empty_conditions: Vec<ConditionCode>,
    /// Subjects behind each computed difference wave.
    pub waves: BTreeMap<String, usize>,
    pub skipped_waves: Vec<SkippedWave>,
    pub skipped_steps: Vec<SkippedStep>,
    pub reference_waves: Vec<String>,
    pub clusters: Vec<ClusterResult>,
    pub trial_stats: StatsTable,
}

impl RunReport {
    pub fn new(steps: StepModes) -> Self {
        Self {
            generated_at: chrono::Local::now().to_rfc3339(),
            steps: Some(steps),
            ..Self::default()
        }
    }

    pub fn record_inclusion(&mut self, table: &InclusionTable) {
        self.included = table.dataset_included();
        self.excluded = table
            .excluded()
            .into_iter()
            .map(|r| ExcludedSubject { subject: r.subject.clone(), reasons: r.exclusions.clone() })
            .collect();
    }

    pub fn record_averages(&mut self, out: &AveragerOutput) {
        self.record_inclusion(&out.table);
        self.stack_sizes = out.grand_averages.iter().map(|(&c, g)| (c, g.n_subjects())).collect();
        self.empty_conditions = out.empty_conditions();
        self.trial_stats = out.stats.clone();
    }

    pub fn record_waves(&mut self, set: &WaveSet) {
        self.waves = set.waves.iter().map(|(n, w)| (n.clone(), w.n_subjects())).collect();
        self.skipped_waves = set.skipped.clone();
    }

    pub fn skip_step(&mut self, step: &str, reason: impl Into<String>) {
        self.skipped_steps.push(SkippedStep { step: step.into(), reason: reason.into() });
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "included subjects: {}", self.included.len())?;
        for e in &self.excluded {
            write!(f, "  excluded {}:", e.subject)?;
            for r in &e.reasons {
                match r {
                    ExclusionReason::LoadFailed { detail } => write!(f, " load failed ({detail})")?,
                    ExclusionReason::LowAccuracy { accuracy, required } => {
                        write!(f, " accuracy {accuracy:.3} < {required:.3}")?
                    }
                    ExclusionReason::TooFewTrials { code, final_count, required } => {
                        write!(f, " {code}: {final_count} < {required} trials")?
                    }
                }
            }
            writeln!(f)?;
        }
        if !self.empty_conditions.is_empty() {
            let codes: Vec<String> = self.empty_conditions.iter().map(|c| c.to_string()).collect();
            writeln!(f, "empty conditions: {}", codes.join(", "))?;
        }
        for (name, n) in &self.waves {
            writeln!(f, "wave {name}: {n} subjects")?;
        }
        for s in &self.skipped_waves {
            writeln!(f, "wave {} skipped: {:?}", s.name, s.reason)?;
        }
        for s in &self.skipped_steps {
            writeln!(f, "step {} skipped: {}", s.step, s.reason)?;
        }
        for c in &self.clusters {
            writeln!(
                f,
                "{} [{:?}] {}: mean {:.4}, peak {:.4} at {} ms on {}",
                c.component,
                c.polarity,
                c.electrodes.join("/"),
                c.mean_amplitude,
                c.peak.amplitude,
                c.peak.time_ms,
                c.peak.electrode,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difference::SkipReason;
    use crate::inclusion::InclusionRecord;

    #[test]
    fn excluded_subjects_carry_reasons() {
        let table = InclusionTable::from_records(vec![
            InclusionRecord {
                subject: "a".into(),
                dataset_included: true,
                accuracy: Some(0.9),
                exclusions: vec![],
                conditions: BTreeMap::new(),
            },
            InclusionRecord {
                subject: "b".into(),
                dataset_included: false,
                accuracy: Some(0.4),
                exclusions: vec![ExclusionReason::LowAccuracy { accuracy: 0.4, required: 0.6 }],
                conditions: BTreeMap::new(),
            },
        ]);
        let mut report = RunReport::new(StepModes::default());
        report.record_inclusion(&table);
        report.skip_step("clusters", "no reference wave");
        report.skipped_waves.push(SkippedWave {
            name: "w".into(),
            reason: SkipReason::NoSharedSubjects,
        });

        assert_eq!(report.included, vec![SubjectId::from("a")]);
        let json = report.to_json().unwrap();
        assert_eq!(json["excluded"][0]["subject"], "b");
        assert_eq!(json["excluded"][0]["reasons"][0]["reason"], "low_accuracy");
        assert_eq!(json["skipped_waves"][0]["reason"], "no_shared_subjects");
        assert_eq!(json["skipped_steps"][0]["step"], "clusters");

        let text = report.to_string();
        assert!(text.contains("excluded b: accuracy 0.400 < 0.600"));
        assert!(text.contains("step clusters skipped"));
    }
}
