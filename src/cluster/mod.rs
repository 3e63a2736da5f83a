//! Electrode-cluster selection for the two ERP components.
//!
//! # Reference waveform
//!
//! Each configured reference difference wave is first averaged over its own
//! subjects; the resulting `[C, T]` waveforms are then averaged with equal
//! weight. A wave with many subjects therefore counts exactly as much as one
//! with few.
//!
//! # Strategies
//!
//! Both strategies reduce to [`pick_extreme`]: walk a list of candidate
//! clusters, keep those passing an eligibility rule, and return the one whose
//! mean amplitude over the component window is most extreme in the
//! component's direction (first seen wins ties).
//!
//! * [`search`] (Strategy A) generates the candidates from a search region
//!   under midline/connectivity/distance constraints; every candidate is
//!   eligible.
//! * [`gated`] (Strategy B) takes fixed candidates; only those containing the
//!   maximal-deflection electrode are eligible.
pub mod gated;
pub mod graph;
pub mod search;

use ndarray::Array2;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::{ClusterStrategy, ComponentConfig, Polarity};
use crate::difference::DifferenceWave;
use crate::error::{ConfigError, PipelineError, Result};
use crate::store::Layout;

use self::graph::ElectrodeGraph;

/// Mean of per-wave subject means, `[C, T]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceWaveform {
    pub data: Array2<f64>,
    /// Waves that went into it.
    pub waves: Vec<String>,
}

/// Build the reference waveform from whichever of `names` were computed.
/// `None` when none of them is available.
pub fn reference_waveform(
    waves: &BTreeMap<String, DifferenceWave>,
    names: &[String],
) -> Option<ReferenceWaveform> {
    let means: Vec<(String, Array2<f64>)> = names
        .iter()
        .filter_map(|n| waves.get(n))
        .filter_map(|w| w.subject_mean().map(|m| (w.name.clone(), m)))
        .collect();
    let (first_name, first) = means.first()?;
    let mut sum = Array2::<f64>::zeros(first.raw_dim());
    let mut used = vec![];
    for (name, m) in &means {
        if m.dim() != first.dim() {
            tracing::warn!(wave = %name, reference = %first_name, "shape differs; left out of reference");
            continue;
        }
        sum += m;
        used.push(name.clone());
    }
    let n = used.len() as f64;
    Some(ReferenceWaveform { data: sum / n, waves: used })
}

/// Single most extreme sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peak {
    pub electrode: String,
    pub amplitude: f64,
    pub time_ms: f64,
}

/// Selected cluster for one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResult {
    pub component: String,
    pub polarity: Polarity,
    pub electrodes: Vec<String>,
    pub window_ms: [f64; 2],
    /// Mean over the cluster's electrodes and the window samples.
    pub mean_amplitude: f64,
    /// Peak inside the selected cluster.
    pub peak: Peak,
    /// Maximal-deflection sample that gated eligibility (Strategy B only).
    pub gate: Option<Peak>,
    /// Number of candidates that passed the eligibility rule.
    pub n_eligible: usize,
}

/// Mean of `data[ch, t]` over `channels × samples`.
pub fn mean_amplitude(data: &Array2<f64>, channels: &[usize], samples: &[usize]) -> f64 {
    let mut sum = 0.0;
    for &c in channels {
        for &t in samples {
            sum += data[[c, t]];
        }
    }
    sum / (channels.len() * samples.len()) as f64
}

/// Most extreme `(channel, sample, value)` over `channels × samples`,
/// scanning channels in the given order; first seen wins ties.
pub fn find_peak(
    data: &Array2<f64>,
    channels: &[usize],
    samples: &[usize],
    polarity: Polarity,
) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for &c in channels {
        for &t in samples {
            let v = data[[c, t]];
            if best.is_none_or(|(_, _, b)| polarity.beats(v, b)) {
                best = Some((c, t, v));
            }
        }
    }
    best
}

/// Candidate with the most extreme window mean among the eligible ones.
///
/// Returns `(candidate position, mean, eligible count)`.
pub fn pick_extreme<'c>(
    candidates: impl IntoIterator<Item = &'c [usize]>,
    eligible: impl Fn(&[usize]) -> bool,
    data: &Array2<f64>,
    samples: &[usize],
    polarity: Polarity,
) -> Option<(usize, f64, usize)> {
    let mut best: Option<(usize, f64)> = None;
    let mut n_eligible = 0;
    for (k, channels) in candidates.into_iter().enumerate() {
        if !eligible(channels) {
            continue;
        }
        n_eligible += 1;
        let m = mean_amplitude(data, channels, samples);
        if best.is_none_or(|(_, b)| polarity.beats(m, b)) {
            best = Some((k, m));
        }
    }
    best.map(|(k, m)| (k, m, n_eligible))
}

/// Window samples of a component; an empty window is a configuration error.
pub(crate) fn window_samples(layout: &Layout, comp: &ComponentConfig) -> Result<Vec<usize>> {
    let [t0, t1] = comp.window_ms;
    let samples = layout.window_samples(t0, t1);
    if samples.is_empty() {
        return Err(PipelineError::EmptyWindow {
            component: comp.name.clone(),
            t_min_ms: t0,
            t_max_ms: t1,
        });
    }
    Ok(samples)
}

/// Map electrode labels to channel indices of the reference waveform.
pub(crate) fn channel_indices(
    layout: &Layout,
    names: &[String],
    component: &str,
) -> Result<Vec<usize>, ConfigError> {
    names
        .iter()
        .map(|n| {
            layout.channel_index(n).ok_or_else(|| ConfigError::UnknownElectrode {
                electrode: n.clone(),
                context: format!("component '{component}' (not a recorded channel)"),
            })
        })
        .collect()
}

pub(crate) fn peak_at(
    layout: &Layout,
    data: &Array2<f64>,
    channels: &[usize],
    samples: &[usize],
    polarity: Polarity,
) -> Option<Peak> {
    find_peak(data, channels, samples, polarity).map(|(c, t, v)| Peak {
        electrode: layout.ch_names[c].clone(),
        amplitude: v,
        time_ms: layout.times_s[t] * 1000.0,
    })
}

/// Select one component's cluster with its configured strategy.
pub fn select_cluster(
    reference: &ReferenceWaveform,
    layout: &Layout,
    graph: &ElectrodeGraph,
    comp: &ComponentConfig,
) -> Result<ClusterResult> {
    let result = match &comp.strategy {
        ClusterStrategy::Exhaustive { cluster_size, search_region } => {
            search::select(reference, layout, graph, comp, *cluster_size, search_region)?
        }
        ClusterStrategy::Gated { candidate_clusters, superset } => {
            gated::select(reference, layout, comp, candidate_clusters, superset)?
        }
    };
    info!(
        component = %result.component,
        electrodes = ?result.electrodes,
        mean = result.mean_amplitude,
        peak_ms = result.peak.time_ms,
        "cluster selected"
    );
    Ok(result)
}

/// Select clusters for every component.
pub fn select_clusters(
    reference: &ReferenceWaveform,
    layout: &Layout,
    graph: &ElectrodeGraph,
    components: &[ComponentConfig],
) -> Result<Vec<ClusterResult>> {
    components
        .iter()
        .map(|c| select_cluster(reference, layout, graph, c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionCode;
    use crate::recording::SubjectId;
    use ndarray::Array3;

    fn wave(name: &str, values: &[f64]) -> DifferenceWave {
        let n = values.len();
        DifferenceWave {
            name: name.into(),
            minuend: ConditionCode(1),
            subtrahend: ConditionCode(2),
            data: Array3::from_shape_fn((1, 1, n), |(_, _, k)| values[k]),
            subjects: (0..n).map(|k| SubjectId::new(format!("{name}{k}"))).collect(),
        }
    }

    #[test]
    fn reference_weights_waves_equally() {
        // Wave a: one subject at 4. Wave b: three subjects at 0, 0, 3 (mean 1).
        // Equal weighting gives 2.5; pooling the four subjects would give 1.75.
        let mut waves = BTreeMap::new();
        waves.insert("a".to_string(), wave("a", &[4.0]));
        waves.insert("b".to_string(), wave("b", &[0.0, 0.0, 3.0]));
        let r = reference_waveform(&waves, &["a".into(), "b".into()]).unwrap();
        approx::assert_abs_diff_eq!(r.data[[0, 0]], 2.5, epsilon = 1e-12);
        assert_eq!(r.waves, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reference_ignores_missing_waves() {
        let mut waves = BTreeMap::new();
        waves.insert("a".to_string(), wave("a", &[4.0]));
        let r = reference_waveform(&waves, &["a".into(), "gone".into()]).unwrap();
        assert_eq!(r.waves, vec!["a".to_string()]);
        assert!(reference_waveform(&waves, &["gone".into()]).is_none());
    }

    #[test]
    fn peak_tie_keeps_first() {
        let data = Array2::from_shape_vec((2, 2), vec![-1.0, -3.0, -3.0, 0.0]).unwrap();
        assert_eq!(find_peak(&data, &[0, 1], &[0, 1], Polarity::Negative), Some((0, 1, -3.0)));
        assert_eq!(find_peak(&data, &[0, 1], &[0, 1], Polarity::Positive), Some((1, 1, 0.0)));
    }

    #[test]
    fn pick_extreme_respects_eligibility_and_ties() {
        let data = Array2::from_shape_vec((3, 1), vec![1.0, 5.0, 5.0]).unwrap();
        let cands: Vec<Vec<usize>> = vec![vec![0], vec![1], vec![2]];
        let all = pick_extreme(cands.iter().map(Vec::as_slice), |_| true, &data, &[0], Polarity::Positive);
        assert_eq!(all, Some((1, 5.0, 3)));
        let gated = pick_extreme(
            cands.iter().map(Vec::as_slice),
            |c| c.contains(&2) || c.contains(&0),
            &data,
            &[0],
            Polarity::Positive,
        );
        assert_eq!(gated, Some((2, 5.0, 2)));
        let none = pick_extreme(cands.iter().map(Vec::as_slice), |_| false, &data, &[0], Polarity::Positive);
        assert_eq!(none, None);
    }
}
