//! Strategy A: exhaustive constrained search.
//!
//! Every `k`-combination of the search region (in region order) is a
//! candidate if it
//!
//! 1. holds at least `min_midline(k)` midline electrodes,
//! 2. is connected as an induced subgraph of the montage, and
//! 3. has no two members further apart than `max_distance(k)` in the full
//!    montage.
//!
//! All surviving candidates are eligible; the most extreme window mean wins.
use tracing::debug;

use super::graph::ElectrodeGraph;
use super::{channel_indices, peak_at, pick_extreme, window_samples, ClusterResult, ReferenceWaveform};
use crate::config::ComponentConfig;
use crate::error::{ConfigError, PipelineError, Result};
use crate::store::Layout;

/// Midline electrodes a cluster of `size` must contain.
pub fn min_midline(size: usize) -> usize {
    match size {
        0..=2 => 1,
        3..=4 => 2,
        _ => 3,
    }
}

/// Largest allowed graph distance between two members.
pub fn max_distance(size: usize) -> usize {
    if size <= 4 {
        2
    } else {
        3
    }
}

/// Lexicographic `k`-combinations of `0..n`.
pub struct Combinations {
    n: usize,
    idx: Vec<usize>,
    done: bool,
}

impl Combinations {
    pub fn new(n: usize, k: usize) -> Self {
        Self { n, idx: (0..k).collect(), done: k > n || k == 0 }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let out = self.idx.clone();
        let k = self.idx.len();
        // Rightmost position that can still move.
        match (0..k).rev().find(|&i| self.idx[i] < self.n - k + i) {
            Some(i) => {
                self.idx[i] += 1;
                for j in i + 1..k {
                    self.idx[j] = self.idx[j - 1] + 1;
                }
            }
            None => self.done = true,
        }
        Some(out)
    }
}

/// Whether a set of graph nodes satisfies all three constraints.
pub fn is_valid_cluster(graph: &ElectrodeGraph, members: &[usize]) -> bool {
    let k = members.len();
    let midline = members.iter().filter(|&&m| graph.is_midline(m)).count();
    if midline < min_midline(k) {
        return false;
    }
    if !graph.is_connected(members) {
        return false;
    }
    graph.diameter(members).is_some_and(|d| d <= max_distance(k))
}

/// All valid clusters of `size` drawn from `region` (graph indices), in
/// generation order.
pub fn candidate_clusters(graph: &ElectrodeGraph, region: &[usize], size: usize) -> Vec<Vec<usize>> {
    Combinations::new(region.len(), size)
        .map(|combo| combo.iter().map(|&i| region[i]).collect::<Vec<_>>())
        .filter(|members| is_valid_cluster(graph, members))
        .collect()
}

pub(crate) fn select(
    reference: &ReferenceWaveform,
    layout: &Layout,
    graph: &ElectrodeGraph,
    comp: &ComponentConfig,
    size: usize,
    search_region: &[String],
) -> Result<ClusterResult> {
    let region = search_region
        .iter()
        .map(|e| {
            graph.index_of(e).ok_or_else(|| ConfigError::UnknownElectrode {
                electrode: e.clone(),
                context: comp.name.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let samples = window_samples(layout, comp)?;

    let clusters = candidate_clusters(graph, &region, size);
    debug!(component = %comp.name, n_candidates = clusters.len(), "exhaustive search");

    // Candidate electrodes as channel indices of the reference waveform.
    let as_channels = clusters
        .iter()
        .map(|members| {
            let names: Vec<String> = members.iter().map(|&m| graph.name(m).to_string()).collect();
            channel_indices(layout, &names, &comp.name)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (best, mean, n_eligible) = pick_extreme(
        as_channels.iter().map(Vec::as_slice),
        |_| true,
        &reference.data,
        &samples,
        comp.polarity,
    )
    .ok_or_else(|| PipelineError::NoValidCombination { component: comp.name.clone() })?;

    let channels = &as_channels[best];
    let peak = peak_at(layout, &reference.data, channels, &samples, comp.polarity)
        .ok_or_else(|| PipelineError::NoValidCombination { component: comp.name.clone() })?;
    Ok(ClusterResult {
        component: comp.name.clone(),
        polarity: comp.polarity,
        electrodes: clusters[best].iter().map(|&m| graph.name(m).to_string()).collect(),
        window_ms: comp.window_ms,
        mean_amplitude: mean,
        peak,
        gate: None,
        n_eligible,
    })
}
