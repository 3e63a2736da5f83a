//! Strategy B: fixed candidate clusters gated by the maximal deflection.
//!
//! The most extreme electrode × sample over the component's electrode
//! superset and window picks the *gate* electrode. Only candidates containing
//! it are eligible; among those the most extreme window mean wins. No
//! eligible candidate is an error, never a silent fallback.
use super::{channel_indices, peak_at, pick_extreme, window_samples, ClusterResult, ReferenceWaveform};
use crate::config::ComponentConfig;
use crate::error::{PipelineError, Result};
use crate::store::Layout;

/// Union of candidate electrodes, in first-appearance order.
pub fn electrode_superset(candidates: &[Vec<String>]) -> Vec<String> {
    let mut out: Vec<String> = vec![];
    for e in candidates.iter().flatten() {
        if !out.contains(e) {
            out.push(e.clone());
        }
    }
    out
}

pub(crate) fn select(
    reference: &ReferenceWaveform,
    layout: &Layout,
    comp: &ComponentConfig,
    candidates: &[Vec<String>],
    superset: &[String],
) -> Result<ClusterResult> {
    let samples = window_samples(layout, comp)?;
    let gate_names = if superset.is_empty() {
        electrode_superset(candidates)
    } else {
        superset.to_vec()
    };
    let gate_channels = channel_indices(layout, &gate_names, &comp.name)?;
    let no_candidates = || PipelineError::NoValidCombination { component: comp.name.clone() };

    let gate = peak_at(layout, &reference.data, &gate_channels, &samples, comp.polarity)
        .ok_or_else(no_candidates)?;
    let gate_channel = layout.channel_index(&gate.electrode).ok_or_else(no_candidates)?;

    let as_channels = candidates
        .iter()
        .map(|c| channel_indices(layout, c, &comp.name))
        .collect::<Result<Vec<_>, _>>()?;

    let (best, mean, n_eligible) = pick_extreme(
        as_channels.iter().map(Vec::as_slice),
        |c| c.contains(&gate_channel),
        &reference.data,
        &samples,
        comp.polarity,
    )
    .ok_or_else(|| PipelineError::NoEligibleCluster {
        component: comp.name.clone(),
        electrode: gate.electrode.clone(),
    })?;

    let peak = peak_at(layout, &reference.data, &as_channels[best], &samples, comp.polarity)
        .ok_or_else(no_candidates)?;
    Ok(ClusterResult {
        component: comp.name.clone(),
        polarity: comp.polarity,
        electrodes: candidates[best].clone(),
        window_ms: comp.window_ms,
        mean_amplitude: mean,
        peak,
        gate: Some(gate),
        n_eligible,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterStrategy, Polarity};
    use ndarray::Array2;

    fn strings(ls: &[&str]) -> Vec<String> {
        ls.iter().map(|s| s.to_string()).collect()
    }

    fn component(name: &str, polarity: Polarity, window_ms: [f64; 2]) -> ComponentConfig {
        ComponentConfig {
            name: name.into(),
            polarity,
            window_ms,
            strategy: ClusterStrategy::Gated { candidate_clusters: vec![], superset: vec![] },
        }
    }

    /// Channels Cz, CPz, Pz, P1; samples at 0, 100, 200, 300 ms.
    fn fixture() -> (Layout, ReferenceWaveform) {
        let layout = Layout {
            ch_names: strings(&["Cz", "CPz", "Pz", "P1"]),
            sfreq: 10.0,
            times_s: vec![0.0, 0.1, 0.2, 0.3],
        };
        #[rustfmt::skip]
        let data = Array2::from_shape_vec((4, 4), vec![
            0.0, 3.0, 3.0, 0.0, // Cz: high mean, no single peak
            0.0, 1.0, 1.0, 0.0, // CPz
            0.0, 5.0, 0.0, 0.0, // Pz: peak at 100 ms
            0.0, 2.0, 2.0, 0.0, // P1
        ])
        .unwrap();
        (layout, ReferenceWaveform { data, waves: vec!["w".into()] })
    }

    #[test]
    fn superset_keeps_first_appearance() {
        let cands = vec![strings(&["Pz", "CPz"]), strings(&["CPz", "P1"])];
        assert_eq!(electrode_superset(&cands), strings(&["Pz", "CPz", "P1"]));
    }

    #[test]
    fn only_candidates_holding_the_peak_electrode_compete() {
        let (layout, reference) = fixture();
        let comp = component("LP", Polarity::Positive, [100.0, 200.0]);
        let cands = vec![
            strings(&["Cz", "CPz"]), // best mean, but no Pz
            strings(&["CPz", "Pz"]), // 1.75
            strings(&["Pz", "P1"]),  // 2.25
        ];
        let r = select(&reference, &layout, &comp, &cands, &[]).unwrap();
        assert_eq!(r.electrodes, strings(&["Pz", "P1"]));
        assert_eq!(r.n_eligible, 2);
        approx::assert_abs_diff_eq!(r.mean_amplitude, 2.25, epsilon = 1e-12);
        let gate = r.gate.unwrap();
        assert_eq!(gate.electrode, "Pz");
        approx::assert_abs_diff_eq!(gate.time_ms, 100.0, epsilon = 1e-9);
        assert_eq!(r.peak.electrode, "Pz");
    }

    #[test]
    fn single_eligible_candidate_wins() {
        let (layout, reference) = fixture();
        let comp = component("LP", Polarity::Positive, [100.0, 200.0]);
        // {Cz} has the larger mean but cannot hold the Pz gate.
        let cands = vec![strings(&["Cz"]), strings(&["Cz", "Pz"])];
        let r = select(&reference, &layout, &comp, &cands, &[]).unwrap();
        assert_eq!(r.electrodes, strings(&["Cz", "Pz"]));
        assert_eq!(r.n_eligible, 1);
        approx::assert_abs_diff_eq!(r.mean_amplitude, 2.75, epsilon = 1e-12);
    }

    #[test]
    fn equal_means_keep_the_first_candidate() {
        let (layout, reference) = fixture();
        let comp = component("LP", Polarity::Positive, [100.0, 200.0]);
        let cands = vec![strings(&["Pz", "CPz"]), strings(&["CPz", "Pz"])];
        let r = select(&reference, &layout, &comp, &cands, &[]).unwrap();
        assert_eq!(r.electrodes, strings(&["Pz", "CPz"]));
    }

    #[test]
    fn gate_outside_every_candidate_is_an_error() {
        let (layout, reference) = fixture();
        let comp = component("LP", Polarity::Positive, [100.0, 200.0]);
        // Pz carries the maximal deflection but no candidate includes it.
        let cands = vec![strings(&["Cz", "CPz"]), strings(&["CPz", "P1"])];
        let superset = strings(&["Cz", "CPz", "Pz", "P1"]);
        match select(&reference, &layout, &comp, &cands, &superset) {
            Err(PipelineError::NoEligibleCluster { component, electrode }) => {
                assert_eq!(component, "LP");
                assert_eq!(electrode, "Pz");
            }
            other => panic!("expected NoEligibleCluster, got {other:?}"),
        }
    }

    #[test]
    fn negative_component_gates_on_the_minimum() {
        let (layout, mut reference) = fixture();
        reference.data.mapv_inplace(|v| -v);
        let comp = component("VAN", Polarity::Negative, [100.0, 200.0]);
        let cands = vec![strings(&["Cz", "CPz"]), strings(&["CPz", "Pz"])];
        let r = select(&reference, &layout, &comp, &cands, &[]).unwrap();
        assert_eq!(r.electrodes, strings(&["CPz", "Pz"]));
        approx::assert_abs_diff_eq!(r.peak.amplitude, -5.0, epsilon = 1e-12);
    }

    #[test]
    fn unrecorded_candidate_electrode_is_a_config_error() {
        let (layout, reference) = fixture();
        let comp = component("LP", Polarity::Positive, [100.0, 200.0]);
        let cands = vec![strings(&["Pz", "Oz"])];
        assert!(matches!(
            select(&reference, &layout, &comp, &cands, &[]),
            Err(PipelineError::Config(_))
        ));
    }
}
