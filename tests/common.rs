/// Shared helpers: synthetic recordings and small pipeline configurations.
use erp_post::config::{AccuracyConfig, ClusterConfig, ComponentConfig, InclusionConfig};
use erp_post::{
    ConditionCode, ConditionVocabulary, DifferenceWaveSpec, ElectrodeGraph, PipelineConfig,
    SubjectId, SubjectRecording, TrialMeta, TrimConfig,
};
use ndarray::Array3;

pub const SFREQ: f64 = 100.0;
pub const N_TIMES: usize = 81;

/// 0 … 800 ms at 100 Hz.
pub fn times_s() -> Vec<f64> {
    (0..N_TIMES).map(|k| k as f64 / SFREQ).collect()
}

/// Channel labels of the built-in montage.
pub fn montage_channels() -> Vec<String> {
    let g = ElectrodeGraph::default_montage();
    (0..g.len()).map(|i| g.name(i).to_string()).collect()
}

pub fn in_window(t_s: f64, t0_ms: f64, t1_ms: f64) -> bool {
    let ms = t_s * 1000.0;
    ms >= t0_ms && ms <= t1_ms
}

/// `n` trials of one condition sharing a response time and an amplitude.
#[derive(Debug, Clone)]
pub struct Block {
    pub code: u16,
    pub rts_s: Vec<f64>,
    pub value: f64,
}

#[allow(unused)]
pub fn block(code: u16, n: usize, value: f64) -> Block {
    Block { code, rts_s: vec![0.5; n], value }
}

#[allow(unused)]
pub fn block_rts(code: u16, rts_s: &[f64], value: f64) -> Block {
    Block { code, rts_s: rts_s.to_vec(), value }
}

/// Recording whose trial `k` is `value + pattern(code, channel, t)` everywhere.
pub fn recording_with(
    id: &str,
    blocks: &[Block],
    pattern: impl Fn(u16, &str, f64) -> f64,
) -> SubjectRecording {
    let ch_names = montage_channels();
    let times = times_s();
    let mut trials = vec![];
    let mut values = vec![];
    for b in blocks {
        for &rt_s in &b.rts_s {
            trials.push(TrialMeta {
                code: ConditionCode(b.code),
                rt_s,
                index: trials.len() as u32,
            });
            values.push((b.code, b.value));
        }
    }
    let data = Array3::from_shape_fn((ch_names.len(), N_TIMES, trials.len()), |(c, t, k)| {
        let (code, value) = values[k];
        value + pattern(code, &ch_names[c], times[t])
    });
    SubjectRecording {
        subject: SubjectId::from(id),
        ch_names,
        sfreq: SFREQ,
        times_s: times,
        data,
        trials,
    }
}

#[allow(unused)]
pub fn recording(id: &str, blocks: &[Block]) -> SubjectRecording {
    recording_with(id, blocks, |_, _, _| 0.0)
}

#[allow(unused)]
pub fn ids(names: &[&str]) -> Vec<SubjectId> {
    names.iter().map(|&n| SubjectId::from(n)).collect()
}

/// Base-code-only configuration: no trimming, no primary conditions, every
/// listed code counts as a correct visible-target response, clusters off.
#[allow(unused)]
pub fn small_config(codes: &[u16], min_trials: usize, waves: &[(&str, u16, u16)]) -> PipelineConfig {
    let mut cfg = PipelineConfig {
        conditions: ConditionVocabulary::from_base_codes(codes),
        trim: TrimConfig::disabled(),
        inclusion: InclusionConfig {
            accuracy_threshold: 0.0,
            accuracy: AccuracyConfig {
                correct_codes: codes.iter().copied().map(ConditionCode).collect(),
                error_codes: vec![],
            },
            primary_conditions: vec![],
            secondary_min_trials: min_trials,
            secondary_overrides: vec![],
        },
        difference_waves: waves
            .iter()
            .map(|&(n, m, s)| DifferenceWaveSpec::new(n, m, s))
            .collect(),
        cluster: ClusterConfig::default(),
        ..PipelineConfig::default()
    };
    cfg.steps.clusters = erp_post::StepMode::Skip;
    cfg
}

/// [`small_config`] with cluster selection over the given components.
#[allow(unused)]
pub fn with_clusters(
    mut cfg: PipelineConfig,
    reference_waves: &[&str],
    components: Vec<ComponentConfig>,
) -> PipelineConfig {
    cfg.cluster = ClusterConfig {
        reference_waves: reference_waves.iter().map(|s| s.to_string()).collect(),
        components,
        montage: None,
    };
    cfg.steps.clusters = erp_post::StepMode::Compute;
    cfg
}

#[allow(unused)]
pub fn strings(ls: &[&str]) -> Vec<String> {
    ls.iter().map(|s| s.to_string()).collect()
}
