//! Reaction-time trial trimming for one subject × condition.
//!
//! Two filters, applied in order:
//!
//! 1. **Lower bound** — drop trials with `rt < rt_lower_bound_ms`.
//! 2. **Outliers** — on the survivors, drop trials with
//!    `|rt − mean| > rt_outlier_sd × sd` (population SD, `ddof = 0`).
//!    Mean and SD use finite RTs only; skipped when fewer than two remain.
//!
//! Comparisons are strict, so a trial exactly on a boundary is kept. A trial
//! without a usable RT (NaN) meets neither removal test and survives.
//! Setting either threshold to `0` disables that filter.
use serde::{Deserialize, Serialize};

use crate::config::TrimConfig;
use crate::error::{PipelineError, Result};

/// Trial counts after each trimming stage.
///
/// Invariant: `final_count == after_outliers <= after_rt_min <= original`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialStats {
    pub original: usize,
    pub after_rt_min: usize,
    pub after_outliers: usize,
    #[serde(rename = "final")]
    pub final_count: usize,
}

/// Surviving trials and the counts that led to them.
#[derive(Debug, Clone, PartialEq)]
pub struct Trimmed {
    /// Surviving entries of the input `indices`, in input order.
    pub kept: Vec<usize>,
    pub stats: TrialStats,
}

/// Trim one condition's trials.
///
/// `indices` and `rts_s` are parallel; response times are in seconds.
pub fn trim_trials(indices: &[usize], rts_s: &[f64], cfg: &TrimConfig) -> Result<Trimmed> {
    if indices.len() != rts_s.len() {
        return Err(PipelineError::TrialInput(format!(
            "{} trial indices but {} response times",
            indices.len(),
            rts_s.len()
        )));
    }
    let original = indices.len();

    let too_fast = |rt: f64| cfg.rt_lower_bound_ms > 0.0 && rt < cfg.rt_lower_bound_ms;

    // (index, rt_ms) pairs surviving the lower bound.
    let mut kept: Vec<(usize, f64)> = indices
        .iter()
        .zip(rts_s)
        .map(|(&i, &rt)| (i, rt * 1000.0))
        .filter(|&(_, rt)| !too_fast(rt))
        .collect();
    let after_rt_min = kept.len();

    let finite = kept.iter().map(|&(_, rt)| rt).filter(|rt| rt.is_finite());
    if cfg.rt_outlier_sd > 0.0 && finite.clone().count() >= 2 {
        let (mean, sd) = mean_sd(finite);
        let limit = cfg.rt_outlier_sd * sd;
        let outlier = |rt: f64| (rt - mean).abs() > limit;
        kept.retain(|&(_, rt)| !outlier(rt));
    }
    let after_outliers = kept.len();

    Ok(Trimmed {
        kept: kept.into_iter().map(|(i, _)| i).collect(),
        stats: TrialStats {
            original,
            after_rt_min,
            after_outliers,
            final_count: after_outliers,
        },
    })
}

/// Mean and population standard deviation.
fn mean_sd(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count() as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}
