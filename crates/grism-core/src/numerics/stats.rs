//! Robust image statistics: iterative sigma clipping and the converging
//! clip mask used to separate background pixels from trace pixels.

use crate::common::constants::is_masked;

/// Mean and standard deviation after `nclip` rounds of `sigma`-clipping.
///
/// Masked (sentinel/non-finite) values never participate. Returns `None`
/// when no valid pixel survives.
pub fn sigma_clipped_stats(values: &[f64], nclip: usize, sigma: f64) -> Option<(f64, f64)> {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| !is_masked(*v)).collect();
    if kept.is_empty() {
        return None;
    }

    let mut stats = mean_std(&kept);
    for _ in 0..nclip {
        let (mean, std) = stats;
        if std <= 0.0 {
            break;
        }
        let before = kept.len();
        kept.retain(|v| (v - mean).abs() <= sigma * std);
        if kept.is_empty() {
            // Over-aggressive clip; fall back to the last stable stats.
            return Some((mean, std));
        }
        stats = mean_std(&kept);
        if kept.len() == before {
            break;
        }
    }
    Some(stats)
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Boolean mask of the pixels within `sigclip` standard deviations of the
/// (iterated) mean. Iterates until the mask converges, so outliers do not
/// inflate the deviation estimate. With `positive_only`, negative pixels are
/// excluded from the seed mask.
pub fn clip_mask(values: &[f64], sigclip: f64, positive_only: bool) -> Vec<bool> {
    let n = values.len();
    let mut mask: Vec<bool> = values
        .iter()
        .map(|v| !is_masked(*v) && (!positive_only || *v >= 0.0))
        .collect();
    let mut kept = mask.iter().filter(|m| **m).count();
    if kept == 0 {
        return mask;
    }

    for _ in 0..50 {
        let selected: Vec<f64> = (0..n).filter(|&i| mask[i]).map(|i| values[i]).collect();
        let (mean, std) = mean_std(&selected);
        let mut next = vec![false; n];
        for i in 0..n {
            next[i] = !is_masked(values[i]) && (values[i] - mean).abs() < sigclip * std;
        }
        let next_kept = next.iter().filter(|m| **m).count();
        if next_kept == 0 {
            break;
        }
        mask = next;
        if next_kept == kept {
            break;
        }
        kept = next_kept;
    }
    mask
}
