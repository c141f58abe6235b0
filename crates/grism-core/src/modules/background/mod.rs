//! Background estimation for a spectrum image strip.
//!
//! The strip is first stabilized patch-wise: the background level can vary
//! by more than a factor of two along the dispersion axis, so outliers are
//! clipped against local block statistics rather than one global mean. Two
//! band profiles (below and above the spectrum) are then estimated with
//! either boxcar smoothing or a smoothing spline, and interpolated in the
//! cross-dispersion direction into a full background image.

use crate::common::config::{BackgroundBand, BackgroundConfig, BackgroundMethod};
use crate::common::constants::{is_masked, CVAL};
use crate::domain::{GrismError, GrismResult, WarningBuffer};
use crate::numerics::smooth::{boxcar_1d, boxcar_2d};
use crate::numerics::spline::CubicSpline;
use crate::numerics::stats::sigma_clipped_stats;
use ndarray::Array2;

/// Number of block boundaries for the patch-wise outlier replacement.
const PATCH_BLOCKS: usize = 80;
/// Local smoothing kernel inside each patch block.
const PATCH_KERNEL: [usize; 2] = [5, 5];
/// Sigma threshold for patching a pixel against its local block mean.
const PATCH_SIGMA: f64 = 2.0;
/// Columns trimmed inside the first/last valid column against edge effects.
const EDGE_TRIM: usize = 10;
/// Default spacing (columns) between smoothing-spline knots.
const DEFAULT_KNOT_SPACING: f64 = 25.0;
/// Boxcar length applied to band means before knot placement.
const BAND_PRESMOOTH: usize = 50;

/// Estimated background of one image strip.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundModel {
    /// Global sigma-clipped mean of the strip.
    pub mean: f64,
    /// Global sigma-clipped standard deviation of the strip.
    pub sigma: f64,
    /// Lower-band profile per column.
    pub lower_profile: Vec<f64>,
    /// Upper-band profile per column.
    pub upper_profile: Vec<f64>,
    pub lower_valid: bool,
    pub upper_valid: bool,
    /// Full 2-D background, same shape as the input strip.
    pub image: Array2<f64>,
    /// Row limits actually used: `[lower_start, lower_end, upper_start,
    /// upper_end]` (half-open).
    pub limits_used: [usize; 4],
    pub warnings: WarningBuffer,
}

impl BackgroundModel {
    /// Background summed over the rows `k1..k2` of one column.
    pub fn window_sum(&self, k1: usize, k2: usize, column: usize) -> f64 {
        (k1..k2).map(|row| self.image[[row, column]]).sum()
    }
}

/// Estimate the background of `strip`, excluding the spectral traces.
///
/// `spectrum_row` is the cross-dispersion location of the first-order
/// spectrum, used to place explicit background bands. Degenerate inputs
/// (fully masked bands, fully masked strip) fall back to flatter models and
/// record warnings; only an empty image is a structural error.
pub fn estimate_background(
    strip: &Array2<f64>,
    spectrum_row: f64,
    config: &BackgroundConfig,
) -> GrismResult<BackgroundModel> {
    let (ny, nx) = strip.dim();
    if ny == 0 || nx == 0 {
        return Err(GrismError::input_validation(
            "INPUT.BACKGROUND_STRIP",
            format!("background strip is empty: {ny}x{nx}"),
        ));
    }

    let mut warnings = WarningBuffer::new();

    let values: Vec<f64> = strip.iter().copied().collect();
    let Some((mean, sigma)) = sigma_clipped_stats(&values, 3, 3.0) else {
        warnings.push("background strip has no valid pixels; using a zero background");
        return Ok(BackgroundModel {
            mean: 0.0,
            sigma: 0.0,
            lower_profile: vec![0.0; nx],
            upper_profile: vec![0.0; nx],
            lower_valid: false,
            upper_valid: false,
            image: Array2::zeros((ny, nx)),
            limits_used: [0, 0, 0, 0],
            warnings,
        });
    };

    // Patch-wise outlier replacement on a working copy.
    let mut cleaned = strip.clone();
    let mut good = Array2::from_elem((ny, nx), true);
    for ((r, c), value) in strip.indexed_iter() {
        if is_masked(*value) {
            good[[r, c]] = false;
        }
    }
    patch_outliers(&mut cleaned, &mut good, mean);

    // Band row ranges.
    let quartile = (ny / 4).max(1);
    let (lower_start, lower_end) = match config.lower {
        None => (0, quartile.min(ny)),
        Some(band) => lower_band_rows(spectrum_row, band, ny),
    };
    let (upper_start, upper_end) = match config.upper {
        None => (ny - quartile.min(ny), ny),
        Some(band) => upper_band_rows(spectrum_row, band, ny),
    };
    let limits_used = [lower_start, lower_end, upper_start, upper_end];

    let (lower_profile, lower_valid) = match config.method {
        BackgroundMethod::Boxcar => {
            band_profile_boxcar(&cleaned, &good, lower_start, lower_end, config.smoothing)
        }
        BackgroundMethod::SplineFit => band_profile_spline(
            &cleaned,
            &good,
            lower_start,
            lower_end,
            config.spline_smoothing_lower.unwrap_or(DEFAULT_KNOT_SPACING),
        ),
    };
    let (upper_profile, upper_valid) = match config.method {
        BackgroundMethod::Boxcar => {
            band_profile_boxcar(&cleaned, &good, upper_start, upper_end, config.smoothing)
        }
        BackgroundMethod::SplineFit => band_profile_spline(
            &cleaned,
            &good,
            upper_start,
            upper_end,
            config.spline_smoothing_upper.unwrap_or(DEFAULT_KNOT_SPACING),
        ),
    };

    if !lower_valid {
        warnings.push("lower background band has no valid pixels");
    }
    if !upper_valid {
        warnings.push("upper background band has no valid pixels");
    }

    // Full 2-D background from the band profiles.
    let image = match (lower_valid, upper_valid) {
        (true, true) => {
            let lower_center = 0.5 * (lower_start + lower_end) as f64;
            let upper_center = 0.5 * (upper_start + upper_end) as f64;
            let span = (upper_center - lower_center).max(1.0);
            let mut image = Array2::zeros((ny, nx));
            for r in 0..ny {
                let t = (r as f64 - lower_center) / span;
                for c in 0..nx {
                    image[[r, c]] = lower_profile[c] + t * (upper_profile[c] - lower_profile[c]);
                }
            }
            image
        }
        (true, false) => broadcast_profile(&lower_profile, ny),
        (false, true) => broadcast_profile(&upper_profile, ny),
        (false, false) => {
            warnings.push(
                "neither background band is usable; falling back to the clipped strip mean",
            );
            Array2::from_elem((ny, nx), mean)
        }
    };

    Ok(BackgroundModel {
        mean,
        sigma,
        lower_profile,
        upper_profile,
        lower_valid,
        upper_valid,
        image,
        limits_used,
        warnings,
    })
}

/// Replace outliers block-by-block with the local clipped mean, flagging the
/// replaced pixels.
fn patch_outliers(cleaned: &mut Array2<f64>, good: &mut Array2<bool>, global_mean: f64) {
    let (ny, nx) = cleaned.dim();
    let edges: Vec<usize> = (0..PATCH_BLOCKS)
        .map(|i| (i as f64 / (PATCH_BLOCKS - 1) as f64 * nx as f64).round() as usize)
        .collect();

    for i in 0..PATCH_BLOCKS.saturating_sub(2) {
        let c0 = edges[i];
        let c1 = edges[i + 2].min(nx);
        if c1 <= c0 + 1 {
            continue;
        }
        let block = cleaned.slice(ndarray::s![.., c0..c1]).to_owned();
        let smoothed = boxcar_2d(&block, PATCH_KERNEL);
        let block_values: Vec<f64> = smoothed.iter().copied().collect();
        let Some((block_mean, block_sigma)) = sigma_clipped_stats(&block_values, 3, 3.0) else {
            continue;
        };
        for r in 0..ny {
            for c in c0..c1 {
                let local = smoothed[[r, c - c0]];
                let original_masked = is_masked(cleaned[[r, c]]);
                let outlier = is_masked(local)
                    || (local - block_mean).abs() > PATCH_SIGMA * block_sigma
                    || local <= 0.0;
                if original_masked || outlier {
                    cleaned[[r, c]] = if original_masked {
                        global_mean
                    } else {
                        block_mean
                    };
                    good[[r, c]] = false;
                }
            }
        }
    }
}

fn lower_band_rows(spectrum_row: f64, band: BackgroundBand, ny: usize) -> (usize, usize) {
    let near = (spectrum_row - band.offset).clamp(0.0, ny as f64);
    let far = (spectrum_row - band.offset - band.width).clamp(0.0, ny as f64);
    (far.floor() as usize, near.ceil() as usize)
}

fn upper_band_rows(spectrum_row: f64, band: BackgroundBand, ny: usize) -> (usize, usize) {
    let near = (spectrum_row + band.offset).clamp(0.0, ny as f64);
    let far = (spectrum_row + band.offset + band.width).clamp(0.0, ny as f64);
    (near.floor() as usize, far.ceil() as usize)
}

/// Column means of the boxcar-smoothed band rows.
///
/// Validity follows the good-pixel mask, not the patched values: a column
/// (or a whole band) with no originally valid pixel carries patched means
/// that must not count as measured background.
fn band_profile_boxcar(
    cleaned: &Array2<f64>,
    good: &Array2<bool>,
    start: usize,
    end: usize,
    smoothing: [usize; 2],
) -> (Vec<f64>, bool) {
    let (_, nx) = cleaned.dim();
    if end <= start {
        return (vec![0.0; nx], false);
    }
    let band = cleaned.slice(ndarray::s![start..end, ..]).to_owned();
    // smoothing is [dispersion, cross-dispersion]; the kernel axes are
    // [rows, cols].
    let smoothed = boxcar_2d(&band, [smoothing[1], smoothing[0]]);
    let mut profile = vec![0.0; nx];
    let mut any_valid = false;
    for c in 0..nx {
        let has_good = (start..end).any(|r| good[[r, c]]);
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in 0..(end - start) {
            let value = smoothed[[r, c]];
            if !is_masked(value) {
                sum += value;
                count += 1;
            }
        }
        if has_good && count > 0 {
            profile[c] = sum / count as f64;
            any_valid = true;
        } else {
            profile[c] = CVAL;
        }
    }
    if any_valid {
        fill_masked_columns(&mut profile);
    }
    (profile, any_valid)
}

/// Column means of good band pixels, smoothed through a cubic spline on
/// knots placed every `knot_spacing` valid columns.
fn band_profile_spline(
    cleaned: &Array2<f64>,
    good: &Array2<bool>,
    start: usize,
    end: usize,
    knot_spacing: f64,
) -> (Vec<f64>, bool) {
    let (_, nx) = cleaned.dim();
    if end <= start {
        return (vec![0.0; nx], false);
    }

    let mut column_means = vec![CVAL; nx];
    let mut good_columns: Vec<usize> = Vec::new();
    for c in 0..nx {
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in start..end {
            if good[[r, c]] {
                sum += cleaned[[r, c]];
                count += 1;
            }
        }
        if count > 0 {
            column_means[c] = sum / count as f64;
            good_columns.push(c);
        }
    }
    if good_columns.is_empty() {
        return (vec![0.0; nx], false);
    }

    let band_mean = good_columns
        .iter()
        .map(|&c| column_means[c])
        .sum::<f64>()
        / good_columns.len() as f64;

    // Trim edge columns where the profile turns over, pre-smooth, then knot.
    let trimmed: Vec<usize> = if good_columns.len() > 4 * EDGE_TRIM {
        good_columns[EDGE_TRIM..good_columns.len() - EDGE_TRIM].to_vec()
    } else {
        good_columns.clone()
    };
    let series: Vec<f64> = trimmed.iter().map(|&c| column_means[c]).collect();
    let smoothed = boxcar_1d(&series, BAND_PRESMOOTH.min(series.len().max(1)));

    let spacing = knot_spacing.max(2.0) as usize;
    let mut knot_x: Vec<f64> = Vec::new();
    let mut knot_y: Vec<f64> = Vec::new();
    let mut i = 0;
    while i < trimmed.len() {
        knot_x.push(trimmed[i] as f64);
        knot_y.push(smoothed[i]);
        i += spacing;
    }
    if let (Some(&last_col), Some(&last_val)) = (trimmed.last(), smoothed.last()) {
        if knot_x.last().copied() != Some(last_col as f64) {
            knot_x.push(last_col as f64);
            knot_y.push(last_val);
        }
    }

    let mut profile = vec![band_mean; nx];
    if let Some(spline) = CubicSpline::natural(&knot_x, &knot_y) {
        let eval_start = trimmed.first().copied().unwrap_or(0);
        let eval_end = trimmed.last().copied().unwrap_or(nx - 1);
        for c in eval_start..=eval_end {
            profile[c] = spline.eval(c as f64);
        }
    }
    // The spline can undershoot; backgrounds are count rates.
    for value in &mut profile {
        if *value < 0.0 {
            *value = 0.0;
        }
    }
    (profile, true)
}

fn broadcast_profile(profile: &[f64], ny: usize) -> Array2<f64> {
    let nx = profile.len();
    let mut image = Array2::zeros((ny, nx));
    for r in 0..ny {
        for c in 0..nx {
            image[[r, c]] = profile[c];
        }
    }
    image
}

/// Replace leftover masked columns with their nearest valid neighbor.
fn fill_masked_columns(profile: &mut [f64]) {
    let n = profile.len();
    for i in 0..n {
        if !is_masked(profile[i]) {
            continue;
        }
        let mut replacement = None;
        for offset in 1..n {
            if i >= offset && !is_masked(profile[i - offset]) {
                replacement = Some(profile[i - offset]);
                break;
            }
            if i + offset < n && !is_masked(profile[i + offset]) {
                replacement = Some(profile[i + offset]);
                break;
            }
        }
        if let Some(value) = replacement {
            profile[i] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::estimate_background;
    use crate::common::config::{BackgroundBand, BackgroundConfig, BackgroundMethod};
    use crate::common::constants::CVAL;
    use ndarray::Array2;

    fn flat_strip(ny: usize, nx: usize, level: f64) -> Array2<f64> {
        Array2::from_elem((ny, nx), level)
    }

    fn strip_with_trace(ny: usize, nx: usize, level: f64, trace_row: usize) -> Array2<f64> {
        let mut strip = flat_strip(ny, nx, level);
        for c in 0..nx {
            for dr in 0..5 {
                let r = trace_row + dr - 2;
                strip[[r, c]] += 400.0;
            }
        }
        strip
    }

    #[test]
    fn flat_strip_yields_flat_background() {
        let strip = flat_strip(80, 300, 5.0);
        let model = estimate_background(&strip, 40.0, &BackgroundConfig::default())
            .expect("estimation should succeed");
        assert!((model.mean - 5.0).abs() < 1.0e-9);
        assert!(model.lower_valid && model.upper_valid);
        for c in [0, 150, 299] {
            for r in [0, 40, 79] {
                assert!(
                    (model.image[[r, c]] - 5.0).abs() < 0.05,
                    "background at ({r},{c}) = {}",
                    model.image[[r, c]]
                );
            }
        }
    }

    #[test]
    fn bright_trace_does_not_leak_into_band_profiles() {
        let strip = strip_with_trace(100, 400, 8.0, 50);
        let model = estimate_background(&strip, 50.0, &BackgroundConfig::default())
            .expect("estimation should succeed");
        // Default bands are the outer quartiles, far away from the trace.
        for c in 50..350 {
            assert!(
                (model.lower_profile[c] - 8.0).abs() < 0.5,
                "lower profile at {c} = {}",
                model.lower_profile[c]
            );
            assert!((model.upper_profile[c] - 8.0).abs() < 0.5);
        }
    }

    #[test]
    fn vertical_gradient_is_reproduced_between_bands() {
        let ny = 100;
        let nx = 200;
        let mut strip = Array2::zeros((ny, nx));
        for r in 0..ny {
            for c in 0..nx {
                strip[[r, c]] = 4.0 + 0.05 * r as f64;
            }
        }
        let model = estimate_background(&strip, 50.0, &BackgroundConfig::default())
            .expect("estimation should succeed");
        // Between band centers the interpolation recovers the gradient.
        let mid = model.image[[50, 100]];
        assert!((mid - (4.0 + 0.05 * 50.0)).abs() < 0.3, "mid {mid}");
    }

    #[test]
    fn spline_mode_tracks_a_slow_dispersion_trend() {
        let ny = 80;
        let nx = 600;
        let mut strip = Array2::zeros((ny, nx));
        for r in 0..ny {
            for c in 0..nx {
                strip[[r, c]] = 10.0 + 3.0 * (c as f64 / nx as f64);
            }
        }
        let config = BackgroundConfig {
            method: BackgroundMethod::SplineFit,
            ..BackgroundConfig::default()
        };
        let model =
            estimate_background(&strip, 40.0, &config).expect("estimation should succeed");
        for c in (50..550).step_by(100) {
            let expected = 10.0 + 3.0 * (c as f64 / nx as f64);
            assert!(
                (model.lower_profile[c] - expected).abs() < 0.3,
                "column {c}: {} vs {expected}",
                model.lower_profile[c]
            );
        }
    }

    #[test]
    fn explicit_bands_are_respected_and_recorded() {
        let strip = flat_strip(200, 300, 6.0);
        let config = BackgroundConfig {
            lower: Some(BackgroundBand {
                offset: 40.0,
                width: 30.0,
            }),
            upper: Some(BackgroundBand {
                offset: 50.0,
                width: 20.0,
            }),
            ..BackgroundConfig::default()
        };
        let model =
            estimate_background(&strip, 100.0, &config).expect("estimation should succeed");
        assert_eq!(model.limits_used, [30, 60, 150, 170]);
    }

    #[test]
    fn fully_masked_bands_fall_back_to_flat_mean_with_warning() {
        let mut strip = flat_strip(40, 100, 7.0);
        // Mask the outer quartiles entirely.
        for c in 0..100 {
            for r in 0..10 {
                strip[[r, c]] = CVAL;
            }
            for r in 30..40 {
                strip[[r, c]] = CVAL;
            }
        }
        let model = estimate_background(&strip, 20.0, &BackgroundConfig::default())
            .expect("estimation should succeed");
        assert!(!model.lower_valid && !model.upper_valid);
        assert!(!model.warnings.is_empty());
        for c in [0, 50, 99] {
            assert!((model.image[[20, c]] - 7.0).abs() < 1.0e-6);
        }
    }

    #[test]
    fn empty_strip_is_a_structural_error() {
        let strip = Array2::zeros((0, 0));
        let error = estimate_background(&strip, 0.0, &BackgroundConfig::default())
            .expect_err("empty image must be rejected");
        assert_eq!(error.code(), "INPUT.BACKGROUND_STRIP");
    }

    #[test]
    fn background_is_invariant_under_dispersion_translation() {
        // A source-free strip with structure only in the cross-dispersion
        // direction: translating columns must not change the estimate.
        let ny = 60;
        let nx = 240;
        let mut strip = Array2::zeros((ny, nx));
        for r in 0..ny {
            for c in 0..nx {
                strip[[r, c]] = 5.0 + 0.02 * r as f64;
            }
        }
        let base = estimate_background(&strip, 30.0, &BackgroundConfig::default())
            .expect("estimation should succeed");

        // Roll columns by 37; the column-constant image is unchanged, so
        // this doubles as a regression guard for column-order dependence.
        let mut rolled = Array2::zeros((ny, nx));
        for r in 0..ny {
            for c in 0..nx {
                rolled[[r, c]] = strip[[r, (c + 37) % nx]];
            }
        }
        let shifted = estimate_background(&rolled, 30.0, &BackgroundConfig::default())
            .expect("estimation should succeed");
        for c in 0..nx {
            assert!((base.lower_profile[c] - shifted.lower_profile[c]).abs() < 1.0e-9);
            assert!((base.upper_profile[c] - shifted.upper_profile[c]).abs() < 1.0e-9);
        }
    }
}
