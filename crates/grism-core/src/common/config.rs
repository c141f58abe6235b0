//! Immutable run configuration for the extraction engine.
//!
//! Every value that the original pipeline kept as process-global state is a
//! field here; entry points take these records by reference and never mutate
//! them.

use crate::common::constants::{COI_AREA_SUBPIXELS, DEFAULT_FRAME_TIME};
use serde::{Deserialize, Serialize};

/// Background estimation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackgroundMethod {
    /// 2-D boxcar smoothing of the outlier-patched strip.
    #[default]
    Boxcar,
    /// Per-column band means followed by a smoothing cubic spline.
    SplineFit,
}

/// Offset and width (in pixels, away from the spectrum row) of one
/// background band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundBand {
    pub offset: f64,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundConfig {
    pub method: BackgroundMethod,
    /// Boxcar kernel `[dispersion, cross-dispersion]` in pixels.
    pub smoothing: [usize; 2],
    /// Explicit lower band; `None` selects the bottom quartile of rows.
    pub lower: Option<BackgroundBand>,
    /// Explicit upper band; `None` selects the top quartile of rows.
    pub upper: Option<BackgroundBand>,
    /// Smoothing-spline parameter override for the lower band.
    pub spline_smoothing_lower: Option<f64>,
    /// Smoothing-spline parameter override for the upper band.
    pub spline_smoothing_upper: Option<f64>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            method: BackgroundMethod::Boxcar,
            smoothing: [50, 7],
            lower: None,
            upper: None,
            spline_smoothing_lower: None,
            spline_smoothing_upper: None,
        }
    }
}

/// Coincidence-loss model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoiModel {
    /// Classic single-population pile-up formula. Experimental: kept for
    /// comparison against photometry-mode corrections.
    Classic,
    /// Classic formula with polynomial corrections for extended losses in
    /// source and background populations. Reference behavior.
    #[default]
    Extended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoiConfig {
    /// Master toggle; disabled returns unit correction factors.
    pub enabled: bool,
    pub model: CoiModel,
    /// CCD frame time in seconds.
    pub frame_time: f64,
    /// Effective coincidence area in independent sub-pixel bins.
    pub area_subpixels: f64,
    /// Boxcar length (dispersion pixels) for the counts-per-frame series.
    pub smoothing_length: usize,
    /// Polynomial correction applied to the source counts per frame,
    /// highest power first. `[1.0]` recovers the classic formula.
    pub source_correction: Vec<f64>,
    /// Polynomial correction applied to the background counts per frame.
    pub background_correction: Vec<f64>,
    /// Clamp range for the first-order sigma entering the area factor.
    pub sigma1_limits: (f64, f64),
}

impl Default for CoiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: CoiModel::Extended,
            frame_time: DEFAULT_FRAME_TIME,
            area_subpixels: COI_AREA_SUBPIXELS,
            smoothing_length: 26,
            source_correction: vec![-1.5, 1.5, -1.5, 1.5, -1.5, 1.5, 0.995],
            background_correction: vec![0.72, -0.72, 0.995],
            sigma1_limits: (2.6, 4.0),
        }
    }
}

/// Top-level extraction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Extraction half-width in units of the local Gaussian sigma.
    pub track_width: f64,
    /// Scale factor applied to pixel variances in the optimal extraction,
    /// compensating correlation introduced by resampling and rotation.
    pub variance_fudge: f64,
    /// Fit Gaussian sigmas within a small tolerance of the calibration
    /// value instead of the default free window.
    pub fix_sigma: bool,
    /// Pin Gaussian centers to the track prediction.
    pub fix_position: bool,
    /// Tolerance on sigma when `fix_sigma` is set.
    pub fixed_sigma_tolerance: f64,
    /// Fractional half-window on free sigma fits.
    pub free_sigma_fraction: f64,
    /// Refine track centerlines and sigmas from the image before
    /// extraction.
    pub refine_tracks: bool,
    /// Use the first-order spectrum to predict (and bound) the second
    /// order.
    pub predict_second_order: bool,
    /// Centerline separation below which overlapping orders are split by
    /// prediction instead of a joint profile fit, in pixels.
    pub min_fit_separation: f64,
    pub background: BackgroundConfig,
    pub coincidence: CoiConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            track_width: 2.5,
            variance_fudge: 0.5,
            fix_sigma: false,
            fix_position: false,
            fixed_sigma_tolerance: 0.2,
            free_sigma_fraction: 0.3,
            refine_tracks: false,
            predict_second_order: true,
            min_fit_separation: 2.0,
            background: BackgroundConfig::default(),
            coincidence: CoiConfig::default(),
        }
    }
}

impl ExtractionConfig {
    /// The default used for flux calibration: 2.5 sigma half-width.
    pub fn flux_calibrated() -> Self {
        Self::default()
    }

    /// Narrow 1.0 sigma half-width: trades calibration consistency for
    /// reduced contamination in crowded fields.
    pub fn narrow_slit() -> Self {
        Self {
            track_width: 1.0,
            ..Self::default()
        }
    }
}
