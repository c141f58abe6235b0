//! Order flux extraction: per-column windows, simple sums, aperture
//! corrections, and quality propagation.
//!
//! The optimal (Horne-weighted) extraction and the pixel-by-pixel overlap
//! apportionment live in [`split`]; iterative track refinement lives in
//! [`refine`].

pub mod refine;
pub mod split;

use crate::common::config::ExtractionConfig;
use crate::common::constants::{is_masked, CVAL, MIN_TRACK_SIGMA};
use crate::domain::{
    ContaminationMask, GrismError, GrismResult, QualityFlags, SpectralOrder, TrackSet,
    WarningBuffer,
};
use crate::modules::background::BackgroundModel;
use crate::numerics::gauss::gaussian_half_integral_fraction;
use crate::numerics::interp::interp_linear;
use ndarray::Array2;
use rayon::prelude::*;

/// Smallest Gaussian fraction the aperture correction divides by; windows
/// narrower than this are clamped and flagged rather than amplified without
/// bound.
const MIN_APERTURE_FRACTION: f64 = 0.05;

/// Measured first-order cumulative profile: fraction of the total flux
/// within `±u` sigma. The measured PSF has broader wings than a pure
/// Gaussian over moderate window widths, so the analytic fraction
/// over-corrects there.
const FIRST_ORDER_PROFILE_WIDTH: [f64; 51] = [
    0.0, 0.0667, 0.1667, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.3, 1.4, 1.5, 1.6,
    1.7, 1.8, 1.9, 2.0, 2.1, 2.2, 2.3, 2.4, 2.5, 2.6, 2.7, 2.8, 2.9, 3.0, 3.1, 3.2, 3.3, 3.4,
    3.5, 3.6, 3.7, 3.8, 3.9, 4.0, 4.1, 4.2, 4.3, 4.4, 4.5, 4.6, 4.7, 4.8333, 4.9333, 5.0,
];
const FIRST_ORDER_PROFILE_FRACTION: [f64; 51] = [
    0.0,
    0.079_769_804_7,
    0.152_208_991,
    0.256_482_414,
    0.331_017_197,
    0.403_222_197,
    0.472_064_814,
    0.537_148_347,
    0.597_906_198,
    0.653_816_662,
    0.704_346_413,
    0.748_964_617,
    0.787_816_053,
    0.821_035_507,
    0.848_805_502,
    0.871_348_421,
    0.888_900_296,
    0.903_143_354,
    0.916_085_646,
    0.928_196_443,
    0.938_406_001,
    0.945_971_114,
    0.951_330_905,
    0.954_947_93,
    0.957_278_503,
    0.958_780_477,
    0.959_911_792,
    0.960_934_825,
    0.962_119_406,
    0.963_707_446,
    0.966_045_076,
    0.969_089_467,
    0.973_684_854,
    0.975_257_929,
    0.977_453_939,
    0.981_061_451,
    0.980_798_098,
    0.982_633_805,
    0.983_725_248,
    0.984_876_762,
    0.985_915_295,
    0.986_929_684,
    0.987_938_594,
    0.988_979_493,
    0.990_084_808,
    0.991_288_321,
    0.992_623_448,
    0.994_123_703,
    0.996_388_866,
    0.998_435_907,
    1.0,
];

/// Extraction window `[k1, k2)` in image rows for one column.
///
/// Rounds like the historical extraction (`k1 = y - w*sigma + 0.5`,
/// `k2 = k1 + 2*w*sigma + 0.5`) and clips to the image; `None` when the
/// clipped window is empty.
pub fn extraction_window(
    center: f64,
    sigma: f64,
    track_width: f64,
    nrows: usize,
) -> Option<(usize, usize)> {
    let sigma = sigma.max(MIN_TRACK_SIGMA);
    let half_width = track_width * sigma;
    let k1 = (center - half_width + 0.5).floor();
    let k2 = k1 + (2.0 * half_width + 0.5).floor();
    let k1 = k1.max(0.0) as usize;
    let k2 = (k2.max(0.0) as usize).min(nrows);
    if k1 < k2 { Some((k1, k2)) } else { None }
}

/// Aperture correction factor for a window `[k1, k2)` around an order of
/// the given sigma: one over the captured fraction of the cross-dispersion
/// profile.
///
/// The first order uses the measured cumulative profile over moderate
/// widths (0.5-4.5 sigma); everything else, and very wide first-order
/// windows, use the analytic Gaussian fraction.
pub fn aperture_correction(k1: usize, k2: usize, sigma: f64, order: SpectralOrder) -> f64 {
    let sigma = sigma.max(MIN_TRACK_SIGMA);
    let half_width_sigmas = 0.5 * (k2.saturating_sub(k1)) as f64 / sigma;
    let fraction = if order == SpectralOrder::First
        && half_width_sigmas > 0.5
        && half_width_sigmas <= 4.5
    {
        interp_linear(
            half_width_sigmas,
            &FIRST_ORDER_PROFILE_WIDTH,
            &FIRST_ORDER_PROFILE_FRACTION,
        )
    } else {
        gaussian_half_integral_fraction(half_width_sigmas)
    };
    1.0 / fraction.max(MIN_APERTURE_FRACTION)
}

/// Exposure information for the strip.
#[derive(Debug, Clone, PartialEq)]
pub enum Exposure {
    /// One exposure time for every pixel, in seconds.
    Constant(f64),
    /// Per-pixel exposure map, same shape as the image.
    Map(Array2<f64>),
}

impl Exposure {
    fn window_mean(&self, k1: usize, k2: usize, column: usize) -> f64 {
        match self {
            Self::Constant(value) => *value,
            Self::Map(map) => {
                let mut sum = 0.0;
                let mut count = 0usize;
                for row in k1..k2 {
                    let value = map[[row, column]];
                    if !is_masked(value) {
                        sum += value;
                        count += 1;
                    }
                }
                if count > 0 { sum / count as f64 } else { 0.0 }
            }
        }
    }
}

/// Per-order simple extraction output; columns outside the order's range
/// hold the off-detector sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleOrderData {
    pub order: SpectralOrder,
    pub present: bool,
    /// Background-subtracted window sum per column.
    pub flux: Vec<f64>,
    /// Background window sum per column.
    pub background: Vec<f64>,
    /// Window-summed variance (fudged) per column.
    pub variance: Vec<f64>,
    pub aperture_correction: Vec<f64>,
    pub window_lower: Vec<f64>,
    pub window_upper: Vec<f64>,
    pub exposure: Vec<f64>,
    pub sigma: Vec<f64>,
    pub quality: Vec<QualityFlags>,
}

impl SimpleOrderData {
    fn sentinel(order: SpectralOrder, present: bool, nx: usize) -> Self {
        Self {
            order,
            present,
            flux: vec![CVAL; nx],
            background: vec![CVAL; nx],
            variance: vec![CVAL; nx],
            aperture_correction: vec![CVAL; nx],
            window_lower: vec![CVAL; nx],
            window_upper: vec![CVAL; nx],
            exposure: vec![0.0; nx],
            sigma: vec![CVAL; nx],
            quality: vec![QualityFlags::GOOD; nx],
        }
    }
}

/// One column's simple-extraction products, computed in parallel.
struct ColumnOutcome {
    clipped: bool,
    masked: bool,
    sigma: f64,
    flux: f64,
    background: f64,
    variance: f64,
    aperture: f64,
    window: (f64, f64),
    exposure: f64,
}

impl ColumnOutcome {
    fn clipped(sigma: f64) -> Self {
        Self {
            clipped: true,
            masked: false,
            sigma,
            flux: CVAL,
            background: CVAL,
            variance: CVAL,
            aperture: CVAL,
            window: (CVAL, CVAL),
            exposure: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleExtraction {
    pub orders: [SimpleOrderData; 4],
    pub warnings: WarningBuffer,
}

impl SimpleExtraction {
    pub fn order(&self, order: SpectralOrder) -> &SimpleOrderData {
        &self.orders[order.index()]
    }
}

/// Simple (window-sum) extraction of every present order.
///
/// Masked pixels inside a window are zeroed and flag the column bad;
/// windows that clip to nothing flag the column bad and leave the sentinel
/// outputs. Overlap and contamination quality bits are OR-ed in, never
/// overwritten.
pub fn extract_simple(
    image: &Array2<f64>,
    background: &BackgroundModel,
    tracks: &TrackSet,
    exposure: &Exposure,
    contamination: Option<&ContaminationMask>,
    config: &ExtractionConfig,
) -> GrismResult<SimpleExtraction> {
    let (ny, nx) = image.dim();
    if background.image.dim() != (ny, nx) {
        return Err(GrismError::input_validation(
            "INPUT.EXTRACT_SHAPE",
            format!(
                "background image {:?} does not match strip {:?}",
                background.image.dim(),
                (ny, nx)
            ),
        ));
    }
    if tracks.width() != nx {
        return Err(GrismError::input_validation(
            "INPUT.EXTRACT_SHAPE",
            format!("track set width {} does not match image {}", tracks.width(), nx),
        ));
    }
    if let Some(mask) = contamination {
        if mask.weak.len() != nx || mask.strong.len() != nx {
            return Err(GrismError::input_validation(
                "INPUT.EXTRACT_CONTAMINATION",
                format!(
                    "contamination mask lengths {}/{} do not match image width {}",
                    mask.weak.len(),
                    mask.strong.len(),
                    nx
                ),
            ));
        }
    }

    let mut warnings = WarningBuffer::new();
    let mut orders: Vec<SimpleOrderData> = SpectralOrder::ALL
        .into_iter()
        .map(|order| SimpleOrderData::sentinel(order, tracks.track(order).present, nx))
        .collect();

    // Columns are independent here, so each order's sweep fans out across
    // them; only the sequential-seeded loops (overlap splitting,
    // refinement) stay serial.
    for order in SpectralOrder::ALL {
        let track = tracks.track(order);
        if !track.present {
            continue;
        }
        let columns: Vec<Option<ColumnOutcome>> = (0..nx)
            .into_par_iter()
            .map(|column| {
                if !track.covers(column, tracks.anchor.x) {
                    return None;
                }
                let sigma = track.sigma[column].max(MIN_TRACK_SIGMA);
                let center = track.centerline[column];
                let Some((k1, k2)) =
                    extraction_window(center, sigma, config.track_width, ny)
                else {
                    return Some(ColumnOutcome::clipped(sigma));
                };

                let mut raw_sum = 0.0;
                let mut variance_sum = 0.0;
                let mut masked = false;
                for row in k1..k2 {
                    let pixel = image[[row, column]];
                    if is_masked(pixel) {
                        masked = true;
                        continue;
                    }
                    raw_sum += pixel;
                    variance_sum += pixel.max(0.0) * config.variance_fudge;
                }

                let background_sum = background.window_sum(k1, k2, column);
                Some(ColumnOutcome {
                    clipped: false,
                    masked,
                    sigma,
                    flux: raw_sum - background_sum,
                    background: background_sum,
                    variance: variance_sum,
                    aperture: aperture_correction(k1, k2, sigma, order),
                    window: (k1 as f64, k2 as f64),
                    exposure: exposure.window_mean(k1, k2, column),
                })
            })
            .collect();

        let data = &mut orders[order.index()];
        let mut clipped_columns = 0usize;
        for (column, outcome) in columns.into_iter().enumerate() {
            let Some(outcome) = outcome else { continue };
            data.sigma[column] = outcome.sigma;
            if outcome.clipped {
                data.quality[column] |= QualityFlags::BAD;
                clipped_columns += 1;
                continue;
            }
            if outcome.masked {
                data.quality[column] |= QualityFlags::BAD;
            }
            data.flux[column] = outcome.flux;
            data.background[column] = outcome.background;
            data.variance[column] = outcome.variance;
            data.aperture_correction[column] = outcome.aperture;
            data.window_lower[column] = outcome.window.0;
            data.window_upper[column] = outcome.window.1;
            data.exposure[column] = outcome.exposure;
        }
        if clipped_columns > 0 {
            warnings.push(format!(
                "order {order}: extraction window off the detector in {clipped_columns} columns"
            ));
        }
    }

    apply_overlap_flags(tracks, &mut orders);
    if let Some(mask) = contamination {
        apply_contamination_flags(tracks, mask, &mut orders);
    }

    let orders: [SimpleOrderData; 4] = orders
        .try_into()
        .map_err(|_| GrismError::internal("BUG.ORDER_COUNT", "expected exactly four orders"))?;
    Ok(SimpleExtraction { orders, warnings })
}

/// Set the overlap bit wherever two present orders' centerlines approach
/// closer than the mean of their sigmas.
fn apply_overlap_flags(tracks: &TrackSet, orders: &mut [SimpleOrderData]) {
    let nx = tracks.width();
    let present: Vec<SpectralOrder> = tracks.present_orders();
    for (i, &order_a) in present.iter().enumerate() {
        for &order_b in present.iter().skip(i + 1) {
            let track_a = tracks.track(order_a);
            let track_b = tracks.track(order_b);
            for column in 0..nx {
                if !track_a.covers(column, tracks.anchor.x)
                    || !track_b.covers(column, tracks.anchor.x)
                {
                    continue;
                }
                let separation = (track_a.centerline[column] - track_b.centerline[column]).abs();
                let threshold = 0.5 * (track_a.sigma[column] + track_b.sigma[column]);
                if separation < threshold {
                    orders[order_a.index()].quality[column] |= QualityFlags::ORDER_OVERLAP;
                    orders[order_b.index()].quality[column] |= QualityFlags::ORDER_OVERLAP;
                }
            }
        }
    }
}

fn apply_contamination_flags(
    tracks: &TrackSet,
    mask: &ContaminationMask,
    orders: &mut [SimpleOrderData],
) {
    let nx = tracks.width();
    for order in SpectralOrder::ALL {
        let track = tracks.track(order);
        if !track.present {
            continue;
        }
        let data = &mut orders[order.index()];
        for column in 0..nx {
            if !track.covers(column, tracks.anchor.x) {
                continue;
            }
            if mask.strong[column] {
                data.quality[column] |= QualityFlags::STRONG_ZEROTH;
            }
            if mask.weak[column] {
                data.quality[column] |= QualityFlags::WEAK_ZEROTH;
            }
        }
    }
}


#[cfg(test)]
mod extraction_tests {
    use super::{extract_simple, Exposure};
    use crate::common::config::ExtractionConfig;
    use crate::common::constants::CVAL;
    use crate::domain::{Anchor, ContaminationMask, QualityFlags, SpectralOrder, WarningBuffer};
    use crate::modules::background::estimate_background;
    use crate::modules::track::{build_track_set, CenterlineOverrides, NominalCalibration};
    use ndarray::Array2;

    fn synthetic_scene(
        ny: usize,
        nx: usize,
        amplitude: f64,
        row: f64,
        sigma: f64,
        background: f64,
    ) -> Array2<f64> {
        let mut image = Array2::from_elem((ny, nx), background);
        for c in 0..nx {
            for r in 0..ny {
                let z = (r as f64 - row) / sigma;
                image[[r, c]] += amplitude * (-0.5 * z * z).exp();
            }
        }
        image
    }

    #[test]
    fn straight_trace_flux_matches_analytic_integral() {
        let (ny, nx) = (200, 600);
        let (amplitude, row, sigma, bg) = (1000.0, 100.0, 3.2, 5.0);
        let image = synthetic_scene(ny, nx, amplitude, row, sigma, bg);

        let mut warnings = WarningBuffer::new();
        let tracks = build_track_set(
            nx,
            Anchor::new(300.0, row),
            &NominalCalibration,
            &CenterlineOverrides::none(),
            &mut warnings,
        )
        .expect("tracks");
        // A 4-sigma half-width captures 99.99% of the trace, so the plain
        // window sum must land on the analytic integral within 1%.
        let config = ExtractionConfig {
            track_width: 4.0,
            ..ExtractionConfig::default()
        };
        let background =
            estimate_background(&image, row, &config.background).expect("background");
        let extraction = extract_simple(
            &image,
            &background,
            &tracks,
            &Exposure::Constant(1000.0),
            None,
            &config,
        )
        .expect("extraction");

        let first = extraction.order(SpectralOrder::First);
        let analytic = amplitude * sigma * (2.0 * std::f64::consts::PI).sqrt();
        for column in (60..540).step_by(40) {
            let flux = first.flux[column];
            assert!(
                (flux - analytic).abs() / analytic < 0.01,
                "column {column}: flux {flux} vs {analytic}"
            );
        }
    }

    #[test]
    fn window_bounds_are_recorded_and_ordered() {
        let image = synthetic_scene(120, 300, 400.0, 60.0, 3.0, 3.0);
        let mut warnings = WarningBuffer::new();
        let tracks = build_track_set(
            300,
            Anchor::new(150.0, 60.0),
            &NominalCalibration,
            &CenterlineOverrides::none(),
            &mut warnings,
        )
        .expect("tracks");
        let config = ExtractionConfig::default();
        let background =
            estimate_background(&image, 60.0, &config.background).expect("background");
        let extraction = extract_simple(
            &image,
            &background,
            &tracks,
            &Exposure::Constant(1.0),
            None,
            &config,
        )
        .expect("extraction");
        let first = extraction.order(SpectralOrder::First);
        for column in 0..300 {
            let k1 = first.window_lower[column];
            let k2 = first.window_upper[column];
            if (k1 - CVAL).abs() < 1.0e-6 {
                continue;
            }
            assert!(k1 < k2, "column {column}");
            assert!(k1 >= 0.0 && k2 <= 120.0);
        }
    }

    #[test]
    fn contamination_bits_are_ored_onto_covered_columns() {
        let image = synthetic_scene(120, 200, 300.0, 60.0, 3.0, 2.0);
        let mut warnings = WarningBuffer::new();
        let tracks = build_track_set(
            200,
            Anchor::new(100.0, 60.0),
            &NominalCalibration,
            &CenterlineOverrides::none(),
            &mut warnings,
        )
        .expect("tracks");
        let mut mask = ContaminationMask {
            weak: vec![false; 200],
            strong: vec![false; 200],
        };
        mask.weak[40] = true;
        mask.strong[40] = true;
        mask.weak[90] = true;
        let config = ExtractionConfig::default();
        let background =
            estimate_background(&image, 60.0, &config.background).expect("background");
        let extraction = extract_simple(
            &image,
            &background,
            &tracks,
            &Exposure::Constant(1.0),
            Some(&mask),
            &config,
        )
        .expect("extraction");
        let first = extraction.order(SpectralOrder::First);
        assert!(first.quality[40].contains(QualityFlags::WEAK_ZEROTH));
        assert!(first.quality[40].contains(QualityFlags::STRONG_ZEROTH));
        assert!(first.quality[90].contains(QualityFlags::WEAK_ZEROTH));
        assert!(!first.quality[90].contains(QualityFlags::STRONG_ZEROTH));
        assert!(first.quality[91].is_good());
    }

    #[test]
    fn masked_pixels_flag_the_column_bad_but_do_not_poison_the_sum() {
        let mut image = synthetic_scene(120, 200, 300.0, 60.0, 3.0, 2.0);
        image[[60, 100]] = CVAL;
        let mut warnings = WarningBuffer::new();
        let tracks = build_track_set(
            200,
            Anchor::new(100.0, 60.0),
            &NominalCalibration,
            &CenterlineOverrides::none(),
            &mut warnings,
        )
        .expect("tracks");
        let config = ExtractionConfig::default();
        let background =
            estimate_background(&image, 60.0, &config.background).expect("background");
        let extraction = extract_simple(
            &image,
            &background,
            &tracks,
            &Exposure::Constant(1.0),
            None,
            &config,
        )
        .expect("extraction");
        let first = extraction.order(SpectralOrder::First);
        assert!(first.quality[100].contains(QualityFlags::BAD));
        assert!(first.flux[100].is_finite());
        assert!(first.flux[100] < first.flux[101]);
    }

    #[test]
    fn mismatched_shapes_are_structural_errors() {
        let image = synthetic_scene(50, 100, 100.0, 25.0, 3.0, 2.0);
        let mut warnings = WarningBuffer::new();
        let tracks = build_track_set(
            120,
            Anchor::new(60.0, 25.0),
            &NominalCalibration,
            &CenterlineOverrides::none(),
            &mut warnings,
        )
        .expect("tracks");
        let config = ExtractionConfig::default();
        let background =
            estimate_background(&image, 25.0, &config.background).expect("background");
        let error = extract_simple(
            &image,
            &background,
            &tracks,
            &Exposure::Constant(1.0),
            None,
            &config,
        )
        .expect_err("shape mismatch must be fatal");
        assert_eq!(error.code(), "INPUT.EXTRACT_SHAPE");
    }
}
