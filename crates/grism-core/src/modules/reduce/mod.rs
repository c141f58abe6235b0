//! End-to-end reduction of one grism image strip.
//!
//! Sequences the engine: background estimation, track building, optional
//! track refinement, simple extraction, second-order prediction,
//! overlap-aware optimal extraction, and the coincidence-loss factors. The
//! result is one record per reduction with every per-order product and the
//! accumulated warnings; callers own persistence and presentation.

use crate::common::config::ExtractionConfig;
use crate::common::constants::CVAL;
use crate::domain::{
    Anchor, ContaminationMask, GrismError, GrismResult, QualityFlags, SpectralOrder, TrackSet,
    WarningBuffer,
};
use crate::modules::background::{estimate_background, BackgroundModel};
use crate::modules::coincidence::{coi_correction, CoiCorrection, CoiInput};
use crate::modules::extract::refine::refine_tracks;
use crate::modules::extract::split::extract_split;
use crate::modules::extract::{extract_simple, Exposure};
use crate::modules::secondorder::{
    predict_second_order, DispersionCalibration, ResponseRatio, SecondOrderPrediction,
};
use crate::modules::track::{build_track_set, CenterlineOverrides, CurvatureProvider};
use crate::numerics::poly::polyval;
use ndarray::Array2;

/// All inputs of one reduction. The image and the collaborator seams stay
/// borrowed; the engine never mutates them.
pub struct ReductionInputs<'a> {
    /// Rotated/extracted image strip, rows = cross-dispersion.
    pub image: &'a Array2<f64>,
    pub anchor: Anchor,
    pub provider: &'a dyn CurvatureProvider,
    pub overrides: CenterlineOverrides,
    pub exposure: Exposure,
    pub contamination: Option<&'a ContaminationMask>,
    /// Wavelength calibration; without it the second-order prediction and
    /// the coincidence correction are skipped.
    pub dispersion: Option<&'a DispersionCalibration>,
    pub response: Option<&'a dyn ResponseRatio>,
}

/// Combined per-order products of one reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderExtraction {
    pub order: SpectralOrder,
    pub present: bool,
    /// Background-subtracted window sum per column.
    pub flux_simple: Vec<f64>,
    /// Horne-weighted flux per column.
    pub flux_optimal: Vec<f64>,
    pub variance_simple: Vec<f64>,
    pub variance_optimal: Vec<f64>,
    pub background: Vec<f64>,
    pub aperture_correction: Vec<f64>,
    pub window_lower: Vec<f64>,
    pub window_upper: Vec<f64>,
    pub exposure: Vec<f64>,
    pub overlap_fraction: Vec<f64>,
    pub sigma: Vec<f64>,
    pub quality: Vec<QualityFlags>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReductionResult {
    pub background: BackgroundModel,
    pub tracks: TrackSet,
    pub orders: [OrderExtraction; 4],
    pub second_order: Option<SecondOrderPrediction>,
    pub coincidence: Option<CoiCorrection>,
    pub warnings: WarningBuffer,
}

impl ReductionResult {
    pub fn order(&self, order: SpectralOrder) -> &OrderExtraction {
        &self.orders[order.index()]
    }
}

/// Run the full reduction.
pub fn reduce(
    inputs: &ReductionInputs<'_>,
    config: &ExtractionConfig,
) -> GrismResult<ReductionResult> {
    let (ny, nx) = inputs.image.dim();
    if ny == 0 || nx == 0 {
        return Err(GrismError::input_validation(
            "INPUT.REDUCE_IMAGE",
            format!("image strip is empty: {ny}x{nx}"),
        ));
    }

    let mut warnings = WarningBuffer::new();

    // Background and net image.
    let background = estimate_background(inputs.image, inputs.anchor.y, &config.background)?;
    warnings.extend(background.warnings.clone());
    let mut net = inputs.image.clone();
    let mut variance = Array2::zeros((ny, nx));
    for r in 0..ny {
        for c in 0..nx {
            let raw = inputs.image[[r, c]];
            if crate::common::constants::is_masked(raw) {
                net[[r, c]] = CVAL;
                variance[[r, c]] = CVAL;
            } else {
                net[[r, c]] = raw - background.image[[r, c]];
                variance[[r, c]] = raw.max(1.0e-10);
            }
        }
    }

    // Tracks, optionally refined against the net image.
    let mut tracks = build_track_set(
        nx,
        inputs.anchor,
        inputs.provider,
        &inputs.overrides,
        &mut warnings,
    )?;
    if config.refine_tracks {
        tracks = refine_tracks(&net, &tracks, None, config, &mut warnings)?;
    }

    // Simple extraction.
    let simple = extract_simple(
        inputs.image,
        &background,
        &tracks,
        &inputs.exposure,
        inputs.contamination,
        config,
    )?;
    warnings.extend(simple.warnings.clone());

    // Second-order prediction from the first-order simple spectrum.
    let second_order = if config.predict_second_order {
        predict_from_first(inputs, &tracks, &simple, &mut warnings)
    } else {
        None
    };

    // Overlap-aware optimal extraction.
    let split = extract_split(&net, &variance, &tracks, second_order.as_ref(), config)?;
    warnings.extend(split.warnings.clone());

    // Coincidence-loss factors over the first order.
    let coincidence = if config.coincidence.enabled {
        coincidence_for_first_order(inputs, &tracks, &simple, config, &mut warnings)
    } else {
        None
    };

    // Assemble the per-order products.
    let orders: [OrderExtraction; 4] = SpectralOrder::ALL
        .map(|order| {
            let simple_data = simple.order(order);
            let split_data = split.order(order);
            let mut quality = simple_data.quality.clone();
            for (q, s) in quality.iter_mut().zip(split_data.quality.iter()) {
                *q |= *s;
            }
            OrderExtraction {
                order,
                present: simple_data.present,
                flux_simple: simple_data.flux.clone(),
                flux_optimal: split_data.flux.clone(),
                variance_simple: simple_data.variance.clone(),
                variance_optimal: split_data.variance.clone(),
                background: simple_data.background.clone(),
                aperture_correction: simple_data.aperture_correction.clone(),
                window_lower: simple_data.window_lower.clone(),
                window_upper: simple_data.window_upper.clone(),
                exposure: simple_data.exposure.clone(),
                overlap_fraction: split_data.fraction_sum.clone(),
                sigma: simple_data.sigma.clone(),
                quality,
            }
        });

    Ok(ReductionResult {
        background,
        tracks,
        orders,
        second_order,
        coincidence,
        warnings,
    })
}

/// Predict the second order from the extracted first-order spectrum; any
/// failure downgrades to a warning because the prediction is an aid, not a
/// required product.
fn predict_from_first(
    inputs: &ReductionInputs<'_>,
    tracks: &TrackSet,
    simple: &crate::modules::extract::SimpleExtraction,
    warnings: &mut WarningBuffer,
) -> Option<SecondOrderPrediction> {
    let dispersion = inputs.dispersion?;
    let response = inputs.response?;
    let first_track = tracks.track(SpectralOrder::First);
    let second_track = tracks.track(SpectralOrder::Second);
    if !(first_track.present && second_track.present) {
        return None;
    }
    let first = simple.order(SpectralOrder::First);

    let nx = tracks.width();
    let mut dis = Vec::with_capacity(nx);
    let mut net = Vec::with_capacity(nx);
    let mut quality = Vec::with_capacity(nx);
    for column in 0..nx {
        if !first_track.covers(column, tracks.anchor.x) {
            continue;
        }
        let flux = first.flux[column];
        if (flux - CVAL).abs() < 1.0e-6 {
            continue;
        }
        dis.push(column as f64 - tracks.anchor.x);
        net.push(flux);
        quality.push(first.quality[column]);
    }

    match predict_second_order(
        &dis,
        &net,
        &quality,
        dispersion,
        (first_track.range.min, first_track.range.max),
        response,
    ) {
        Ok(prediction) => Some(prediction),
        Err(error) => {
            warnings.push(format!("second-order prediction skipped: {error}"));
            None
        }
    }
}

/// Coincidence factors for the first order; needs wavelengths and a usable
/// exposure, otherwise records a warning and skips.
fn coincidence_for_first_order(
    inputs: &ReductionInputs<'_>,
    tracks: &TrackSet,
    simple: &crate::modules::extract::SimpleExtraction,
    config: &ExtractionConfig,
    warnings: &mut WarningBuffer,
) -> Option<CoiCorrection> {
    let Some(dispersion) = inputs.dispersion else {
        warnings.push("coincidence correction skipped: no dispersion calibration");
        return None;
    };
    let first_track = tracks.track(SpectralOrder::First);
    if !first_track.present {
        return None;
    }
    let first = simple.order(SpectralOrder::First);

    let nx = tracks.width();
    let mut pixel = Vec::with_capacity(nx);
    let mut wavelength = Vec::with_capacity(nx);
    let mut net_rate = Vec::with_capacity(nx);
    let mut background_rate = Vec::with_capacity(nx);
    for column in 0..nx {
        if !first_track.covers(column, tracks.anchor.x) {
            continue;
        }
        let flux = first.flux[column];
        let correction = first.aperture_correction[column];
        if crate::common::constants::is_masked(flux)
            || crate::common::constants::is_masked(correction)
        {
            continue;
        }
        let exposure = first.exposure[column];
        if !(exposure > 0.0) {
            continue;
        }
        let x = column as f64 - tracks.anchor.x;
        pixel.push(x);
        wavelength.push(polyval(&dispersion.first, x));
        net_rate.push(flux * correction / exposure);
        background_rate.push(first.background[column].max(0.0) / exposure);
    }
    if pixel.is_empty() {
        warnings.push("coincidence correction skipped: no exposed first-order columns");
        return None;
    }

    let input = CoiInput {
        pixel: &pixel,
        wavelength: &wavelength,
        net_rate: &net_rate,
        background_rate: &background_rate,
        sigma_poly: &first_track.sigma_poly,
        track_width: config.track_width,
    };
    match coi_correction(&input, &config.coincidence) {
        Ok(correction) => {
            warnings.extend(correction.warnings.clone());
            Some(correction)
        }
        Err(error) => {
            warnings.push(format!("coincidence correction skipped: {error}"));
            None
        }
    }
}
