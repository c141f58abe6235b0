//! Iterative refinement of the order tracks against the image.
//!
//! The calibration polynomials are good to a few pixels; fitting Gaussian
//! bundles in coarse column bins along each order and re-fitting the
//! centerline and sigma polynomials through the bin results tightens the
//! tracks before extraction. Orders whose clipped range is too short keep
//! their calibration polynomials.

use crate::common::config::ExtractionConfig;
use crate::common::constants::MIN_TRACK_SIGMA;
use crate::domain::{
    GrismResult, QualityFlags, SpectralOrder, TrackSet, WarningBuffer,
};
use crate::modules::profile::{fit_profile, ComponentGuess, FitConstraints, ProfileSample};
use crate::modules::secondorder::SecondOrderPrediction;
use crate::numerics::poly::{polyfit, polyval};
use ndarray::Array2;

/// Column-bin half width for the refinement fits.
const BIN_HALF_WIDTH: usize = 15;
/// Orders with a clipped dispersion range shorter than this are not
/// refined.
const MIN_REFINE_SPAN: f64 = 100.0;
/// Centerline polynomial degree per order (zeroth..third).
const CENTERLINE_DEGREE: [usize; 4] = [2, 3, 2, 1];

/// One accepted bin fit for one order.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BinFit {
    x: f64,
    center: f64,
    center_error: f64,
    sigma: f64,
}

/// Refine the track set against the background-subtracted image.
///
/// Bins whose joint fit fails are skipped; an order where every bin fails
/// keeps its calibration polynomials and a warning is recorded. The
/// returned set preserves presence and ranges.
pub fn refine_tracks(
    net: &Array2<f64>,
    tracks: &TrackSet,
    prediction: Option<&SecondOrderPrediction>,
    config: &ExtractionConfig,
    warnings: &mut WarningBuffer,
) -> GrismResult<TrackSet> {
    let (_, nx) = net.dim();
    let anchor = tracks.anchor;
    let mut collected: [Vec<BinFit>; 4] = [vec![], vec![], vec![], vec![]];

    let refinable: Vec<SpectralOrder> = SpectralOrder::ALL
        .into_iter()
        .filter(|&order| {
            let track = tracks.track(order);
            track.present && track.range.length() >= MIN_REFINE_SPAN
        })
        .collect();

    for column in ((BIN_HALF_WIDTH)..nx.saturating_sub(BIN_HALF_WIDTH))
        .step_by(2 * BIN_HALF_WIDTH)
    {
        // Which refinable orders cover this bin center?
        let covering: Vec<SpectralOrder> = refinable
            .iter()
            .copied()
            .filter(|&order| tracks.track(order).covers(column, anchor.x))
            .collect();
        if covering.is_empty() || covering.len() > 3 {
            continue;
        }

        let Ok(sample) =
            ProfileSample::from_columns(net, column - BIN_HALF_WIDTH, column + BIN_HALF_WIDTH)
        else {
            continue;
        };

        let guesses: Vec<ComponentGuess> = covering
            .iter()
            .map(|&order| {
                let track = tracks.track(order);
                ComponentGuess {
                    amplitude: sample
                        .counts
                        .get(track.centerline[column].round().max(0.0) as usize)
                        .copied()
                        .filter(|v| v.is_finite())
                        .unwrap_or(sample.noise_level)
                        .max(0.0),
                    center: track.centerline[column],
                    sigma: track.sigma[column].max(MIN_TRACK_SIGMA),
                }
            })
            .collect();

        let mut constraints = FitConstraints {
            fix_sigma: config.fix_sigma,
            fix_position: false,
            fixed_sigma_tolerance: config.fixed_sigma_tolerance,
            free_sigma_fraction: config.free_sigma_fraction,
            amplitude_limits: [None; 3],
        };
        if let (Some(prediction), Some(slot)) = (
            prediction,
            covering.iter().position(|&o| o == SpectralOrder::Second),
        ) {
            let track = tracks.track(SpectralOrder::Second);
            let sigma = track.sigma[column].max(MIN_TRACK_SIGMA);
            let x = column as f64 - anchor.x;
            if let Some(limits) = prediction.amplitude_range(
                x - BIN_HALF_WIDTH as f64,
                x + BIN_HALF_WIDTH as f64,
                sigma,
            ) {
                constraints.amplitude_limits[slot] = Some(limits);
            }
        }

        let Ok(fit) = fit_profile(&sample, &guesses, &constraints) else {
            continue;
        };
        if !fit.converged() {
            continue;
        }
        for (slot, &order) in covering.iter().enumerate() {
            let component = fit.components[slot];
            if component.dropped || !component.center.is_finite() {
                continue;
            }
            collected[order.index()].push(BinFit {
                x: column as f64 - anchor.x,
                center: component.center,
                center_error: component.center_error.max(0.05),
                sigma: component.sigma,
            });
        }
    }

    // Re-fit polynomials through the accepted bins.
    let mut refined = tracks.clone();
    for order in SpectralOrder::ALL {
        let bins = &collected[order.index()];
        let track = tracks.track(order);
        if !refinable.contains(&order) {
            continue;
        }
        let degree = CENTERLINE_DEGREE[order.index()];
        if bins.len() < degree + 1 {
            warnings.push(format!(
                "order {order}: {} usable refinement bins, keeping calibration track",
                bins.len()
            ));
            continue;
        }

        let x: Vec<f64> = bins.iter().map(|b| b.x).collect();
        let center: Vec<f64> = bins.iter().map(|b| b.center - anchor.y).collect();
        let weight: Vec<f64> = bins
            .iter()
            .map(|b| 1.0 / (b.center_error * b.center_error))
            .collect();
        let sigma: Vec<f64> = bins.iter().map(|b| b.sigma).collect();

        let Some(center_poly) = polyfit(&x, &center, Some(&weight), degree) else {
            warnings.push(format!(
                "order {order}: centerline re-fit is singular, keeping calibration track"
            ));
            continue;
        };
        let sigma_poly =
            polyfit(&x, &sigma, None, degree).unwrap_or_else(|| track.sigma_poly.clone());

        let new_track = refined.track_mut(order);
        new_track.centerline_poly = center_poly.clone();
        new_track.sigma_poly = sigma_poly.clone();
        for column in 0..nx {
            let xo = column as f64 - anchor.x;
            new_track.centerline[column] = anchor.y + polyval(&center_poly, xo);
            let s = polyval(&sigma_poly, xo);
            new_track.sigma[column] = if s > MIN_TRACK_SIGMA { s } else { MIN_TRACK_SIGMA };
            new_track.quality[column] = QualityFlags::GOOD;
        }
    }

    Ok(refined)
}
