//! Optimal extraction and pixel-by-pixel separation of overlapping orders.
//!
//! Where orders share a column, the column's cross-dispersion profile is
//! decomposed into per-order Gaussians (fixed sigma and position, amplitudes
//! free) and each pixel's net counts are apportioned by the ratio of the
//! order's density to the total. Each order's variance is inflated by the
//! apportioned share of the other orders, since split photons carry shared
//! noise. Column fits seed from the previous column's amplitudes, a
//! deliberate sequential dependency.

use crate::common::config::ExtractionConfig;
use crate::common::constants::{is_masked, CVAL, MIN_TRACK_SIGMA};
use crate::domain::{
    GrismError, GrismResult, QualityFlags, SpectralOrder, TrackSet, WarningBuffer,
};
use crate::modules::profile::{
    fit_profile, ComponentGuess, FitConstraints, ProfileSample,
};
use crate::modules::secondorder::SecondOrderPrediction;
use crate::numerics::gauss::gaussian;
use ndarray::Array2;

/// Floor for a fitted amplitude that came back non-positive.
const AMPLITUDE_FLOOR: f64 = 1.0e-6;

/// Per-order output of the overlap-aware optimal extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOrderData {
    pub order: SpectralOrder,
    /// Horne-weighted net flux per column.
    pub flux: Vec<f64>,
    /// Optimal-extraction variance per column.
    pub variance: Vec<f64>,
    /// Sum over the window of this order's apportionment fraction.
    pub fraction_sum: Vec<f64>,
    /// Columns where the joint fit did not converge and the calibration
    /// guess was used instead.
    pub quality: Vec<QualityFlags>,
}

impl SplitOrderData {
    fn sentinel(order: SpectralOrder, nx: usize) -> Self {
        Self {
            order,
            flux: vec![CVAL; nx],
            variance: vec![CVAL; nx],
            fraction_sum: vec![CVAL; nx],
            quality: vec![QualityFlags::GOOD; nx],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitExtraction {
    pub orders: [SplitOrderData; 4],
    pub warnings: WarningBuffer,
}

impl SplitExtraction {
    pub fn order(&self, order: SpectralOrder) -> &SplitOrderData {
        &self.orders[order.index()]
    }
}

/// Apportionment fractions of each component at each row:
/// `frac[k][i] = G_k(row_i) / sum_j G_j(row_i)`.
///
/// Rows where every component is negligible split evenly so the fractions
/// always sum to one.
pub fn overlap_fractions(
    components: &[(f64, f64, f64)],
    rows: &[f64],
) -> Vec<Vec<f64>> {
    let ncomp = components.len();
    let mut fractions = vec![vec![0.0; rows.len()]; ncomp];
    for (i, &row) in rows.iter().enumerate() {
        let densities: Vec<f64> = components
            .iter()
            .map(|&(a, c, s)| gaussian(row, a.max(AMPLITUDE_FLOOR), c, s))
            .collect();
        let total: f64 = densities.iter().sum();
        if total > 0.0 {
            for k in 0..ncomp {
                fractions[k][i] = densities[k] / total;
            }
        } else {
            for fraction in fractions.iter_mut() {
                fraction[i] = 1.0 / ncomp as f64;
            }
        }
    }
    fractions
}

/// Overlap-aware optimal extraction of every present order.
///
/// `net` is the background-subtracted strip and `variance` the per-pixel
/// variance (before the fudge factor). The optional second-order prediction
/// bounds the second-order amplitude in joint fits and replaces it entirely
/// when the orders are too close to fit.
pub fn extract_split(
    net: &Array2<f64>,
    variance: &Array2<f64>,
    tracks: &TrackSet,
    prediction: Option<&SecondOrderPrediction>,
    config: &ExtractionConfig,
) -> GrismResult<SplitExtraction> {
    let (ny, nx) = net.dim();
    if variance.dim() != (ny, nx) {
        return Err(GrismError::input_validation(
            "INPUT.SPLIT_SHAPE",
            format!(
                "variance {:?} does not match net image {:?}",
                variance.dim(),
                (ny, nx)
            ),
        ));
    }
    if tracks.width() != nx {
        return Err(GrismError::input_validation(
            "INPUT.SPLIT_SHAPE",
            format!("track set width {} does not match image {}", tracks.width(), nx),
        ));
    }

    let mut warnings = WarningBuffer::new();
    let mut orders: Vec<SplitOrderData> = SpectralOrder::ALL
        .into_iter()
        .map(|order| SplitOrderData::sentinel(order, nx))
        .collect();

    // Previous column's fitted amplitudes, keyed by order index.
    let mut seed_amplitudes: [Option<f64>; 4] = [None; 4];
    let mut failed_fits = 0usize;

    for column in 0..nx {
        let covering: Vec<SpectralOrder> = SpectralOrder::ALL
            .into_iter()
            .filter(|order| tracks.track(*order).covers(column, tracks.anchor.x))
            .collect();
        if covering.is_empty() {
            continue;
        }

        // Solve for the component amplitudes of this column.
        let solved = solve_column_amplitudes(
            net,
            tracks,
            column,
            &covering,
            prediction,
            config,
            &mut seed_amplitudes,
            &mut failed_fits,
            &mut orders,
        )?;

        // Apportion and sum per order.
        let components: Vec<(f64, f64, f64)> = solved
            .iter()
            .map(|&(order, amplitude)| {
                let track = tracks.track(order);
                (
                    amplitude,
                    track.centerline[column],
                    track.sigma[column].max(MIN_TRACK_SIGMA),
                )
            })
            .collect();

        for (slot, &(order, _)) in solved.iter().enumerate() {
            let track = tracks.track(order);
            let sigma = track.sigma[column].max(MIN_TRACK_SIGMA);
            let center = track.centerline[column];
            let Some((k1, k2)) =
                super::extraction_window(center, sigma, config.track_width, ny)
            else {
                orders[order.index()].quality[column] |= QualityFlags::BAD;
                continue;
            };
            let rows: Vec<f64> = (k1..k2).map(|r| r as f64).collect();
            let fractions = overlap_fractions(&components, &rows);

            // Window-normalized own profile for the Horne weights.
            let own_profile: Vec<f64> = rows
                .iter()
                .map(|&row| gaussian(row, 1.0, center, sigma))
                .collect();
            let profile_total: f64 = own_profile.iter().sum();
            if profile_total <= 0.0 {
                orders[order.index()].quality[column] |= QualityFlags::BAD;
                continue;
            }

            let mut weight_sum = 0.0;
            let mut weighted_flux = 0.0;
            let mut fraction_sum = 0.0;
            for (i, row) in (k1..k2).enumerate() {
                let pixel = net[[row, column]];
                let own_fraction = fractions[slot][i];
                let other_fraction = 1.0 - own_fraction;
                fraction_sum += own_fraction;

                let mut share = if is_masked(pixel) {
                    0.0
                } else {
                    pixel * own_fraction
                };
                if share < 0.0 {
                    share = 0.0;
                }

                let mut pixel_variance = variance[[row, column]];
                if is_masked(pixel_variance) || pixel_variance <= 0.0 {
                    pixel_variance = 1.0e-10;
                }
                let inflated =
                    pixel_variance * config.variance_fudge * (1.0 + other_fraction);

                let p = own_profile[i] / profile_total;
                weight_sum += p * p / inflated;
                weighted_flux += p * share / inflated;
            }

            let data = &mut orders[order.index()];
            if weight_sum > 0.0 {
                let var_opt = 1.0 / weight_sum;
                data.variance[column] = var_opt;
                data.flux[column] = var_opt * weighted_flux;
            } else {
                data.quality[column] |= QualityFlags::BAD;
            }
            data.fraction_sum[column] = fraction_sum;
        }
    }

    if failed_fits > 0 {
        warnings.push(format!(
            "column profile fit fell back to the calibration guess in {failed_fits} columns"
        ));
    }

    let orders: [SplitOrderData; 4] = orders
        .try_into()
        .map_err(|_| GrismError::internal("BUG.ORDER_COUNT", "expected exactly four orders"))?;
    Ok(SplitExtraction { orders, warnings })
}

/// Amplitudes of the orders covering one column, by joint profile fit with
/// fixed sigmas/positions, or from the second-order prediction when the
/// orders sit too close to separate.
#[allow(clippy::too_many_arguments)]
fn solve_column_amplitudes(
    net: &Array2<f64>,
    tracks: &TrackSet,
    column: usize,
    covering: &[SpectralOrder],
    prediction: Option<&SecondOrderPrediction>,
    config: &ExtractionConfig,
    seed_amplitudes: &mut [Option<f64>; 4],
    failed_fits: &mut usize,
    orders: &mut [SplitOrderData],
) -> GrismResult<Vec<(SpectralOrder, f64)>> {
    // Sort by centerline so the joint fit sees ordered components.
    let mut sorted: Vec<SpectralOrder> = covering.to_vec();
    sorted.sort_by(|&a, &b| {
        tracks.track(a).centerline[column].total_cmp(&tracks.track(b).centerline[column])
    });

    // Too-close check between first and second order: use the prediction
    // instead of an unstable joint fit.
    if sorted.len() > 1 {
        let first = tracks.track(SpectralOrder::First);
        let second = tracks.track(SpectralOrder::Second);
        let both_cover = first.covers(column, tracks.anchor.x)
            && second.covers(column, tracks.anchor.x);
        if both_cover {
            let separation =
                (first.centerline[column] - second.centerline[column]).abs();
            if separation < config.min_fit_separation {
                for &order in covering {
                    orders[order.index()].quality[column] |= QualityFlags::ORDER_OVERLAP;
                }
                return predicted_amplitude_split(
                    net, tracks, column, covering, prediction, config, seed_amplitudes,
                    failed_fits,
                );
            }
        }
    }

    let sample = ProfileSample::from_columns(net, column, column + 1)?;
    let guesses: Vec<ComponentGuess> = sorted
        .iter()
        .map(|&order| {
            let track = tracks.track(order);
            let center = track.centerline[column];
            let sigma = track.sigma[column].max(MIN_TRACK_SIGMA);
            let seed = seed_amplitudes[order.index()].unwrap_or_else(|| {
                let row = center.round().max(0.0) as usize;
                let row = row.min(net.nrows().saturating_sub(1));
                let pixel = net[[row, column]];
                if is_masked(pixel) { 0.0 } else { pixel.max(0.0) }
            });
            ComponentGuess {
                amplitude: seed,
                center,
                sigma,
            }
        })
        .collect();

    let mut constraints = FitConstraints::fixed(config.fixed_sigma_tolerance);
    if let (Some(prediction), Some(slot)) = (
        prediction,
        sorted.iter().position(|&o| o == SpectralOrder::Second),
    ) {
        let sigma = tracks.track(SpectralOrder::Second).sigma[column].max(MIN_TRACK_SIGMA);
        if let Some((lo, hi)) = prediction.amplitude_range(
            column as f64 - tracks.anchor.x - 15.0,
            column as f64 - tracks.anchor.x + 15.0,
            sigma,
        ) {
            constraints = constraints.with_amplitude_limit(slot, (lo, hi));
        }
    }

    let fit = fit_profile(&sample, &guesses, &constraints)?;
    let mut solved = Vec::with_capacity(sorted.len());
    if fit.converged() {
        for (slot, &order) in sorted.iter().enumerate() {
            let amplitude = fit.components[slot].amplitude.max(AMPLITUDE_FLOOR);
            seed_amplitudes[order.index()] = Some(amplitude);
            solved.push((order, amplitude));
        }
    } else {
        // Keep the column: fall back to the seed/guess amplitudes and flag.
        *failed_fits += 1;
        for (slot, &order) in sorted.iter().enumerate() {
            orders[order.index()].quality[column] |= QualityFlags::BAD;
            solved.push((order, guesses[slot].amplitude.max(AMPLITUDE_FLOOR)));
        }
    }
    Ok(solved)
}

/// Amplitude split when first and second order cannot be separated by a
/// fit: the second order takes its predicted amplitude, the first keeps the
/// remainder of a single-component fit.
#[allow(clippy::too_many_arguments)]
fn predicted_amplitude_split(
    net: &Array2<f64>,
    tracks: &TrackSet,
    column: usize,
    covering: &[SpectralOrder],
    prediction: Option<&SecondOrderPrediction>,
    config: &ExtractionConfig,
    seed_amplitudes: &mut [Option<f64>; 4],
    failed_fits: &mut usize,
) -> GrismResult<Vec<(SpectralOrder, f64)>> {
    let first = tracks.track(SpectralOrder::First);
    let sigma1 = first.sigma[column].max(MIN_TRACK_SIGMA);
    let sample = ProfileSample::from_columns(net, column, column + 1)?;
    let guess = ComponentGuess {
        amplitude: seed_amplitudes[SpectralOrder::First.index()].unwrap_or(sample.noise_level),
        center: first.centerline[column],
        sigma: sigma1,
    };
    let fit = fit_profile(
        &sample,
        &[guess],
        &FitConstraints::fixed(config.fixed_sigma_tolerance),
    )?;
    let mut blended = if fit.converged() {
        fit.components[0].amplitude.max(0.0)
    } else {
        *failed_fits += 1;
        guess.amplitude.max(0.0)
    };

    let sigma2 = tracks.track(SpectralOrder::Second).sigma[column].max(MIN_TRACK_SIGMA);
    let x = column as f64 - tracks.anchor.x;
    let predicted2 = prediction
        .and_then(|p| p.amplitude_at(x, sigma2))
        .unwrap_or(0.0)
        .max(0.0);

    // The blended peak contains both orders; subtract the prediction.
    let first_amplitude = if blended > predicted2 {
        blended -= predicted2;
        blended
    } else {
        0.0
    };

    let mut solved = Vec::with_capacity(covering.len());
    for &order in covering {
        let amplitude = match order {
            SpectralOrder::First => first_amplitude.max(AMPLITUDE_FLOOR),
            SpectralOrder::Second => predicted2.max(AMPLITUDE_FLOOR),
            _ => AMPLITUDE_FLOOR,
        };
        seed_amplitudes[order.index()] = Some(amplitude);
        solved.push((order, amplitude));
    }
    Ok(solved)
}
