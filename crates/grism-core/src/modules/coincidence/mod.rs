//! Coincidence-loss (photon pile-up) correction.
//!
//! A photon-counting detector undercounts when several photons arrive in
//! one frame. The classic single-population inversion is
//! `incident = -ln(1 - area * observed * frametime) / (area * frametime *
//! alpha)` with `alpha` absorbing the fixed CCD dead time per frame; the
//! extended model applies polynomial corrections to the source and
//! background counts-per-frame before inverting, which matches the measured
//! high-background behavior. Out-of-domain rates are clamped to a floor and
//! excluded from the returned interpolator's domain rather than raised.

use crate::common::config::{CoiConfig, CoiModel};
use crate::common::constants::FRAME_DEAD_TIME;
use crate::domain::{GrismError, GrismResult, WarningBuffer};
use crate::numerics::interp::NearestInterpolator;
use crate::numerics::poly::polyval;
use crate::numerics::smooth::boxcar_1d;

/// Log-argument floor for the extended model.
const EXTENDED_LOG_FLOOR: f64 = 1.0e-4;
/// Log-argument floor for the classic model.
const CLASSIC_LOG_FLOOR: f64 = 1.0e-6;
/// Counts-per-frame ceiling beyond which a bin is excluded outright.
const CPF_CEILING: f64 = 0.9999;
/// Rates below this are statistically meaningless for the correction.
const RATE_FLOOR: f64 = 1.0e-8;
/// Aperture the correction factors are referenced to, in sigma.
const REFERENCE_TRACK_WIDTH: f64 = 2.5;

/// Per-wavelength inputs to the corrector. All arrays share one length and
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoiInput<'a> {
    /// Dispersion pixel (anchor-relative) per bin.
    pub pixel: &'a [f64],
    /// Wavelength per bin, monotonically increasing.
    pub wavelength: &'a [f64],
    /// Aperture-corrected net source count rate per bin (counts/s).
    pub net_rate: &'a [f64],
    /// Background count rate within the extraction track (counts/s).
    pub background_rate: &'a [f64],
    /// First-order sigma polynomial over dispersion pixels.
    pub sigma_poly: &'a [f64],
    /// Extraction half-width in sigma used for `background_rate`.
    pub track_width: f64,
}

/// Correction factors as functions of wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct CoiCorrection {
    /// Net-rate correction factor; nearest-neighbor in wavelength, 1.0
    /// outside the valid domain.
    pub factors: NearestInterpolator,
    /// Background-rate correction factor.
    pub background_factors: NearestInterpolator,
    /// Wavelengths excluded because the observed rate reached the
    /// theoretical maximum.
    pub excluded_wavelengths: Vec<f64>,
    pub warnings: WarningBuffer,
}

/// Forward pile-up model of the classic single-population detector: the
/// observed counts per frame produced by a given incident counts per frame.
pub fn classic_pileup_observed(incident_cpf: f64, area_factor: f64, alpha: f64) -> f64 {
    (1.0 - (-alpha * area_factor * incident_cpf).exp()) / area_factor
}

/// Build the coincidence-loss correction for one spectrum.
///
/// With the correction disabled in `config`, identity factors are returned.
/// Option 3 of the historical correction is rejected: its calibration was
/// never specified, so selecting it is an input error rather than a guess.
pub fn coi_correction(input: &CoiInput<'_>, config: &CoiConfig) -> GrismResult<CoiCorrection> {
    let n = input.wavelength.len();
    if input.pixel.len() != n || input.net_rate.len() != n || input.background_rate.len() != n {
        return Err(GrismError::input_validation(
            "INPUT.COI_SHAPE",
            format!(
                "coincidence input arrays disagree: pixel {}, wavelength {}, net {}, background {}",
                input.pixel.len(),
                n,
                input.net_rate.len(),
                input.background_rate.len()
            ),
        ));
    }
    if !(input.track_width > 0.0) {
        return Err(GrismError::input_validation(
            "INPUT.COI_TRACK_WIDTH",
            format!("track width must be positive, got {}", input.track_width),
        ));
    }

    let mut warnings = WarningBuffer::new();
    if !config.enabled {
        return Ok(CoiCorrection {
            factors: NearestInterpolator::new(vec![], vec![], 1.0),
            background_factors: NearestInterpolator::new(vec![], vec![], 1.0),
            excluded_wavelengths: vec![],
            warnings,
        });
    }

    let frame_time = config.frame_time;
    let alpha = (frame_time - FRAME_DEAD_TIME) / frame_time;

    // Usable bins: finite and above the rate floor.
    let usable: Vec<usize> = (0..n)
        .filter(|&i| {
            input.wavelength[i].is_finite()
                && input.net_rate[i].is_finite()
                && input.background_rate[i].is_finite()
                && input.net_rate[i] > RATE_FLOOR
                && input.background_rate[i] > RATE_FLOOR
        })
        .collect();
    if usable.is_empty() {
        warnings.push("no usable bins for the coincidence-loss correction; factors set to 1");
        return Ok(CoiCorrection {
            factors: NearestInterpolator::new(vec![], vec![], 1.0),
            background_factors: NearestInterpolator::new(vec![], vec![], 1.0),
            excluded_wavelengths: vec![],
            warnings,
        });
    }

    let m = usable.len();
    let mut sigma1 = vec![0.0; m];
    let mut area_factor = vec![0.0; m];
    let mut spec_factor = vec![0.0; m];
    let mut net = vec![0.0; m];
    let mut background = vec![0.0; m];
    let mut wave = vec![0.0; m];
    let (sig_lo, sig_hi) = config.sigma1_limits;
    for (j, &i) in usable.iter().enumerate() {
        sigma1[j] = polyval(input.sigma_poly, input.pixel[i]).clamp(sig_lo, sig_hi);
        area_factor[j] = config.area_subpixels / (2.0 * sigma1[j] * input.track_width);
        spec_factor[j] = config.area_subpixels / (2.0 * sigma1[j] * REFERENCE_TRACK_WIDTH);
        net[j] = input.net_rate[i];
        background[j] = input.background_rate[i];
        wave[j] = input.wavelength[i];
    }

    // Counts per frame, smoothed along the dispersion.
    let total_raw: Vec<f64> = (0..m).map(|j| (net[j] + background[j]) * frame_time).collect();
    let background_raw: Vec<f64> = (0..m).map(|j| background[j] * frame_time).collect();
    let tot_cpf = boxcar_1d(&total_raw, config.smoothing_length);
    let bkg_cpf = boxcar_1d(&background_raw, config.smoothing_length);

    let mut valid = vec![true; m];
    let (obs_cpf, obs_incident, bkg_corr_cpf, bkg_incident) = match config.model {
        CoiModel::Classic => {
            let mut obs_incident = vec![0.0; m];
            let mut bkg_incident = vec![0.0; m];
            for j in 0..m {
                if tot_cpf[j] * spec_factor[j] >= CPF_CEILING {
                    valid[j] = false;
                }
                let yy = (1.0 - spec_factor[j] * tot_cpf[j]).max(CLASSIC_LOG_FLOOR);
                if yy <= CLASSIC_LOG_FLOOR {
                    valid[j] = false;
                }
                obs_incident[j] = -(yy.ln()) / (alpha * spec_factor[j]);
                let yb = (1.0 - area_factor[j] * bkg_cpf[j]).max(CLASSIC_LOG_FLOOR);
                bkg_incident[j] = -(yb.ln()) / (alpha * area_factor[j]);
            }
            (tot_cpf.clone(), obs_incident, bkg_cpf.clone(), bkg_incident)
        }
        CoiModel::Extended => {
            for j in 0..m {
                if tot_cpf[j] * area_factor[j] >= CPF_CEILING {
                    valid[j] = false;
                }
            }
            // Polynomial corrections applied to the raw rates, then
            // re-smoothed.
            let corrected_total: Vec<f64> = (0..m)
                .map(|j| {
                    let source_poly =
                        polyval(&config.source_correction, tot_cpf[j] * spec_factor[j]);
                    let background_poly =
                        polyval(&config.background_correction, bkg_cpf[j] * area_factor[j]);
                    (net[j] * source_poly + background[j] * background_poly) * frame_time
                })
                .collect();
            let corrected_background: Vec<f64> = (0..m)
                .map(|j| {
                    let background_poly =
                        polyval(&config.background_correction, bkg_cpf[j] * area_factor[j]);
                    background[j] * background_poly * frame_time
                })
                .collect();
            let total_cpf = boxcar_1d(&corrected_total, config.smoothing_length);
            let bkg_corr_cpf = boxcar_1d(&corrected_background, config.smoothing_length);

            let mut obs_incident = vec![0.0; m];
            let mut bkg_incident = vec![0.0; m];
            for j in 0..m {
                let yy = 1.0 - area_factor[j] * total_cpf[j];
                let clamped = yy.max(EXTENDED_LOG_FLOOR);
                if yy < EXTENDED_LOG_FLOOR {
                    valid[j] = false;
                }
                obs_incident[j] = -(clamped.ln()) / (alpha * area_factor[j]);
                let yb = (1.0 - area_factor[j] * bkg_corr_cpf[j]).max(EXTENDED_LOG_FLOOR);
                bkg_incident[j] = -(yb.ln()) / (alpha * area_factor[j]);
            }
            (total_cpf, obs_incident, bkg_corr_cpf, bkg_incident)
        }
    };

    // Correction factor = incident / observed, for net and background.
    let mut factor_wave = Vec::with_capacity(m);
    let mut factor = Vec::with_capacity(m);
    let mut background_factor_wave = Vec::with_capacity(m);
    let mut background_factor = Vec::with_capacity(m);
    let mut excluded = Vec::new();
    for j in 0..m {
        let bg_denominator = bkg_corr_cpf[j];
        if bg_denominator > 0.0 {
            background_factor_wave.push(wave[j]);
            background_factor.push(bkg_incident[j] / bg_denominator);
        }
        if !valid[j] {
            excluded.push(wave[j]);
            continue;
        }
        let denominator = obs_cpf[j] - bkg_corr_cpf[j];
        if denominator.abs() < 1.0e-12 {
            excluded.push(wave[j]);
            continue;
        }
        factor_wave.push(wave[j]);
        factor.push((obs_incident[j] - bkg_incident[j]) / denominator);
    }

    if !excluded.is_empty() {
        warnings.push(format!(
            "{} bins exceeded the theoretical coincidence limit and were excluded",
            excluded.len()
        ));
    }

    Ok(CoiCorrection {
        factors: NearestInterpolator::new(factor_wave, factor, 1.0),
        background_factors: NearestInterpolator::new(
            background_factor_wave,
            background_factor,
            1.0,
        ),
        excluded_wavelengths: excluded,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::{classic_pileup_observed, coi_correction, CoiInput};
    use crate::common::config::{CoiConfig, CoiModel};
    use crate::common::constants::FRAME_DEAD_TIME;

    fn constant_input(
        n: usize,
        net: f64,
        background: f64,
    ) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let pixel: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let wavelength: Vec<f64> = (0..n).map(|i| 2000.0 + i as f64 * 3.2).collect();
        (pixel, wavelength, vec![net; n], vec![background; n])
    }

    fn classic_limit_config() -> CoiConfig {
        CoiConfig {
            model: CoiModel::Extended,
            source_correction: vec![1.0],
            background_correction: vec![1.0],
            ..CoiConfig::default()
        }
    }

    #[test]
    fn round_trip_recovers_incident_rate_below_saturation() {
        let config = classic_limit_config();
        let frame_time = config.frame_time;
        let alpha = (frame_time - FRAME_DEAD_TIME) / frame_time;
        // sigma poly [3.2], track width 2.5 -> area factor 315/(2*3.2*2.5).
        let area_factor = 315.0 / (2.0 * 3.2 * 2.5);
        let max_cpf = 1.0 / area_factor;

        for saturation in [0.05, 0.2, 0.5, 0.8] {
            let incident_cpf = saturation * max_cpf;
            let observed_cpf = classic_pileup_observed(incident_cpf, area_factor, alpha);
            let observed_rate = observed_cpf / frame_time;

            let (pixel, wavelength, net, background) =
                constant_input(200, observed_rate, 1.0e-6);
            let input = CoiInput {
                pixel: &pixel,
                wavelength: &wavelength,
                net_rate: &net,
                background_rate: &background,
                sigma_poly: &[3.2],
                track_width: 2.5,
            };
            let correction = coi_correction(&input, &config).expect("correction should run");
            let factor = correction.factors.eval(wavelength[100]);
            let recovered = observed_rate * factor;
            let incident_rate = incident_cpf / frame_time;
            assert!(
                (recovered - incident_rate).abs() / incident_rate < 0.01,
                "saturation {saturation}: recovered {recovered} vs {incident_rate}"
            );
        }
    }

    #[test]
    fn saturated_rates_are_clamped_and_excluded_not_raised() {
        let config = classic_limit_config();
        let area_factor = 315.0 / (2.0 * 3.2 * 2.5);
        // Observed rate at the theoretical maximum counts per frame.
        let observed_rate = (1.0 / area_factor) / config.frame_time;
        let (pixel, wavelength, net, background) = constant_input(50, observed_rate, 1.0e-6);
        let input = CoiInput {
            pixel: &pixel,
            wavelength: &wavelength,
            net_rate: &net,
            background_rate: &background,
            sigma_poly: &[3.2],
            track_width: 2.5,
        };
        let correction = coi_correction(&input, &config).expect("must not raise");
        assert!(!correction.excluded_wavelengths.is_empty());
        assert!(!correction.warnings.is_empty());
        // Outside the (empty or reduced) domain the factor falls back to 1.
        let factor = correction.factors.eval(wavelength[25]);
        assert!(factor.is_finite());
    }

    #[test]
    fn low_rates_give_near_unity_factors() {
        let config = CoiConfig::default();
        let (pixel, wavelength, net, background) = constant_input(120, 0.5, 0.05);
        let input = CoiInput {
            pixel: &pixel,
            wavelength: &wavelength,
            net_rate: &net,
            background_rate: &background,
            sigma_poly: &[3.2],
            track_width: 2.5,
        };
        let correction = coi_correction(&input, &config).expect("correction should run");
        let factor = correction.factors.eval(wavelength[60]);
        assert!(
            (factor - 1.0).abs() < 0.1,
            "low-rate factor should be near 1, got {factor}"
        );
    }

    #[test]
    fn disabled_correction_returns_identity() {
        let config = CoiConfig {
            enabled: false,
            ..CoiConfig::default()
        };
        let (pixel, wavelength, net, background) = constant_input(10, 100.0, 5.0);
        let input = CoiInput {
            pixel: &pixel,
            wavelength: &wavelength,
            net_rate: &net,
            background_rate: &background,
            sigma_poly: &[3.2],
            track_width: 2.5,
        };
        let correction = coi_correction(&input, &config).expect("correction should run");
        assert_eq!(correction.factors.eval(2500.0), 1.0);
        assert_eq!(correction.background_factors.eval(2500.0), 1.0);
    }

    #[test]
    fn classic_model_is_supported_as_experimental_variant() {
        let config = CoiConfig {
            model: CoiModel::Classic,
            ..CoiConfig::default()
        };
        let (pixel, wavelength, net, background) = constant_input(80, 2.0, 0.2);
        let input = CoiInput {
            pixel: &pixel,
            wavelength: &wavelength,
            net_rate: &net,
            background_rate: &background,
            sigma_poly: &[3.2],
            track_width: 2.5,
        };
        let correction = coi_correction(&input, &config).expect("classic model should run");
        let factor = correction.factors.eval(wavelength[40]);
        assert!(factor >= 1.0, "pile-up correction boosts rates, got {factor}");
    }

    #[test]
    fn mismatched_arrays_are_structural() {
        let config = CoiConfig::default();
        let input = CoiInput {
            pixel: &[1.0],
            wavelength: &[2000.0, 2003.2],
            net_rate: &[1.0, 1.0],
            background_rate: &[0.1, 0.1],
            sigma_poly: &[3.2],
            track_width: 2.5,
        };
        let error = coi_correction(&input, &config).expect_err("shape mismatch must fail");
        assert_eq!(error.code(), "INPUT.COI_SHAPE");
    }
}
