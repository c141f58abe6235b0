//! Second-order flux prediction from the extracted first-order spectrum.
//!
//! Used to subtract second-order contamination and to bound the
//! second-order amplitude in the joint profile fits; never as an extraction
//! input when the overlap is negligible.

use crate::domain::{GrismError, GrismResult, QualityFlags};
use crate::numerics::gauss::gaussian_integral;
use crate::numerics::interp::interp_linear;
use crate::numerics::poly::{dispersion_scale, pix_from_wave, polyval};

/// Wavelength-dependent second/first-order response ratio, supplied by an
/// external calibration lookup.
pub trait ResponseRatio {
    fn ratio(&self, wavelength: f64) -> f64;
}

/// Tabulated response ratio with linear interpolation, clamped at the table
/// ends.
#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedResponseRatio {
    wavelength: Vec<f64>,
    ratio: Vec<f64>,
}

impl TabulatedResponseRatio {
    pub fn new(wavelength: Vec<f64>, ratio: Vec<f64>) -> GrismResult<Self> {
        if wavelength.len() != ratio.len() || wavelength.is_empty() {
            return Err(GrismError::input_validation(
                "INPUT.RESPONSE_TABLE",
                format!(
                    "response table lengths disagree or empty: {} vs {}",
                    wavelength.len(),
                    ratio.len()
                ),
            ));
        }
        Ok(Self { wavelength, ratio })
    }
}

impl ResponseRatio for TabulatedResponseRatio {
    fn ratio(&self, wavelength: f64) -> f64 {
        interp_linear(wavelength, &self.wavelength, &self.ratio)
    }
}

/// Dispersion calibration of the first and second orders.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionCalibration {
    /// First-order wavelength polynomial over anchor-relative pixels.
    pub first: Vec<f64>,
    /// Second-order wavelength polynomial over pixels relative to the
    /// second-order reference point.
    pub second: Vec<f64>,
    /// Distance in pixels between the anchor and the second-order
    /// reference point.
    pub dist12: f64,
}

/// Predicted second-order spectrum on the second-order pixel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondOrderPrediction {
    /// Second-order wavelength per sample.
    pub wavelength: Vec<f64>,
    /// Dispersion pixel in the anchor (first-order) frame where the sample
    /// lands on the detector.
    pub pixel: Vec<f64>,
    /// Predicted counts per second-order pixel bin.
    pub flux: Vec<f64>,
    /// First-order quality resampled nearest-neighbor.
    pub quality: Vec<QualityFlags>,
    pub dist12: f64,
}

impl SecondOrderPrediction {
    /// Predicted counts per bin at anchor-frame pixel `x` (linear
    /// interpolation), `None` outside the predicted range.
    pub fn counts_at(&self, x: f64) -> Option<f64> {
        let n = self.pixel.len();
        if n == 0 || x < self.pixel[0] || x > self.pixel[n - 1] {
            return None;
        }
        Some(interp_linear(x, &self.pixel, &self.flux))
    }

    /// Predicted peak amplitude at anchor-frame pixel `x` for a Gaussian of
    /// the given sigma.
    pub fn amplitude_at(&self, x: f64, sigma: f64) -> Option<f64> {
        let integral = gaussian_integral(1.0, sigma);
        self.counts_at(x).map(|counts| {
            if integral > 0.0 { counts / integral } else { 0.0 }
        })
    }

    /// Min/max predicted amplitude over the anchor-frame pixel interval,
    /// for bounding a joint-fit amplitude. `None` when the interval misses
    /// the predicted range.
    pub fn amplitude_range(&self, lo: f64, hi: f64, sigma: f64) -> Option<(f64, f64)> {
        let integral = gaussian_integral(1.0, sigma);
        if integral <= 0.0 {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (i, &pix) in self.pixel.iter().enumerate() {
            if pix >= lo && pix <= hi && self.flux[i].is_finite() {
                let amplitude = self.flux[i] / integral;
                min = min.min(amplitude);
                max = max.max(amplitude);
            }
        }
        if min.is_finite() && max.is_finite() {
            Some((min.max(0.0), max.max(0.0)))
        } else {
            None
        }
    }
}

/// Predict the second-order counts from the first-order net spectrum.
///
/// `dis` are anchor-relative first-order dispersion pixels with their net
/// counts and quality; `range` is the first-order dispersion range used to
/// bound the wavelength overlap. First-order counts are converted to
/// per-Angstrom flux with the local first-order dispersion scale, scaled by
/// the response ratio, converted back with the second-order scale at the
/// corresponding wavelength, and resampled onto the second-order pixel
/// grid.
pub fn predict_second_order(
    dis: &[f64],
    net: &[f64],
    quality: &[QualityFlags],
    calibration: &DispersionCalibration,
    range: (f64, f64),
    response: &dyn ResponseRatio,
) -> GrismResult<SecondOrderPrediction> {
    let n = dis.len();
    if net.len() != n || quality.len() != n {
        return Err(GrismError::input_validation(
            "INPUT.SECOND_ORDER_SHAPE",
            format!(
                "spectrum arrays disagree: dis {}, net {}, quality {}",
                n,
                net.len(),
                quality.len()
            ),
        ));
    }
    if n == 0 {
        return Err(GrismError::input_validation(
            "INPUT.SECOND_ORDER_EMPTY",
            "first-order spectrum is empty",
        ));
    }

    let (dismin, dismax) = range;
    let c1 = &calibration.first;
    let c2 = &calibration.second;
    let d12 = calibration.dist12;

    let wmin = polyval(c1, dismin);
    let wmax = polyval(c1, dismax);

    // Second-order pixel grid: the detector columns shifted to the
    // second-order reference, restricted to wavelengths the first order
    // covers.
    let mut pix2: Vec<f64> = Vec::new();
    let mut wav2: Vec<f64> = Vec::new();
    for &d in dis {
        if d <= 1.0 {
            continue;
        }
        let p2 = d - d12;
        let w2 = polyval(c2, p2);
        if w2 >= wmin && w2 <= wmax && w2.is_finite() {
            pix2.push(p2);
            wav2.push(w2);
        }
    }
    if pix2.is_empty() {
        return Err(GrismError::computation(
            "RUN.SECOND_ORDER_RANGE",
            "first and second order wavelength ranges do not overlap on the detector",
        ));
    }

    // First-order samples covering the overlapping wavelength interval.
    let wmin2 = wav2.first().copied().unwrap().max(wmin);
    let wmax2 = wav2.last().copied().unwrap().min(wmax);
    let dlo = pix_from_wave(c1, wmin2, (dismin, dismax)).unwrap_or(dismin);
    let dhi = pix_from_wave(c1, wmax2, (dismin, dismax)).unwrap_or(dismax);

    let mut dis2cut: Vec<f64> = Vec::new();
    let mut projected: Vec<f64> = Vec::new();
    let mut qual_cut: Vec<f64> = Vec::new();
    let second_range = (pix2[0] - 1.0, pix2[pix2.len() - 1] + 1.0);
    for i in 0..n {
        let d = dis[i];
        if d < dlo || d > dhi || !net[i].is_finite() {
            continue;
        }
        let wave = polyval(c1, d);
        let Some(p2) = pix_from_wave(c2, wave, second_range) else {
            continue;
        };
        let scale1 = dispersion_scale(c1, d);
        let scale2 = dispersion_scale(c2, p2);
        if scale1 <= 0.0 || scale2 <= 0.0 {
            continue;
        }
        // counts/bin1 -> counts/A -> scaled by the response -> counts/bin2.
        let per_angstrom = net[i] / scale1;
        let flux2_bin = per_angstrom * response.ratio(wave) * scale2;
        dis2cut.push(p2);
        projected.push(flux2_bin);
        qual_cut.push(quality[i].bits() as f64);
    }
    if dis2cut.len() < 2 {
        return Err(GrismError::computation(
            "RUN.SECOND_ORDER_SAMPLES",
            "too few usable first-order samples to project the second order",
        ));
    }

    // Resample onto the second-order pixel grid.
    let mut wavelength = Vec::with_capacity(pix2.len());
    let mut pixel = Vec::with_capacity(pix2.len());
    let mut flux = Vec::with_capacity(pix2.len());
    let mut quality_out = Vec::with_capacity(pix2.len());
    for (i, &p2) in pix2.iter().enumerate() {
        let value = interp_linear(p2, &dis2cut, &projected);
        if !value.is_finite() || !wav2[i].is_finite() {
            continue;
        }
        // Nearest-neighbor quality resample.
        let q = interp_linear(p2, &dis2cut, &qual_cut);
        wavelength.push(wav2[i]);
        pixel.push(p2 + d12);
        flux.push(value);
        quality_out.push(QualityFlags::from_bits((q + 0.5) as u8));
    }

    Ok(SecondOrderPrediction {
        wavelength,
        pixel,
        flux,
        quality: quality_out,
        dist12: d12,
    })
}
