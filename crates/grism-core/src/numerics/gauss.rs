//! Gaussian profile models and the error-function machinery behind the
//! aperture corrections.

/// `amplitude * exp(-((x - center)^2) / (2 sigma^2))`.
///
/// A non-positive or non-finite sigma yields zero rather than a singular
/// profile.
pub fn gaussian(x: f64, amplitude: f64, center: f64, sigma: f64) -> f64 {
    if !(sigma.is_finite() && sigma > 0.0) {
        return 0.0;
    }
    let z = (x - center) / sigma;
    amplitude * (-0.5 * z * z).exp()
}

/// Sum of up to three Gaussians sharing one abscissa.
pub fn gaussian_sum(x: f64, components: &[(f64, f64, f64)]) -> f64 {
    components
        .iter()
        .map(|&(amplitude, center, sigma)| gaussian(x, amplitude, center, sigma))
        .sum()
}

/// Integral of a unit-amplitude Gaussian over all x: `sigma * sqrt(2 pi)`.
pub fn gaussian_integral(amplitude: f64, sigma: f64) -> f64 {
    amplitude * sigma * (2.0 * std::f64::consts::PI).sqrt()
}

/// Fraction of a Gaussian's total integral captured within `±u` sigma of
/// its center: `erf(u / sqrt(2))`.
///
/// Monotonically increasing in `u`, 0 at `u = 0`, 1 in the infinite-window
/// limit.
pub fn gaussian_half_integral_fraction(u: f64) -> f64 {
    if u <= 0.0 {
        return 0.0;
    }
    erf(u / std::f64::consts::SQRT_2)
}

/// Error function, Chebyshev-fitted complement (absolute error < 1.2e-7).
pub fn erf(x: f64) -> f64 {
    1.0 - erfc(x)
}

pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let tau = t
        * (-z * z - 1.265_512_23
            + t * (1.000_023_68
                + t * (0.374_091_96
                    + t * (0.096_784_18
                        + t * (-0.186_288_06
                            + t * (0.278_868_07
                                + t * (-1.135_203_98
                                    + t * (1.488_515_87
                                        + t * (-0.822_152_23 + t * 0.170_872_77)))))))))
        .exp();
    if x >= 0.0 { tau } else { 2.0 - tau }
}
