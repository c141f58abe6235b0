//! Polynomial evaluation, least-squares fitting, and dispersion-relation
//! inversion.
//!
//! Coefficients are stored highest power first throughout the engine, so a
//! centerline polynomial `[a, b, c]` evaluates as `a*x^2 + b*x + c`.

use super::linalg::{lu_solve, DenseMatrix};

/// Horner evaluation, highest power first. An empty coefficient slice
/// evaluates to zero.
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .fold(0.0, |acc, coefficient| acc * x + coefficient)
}

/// Weighted least-squares polynomial fit of the given degree, highest power
/// first. `None` when the sample is too small or the normal equations are
/// singular (e.g. all abscissae identical).
pub fn polyfit(x: &[f64], y: &[f64], weights: Option<&[f64]>, degree: usize) -> Option<Vec<f64>> {
    let n = x.len();
    if n == 0 || n != y.len() || n < degree + 1 {
        return None;
    }
    if let Some(w) = weights {
        if w.len() != n {
            return None;
        }
    }

    let terms = degree + 1;
    let mut normal = DenseMatrix::zeros(terms, terms);
    let mut rhs = vec![0.0; terms];

    for i in 0..n {
        if !x[i].is_finite() || !y[i].is_finite() {
            continue;
        }
        let weight = weights.map_or(1.0, |w| w[i]);
        if !(weight.is_finite() && weight > 0.0) {
            continue;
        }
        // powers[k] = x^k
        let mut powers = vec![1.0; terms];
        for k in 1..terms {
            powers[k] = powers[k - 1] * x[i];
        }
        for row in 0..terms {
            rhs[row] += weight * powers[row] * y[i];
            for col in 0..terms {
                normal[(row, col)] += weight * powers[row] * powers[col];
            }
        }
    }

    let solution = lu_solve(&normal, &rhs).ok()?;
    // Solution is lowest power first; flip to the engine convention.
    Some(solution.into_iter().rev().collect())
}

/// Wavelength step per dispersion pixel at `pix`, by central difference of
/// the dispersion polynomial.
pub fn dispersion_scale(dispersion: &[f64], pix: f64) -> f64 {
    polyval(dispersion, pix + 0.5) - polyval(dispersion, pix - 0.5)
}

/// Inverse of a monotonic dispersion relation over `range`: the pixel at
/// which `polyval(dispersion, pix) == wave`.
///
/// Sampled bracketing followed by Newton refinement; `None` when `wave`
/// falls outside the dispersion values spanned by `range` or the relation is
/// not monotonic over it.
pub fn pix_from_wave(dispersion: &[f64], wave: f64, range: (f64, f64)) -> Option<f64> {
    const SAMPLES: usize = 256;
    const NEWTON_STEPS: usize = 8;

    let (lo, hi) = range;
    if !(hi > lo) || !wave.is_finite() {
        return None;
    }
    let step = (hi - lo) / SAMPLES as f64;
    let mut prev_x = lo;
    let mut prev_w = polyval(dispersion, prev_x);
    let mut bracket = None;
    for i in 1..=SAMPLES {
        let x = lo + step * i as f64;
        let w = polyval(dispersion, x);
        if (prev_w - wave) * (w - wave) <= 0.0 {
            bracket = Some((prev_x, x, prev_w, w));
            break;
        }
        prev_x = x;
        prev_w = w;
    }
    let (x0, x1, w0, w1) = bracket?;

    // Secant seed inside the bracket, then Newton.
    let mut pix = if (w1 - w0).abs() > 0.0 {
        x0 + (wave - w0) / (w1 - w0) * (x1 - x0)
    } else {
        0.5 * (x0 + x1)
    };
    for _ in 0..NEWTON_STEPS {
        let value = polyval(dispersion, pix) - wave;
        let slope = derivative_at(dispersion, pix);
        if slope.abs() < 1.0e-12 {
            break;
        }
        let next = pix - value / slope;
        if !next.is_finite() {
            break;
        }
        pix = next.clamp(lo, hi);
        if value.abs() < 1.0e-9 {
            break;
        }
    }
    Some(pix)
}

fn derivative_at(coefficients: &[f64], x: f64) -> f64 {
    let n = coefficients.len();
    if n < 2 {
        return 0.0;
    }
    let mut acc = 0.0;
    for (i, coefficient) in coefficients[..n - 1].iter().enumerate() {
        let power = (n - 1 - i) as f64;
        acc = acc * x + coefficient * power;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::{dispersion_scale, pix_from_wave, polyfit, polyval};

    #[test]
    fn horner_matches_expanded_polynomial() {
        let coefficients = [2.0, -3.0, 1.0];
        for x in [-2.0, 0.0, 0.5, 4.0] {
            let expected = 2.0 * x * x - 3.0 * x + 1.0;
            assert!((polyval(&coefficients, x) - expected).abs() < 1.0e-12);
        }
        assert_eq!(polyval(&[], 3.0), 0.0);
    }

    #[test]
    fn polyfit_recovers_exact_quadratic() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5 - 3.0).collect();
        let y: Vec<f64> = x.iter().map(|&v| 0.25 * v * v - 1.5 * v + 2.0).collect();
        let fit = polyfit(&x, &y, None, 2).expect("fit should succeed");
        assert!((fit[0] - 0.25).abs() < 1.0e-9);
        assert!((fit[1] + 1.5).abs() < 1.0e-9);
        assert!((fit[2] - 2.0).abs() < 1.0e-9);
    }

    #[test]
    fn polyfit_honors_weights() {
        // Two populations; the heavily weighted one defines the line.
        let x = [0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 2.0, 3.0, 10.0, 10.0, 10.0, 10.0];
        let w = [1.0e6, 1.0e6, 1.0e6, 1.0e6, 1.0e-6, 1.0e-6, 1.0e-6, 1.0e-6];
        let fit = polyfit(&x, &y, Some(&w), 1).expect("fit should succeed");
        assert!((fit[0] - 1.0).abs() < 1.0e-3);
        assert!(fit[1].abs() < 1.0e-3);
    }

    #[test]
    fn polyfit_rejects_underdetermined_samples() {
        assert!(polyfit(&[1.0, 2.0], &[1.0, 2.0], None, 2).is_none());
        assert!(polyfit(&[], &[], None, 0).is_none());
    }

    #[test]
    fn pix_from_wave_inverts_linear_dispersion() {
        // wave = 3.1 * pix + 2600
        let dispersion = [3.1, 2600.0];
        let pix = pix_from_wave(&dispersion, 2910.0, (-400.0, 1200.0)).expect("in range");
        assert!((pix - 100.0).abs() < 1.0e-6);
        assert!(pix_from_wave(&dispersion, 9.0e9, (-400.0, 1200.0)).is_none());
    }

    #[test]
    fn pix_from_wave_inverts_curved_dispersion() {
        let dispersion = [1.0e-5, 3.1, 2600.0];
        for target_pix in [-300.0, -10.0, 250.0, 1100.0] {
            let wave = super::polyval(&dispersion, target_pix);
            let pix = pix_from_wave(&dispersion, wave, (-400.0, 1200.0)).expect("in range");
            assert!(
                (pix - target_pix).abs() < 1.0e-4,
                "pix {pix} vs {target_pix}"
            );
        }
    }

    #[test]
    fn dispersion_scale_matches_slope() {
        let dispersion = [3.1, 2600.0];
        assert!((dispersion_scale(&dispersion, 57.0) - 3.1).abs() < 1.0e-9);
    }
}
