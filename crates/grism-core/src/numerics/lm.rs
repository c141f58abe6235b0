//! Box-bounded Levenberg-Marquardt least squares.
//!
//! The profile decomposer needs the contract the original pipeline got from
//! its bounded fitter: per-parameter box limits, fixed parameters, an
//! integer status code that distinguishes convergence from iteration
//! exhaustion, and 1-sigma parameter errors from the covariance at the
//! solution.

use super::linalg::{lu_factorize, DenseMatrix};

const DEFAULT_MAX_ITERATIONS: usize = 200;
const DEFAULT_FTOL: f64 = 1.0e-10;
const DEFAULT_XTOL: f64 = 1.0e-10;
const LAMBDA_INITIAL: f64 = 1.0e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const LAMBDA_MAX: f64 = 1.0e12;

/// One fit parameter with optional box bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameter {
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub fixed: bool,
}

impl Parameter {
    pub fn free(value: f64) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
            fixed: false,
        }
    }

    pub fn bounded(value: f64, lower: f64, upper: f64) -> Self {
        Self {
            value,
            lower: Some(lower),
            upper: Some(upper),
            fixed: false,
        }
    }

    pub fn lower_bounded(value: f64, lower: f64) -> Self {
        Self {
            value,
            lower: Some(lower),
            upper: None,
            fixed: false,
        }
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
            fixed: true,
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(lo) = self.lower {
            v = v.max(lo);
        }
        if let Some(hi) = self.upper {
            v = v.min(hi);
        }
        v
    }
}

/// Model seam for the solver: value and analytic partials at one abscissa.
pub trait LeastSquaresModel {
    fn parameter_count(&self) -> usize;
    fn value(&self, params: &[f64], x: f64) -> f64;
    /// Write `d value / d params[k]` into `out[k]` for every parameter.
    fn partials(&self, params: &[f64], x: f64, out: &mut [f64]);
}

/// Termination condition, with the integer code the callers record in their
/// status vectors. Positive codes are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    /// Relative chi-square reduction fell below `ftol`.
    ConvergedChiSquare,
    /// Relative parameter step fell below `xtol`.
    ConvergedParameters,
    /// Iteration cap reached; last accepted parameters returned.
    MaxIterations,
    /// Normal matrix could not be solved even under heavy damping.
    SingularNormalMatrix,
    /// Inconsistent input shapes or no usable data points.
    InvalidInput,
}

impl FitStatus {
    pub const fn code(self) -> i32 {
        match self {
            Self::ConvergedChiSquare => 1,
            Self::ConvergedParameters => 2,
            Self::MaxIterations => 5,
            Self::SingularNormalMatrix => -16,
            Self::InvalidInput => 0,
        }
    }

    pub const fn is_success(self) -> bool {
        self.code() > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    /// 1-sigma errors from the covariance diagonal; zero for fixed
    /// parameters and when the covariance is unavailable.
    pub errors: Vec<f64>,
    pub status: FitStatus,
    pub chi_square: f64,
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            ftol: DEFAULT_FTOL,
            xtol: DEFAULT_XTOL,
        }
    }
}

impl LevenbergMarquardt {
    /// Minimize `sum(((y - model(x)) / err)^2)` over the free parameters.
    ///
    /// Pixels with non-finite values or non-positive errors are skipped;
    /// the huge sentinel error on worthless pixels reduces their weight to
    /// nothing without special-casing them here.
    pub fn fit(
        &self,
        model: &impl LeastSquaresModel,
        x: &[f64],
        y: &[f64],
        err: &[f64],
        parameters: &[Parameter],
    ) -> FitOutcome {
        let nparams = model.parameter_count();
        if parameters.len() != nparams || x.len() != y.len() || x.len() != err.len() {
            return invalid_outcome(parameters);
        }

        let usable: Vec<usize> = (0..x.len())
            .filter(|&i| {
                x[i].is_finite() && y[i].is_finite() && err[i].is_finite() && err[i] > 0.0
            })
            .collect();
        let free: Vec<usize> = (0..nparams).filter(|&k| !parameters[k].fixed).collect();
        if usable.len() < free.len() || free.is_empty() {
            return invalid_outcome(parameters);
        }

        let mut params: Vec<f64> = parameters
            .iter()
            .map(|p| p.clamp(p.value))
            .collect();
        let mut cost = self.cost(model, &params, x, y, err, &usable);
        if !cost.is_finite() {
            return invalid_outcome(parameters);
        }

        let nfree = free.len();
        let mut lambda = LAMBDA_INITIAL;
        let mut partials = vec![0.0; nparams];
        let mut status = FitStatus::MaxIterations;
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;

            // Accumulate the weighted normal equations over the free set.
            let mut jtj = DenseMatrix::zeros(nfree, nfree);
            let mut jtr = vec![0.0; nfree];
            for &i in &usable {
                let weight = 1.0 / err[i];
                let residual = (y[i] - model.value(&params, x[i])) * weight;
                model.partials(&params, x[i], &mut partials);
                for a in 0..nfree {
                    let ja = partials[free[a]] * weight;
                    jtr[a] += ja * residual;
                    for b in a..nfree {
                        let jb = partials[free[b]] * weight;
                        jtj[(a, b)] += ja * jb;
                    }
                }
            }
            for a in 0..nfree {
                for b in 0..a {
                    let mirrored = jtj[(b, a)];
                    jtj[(a, b)] = mirrored;
                }
            }

            // Try damped steps until one reduces the cost.
            let mut stepped = false;
            while lambda <= LAMBDA_MAX {
                let mut damped = jtj.clone();
                for a in 0..nfree {
                    let diagonal = damped[(a, a)];
                    damped[(a, a)] = diagonal + lambda * diagonal.max(1.0e-12);
                }
                let delta = match lu_factorize(&damped).and_then(|f| f.solve(&jtr)) {
                    Ok(delta) => delta,
                    Err(_) => {
                        lambda *= LAMBDA_UP;
                        continue;
                    }
                };

                let mut trial = params.clone();
                for (a, &k) in free.iter().enumerate() {
                    trial[k] = parameters[k].clamp(params[k] + delta[a]);
                }
                let trial_cost = self.cost(model, &trial, x, y, err, &usable);
                if trial_cost.is_finite() && trial_cost <= cost {
                    let cost_drop = cost - trial_cost;
                    let step_small = free.iter().enumerate().all(|(a, &k)| {
                        let scale = params[k].abs().max(1.0);
                        (trial[k] - params[k]).abs() <= self.xtol * scale && delta[a].is_finite()
                    });
                    params = trial;
                    let converged_chi = cost_drop <= self.ftol * cost.max(1.0e-300);
                    cost = trial_cost;
                    lambda = (lambda * LAMBDA_DOWN).max(1.0e-12);
                    stepped = true;
                    if converged_chi {
                        status = FitStatus::ConvergedChiSquare;
                    } else if step_small {
                        status = FitStatus::ConvergedParameters;
                    }
                    break;
                }
                lambda *= LAMBDA_UP;
            }

            if !stepped {
                // No direction reduced the cost; treat the current point as
                // converged unless the very first step already failed.
                status = if iteration == 0 {
                    FitStatus::SingularNormalMatrix
                } else {
                    FitStatus::ConvergedChiSquare
                };
                break;
            }
            if matches!(
                status,
                FitStatus::ConvergedChiSquare | FitStatus::ConvergedParameters
            ) {
                break;
            }
        }

        let errors = self.parameter_errors(model, &params, x, err, &usable, parameters, &free);
        FitOutcome {
            params,
            errors,
            status,
            chi_square: cost,
            iterations,
        }
    }

    fn cost(
        &self,
        model: &impl LeastSquaresModel,
        params: &[f64],
        x: &[f64],
        y: &[f64],
        err: &[f64],
        usable: &[usize],
    ) -> f64 {
        usable
            .iter()
            .map(|&i| {
                let r = (y[i] - model.value(params, x[i])) / err[i];
                r * r
            })
            .sum()
    }

    fn parameter_errors(
        &self,
        model: &impl LeastSquaresModel,
        params: &[f64],
        x: &[f64],
        err: &[f64],
        usable: &[usize],
        parameters: &[Parameter],
        free: &[usize],
    ) -> Vec<f64> {
        let nfree = free.len();
        let mut jtj = DenseMatrix::zeros(nfree, nfree);
        let mut partials = vec![0.0; parameters.len()];
        for &i in usable {
            let weight = 1.0 / err[i];
            model.partials(params, x[i], &mut partials);
            for a in 0..nfree {
                let ja = partials[free[a]] * weight;
                for b in a..nfree {
                    let jb = partials[free[b]] * weight;
                    jtj[(a, b)] += ja * jb;
                }
            }
        }
        for a in 0..nfree {
            for b in 0..a {
                let mirrored = jtj[(b, a)];
                jtj[(a, b)] = mirrored;
            }
        }

        let mut errors = vec![0.0; parameters.len()];
        if let Ok(covariance) = lu_factorize(&jtj).and_then(|f| f.invert()) {
            for (a, &k) in free.iter().enumerate() {
                let variance = covariance[(a, a)];
                if variance.is_finite() && variance > 0.0 {
                    errors[k] = variance.sqrt();
                }
            }
        }
        errors
    }
}

fn invalid_outcome(parameters: &[Parameter]) -> FitOutcome {
    FitOutcome {
        params: parameters.iter().map(|p| p.value).collect(),
        errors: vec![0.0; parameters.len()],
        status: FitStatus::InvalidInput,
        chi_square: f64::INFINITY,
        iterations: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{FitStatus, LeastSquaresModel, LevenbergMarquardt, Parameter};

    /// `a * exp(-(x-c)^2 / (2 s^2)) + b`
    struct GaussianPlusConstant;

    impl LeastSquaresModel for GaussianPlusConstant {
        fn parameter_count(&self) -> usize {
            4
        }

        fn value(&self, p: &[f64], x: f64) -> f64 {
            let z = (x - p[1]) / p[2];
            p[0] * (-0.5 * z * z).exp() + p[3]
        }

        fn partials(&self, p: &[f64], x: f64, out: &mut [f64]) {
            let z = (x - p[1]) / p[2];
            let e = (-0.5 * z * z).exp();
            out[0] = e;
            out[1] = p[0] * e * z / p[2];
            out[2] = p[0] * e * z * z / p[2];
            out[3] = 1.0;
        }
    }

    fn synthetic_profile(a: f64, c: f64, s: f64, b: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&v| {
                let z = (v - c) / s;
                a * (-0.5 * z * z).exp() + b
            })
            .collect();
        let err = vec![1.0; x.len()];
        (x, y, err)
    }

    #[test]
    fn recovers_noise_free_gaussian_parameters() {
        let (x, y, err) = synthetic_profile(120.0, 30.0, 3.2, 5.0);
        let params = [
            Parameter::lower_bounded(80.0, 0.0),
            Parameter::bounded(27.0, 20.0, 40.0),
            Parameter::bounded(4.0, 1.0, 8.0),
            Parameter::free(0.0),
        ];
        let outcome = LevenbergMarquardt::default().fit(&GaussianPlusConstant, &x, &y, &err, &params);
        assert!(outcome.status.is_success(), "status {:?}", outcome.status);
        assert!((outcome.params[0] - 120.0).abs() < 0.01);
        assert!((outcome.params[1] - 30.0).abs() < 0.001);
        assert!((outcome.params[2] - 3.2).abs() < 0.01);
        assert!((outcome.params[3] - 5.0).abs() < 0.01);
    }

    #[test]
    fn bounds_are_never_violated() {
        let (x, y, err) = synthetic_profile(120.0, 30.0, 3.2, 0.0);
        let params = [
            Parameter::lower_bounded(50.0, 0.0),
            Parameter::bounded(29.0, 28.0, 29.5),
            Parameter::bounded(5.0, 4.5, 6.0),
            Parameter::fixed(0.0),
        ];
        let outcome = LevenbergMarquardt::default().fit(&GaussianPlusConstant, &x, &y, &err, &params);
        assert!(outcome.params[1] >= 28.0 && outcome.params[1] <= 29.5);
        assert!(outcome.params[2] >= 4.5 && outcome.params[2] <= 6.0);
        assert_eq!(outcome.params[3], 0.0);
        assert_eq!(outcome.errors[3], 0.0);
    }

    #[test]
    fn fixed_parameters_do_not_move() {
        let (x, y, err) = synthetic_profile(100.0, 25.0, 3.0, 2.0);
        let params = [
            Parameter::free(90.0),
            Parameter::fixed(25.0),
            Parameter::fixed(3.0),
            Parameter::free(0.0),
        ];
        let outcome = LevenbergMarquardt::default().fit(&GaussianPlusConstant, &x, &y, &err, &params);
        assert_eq!(outcome.params[1], 25.0);
        assert_eq!(outcome.params[2], 3.0);
        assert!((outcome.params[0] - 100.0).abs() < 0.01);
    }

    #[test]
    fn degenerate_input_reports_invalid_not_panic() {
        let params = [Parameter::free(1.0); 4];
        let outcome =
            LevenbergMarquardt::default().fit(&GaussianPlusConstant, &[1.0], &[2.0], &[1.0], &params);
        assert_eq!(outcome.status, FitStatus::InvalidInput);
        assert_eq!(outcome.status.code(), 0);
    }

    #[test]
    fn errors_scale_with_data_noise_weighting() {
        let (x, y, _) = synthetic_profile(120.0, 30.0, 3.2, 5.0);
        let tight = vec![0.1; x.len()];
        let loose = vec![10.0; x.len()];
        let params = [
            Parameter::lower_bounded(100.0, 0.0),
            Parameter::bounded(29.0, 20.0, 40.0),
            Parameter::bounded(3.0, 1.0, 8.0),
            Parameter::free(0.0),
        ];
        let solver = LevenbergMarquardt::default();
        let tight_fit = solver.fit(&GaussianPlusConstant, &x, &y, &tight, &params);
        let loose_fit = solver.fit(&GaussianPlusConstant, &x, &y, &loose, &params);
        assert!(tight_fit.errors[1] > 0.0);
        assert!(loose_fit.errors[1] > tight_fit.errors[1] * 10.0);
    }
}
