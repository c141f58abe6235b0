pub mod gauss;
pub mod interp;
pub mod linalg;
pub mod lm;
pub mod poly;
pub mod smooth;
pub mod spline;
pub mod stats;

pub use gauss::{erf, gaussian, gaussian_half_integral_fraction, gaussian_integral, gaussian_sum};
pub use interp::{interp_linear, resample_linear, NearestInterpolator};
pub use linalg::{lu_factorize, lu_solve, DenseMatrix, LuDecomposition, LuError};
pub use lm::{FitOutcome, FitStatus, LeastSquaresModel, LevenbergMarquardt, Parameter};
pub use poly::{dispersion_scale, pix_from_wave, polyfit, polyval};
pub use smooth::{boxcar_1d, boxcar_2d};
pub use spline::CubicSpline;
pub use stats::{clip_mask, sigma_clipped_stats};
