//! Grism spectral-order separation and extraction engine.
//!
//! Reduces a rotated 2-D slitless-spectrograph image strip into calibrated
//! per-order 1-D spectra: background estimation, per-order curvature/width
//! tracks, multi-Gaussian cross-dispersion decomposition of overlapping
//! orders, simple and optimal flux extraction, second-order prediction, and
//! coincidence-loss correction. Astrometry, calibration-file parsing, image
//! I/O, and plotting are collaborator concerns and stay outside this crate.

pub mod common;
pub mod domain;
pub mod modules;
pub mod numerics;

pub use common::config::{
    BackgroundBand, BackgroundConfig, BackgroundMethod, CoiConfig, CoiModel, ExtractionConfig,
};
pub use domain::{
    Anchor, ContaminationMask, DispersionRange, GrismError, GrismErrorCategory, GrismResult,
    OrderTrack, QualityFlags, SpectralOrder, TrackSet, WarningBuffer,
};
pub use modules::background::{estimate_background, BackgroundModel};
pub use modules::coincidence::{coi_correction, CoiCorrection, CoiInput};
pub use modules::extract::{
    aperture_correction, extract_simple, extraction_window, Exposure, SimpleExtraction,
};
pub use modules::profile::{
    estimate_components, fit_profile, ComponentGuess, FitConstraints, ProfileFitResult,
    ProfileSample,
};
pub use modules::reduce::{reduce, OrderExtraction, ReductionInputs, ReductionResult};
pub use modules::secondorder::{
    predict_second_order, DispersionCalibration, ResponseRatio, SecondOrderPrediction,
    TabulatedResponseRatio,
};
pub use modules::track::{
    build_track_set, CenterlineOverrides, CurvatureProvider, NominalCalibration, OrderCurvature,
};
