//! Order curvature and width models.
//!
//! The calibration lookup that turns an anchor position into per-order
//! centerline/sigma polynomials lives behind [`CurvatureProvider`]; the
//! engine only needs the polynomials and the nominal dispersion range of
//! each order. [`NominalCalibration`] supplies the built-in defaults, and
//! callers may override any order's centerline polynomial (manual
//! calibration).

use crate::common::constants::MIN_TRACK_SIGMA;
use crate::domain::{
    Anchor, DispersionRange, GrismError, GrismResult, OrderTrack, QualityFlags, SpectralOrder,
    TrackSet, WarningBuffer,
};
use crate::numerics::poly::polyval;

/// Calibration output for one order: polynomials in anchor-relative
/// dispersion pixels, highest power first.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderCurvature {
    pub centerline: Vec<f64>,
    pub sigma: Vec<f64>,
    pub range: DispersionRange,
}

/// External calibration seam: `(anchor, order) -> curvature model`.
pub trait CurvatureProvider {
    fn curvature(&self, anchor: Anchor, order: SpectralOrder) -> GrismResult<OrderCurvature>;
}

/// Built-in curvature defaults.
///
/// Centerlines default to straight tracks at the calibrated offsets; the
/// sigma polynomials and dispersion ranges carry the instrument values.
/// Real reductions replace the centerlines through a fitted calibration
/// provider or per-order overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NominalCalibration;

impl CurvatureProvider for NominalCalibration {
    fn curvature(&self, _anchor: Anchor, order: SpectralOrder) -> GrismResult<OrderCurvature> {
        let curvature = match order {
            SpectralOrder::Zeroth => OrderCurvature {
                centerline: vec![-0.07, -49.0],
                sigma: vec![4.7],
                range: DispersionRange::new(-820.0, -570.0),
            },
            SpectralOrder::First => OrderCurvature {
                centerline: vec![0.0],
                sigma: vec![-8.22e-9, 6.773e-4, 3.338],
                range: DispersionRange::new(-374.0, 1150.0),
            },
            SpectralOrder::Second => OrderCurvature {
                centerline: vec![0.0],
                sigma: vec![-5.44e-7, 2.132e-3, 3.662],
                range: DispersionRange::new(25.0, 3000.0),
            },
            SpectralOrder::Third => OrderCurvature {
                centerline: vec![0.0],
                sigma: vec![0.0059, 1.5],
                range: DispersionRange::new(425.0, 3000.0),
            },
        };
        Ok(curvature)
    }
}

/// Per-order centerline polynomial overrides (manual calibration).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CenterlineOverrides {
    overrides: [Option<Vec<f64>>; 4],
}

impl CenterlineOverrides {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set(&mut self, order: SpectralOrder, poly: Vec<f64>) -> &mut Self {
        self.overrides[order.index()] = Some(poly);
        self
    }

    pub fn with(mut self, order: SpectralOrder, poly: Vec<f64>) -> Self {
        self.overrides[order.index()] = Some(poly);
        self
    }

    fn get(&self, order: SpectralOrder) -> Option<&Vec<f64>> {
        self.overrides[order.index()].as_ref()
    }
}

/// Build the four order tracks for an image of `width` columns.
///
/// An order is present iff its nominal dispersion range intersects the
/// on-detector extent; the stored range is the (clipped) intersection.
/// Sigma polynomials evaluating at or below zero anywhere on the clipped
/// range are clamped to the calibrated minimum, with a warning.
pub fn build_track_set(
    width: usize,
    anchor: Anchor,
    provider: &dyn CurvatureProvider,
    overrides: &CenterlineOverrides,
    warnings: &mut WarningBuffer,
) -> GrismResult<TrackSet> {
    if width == 0 {
        return Err(GrismError::input_validation(
            "INPUT.TRACK_WIDTH",
            "image has zero dispersion extent",
        ));
    }
    if !(anchor.x.is_finite() && anchor.y.is_finite()) {
        return Err(GrismError::input_validation(
            "INPUT.TRACK_ANCHOR",
            format!("anchor position is not finite: ({}, {})", anchor.x, anchor.y),
        ));
    }

    let detector = DispersionRange::new(-anchor.x, width as f64 - anchor.x);
    let mut tracks: Vec<OrderTrack> = Vec::with_capacity(4);
    for order in SpectralOrder::ALL {
        let mut curvature = provider.curvature(anchor, order)?;
        if let Some(poly) = overrides.get(order) {
            curvature.centerline = poly.clone();
        }

        let (present, range) = match curvature.range.intersect(&detector) {
            Some(clipped) => (true, clipped),
            None => (false, DispersionRange::new(0.0, 0.0)),
        };

        let mut centerline = vec![anchor.y; width];
        let mut sigma = vec![MIN_TRACK_SIGMA; width];
        let quality = vec![QualityFlags::GOOD; width];
        let mut clamped_columns = 0usize;
        for (column, (center, sig)) in centerline.iter_mut().zip(sigma.iter_mut()).enumerate() {
            let x = column as f64 - anchor.x;
            *center = anchor.y + polyval(&curvature.centerline, x);
            let raw_sigma = polyval(&curvature.sigma, x);
            if raw_sigma > MIN_TRACK_SIGMA {
                *sig = raw_sigma;
            } else if present && range.contains(x) {
                clamped_columns += 1;
            }
        }
        if clamped_columns > 0 {
            warnings.push(format!(
                "order {order}: sigma polynomial clamped to {MIN_TRACK_SIGMA} px over {clamped_columns} columns"
            ));
        }

        tracks.push(OrderTrack::new(
            order,
            present,
            range,
            curvature.centerline,
            curvature.sigma,
            centerline,
            sigma,
            quality,
        )?);
    }

    let tracks: [OrderTrack; 4] = tracks
        .try_into()
        .map_err(|_| GrismError::internal("BUG.TRACK_COUNT", "expected exactly four tracks"))?;
    Ok(TrackSet { anchor, tracks })
}
