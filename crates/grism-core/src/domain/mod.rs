//! Shared domain types for the grism order-separation engine.
//!
//! The per-order state that the original reduction passed around as nested
//! tuples lives here as named records: an [`OrderTrack`] owns the aligned
//! centerline/sigma/quality sequences for one diffraction order, and a
//! [`TrackSet`] owns the four tracks plus the anchor they are defined
//! against.

pub mod errors;

pub use errors::{GrismError, GrismErrorCategory, GrismResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One diffracted spectral image of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralOrder {
    Zeroth,
    First,
    Second,
    Third,
}

impl SpectralOrder {
    pub const ALL: [SpectralOrder; 4] = [Self::Zeroth, Self::First, Self::Second, Self::Third];

    pub const fn index(self) -> usize {
        match self {
            Self::Zeroth => 0,
            Self::First => 1,
            Self::Second => 2,
            Self::Third => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Zeroth => "ZEROTH",
            Self::First => "FIRST",
            Self::Second => "SECOND",
            Self::Third => "THIRD",
        }
    }
}

impl Display for SpectralOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Reference point of the first order at the calibration wavelength.
///
/// All order centerline offsets are defined relative to this point; it is
/// fixed once track building starts for an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Dispersion (column) pixel of the anchor in the image strip.
    pub x: f64,
    /// Cross-dispersion (row) pixel of the anchor in the image strip.
    pub y: f64,
}

impl Anchor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Half-open pixel interval along the dispersion axis, in anchor-relative
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispersionRange {
    pub min: f64,
    pub max: f64,
}

impl DispersionRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn length(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x <= self.max
    }

    /// Intersection with another range; `None` when empty or degenerate.
    pub fn intersect(&self, other: &DispersionRange) -> Option<DispersionRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        if max > min {
            Some(DispersionRange { min, max })
        } else {
            None
        }
    }
}

/// Per-pixel data quality bits. Bits are additive: independently triggered
/// conditions OR together and never replace one another.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct QualityFlags(u8);

impl QualityFlags {
    pub const GOOD: QualityFlags = QualityFlags(0);
    /// Data dropout, off-detector, or bad pixel.
    pub const BAD: QualityFlags = QualityFlags(1);
    /// Strong zeroth order of a field source too close to the spectrum.
    pub const STRONG_ZEROTH: QualityFlags = QualityFlags(2);
    /// Weak zeroth order of a field source too close to the spectrum.
    pub const WEAK_ZEROTH: QualityFlags = QualityFlags(4);
    /// Bright first order of a neighboring source overlapping the track.
    pub const BRIGHT_FIRST: QualityFlags = QualityFlags(8);
    /// Orders overlap too closely to separate.
    pub const ORDER_OVERLAP: QualityFlags = QualityFlags(16);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn is_good(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: QualityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: QualityFlags) {
        self.0 |= other.0;
    }

    pub const fn union(self, other: QualityFlags) -> QualityFlags {
        QualityFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for QualityFlags {
    type Output = QualityFlags;

    fn bitor(self, rhs: QualityFlags) -> QualityFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for QualityFlags {
    fn bitor_assign(&mut self, rhs: QualityFlags) {
        self.insert(rhs);
    }
}

/// Track state for one order over the full image width.
///
/// The three sequences are indexed by image column and always have the same
/// length; columns outside the order's clipped dispersion range carry the
/// anchor row and the good flag but are not extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTrack {
    pub order: SpectralOrder,
    pub present: bool,
    /// Anchor-relative dispersion range actually on the detector.
    pub range: DispersionRange,
    /// Centerline polynomial in anchor-relative coordinates, highest power
    /// first.
    pub centerline_poly: Vec<f64>,
    /// Gaussian sigma polynomial in anchor-relative coordinates, highest
    /// power first.
    pub sigma_poly: Vec<f64>,
    /// Cross-dispersion center row per image column.
    pub centerline: Vec<f64>,
    /// Gaussian sigma per image column, clamped to the calibrated minimum.
    pub sigma: Vec<f64>,
    /// Quality bits per image column.
    pub quality: Vec<QualityFlags>,
}

impl OrderTrack {
    /// Build a track from aligned sequences, enforcing the length invariant.
    pub fn new(
        order: SpectralOrder,
        present: bool,
        range: DispersionRange,
        centerline_poly: Vec<f64>,
        sigma_poly: Vec<f64>,
        centerline: Vec<f64>,
        sigma: Vec<f64>,
        quality: Vec<QualityFlags>,
    ) -> GrismResult<Self> {
        if centerline.len() != sigma.len() || centerline.len() != quality.len() {
            return Err(GrismError::internal(
                "BUG.TRACK_SHAPE",
                format!(
                    "order {} track arrays disagree: centerline {}, sigma {}, quality {}",
                    order,
                    centerline.len(),
                    sigma.len(),
                    quality.len()
                ),
            ));
        }
        Ok(Self {
            order,
            present,
            range,
            centerline_poly,
            sigma_poly,
            centerline,
            sigma,
            quality,
        })
    }

    pub fn len(&self) -> usize {
        self.centerline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centerline.is_empty()
    }

    /// Whether the order is present and `column` (absolute image column)
    /// falls inside its clipped dispersion range.
    pub fn covers(&self, column: usize, anchor_x: f64) -> bool {
        self.present && self.range.contains(column as f64 - anchor_x)
    }
}

/// The four order tracks of one extraction, plus the anchor they share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSet {
    pub anchor: Anchor,
    pub tracks: [OrderTrack; 4],
}

impl TrackSet {
    pub fn track(&self, order: SpectralOrder) -> &OrderTrack {
        &self.tracks[order.index()]
    }

    pub fn track_mut(&mut self, order: SpectralOrder) -> &mut OrderTrack {
        &mut self.tracks[order.index()]
    }

    pub fn width(&self) -> usize {
        self.tracks[0].len()
    }

    /// Orders marked present, in ascending order number.
    pub fn present_orders(&self) -> Vec<SpectralOrder> {
        SpectralOrder::ALL
            .into_iter()
            .filter(|order| self.track(*order).present)
            .collect()
    }
}

/// Externally supplied per-column contamination verdicts from the
/// field-source footprint mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContaminationMask {
    /// Columns where any field-source zeroth order footprint touches the
    /// spectrum region.
    pub weak: Vec<bool>,
    /// Columns where a bright field-source zeroth order footprint touches
    /// the spectrum region.
    pub strong: Vec<bool>,
}

/// Accumulated non-fatal diagnostics of one reduction run.
///
/// Degenerate inputs and clamped physical limits land here instead of
/// aborting the extraction; the caller decides how to surface them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarningBuffer {
    entries: Vec<String>,
}

impl WarningBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.entries.push(message.into());
    }

    pub fn extend(&mut self, other: WarningBuffer) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
