//! Scene and result records exchanged through JSON files.

use grism_core::{QualityFlags, SpectralOrder};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One synthetic spectral trace in a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpec {
    pub order: SpectralOrder,
    pub amplitude: f64,
    /// Cross-dispersion row at the anchor column.
    pub row: f64,
    pub sigma: f64,
    /// Linear tilt of the trace in rows per dispersion pixel.
    #[serde(default)]
    pub slope: f64,
    /// Quadratic curvature in rows per dispersion pixel squared.
    #[serde(default)]
    pub quadratic: f64,
}

/// A synthetic detector scene: what `simulate` writes and `extract` reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub rows: usize,
    pub columns: usize,
    pub background: f64,
    /// Anchor position `[x, y]` in image pixels.
    pub anchor: [f64; 2],
    /// Exposure time in seconds.
    pub exposure: f64,
    pub traces: Vec<TraceSpec>,
}

impl Scene {
    /// Render the scene into an image strip.
    pub fn render(&self) -> Array2<f64> {
        let mut image = Array2::from_elem((self.rows, self.columns), self.background);
        for trace in &self.traces {
            for c in 0..self.columns {
                let x = c as f64 - self.anchor[0];
                let center = trace.row + trace.slope * x + trace.quadratic * x * x;
                for r in 0..self.rows {
                    let z = (r as f64 - center) / trace.sigma;
                    image[[r, c]] += trace.amplitude * (-0.5 * z * z).exp();
                }
            }
        }
        image
    }
}

/// Per-order spectra in the result file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: SpectralOrder,
    pub present: bool,
    pub flux_simple: Vec<f64>,
    pub flux_optimal: Vec<f64>,
    pub variance_optimal: Vec<f64>,
    pub background: Vec<f64>,
    pub aperture_correction: Vec<f64>,
    pub quality: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub background_mean: f64,
    pub background_sigma: f64,
    pub warnings: Vec<String>,
    pub orders: Vec<OrderRecord>,
}

pub fn quality_bits(quality: &[QualityFlags]) -> Vec<u8> {
    quality.iter().map(|q| q.bits()).collect()
}
