//! Boxcar (moving-average) smoothing with reflective boundaries, aware of
//! the off-detector sentinel: masked pixels contribute nothing and a window
//! with no valid pixel yields the sentinel.

use crate::common::constants::{is_masked, CVAL};
use ndarray::Array2;

/// Reflect an out-of-range index back into `0..len`.
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let mut i = index;
    // Repeated reflection handles kernels larger than the axis.
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= len {
            i = 2 * len - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// 1-D boxcar of the given window length.
pub fn boxcar_1d(values: &[f64], length: usize) -> Vec<f64> {
    if values.is_empty() || length <= 1 {
        return values.to_vec();
    }
    let half = (length / 2) as isize;
    let n = values.len();
    let mut out = vec![0.0; n];
    for i in 0..n {
        let mut sum = 0.0;
        let mut count = 0_usize;
        for offset in -half..=(length as isize - half - 1) {
            let value = values[reflect(i as isize + offset, n)];
            if !is_masked(value) {
                sum += value;
                count += 1;
            }
        }
        out[i] = if count > 0 { sum / count as f64 } else { CVAL };
    }
    out
}

/// 2-D boxcar with kernel `[rows, cols]`.
pub fn boxcar_2d(image: &Array2<f64>, kernel: [usize; 2]) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let [krows, kcols] = kernel;
    if ny == 0 || nx == 0 || (krows <= 1 && kcols <= 1) {
        return image.clone();
    }
    let half_r = (krows.max(1) / 2) as isize;
    let half_c = (kcols.max(1) / 2) as isize;
    let rows_span = krows.max(1) as isize;
    let cols_span = kcols.max(1) as isize;
    let mut out = Array2::zeros((ny, nx));
    for r in 0..ny {
        for c in 0..nx {
            let mut sum = 0.0;
            let mut count = 0_usize;
            for dr in -half_r..=(rows_span - half_r - 1) {
                let rr = reflect(r as isize + dr, ny);
                for dc in -half_c..=(cols_span - half_c - 1) {
                    let cc = reflect(c as isize + dc, nx);
                    let value = image[[rr, cc]];
                    if !is_masked(value) {
                        sum += value;
                        count += 1;
                    }
                }
            }
            out[[r, c]] = if count > 0 { sum / count as f64 } else { CVAL };
        }
    }
    out
}
